//! Intercepts a host application's module loader so that module sources can be searched,
//! rewritten with plugin-supplied patches before they execute, and referenced lazily before
//! they exist.

use std::sync::Arc;

pub mod canon;
pub mod config;
pub mod finder;
pub mod lazy;
pub mod logging;
pub mod patcher;
pub mod registry;
pub mod reporter;

pub use config::RuntimeConfig;
pub use finder::{Filter, FindError, FinderKind};
pub use lazy::{LazyHandle, LazyStatus, LazyUnresolved};
pub use patcher::{FindSpec, Matcher, Patch, Replacement, Replacer};
pub use registry::{
    CompileError, Exports, FactoryCompiler, FactoryFn, ModuleExports, ModuleId, ModuleRecord,
    RawFactory, Runtime,
};
pub use reporter::Report;

/// Sets up logging and installs the shared runtime. Hosts that want an isolated runtime (or
/// tests) can construct [`Runtime`] directly instead.
pub fn init(
    config: RuntimeConfig,
    compiler: Option<Arc<dyn FactoryCompiler>>,
) -> &'static Runtime {
    logging::init(&config);
    registry::install_shared(Runtime::new(config, compiler))
}
