//! Intercepts the host loader's module registrations so that factory sources become
//! inspectable and patchable before execution, and provides the runtime service object that
//! the finder, lazy and reporter layers hang off.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use eyre::eyre;
use itertools::Itertools;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use thiserror::Error;

use crate::{
    config::RuntimeConfig,
    finder::{Filter, FindError, FinderKind, SearchHistoryEntry, SearchOutcome},
    lazy::{LazyHandle, LazyShared, LazyStatus},
    patcher::{self, Patch, PatchOutcome},
};

/// Identifier assigned by the host loader. Opaque to the runtime beyond equality and ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleId {
    Num(u64),
    Name(String),
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleId::Num(n) => write!(f, "{n}"),
            ModuleId::Name(name) => f.write_str(name),
        }
    }
}

impl From<u64> for ModuleId {
    fn from(n: u64) -> ModuleId {
        ModuleId::Num(n)
    }
}

impl From<&str> for ModuleId {
    fn from(name: &str) -> ModuleId {
        ModuleId::Name(name.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(name: String) -> ModuleId {
        ModuleId::Name(name)
    }
}

/// Duck-typed view of an evaluated module value. The host decides what its values look like;
/// the runtime only ever asks capability questions.
pub trait ModuleExports: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Whether the value is an object carrying the named property.
    fn has_prop(&self, _name: &str) -> bool {
        false
    }

    /// The named property's value, if there is one.
    fn prop(&self, _name: &str) -> Option<Exports> {
        None
    }

    /// Whether the value renders as a UI component (callable, render method, etc.).
    fn is_component(&self) -> bool {
        false
    }
}

impl dyn ModuleExports {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Plain-object exports modelled as JSON, which is what most data-carrying host modules look
/// like from the outside.
impl ModuleExports for serde_json::Value {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn has_prop(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn prop(&self, name: &str) -> Option<Exports> {
        self.get(name).map(|value| Arc::new(value.clone()) as Exports)
    }
}

pub type Exports = Arc<dyn ModuleExports>;
pub type FactoryFn = Arc<dyn Fn(&ModuleId) -> Exports + Send + Sync>;

/// The patched source no longer parsed/instantiated on the host side. The runtime falls back
/// to the original factory when it sees this.
#[derive(Clone, Debug, Error)]
#[error("patched source failed to compile: {0}")]
pub struct CompileError(pub String);

/// Host seam that turns rewritten source text back into a runnable factory.
pub trait FactoryCompiler: Send + Sync {
    fn compile(&self, id: &ModuleId, source: &str) -> Result<FactoryFn, CompileError>;
}

/// What the host hands over for each module definition: the factory itself plus its source
/// text, captured before any patching. A factory whose source cannot be captured is opaque.
pub struct RawFactory {
    pub source: Option<String>,
    pub run: FactoryFn,
}

impl RawFactory {
    pub fn new(source: Option<String>, run: FactoryFn) -> RawFactory {
        RawFactory { source, run }
    }

    pub fn opaque(run: FactoryFn) -> RawFactory {
        RawFactory { source: None, run }
    }
}

/// One module in the intercepted graph. Lives for the runtime's lifetime; patched at most
/// once, at or before first execution; exports appear on first require.
pub struct ModuleRecord {
    id: ModuleId,
    original_source: Option<String>,
    source: Option<String>,
    factory: FactoryFn,
    exports: Option<Exports>,
    patched: bool,
    executing: bool,
}

impl ModuleRecord {
    pub(crate) fn from_raw(id: ModuleId, raw: RawFactory) -> ModuleRecord {
        ModuleRecord {
            id,
            original_source: raw.source.clone(),
            source: raw.source,
            factory: raw.run,
            exports: None,
            patched: false,
            executing: false,
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// The current source text: patched if patching has happened, the captured original
    /// otherwise. `None` for opaque modules.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// The source text as captured at registration, before any patch ran.
    pub fn original_source(&self) -> Option<&str> {
        self.original_source.as_deref()
    }

    pub fn exports(&self) -> Option<&Exports> {
        self.exports.as_ref()
    }

    pub fn is_executed(&self) -> bool {
        self.exports.is_some()
    }

    pub fn is_opaque(&self) -> bool {
        self.source.is_none()
    }

    #[cfg(test)]
    pub(crate) fn set_exports(&mut self, exports: Exports) {
        self.exports = Some(exports);
    }
}

/// A registered patch plus how many modules it has hit so far.
struct PatchSlot {
    patch: Arc<Patch>,
    hits: usize,
}

/// Snapshot of one patch's matching record, for diagnostics.
#[derive(Clone, Debug)]
pub struct PatchStat {
    pub plugin: String,
    pub find: String,
    pub all: bool,
    pub hits: usize,
    /// Whether the patch's `find` matches at least one captured module source. A patch can have
    /// zero hits while this is true: its module simply has not been required yet.
    pub matched: bool,
}

struct State {
    modules: HashMap<ModuleId, ModuleRecord>,
    /// Registration order; scans and patch application are deterministic because of it.
    order: Vec<ModuleId>,
    patches: Vec<PatchSlot>,
    pending: Vec<Weak<LazyShared>>,
    history: Vec<SearchHistoryEntry>,
    outcomes: Vec<PatchOutcome>,
    booted: bool,
}

/// The patch runtime: registry shim, patch list, lazy waiters and search history in one
/// explicit service object. Construct one per test; hosts install a process-wide instance via
/// [`install_shared`] (usually through [`crate::init`]).
pub struct Runtime {
    state: Mutex<State>,
    config: RuntimeConfig,
    compiler: Option<Arc<dyn FactoryCompiler>>,
}

enum RequireStep {
    Run(FactoryFn),
    Patch {
        original: String,
        patches: Vec<Arc<Patch>>,
        fallback: FactoryFn,
    },
}

impl Runtime {
    pub fn new(config: RuntimeConfig, compiler: Option<Arc<dyn FactoryCompiler>>) -> Runtime {
        Runtime {
            state: Mutex::new(State {
                modules: HashMap::new(),
                order: Vec::new(),
                patches: Vec::new(),
                pending: Vec::new(),
                history: Vec::new(),
                outcomes: Vec::new(),
                booted: false,
            }),
            config,
            compiler,
        }
    }

    /// The process-wide runtime. Falls back to a default instance (no compiler) when used
    /// before [`crate::init`] ran, since refusing to work would take the host down with us.
    pub fn shared() -> &'static Runtime {
        SHARED.get_or_init(|| {
            log::warn!("graft runtime used before init; using defaults with no compiler");
            Runtime::new(RuntimeConfig::default(), None)
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.config.slow_patch_ms)
    }

    /// Called by the host for every module definition. The source text must be captured here,
    /// before anything runs, because patches operate on text rather than live functions.
    /// Re-registering an id is ignored so that already-rewritten source is never mutated twice.
    pub fn register(&self, id: ModuleId, raw: RawFactory) {
        {
            let mut state = self.state.lock().unwrap();

            if state.modules.contains_key(&id) {
                log::warn!("module {id} registered twice; keeping the first registration");
                return;
            }

            if raw.source.is_none() {
                log::debug!("module {id} has no inspectable source; recording it as opaque");
            }

            state.order.push(id.clone());
            let record = ModuleRecord::from_raw(id.clone(), raw);
            state.modules.insert(id.clone(), record);
        }

        self.retry_pending(&id);
    }

    /// Called by the host when a module is first needed. Guarantees every applicable patch has
    /// been applied before the factory executes; patching is deferred to this point so that
    /// patches registered after the module's definition still take effect.
    pub fn require(&self, id: &ModuleId) -> eyre::Result<Exports> {
        let step = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;

            let record = state
                .modules
                .get_mut(id)
                .ok_or_else(|| eyre!("module {id} is not registered"))?;

            if let Some(exports) = &record.exports {
                return Ok(exports.clone());
            }

            if record.executing {
                return Err(eyre!("circular require of module {id}"));
            }

            if !record.patched && record.source.is_some() {
                record.patched = true;
                // Set before the lock is released so that a patch callback which re-requires
                // this module hits the circular guard instead of running the unpatched factory.
                record.executing = true;
                RequireStep::Patch {
                    original: record.original_source.clone().unwrap_or_default(),
                    patches: state.patches.iter().map(|slot| slot.patch.clone()).collect(),
                    fallback: record.factory.clone(),
                }
            } else {
                record.executing = true;
                RequireStep::Run(record.factory.clone())
            }
        };

        let factory = match step {
            RequireStep::Run(factory) => factory,
            RequireStep::Patch {
                original,
                patches,
                fallback,
            } => {
                // The factory callbacks, predicates and the compiler all run without the
                // registry lock held, so they may re-enter the runtime.
                let result = patcher::apply(
                    id,
                    &original,
                    &patches,
                    self.compiler.as_deref(),
                    self.slow_threshold(),
                );

                let factory = result.factory.unwrap_or(fallback);

                let mut guard = self.state.lock().unwrap();
                let state = &mut *guard;

                for index in &result.hit_patches {
                    if let Some(slot) = state.patches.get_mut(*index) {
                        slot.hits += 1;
                    }
                }

                state.outcomes.extend(result.outcomes);

                if let Some(record) = state.modules.get_mut(id) {
                    record.source = Some(result.source);
                    record.factory = factory.clone();
                    record.executing = true;
                }

                factory
            }
        };

        let exports = factory(id);

        let exports = {
            let mut state = self.state.lock().unwrap();

            match state.modules.get_mut(id) {
                Some(record) => {
                    record.executing = false;

                    match &record.exports {
                        Some(existing) => existing.clone(),
                        None => {
                            record.exports = Some(exports.clone());
                            exports
                        }
                    }
                }
                None => exports,
            }
        };

        // Exports are now visible, so props-based lazies get their retry.
        self.retry_pending(id);

        Ok(exports)
    }

    /// Iterates every known module, executed or not, in registration order.
    pub fn for_each_module(&self, mut f: impl FnMut(&ModuleRecord)) {
        let state = self.state.lock().unwrap();

        for id in &state.order {
            if let Some(record) = state.modules.get(id) {
                f(record);
            }
        }
    }

    pub fn module_count(&self) -> usize {
        self.state.lock().unwrap().order.len()
    }

    /// Appends a patch. Registration order is application order, process-wide.
    pub fn register_patch(&self, patch: Patch) {
        let mut state = self.state.lock().unwrap();

        if state.booted {
            log::warn!(
                "patch from {} registered after boot; it only affects modules that have not \
                 executed yet",
                patch.plugin
            );
        }

        state.patches.push(PatchSlot {
            patch: Arc::new(patch),
            hits: 0,
        });
    }

    pub fn register_plugin(&self, patches: impl IntoIterator<Item = Patch>) {
        for patch in patches {
            self.register_patch(patch);
        }
    }

    /// Strict single-result lookup: exactly one module must match. The match is executed and
    /// its exports returned.
    pub fn find(&self, filter: &Filter) -> Result<Exports, FindError> {
        let ids = self.matching_ids(filter);
        let count = ids.len();

        match ids.into_iter().exactly_one() {
            Ok(id) => {
                self.record_search(filter, SearchOutcome::Found(id.clone()));
                self.require(&id).map_err(|err| FindError::Execution {
                    id,
                    reason: err.to_string(),
                })
            }
            Err(_) if count == 0 => {
                self.record_search(filter, SearchOutcome::NotFound);
                Err(FindError::NotFound {
                    kind: filter.kind(),
                    args: filter.desc().to_string(),
                })
            }
            Err(_) => {
                self.record_search(filter, SearchOutcome::Ambiguous(count));
                Err(FindError::Ambiguous {
                    kind: filter.kind(),
                    args: filter.desc().to_string(),
                    count,
                })
            }
        }
    }

    /// Executes and returns every matching module's exports, in registration order.
    pub fn find_all(&self, filter: &Filter) -> Vec<Exports> {
        self.matching_ids(filter)
            .into_iter()
            .filter_map(|id| match self.require(&id) {
                Ok(exports) => Some(exports),
                Err(err) => {
                    log::warn!("find_all: module {id} matched but failed to execute: {err}");
                    None
                }
            })
            .collect()
    }

    /// Raw id-to-source mapping for every module whose source matches the pattern, executed or
    /// not. This is the developer search tooling seam.
    pub fn search(&self, pattern: &Regex) -> BTreeMap<ModuleId, String> {
        let state = self.state.lock().unwrap();

        state
            .order
            .iter()
            .filter_map(|id| {
                let source = state.modules.get(id)?.source()?;
                pattern
                    .is_match(source)
                    .then(|| (id.clone(), source.to_string()))
            })
            .collect()
    }

    /// Deferred lookup: returns immediately with a handle that resolves once a matching module
    /// becomes available. Resolution executes the matched module.
    pub fn wait_for(&self, filter: Filter) -> LazyHandle {
        self.wait_for_impl(filter, false)
    }

    /// Like [`Runtime::wait_for`], but still unresolved after boot counts as a failure in the
    /// reporter rather than a warning.
    pub fn wait_for_required(&self, filter: Filter) -> LazyHandle {
        self.wait_for_impl(filter, true)
    }

    pub fn find_by_code_lazy<I, S>(&self, fragments: I) -> LazyHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait_for_impl(Filter::by_code(fragments), false)
    }

    pub fn find_by_props_lazy<I, S>(&self, props: I) -> LazyHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait_for_impl(Filter::by_props(props), false)
    }

    pub fn find_component_by_code_lazy<I, S>(&self, fragments: I) -> LazyHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait_for_impl(Filter::component_by_code(fragments), false)
    }

    fn wait_for_impl(&self, filter: Filter, required: bool) -> LazyHandle {
        let kind = match filter.kind() {
            FinderKind::Custom => FinderKind::WaitFor,
            kind => kind,
        };

        let shared = LazyShared::new(kind, filter, required);

        {
            let mut state = self.state.lock().unwrap();
            state.history.push(SearchHistoryEntry {
                kind,
                args: shared.filter.desc().to_string(),
                outcome: SearchOutcome::Lazy(Arc::downgrade(&shared)),
            });
        }

        let found = {
            let state = self.state.lock().unwrap();
            state
                .order
                .iter()
                .find(|id| {
                    state
                        .modules
                        .get(*id)
                        .map_or(false, |record| shared.filter.matches(record))
                })
                .cloned()
        };

        match found {
            Some(id) => match self.require(&id) {
                Ok(exports) => shared.resolve(exports),
                Err(err) => {
                    log::warn!(
                        "lazy {kind} lookup [{}] matched module {id} but it failed to \
                         execute: {err}",
                        shared.filter.desc()
                    );
                    self.park(&shared);
                }
            },
            None => self.park(&shared),
        }

        LazyHandle::from_shared(shared)
    }

    fn park(&self, shared: &Arc<LazyShared>) {
        shared.mark_pending();
        self.state.lock().unwrap().pending.push(Arc::downgrade(shared));
    }

    /// Retries every pending lazy against one (new or newly executed) module. All lookups
    /// satisfied by this event resolve within this single pass.
    fn retry_pending(&self, id: &ModuleId) {
        let matched: Vec<Arc<LazyShared>> = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;

            state.pending.retain(|weak| {
                weak.upgrade()
                    .map_or(false, |handle| handle.status() == LazyStatus::Pending)
            });

            let record = match state.modules.get(id) {
                Some(record) => record,
                None => return,
            };

            state
                .pending
                .iter()
                .filter_map(|weak| weak.upgrade())
                .filter(|handle| handle.filter.matches(record))
                .collect()
        };

        for handle in matched {
            match self.require(id) {
                Ok(exports) => handle.resolve(exports),
                Err(err) => log::warn!(
                    "lazy {} lookup [{}] matched module {id} but it failed to execute: {err}",
                    handle.kind,
                    handle.filter.desc()
                ),
            }
        }
    }

    fn matching_ids(&self, filter: &Filter) -> Vec<ModuleId> {
        let state = self.state.lock().unwrap();

        state
            .order
            .iter()
            .filter(|id| {
                state
                    .modules
                    .get(*id)
                    .map_or(false, |record| filter.matches(record))
            })
            .cloned()
            .collect()
    }

    fn record_search(&self, filter: &Filter, outcome: SearchOutcome) {
        let mut state = self.state.lock().unwrap();
        state.history.push(SearchHistoryEntry {
            kind: filter.kind(),
            args: filter.desc().to_string(),
            outcome,
        });
    }

    /// Marks the end of the host's startup phase. The reporter treats anything still pending
    /// after this point as worth surfacing.
    pub fn mark_boot_complete(&self) {
        self.state.lock().unwrap().booted = true;
    }

    pub fn is_boot_complete(&self) -> bool {
        self.state.lock().unwrap().booted
    }

    pub fn patch_stats(&self) -> Vec<PatchStat> {
        let state = self.state.lock().unwrap();

        state
            .patches
            .iter()
            .map(|slot| {
                let matched = state.modules.values().any(|record| {
                    record
                        .original_source()
                        .map_or(false, |source| slot.patch.find.matches(source))
                });

                PatchStat {
                    plugin: slot.patch.plugin.clone(),
                    find: slot.patch.find.to_string(),
                    all: slot.patch.all,
                    hits: slot.hits,
                    matched,
                }
            })
            .collect()
    }

    pub fn patch_outcomes(&self) -> Vec<PatchOutcome> {
        self.state.lock().unwrap().outcomes.clone()
    }

    pub fn search_history(&self) -> Vec<SearchHistoryEntry> {
        self.state.lock().unwrap().history.clone()
    }

    pub(crate) fn pending_handles(&self) -> Vec<Arc<LazyShared>> {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }
}

static SHARED: OnceCell<Runtime> = OnceCell::new();

pub(crate) fn install_shared(runtime: Runtime) -> &'static Runtime {
    if SHARED.set(runtime).is_err() {
        log::warn!("graft runtime already initialised; keeping the existing instance");
    }

    Runtime::shared()
}

static HOOK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Chunk-array loaders that get their push method swapped for the registration hook.
        Regex::new(r"([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)+)\.push\s*=\s*function").unwrap(),
        // Loaders with an explicit define/register entry point.
        Regex::new(r"([A-Za-z_$][\w$]*)\.(?:define|register)\s*=\s*function").unwrap(),
    ]
});

/// Best-effort text search over the host's bootstrap code for the expression the shim should
/// hook to see module registrations. Brittle by nature; a host update that reshapes its
/// bootstrap breaks this, which is an operational risk rather than something the runtime can
/// fix.
pub fn discover_hook(bootstrap: &str) -> eyre::Result<String> {
    for pattern in HOOK_PATTERNS.iter() {
        if let Some(found) = pattern.captures(bootstrap).and_then(|caps| caps.get(1)) {
            return Ok(found.as_str().to_string());
        }
    }

    Err(eyre!(
        "no module registration hook found in bootstrap source ({} bytes)",
        bootstrap.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patcher::{FindSpec, Replacement};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stands in for the host: "compiles" source by producing a factory that exports the
    /// source text as a string, and rejects anything containing `%%broken%%`.
    struct EchoCompiler;

    impl FactoryCompiler for EchoCompiler {
        fn compile(&self, _id: &ModuleId, source: &str) -> Result<FactoryFn, CompileError> {
            if source.contains("%%broken%%") {
                return Err(CompileError("unexpected token".into()));
            }

            let source = source.to_string();
            Ok(Arc::new(move |_| {
                Arc::new(Value::String(source.clone())) as Exports
            }))
        }
    }

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default(), Some(Arc::new(EchoCompiler)))
    }

    fn text_module(source: &str) -> RawFactory {
        let exported = source.to_string();
        RawFactory::new(
            Some(source.to_string()),
            Arc::new(move |_| Arc::new(Value::String(exported.clone())) as Exports),
        )
    }

    fn object_module(source: &str, value: Value) -> RawFactory {
        RawFactory::new(
            Some(source.to_string()),
            Arc::new(move |_| Arc::new(value.clone()) as Exports),
        )
    }

    fn exported_string(exports: &Exports) -> String {
        exports
            .as_any()
            .downcast_ref::<Value>()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn patches_chain_across_plugins() {
        let rt = runtime();

        rt.register_patch(
            Patch::new("first-plugin", FindSpec::code("foo")).replace(Replacement::text("foo", "bar")),
        );

        rt.register(1.into(), text_module(r#"return "AAA foo BBB";"#));

        // Registered after the module, before its first execution; must still apply, and must
        // see the first patch's output.
        rt.register_patch(
            Patch::new("second-plugin", FindSpec::code("bar")).replace(Replacement::text("bar", "baz")),
        );

        let exports = rt.require(&1.into()).unwrap();
        let text = exported_string(&exports);

        assert!(text.contains("baz"));
        assert!(!text.contains("foo"));
        assert!(!text.contains("bar"));
    }

    #[test]
    fn reregistration_does_not_repatch() {
        let rt = runtime();

        // Doubling marker: applying this twice would produce "XXX".
        rt.register_patch(
            Patch::new("marker", FindSpec::code("X")).replace(Replacement::text("X", "XX")),
        );

        rt.register(1.into(), text_module("X"));
        rt.register(1.into(), text_module("X"));

        let first = exported_string(&rt.require(&1.into()).unwrap());
        let second = exported_string(&rt.require(&1.into()).unwrap());

        assert_eq!(first, "XX");
        assert_eq!(second, "XX");
    }

    #[test]
    fn unpatched_module_keeps_exact_source() {
        let rt = runtime();

        rt.register_patch(
            Patch::new("misser", FindSpec::code("present")).replace(Replacement::text("vanished", "x")),
        );

        let source = "present, yet nothing here matches the entry";
        rt.register(1.into(), text_module(source));
        rt.require(&1.into()).unwrap();

        let mut seen = None;
        rt.for_each_module(|record| seen = record.source().map(str::to_string));
        assert_eq!(seen.as_deref(), Some(source));
    }

    #[test]
    fn strict_find_semantics() {
        let rt = runtime();
        rt.register(1.into(), text_module("shared marker one"));
        rt.register(2.into(), text_module("shared marker two"));
        rt.register(3.into(), text_module("unique snowflake"));

        match rt.find(&Filter::by_code(["shared marker"])) {
            Err(FindError::Ambiguous { count, .. }) => assert_eq!(count, 2),
            Err(err) => panic!("wrong error: {err}"),
            Ok(_) => panic!("expected ambiguity"),
        }

        match rt.find(&Filter::by_code(["no such fragment"])) {
            Err(FindError::NotFound { .. }) => {}
            Err(err) => panic!("wrong error: {err}"),
            Ok(_) => panic!("expected not-found"),
        }

        let exports = rt.find(&Filter::by_code(["unique snowflake"])).unwrap();
        assert_eq!(exported_string(&exports), "unique snowflake");
    }

    #[test]
    fn require_runs_the_factory_once() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        rt.register(
            1.into(),
            RawFactory::new(
                Some("counting module".into()),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Arc::new(json!({ "ok": true })) as Exports
                }),
            ),
        );

        rt.require(&1.into()).unwrap();
        rt.require(&1.into()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn circular_require_errors_instead_of_recursing() {
        let rt = Arc::new(runtime());
        let inner = rt.clone();

        rt.register(
            1.into(),
            RawFactory::new(
                Some("self-requiring module".into()),
                Arc::new(move |id| {
                    let text = match inner.require(id) {
                        Ok(_) => "resolved".to_string(),
                        Err(err) => err.to_string(),
                    };
                    Arc::new(Value::String(text)) as Exports
                }),
            ),
        );

        // The patch list is empty, so the original factory runs.
        let exports = rt.require(&1.into()).unwrap();
        assert!(exported_string(&exports).contains("circular require"));
    }

    #[test]
    fn reentrant_require_while_patching_hits_the_guard() {
        let rt = Arc::new(runtime());
        let inner = rt.clone();

        rt.register(1.into(), text_module("inner point"));

        // A replacer that requires its own module mid-patch must not run the unpatched
        // factory; it gets the circular error like any other re-entry.
        rt.register_patch(
            Patch::new("reentrant", FindSpec::code("point")).replace(Replacement::dynamic(
                "point",
                move |_| match inner.require(&1.into()) {
                    Ok(_) => Ok("ran".to_string()),
                    Err(err) => Ok(format!("blocked ({err})")),
                },
            )),
        );

        let exports = rt.require(&1.into()).unwrap();
        assert!(exported_string(&exports).contains("circular require"));
    }

    #[test]
    fn opaque_factories_register_and_run() {
        let rt = runtime();

        rt.register(
            "native".into(),
            RawFactory::opaque(Arc::new(|_| Arc::new(json!({ "native": true })) as Exports)),
        );

        assert!(rt.find(&Filter::by_code(["native"])).is_err());

        let exports = rt.require(&"native".into()).unwrap();
        assert!(exports.has_prop("native"));
    }

    #[test]
    fn search_maps_ids_to_sources() {
        let rt = runtime();
        rt.register(2.into(), text_module("the quick brown fox"));
        rt.register(1.into(), text_module("lazy dogs everywhere"));

        let results = rt.search(&Regex::new(r"quick \w+ fox").unwrap());
        assert_eq!(results.len(), 1);
        assert_eq!(results[&ModuleId::Num(2)], "the quick brown fox");
    }

    #[test]
    fn code_lazy_resolves_on_registration() {
        let rt = runtime();

        let handle = rt.find_by_code_lazy(["deferred payload"]);
        assert_eq!(handle.status(), LazyStatus::Pending);
        assert!(handle.get().is_none());

        rt.register(7.into(), text_module("the deferred payload arrives"));

        assert_eq!(handle.status(), LazyStatus::Resolved);
        assert_eq!(exported_string(&handle.get().unwrap()), "the deferred payload arrives");
    }

    #[test]
    fn props_lazy_resolves_once_the_module_executes() {
        let rt = runtime();

        let handle = rt.find_by_props_lazy(["alpha", "beta"]);

        rt.register(1.into(), object_module("props module", json!({ "alpha": 1, "beta": 2 })));

        // Registration alone is not enough; by_props never forces execution.
        assert_eq!(handle.status(), LazyStatus::Pending);

        rt.require(&1.into()).unwrap();

        assert_eq!(handle.status(), LazyStatus::Resolved);
        assert!(handle.get().unwrap().has_prop("beta"));
    }

    #[test]
    fn all_waiters_resolve_in_one_pass() {
        let rt = runtime();

        let first = rt.find_by_code_lazy(["common target"]);
        let second = rt.find_by_code_lazy(["common target"]);

        rt.register(1.into(), text_module("the common target module"));

        assert!(first.is_resolved());
        assert!(second.is_resolved());
    }

    #[test]
    fn wait_for_resolves_immediately_when_possible() {
        let rt = runtime();
        rt.register(1.into(), text_module("already here"));

        let handle = rt.wait_for(Filter::by_code(["already here"]));
        assert!(handle.is_resolved());
    }

    #[test]
    fn late_patch_misses_executed_module() {
        let rt = runtime();
        rt.register(1.into(), text_module("stable text"));
        rt.require(&1.into()).unwrap();

        rt.register_patch(
            Patch::new("too-late", FindSpec::code("stable")).replace(Replacement::text("stable", "shifted")),
        );

        // Already executed; the patch never applies and its hit count stays zero.
        let exports = rt.require(&1.into()).unwrap();
        assert_eq!(exported_string(&exports), "stable text");
        assert_eq!(rt.patch_stats()[0].hits, 0);
    }

    #[test]
    fn hook_discovery_scans_bootstrap_text() {
        let bootstrap = r#"
            var chunks = self.hostChunks = self.hostChunks || [];
            chunks.forEach(load);
            self.hostChunks.push = function (chunk) { load(chunk); };
        "#;

        assert_eq!(discover_hook(bootstrap).unwrap(), "self.hostChunks");
        assert!(discover_hook("nothing to see here").is_err());
    }
}
