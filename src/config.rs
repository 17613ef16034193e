//! Loads runtime tunables from a JSON file, falling back to defaults when the file is missing
//! or unreadable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tunables for the patch runtime. Everything here has a sensible default, so hosts that never
/// write a config file still get a working setup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Patch applications that take at least this long are flagged by the reporter.
    pub slow_patch_ms: u64,

    /// Enables the extra logging used while developing patches.
    pub diagnostics: bool,

    /// Where the log file goes. `None` sends log lines to stderr instead.
    pub log_path: Option<PathBuf>,

    /// Address of the UDP log sink used in debug builds.
    pub log_sink_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            slow_patch_ms: 5,
            diagnostics: false,
            log_path: None,
            log_sink_addr: None,
        }
    }
}

impl RuntimeConfig {
    /// Reads the config from `path`, substituting defaults if anything goes wrong. A missing
    /// config file is the common case and not an error worth surfacing to the user.
    pub fn load(path: impl AsRef<Path>) -> RuntimeConfig {
        let path = path.as_ref();

        Self::read(path).unwrap_or_else(|err| {
            log::error!("failed to load config from {}: {:?}", path.display(), err);
            log::info!("using default configuration instead");
            RuntimeConfig::default()
        })
    }

    fn read(path: &Path) -> eyre::Result<RuntimeConfig> {
        Ok(serde_json::from_reader(std::fs::File::open(path)?)?)
    }
}
