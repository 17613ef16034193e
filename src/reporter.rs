//! Post-boot validation pass over the recorded search history and patch outcomes. Reads what
//! the registry already collected and surfaces it as log lines; the only thing it ever mutates
//! is the state of required-but-dangling lazies.

use std::time::Duration;

use itertools::Itertools;

use crate::{
    finder::{FinderKind, SearchOutcome},
    lazy::LazyStatus,
    patcher::EntryOutcome,
    registry::{ModuleId, Runtime},
};

/// A patch whose `find` matched no module at all, usually meaning a host update changed the
/// code shape the patch was written against.
#[derive(Clone, Debug)]
pub struct StalePatch {
    pub plugin: String,
    pub find: String,
}

/// A strict find that came back empty or ambiguous at some point during the session.
#[derive(Clone, Debug)]
pub struct FailedFind {
    pub kind: FinderKind,
    pub args: String,
    pub detail: String,
}

/// A lazy lookup still unresolved when the report ran.
#[derive(Clone, Debug)]
pub struct UnresolvedLazy {
    pub kind: FinderKind,
    pub args: String,
    pub required: bool,
}

#[derive(Clone, Debug)]
pub struct SlowPatch {
    pub plugin: String,
    pub module: ModuleId,
    pub elapsed: Duration,
    pub source_len: usize,
}

/// A replacement entry that failed or had to be reverted.
#[derive(Clone, Debug)]
pub struct FailedEntry {
    pub plugin: String,
    pub module: ModuleId,
    pub detail: String,
}

#[derive(Clone, Debug, Default)]
pub struct Report {
    pub stale_patches: Vec<StalePatch>,
    pub failed_finds: Vec<FailedFind>,
    pub unresolved_lazies: Vec<UnresolvedLazy>,
    pub slow_patches: Vec<SlowPatch>,
    pub failed_entries: Vec<FailedEntry>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.stale_patches.is_empty()
            && self.failed_finds.is_empty()
            && self.unresolved_lazies.is_empty()
            && self.slow_patches.is_empty()
            && self.failed_entries.is_empty()
    }
}

/// Replays everything the runtime recorded and logs what needs human attention. Required
/// lazies still pending after boot are marked failed so that their consumers error loudly
/// instead of waiting forever.
pub fn run(runtime: &Runtime) -> Report {
    let mut report = Report::default();

    for stat in runtime.patch_stats() {
        if stat.hits == 0 {
            // A find that matches a registered-but-never-required module is not stale; it
            // applies whenever the host gets around to requiring that module.
            if stat.matched {
                log::debug!(
                    "patch from {} matches a module that has not been required yet ({})",
                    stat.plugin,
                    stat.find
                );
                continue;
            }

            log::warn!(
                "patch from {} found no module matching {}; stale after a host update?",
                stat.plugin,
                stat.find
            );
            report.stale_patches.push(StalePatch {
                plugin: stat.plugin,
                find: stat.find,
            });
        } else if stat.hits > 1 && !stat.all {
            log::debug!(
                "patch from {} hit {} modules; mark it `all` if that is intended",
                stat.plugin,
                stat.hits
            );
        }
    }

    for entry in runtime.search_history() {
        let detail = match &entry.outcome {
            SearchOutcome::NotFound => "matched no module".to_string(),
            SearchOutcome::Ambiguous(count) => format!("matched {count} modules"),
            SearchOutcome::Found(_) | SearchOutcome::Lazy(_) => continue,
        };

        log::warn!("{} search [{}] {}", entry.kind, entry.args, detail);
        report.failed_finds.push(FailedFind {
            kind: entry.kind,
            args: entry.args,
            detail,
        });
    }

    let booted = runtime.is_boot_complete();

    for handle in runtime.pending_handles() {
        if handle.status() != LazyStatus::Pending {
            continue;
        }

        let args = handle.filter.desc().to_string();

        if booted && handle.required {
            handle.mark_failed();
            log::error!(
                "required lazy {} lookup [{args}] never resolved; the host no longer has this \
                 module",
                handle.kind
            );
        } else {
            log::warn!("lazy {} lookup [{args}] still pending", handle.kind);
        }

        report.unresolved_lazies.push(UnresolvedLazy {
            kind: handle.kind,
            args,
            required: handle.required,
        });
    }

    for outcome in runtime.patch_outcomes() {
        if outcome.slow {
            log::warn!(
                "slow patch from {} on module {}: {:?} over {} bytes",
                outcome.plugin,
                outcome.module,
                outcome.elapsed,
                outcome.source_len
            );
            report.slow_patches.push(SlowPatch {
                plugin: outcome.plugin.clone(),
                module: outcome.module.clone(),
                elapsed: outcome.elapsed,
                source_len: outcome.source_len,
            });
        }

        let failures = outcome
            .entries
            .iter()
            .filter_map(|entry| match entry {
                EntryOutcome::Failed(detail) => Some(format!("failed: {detail}")),
                EntryOutcome::RevertedCompile(detail) => Some(format!("reverted: {detail}")),
                _ => None,
            })
            .join("; ");

        if !failures.is_empty() {
            log::warn!(
                "patch from {} had failing entries on module {}: {failures}",
                outcome.plugin,
                outcome.module
            );
            report.failed_entries.push(FailedEntry {
                plugin: outcome.plugin,
                module: outcome.module,
                detail: failures,
            });
        }
    }

    log::info!(
        "patch report: {} stale patches, {} failed finds, {} unresolved lazies, {} slow \
         patches, {} failed entries",
        report.stale_patches.len(),
        report.failed_finds.len(),
        report.unresolved_lazies.len(),
        report.slow_patches.len(),
        report.failed_entries.len()
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::finder::Filter;
    use crate::patcher::{FindSpec, Patch, Replacement};
    use crate::registry::{Exports, FactoryFn, RawFactory, Runtime};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn text_module(source: &str) -> RawFactory {
        let exported = source.to_string();
        let factory: FactoryFn =
            Arc::new(move |_| Arc::new(Value::String(exported.clone())) as Exports);
        RawFactory::new(Some(source.to_string()), factory)
    }

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default(), None)
    }

    #[test]
    fn clean_runtime_reports_clean() {
        let rt = runtime();
        rt.register(1.into(), text_module("plain module"));
        rt.require(&1.into()).unwrap();

        assert!(run(&rt).is_clean());
    }

    #[test]
    fn unmatched_patch_is_stale() {
        let rt = runtime();
        rt.register_patch(
            Patch::new("old-plugin", FindSpec::code("removed by host update"))
                .replace(Replacement::text("a", "b")),
        );
        rt.register(1.into(), text_module("current module body"));
        rt.require(&1.into()).unwrap();

        let report = run(&rt);
        assert_eq!(report.stale_patches.len(), 1);
        assert_eq!(report.stale_patches[0].plugin, "old-plugin");
    }

    #[test]
    fn unrequired_match_is_not_stale() {
        let rt = runtime();
        rt.register(1.into(), text_module("does some work"));
        rt.register_patch(
            Patch::new("alive", FindSpec::code("work")).replace(Replacement::text("work", "rest")),
        );

        // Nothing required the module yet, so the patch has zero hits but is not stale.
        let report = run(&rt);
        assert!(report.stale_patches.is_empty());
    }

    #[test]
    fn failed_strict_finds_are_reported() {
        let rt = runtime();
        let _ = rt.find(&Filter::by_code(["never present"]));

        let report = run(&rt);
        assert_eq!(report.failed_finds.len(), 1);
        assert!(report.failed_finds[0].detail.contains("no module"));
    }

    #[test]
    fn required_lazy_fails_after_boot() {
        let rt = runtime();
        let required = rt.wait_for_required(Filter::by_props(["gone"]));
        let optional = rt.wait_for(Filter::by_props(["also gone"]));

        rt.mark_boot_complete();
        let report = run(&rt);

        assert_eq!(report.unresolved_lazies.len(), 2);
        assert_eq!(required.status(), crate::lazy::LazyStatus::Failed);
        assert_eq!(optional.status(), crate::lazy::LazyStatus::Pending);
    }

    #[test]
    fn pending_lazy_before_boot_is_only_a_warning() {
        let rt = runtime();
        let handle = rt.wait_for(Filter::by_props(["later"]));

        let report = run(&rt);

        assert_eq!(report.unresolved_lazies.len(), 1);
        assert!(!report.unresolved_lazies[0].required);
        assert_eq!(handle.status(), crate::lazy::LazyStatus::Pending);
    }

    #[test]
    fn slow_patches_show_up() {
        let config = RuntimeConfig {
            slow_patch_ms: 0,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config, None);

        rt.register_patch(
            Patch::new("heavy", FindSpec::code("work")).replace(Replacement::text("work", "play")),
        );
        rt.register(1.into(), text_module("work work work"));
        rt.require(&1.into()).unwrap();

        let report = run(&rt);
        assert_eq!(report.slow_patches.len(), 1);
        assert_eq!(report.slow_patches[0].plugin, "heavy");
    }

    #[test]
    fn resolved_lazies_are_not_reported() {
        let rt = runtime();
        let handle = rt.find_by_props_lazy(["key"]);

        rt.register(
            1.into(),
            RawFactory::new(
                Some("keyed module".into()),
                Arc::new(|_| Arc::new(json!({ "key": 1 })) as Exports),
            ),
        );
        rt.require(&1.into()).unwrap();
        assert!(handle.is_resolved());

        let report = run(&rt);
        assert!(report.unresolved_lazies.is_empty());
    }
}
