//! Predicate-based lookup over captured module sources and, where already executed, over
//! exports shape. Filters never force a module to execute; an unexecuted module simply fails
//! `by_props`-style checks until the host runs it.

use std::{fmt, sync::Arc, sync::Weak};

use itertools::Itertools;
use thiserror::Error;

use crate::{
    lazy::LazyShared,
    registry::{ModuleId, ModuleRecord},
};

/// Which finder variant produced a search, kept for the diagnostics history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum FinderKind {
    ByCode,
    ByProps,
    ComponentByCode,
    Custom,
    WaitFor,
}

/// Errors from strict single-result lookups. Both are recoverable: developer tooling displays
/// them, lazies log them and keep retrying as modules register.
#[derive(Clone, Debug, Error)]
pub enum FindError {
    #[error("no module matched {kind} filter [{args}]")]
    NotFound { kind: FinderKind, args: String },

    #[error("{count} modules matched {kind} filter [{args}]; be more specific")]
    Ambiguous {
        kind: FinderKind,
        args: String,
        count: usize,
    },

    #[error("module {id} failed to execute: {reason}")]
    Execution { id: ModuleId, reason: String },
}

type FilterFn = Arc<dyn Fn(&ModuleRecord) -> bool + Send + Sync>;

/// A named predicate over module records. Filters must not call back into the runtime; they run
/// while the registry is being scanned.
#[derive(Clone)]
pub struct Filter {
    kind: FinderKind,
    desc: String,
    test: FilterFn,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, self.desc)
    }
}

impl Filter {
    /// True iff every fragment is a substring of the module's current source. Opaque modules
    /// never match.
    pub fn by_code<I, S>(fragments: I) -> Filter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments: Vec<String> = fragments.into_iter().map(Into::into).collect();
        let desc = fragments.iter().map(|f| format!("{f:?}")).join(", ");

        Filter {
            kind: FinderKind::ByCode,
            desc,
            test: Arc::new(move |record| {
                record
                    .source()
                    .map_or(false, |source| fragments.iter().all(|f| source.contains(f.as_str())))
            }),
        }
    }

    /// True iff the module has executed and its exports carry every named property. Never
    /// forces execution; an unexecuted module is simply "not found yet".
    pub fn by_props<I, S>(props: I) -> Filter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let props: Vec<String> = props.into_iter().map(Into::into).collect();
        let desc = props.iter().join(", ");

        Filter {
            kind: FinderKind::ByProps,
            desc,
            test: Arc::new(move |record| {
                record
                    .exports()
                    .map_or(false, |exports| props.iter().all(|p| exports.has_prop(p)))
            }),
        }
    }

    /// Like [`Filter::by_code`], but the executed exports must also look like a renderable
    /// component (duck-typed).
    pub fn component_by_code<I, S>(fragments: I) -> Filter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let code = Filter::by_code(fragments);
        let desc = code.desc.clone();

        Filter {
            kind: FinderKind::ComponentByCode,
            desc,
            test: Arc::new(move |record| {
                code.matches(record)
                    && record.exports().map_or(false, |exports| {
                        exports.is_component() || exports.has_prop("render")
                    })
            }),
        }
    }

    pub fn custom(
        desc: impl Into<String>,
        test: impl Fn(&ModuleRecord) -> bool + Send + Sync + 'static,
    ) -> Filter {
        Filter {
            kind: FinderKind::Custom,
            desc: desc.into(),
            test: Arc::new(test),
        }
    }

    /// Both filters must match. The combined filter reports under this filter's kind.
    pub fn and(self, other: Filter) -> Filter {
        let desc = format!("{} & {}", self.desc, other.desc);
        let (a, b) = (self.test, other.test);

        Filter {
            kind: self.kind,
            desc,
            test: Arc::new(move |record| a(record) && b(record)),
        }
    }

    pub fn kind(&self) -> FinderKind {
        self.kind
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn matches(&self, record: &ModuleRecord) -> bool {
        (self.test)(record)
    }
}

/// Append-only record of a finder call, read back by the reporter.
#[derive(Clone)]
pub struct SearchHistoryEntry {
    pub kind: FinderKind,
    pub args: String,
    pub outcome: SearchOutcome,
}

#[derive(Clone)]
pub enum SearchOutcome {
    Found(ModuleId),
    NotFound,
    Ambiguous(usize),
    /// A deferred lookup; the weak reference goes dead once every handle clone is dropped.
    Lazy(Weak<LazyShared>),
}

impl fmt::Debug for SearchHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match &self.outcome {
            SearchOutcome::Found(id) => format!("found module {id}"),
            SearchOutcome::NotFound => "not found".to_string(),
            SearchOutcome::Ambiguous(count) => format!("{count} matches"),
            SearchOutcome::Lazy(_) => "lazy".to_string(),
        };

        write!(f, "{} [{}] -> {}", self.kind, self.args, outcome)
    }
}
