//! Handles for module-derived values that may not exist yet. A handle resolves at most once,
//! driven by registry events rather than polling, and every clone shares the same state.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::{
    finder::{Filter, FinderKind},
    registry::Exports,
};

/// Externally visible state of a lazy lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LazyStatus {
    /// Constructed but not yet attempted against the registry.
    Created,
    /// Attempted at least once with no match; retried on every registry event.
    Pending,
    Resolved,
    /// Terminal. Only required lookups are failed, by the reporter, after boot completes.
    Failed,
}

enum State {
    Created,
    Pending,
    Resolved(Exports),
    Failed,
}

/// Shared core of a lazy lookup. The registry holds weak references to these; dropping every
/// handle clone silently retires the lookup.
pub struct LazyShared {
    pub(crate) kind: FinderKind,
    pub(crate) filter: Filter,
    pub(crate) required: bool,
    state: Mutex<State>,
}

impl LazyShared {
    pub(crate) fn new(kind: FinderKind, filter: Filter, required: bool) -> Arc<LazyShared> {
        Arc::new(LazyShared {
            kind,
            filter,
            required,
            state: Mutex::new(State::Created),
        })
    }

    pub(crate) fn status(&self) -> LazyStatus {
        match *self.state.lock().unwrap() {
            State::Created => LazyStatus::Created,
            State::Pending => LazyStatus::Pending,
            State::Resolved(_) => LazyStatus::Resolved,
            State::Failed => LazyStatus::Failed,
        }
    }

    pub(crate) fn value(&self) -> Option<Exports> {
        match &*self.state.lock().unwrap() {
            State::Resolved(exports) => Some(exports.clone()),
            _ => None,
        }
    }

    pub(crate) fn mark_pending(&self) {
        let mut state = self.state.lock().unwrap();

        if matches!(*state, State::Created) {
            *state = State::Pending;
        }
    }

    /// Transitions to `Resolved` at most once; later calls are ignored so that a handle's value
    /// never changes after consumers have seen it.
    pub(crate) fn resolve(&self, exports: Exports) {
        let mut state = self.state.lock().unwrap();

        match *state {
            State::Created | State::Pending => *state = State::Resolved(exports),
            State::Resolved(_) | State::Failed => {}
        }
    }

    pub(crate) fn mark_failed(&self) {
        let mut state = self.state.lock().unwrap();

        if !matches!(*state, State::Resolved(_)) {
            *state = State::Failed;
        }
    }
}

/// Returned where a caller demands a resolved value; carries enough context to attribute the
/// dangling lookup.
#[derive(Clone, Debug, Error)]
#[error("lazy {kind} lookup [{args}] has not resolved yet")]
pub struct LazyUnresolved {
    pub kind: FinderKind,
    pub args: String,
}

/// A clonable reference to a deferred lookup. All clones observe the same resolution.
#[derive(Clone)]
pub struct LazyHandle {
    shared: Arc<LazyShared>,
}

impl LazyHandle {
    pub(crate) fn from_shared(shared: Arc<LazyShared>) -> LazyHandle {
        LazyHandle { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<LazyShared> {
        &self.shared
    }

    /// The wrapped-getter contract: the underlying value if resolved, `None` otherwise. Error
    /// boundaries and the reporter use this to detect dangling lazies without throwing.
    pub fn get(&self) -> Option<Exports> {
        self.shared.value()
    }

    /// Like [`LazyHandle::get`], but failure is an error naming the lookup, so misuse before
    /// resolution surfaces during development instead of silently propagating a missing value.
    pub fn resolved(&self) -> Result<Exports, LazyUnresolved> {
        self.shared.value().ok_or_else(|| LazyUnresolved {
            kind: self.shared.kind,
            args: self.shared.filter.desc().to_string(),
        })
    }

    pub fn status(&self) -> LazyStatus {
        self.shared.status()
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == LazyStatus::Resolved
    }
}
