//! Process lifecycle states and their priority order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::ProcessKey;

/// Lifecycle state of a process key, and of the artifacts it owns.
///
/// `New` and `Missing` are synthetic: `New` is the old state of a key never
/// seen before, `Missing` is the old state of an artifact that should exist
/// but was removed from the store out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    New,
    Active,
    Draft,
    Retired,
    Excluded,
    Missing,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        Self::New,
        Self::Active,
        Self::Draft,
        Self::Retired,
        Self::Excluded,
        Self::Missing,
    ];

    /// Merge priority. Explicit table, independent of declaration order.
    pub fn priority(self) -> i8 {
        match self {
            Self::Active => 3,
            Self::Draft => 2,
            Self::Retired => 1,
            Self::Excluded => 0,
            Self::New | Self::Missing => -1,
        }
    }

    pub fn is_higher_priority(self, other: LifecycleState) -> bool {
        self.priority() > other.priority()
    }

    /// Artifact status written for this state, if it is a deployable one.
    pub fn status_code(self) -> Option<&'static str> {
        match self {
            Self::Active => Some("active"),
            Self::Draft => Some("draft"),
            Self::Retired => Some("retired"),
            Self::New | Self::Excluded | Self::Missing => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Active => "ACTIVE",
            Self::Draft => "DRAFT",
            Self::Retired => "RETIRED",
            Self::Excluded => "EXCLUDED",
            Self::Missing => "MISSING",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of state resolution for one process key in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub key: ProcessKey,
    pub old_state: LifecycleState,
    pub new_state: LifecycleState,
}

impl StateChange {
    pub fn new(key: ProcessKey, old_state: LifecycleState, new_state: LifecycleState) -> Self {
        Self {
            key,
            old_state,
            new_state,
        }
    }

    pub fn is_draft_stable(&self) -> bool {
        self.old_state == LifecycleState::Draft && self.new_state == LifecycleState::Draft
    }
}

/// Key sets that drive state resolution for one pass.
#[derive(Debug, Clone, Default)]
pub struct KeySets {
    pub loaded: BTreeSet<ProcessKey>,
    pub draft: BTreeSet<ProcessKey>,
    pub excluded: BTreeSet<ProcessKey>,
    pub retired: BTreeSet<ProcessKey>,
}

/// Exclusion wins over retirement, retirement over draft, draft over a
/// plain load. Keys that are not loaded at all are excluded.
pub fn resolve_new_state(key: &ProcessKey, sets: &KeySets) -> LifecycleState {
    if sets.excluded.contains(key) {
        LifecycleState::Excluded
    } else if sets.retired.contains(key) {
        LifecycleState::Retired
    } else if sets.draft.contains(key) {
        LifecycleState::Draft
    } else if sets.loaded.contains(key) {
        LifecycleState::Active
    } else {
        LifecycleState::Excluded
    }
}
