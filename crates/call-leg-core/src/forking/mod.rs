//! Response forking
//!
//! A proxy may fork the initial INVITE, so responses carrying different
//! to-tags come back on the same client transaction. The call-leg that sent
//! the INVITE is the **original**; each additional to-tag gets its own
//! **fork** call-leg, linked back to the original. The relation is one level
//! deep: a fork is never an original.
//!
//! ```text
//!        INVITE ──▶ proxy ──┬──▶ UAS-1  180 (tag=a) ──▶ original (first tag)
//!                           ├──▶ UAS-2  180 (tag=b) ──▶ fork #1
//!                           └──▶ UAS-3  200 (tag=c) ──▶ fork #2
//! ```

use std::collections::HashMap;

use crate::arena::CallLegHandle;

/// Place of a call-leg in a fork family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForkRelation {
    #[default]
    None,
    /// Original call-leg with its forks keyed by to-tag
    Original { forks: HashMap<String, CallLegHandle> },
    /// Fork created by a response with a new to-tag
    Fork { original: CallLegHandle },
}

impl ForkRelation {
    pub fn is_fork(&self) -> bool {
        matches!(self, ForkRelation::Fork { .. })
    }

    /// The original call-leg of the family `me` belongs to
    pub fn original_of(&self, me: CallLegHandle) -> CallLegHandle {
        match self {
            ForkRelation::Fork { original } => *original,
            _ => me,
        }
    }

    pub fn forks(&self) -> Vec<CallLegHandle> {
        match self {
            ForkRelation::Original { forks } => forks.values().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Record a fork on an original (turning a plain call-leg into one)
    pub fn add_fork(&mut self, to_tag: String, fork: CallLegHandle) {
        match self {
            ForkRelation::Original { forks } => {
                forks.insert(to_tag, fork);
            }
            ForkRelation::None => {
                let mut forks = HashMap::new();
                forks.insert(to_tag, fork);
                *self = ForkRelation::Original { forks };
            }
            // a fork never owns forks
            ForkRelation::Fork { .. } => {}
        }
    }

    fn fork_for_tag(&self, to_tag: &str) -> Option<CallLegHandle> {
        match self {
            ForkRelation::Original { forks } => forks.get(to_tag).copied(),
            _ => None,
        }
    }
}

/// Where a response to the original's INVITE belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRoute {
    /// Process on the original as is
    Original,
    /// Process on the original after recording the response's to-tag
    UpdateRemoteTag,
    /// Create a fork for this to-tag
    NewFork,
    /// Process on an already created fork
    ExistingFork(CallLegHandle),
}

/// Decide where a 1xx/2xx with `to_tag` goes
///
/// `recorded_tag` is the to-tag the original holds, set by the first
/// response that carried one.
pub fn route_response(
    relation: &ForkRelation,
    forking_enabled: bool,
    recorded_tag: Option<&str>,
    to_tag: Option<&str>,
) -> ForkRoute {
    let Some(to_tag) = to_tag else {
        return ForkRoute::Original;
    };

    match recorded_tag {
        None => ForkRoute::UpdateRemoteTag,
        Some(recorded) if recorded == to_tag => ForkRoute::Original,
        Some(_) if !forking_enabled => ForkRoute::UpdateRemoteTag,
        Some(_) => match relation.fork_for_tag(to_tag) {
            Some(fork) => ForkRoute::ExistingFork(fork),
            None => ForkRoute::NewFork,
        },
    }
}
