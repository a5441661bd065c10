//! Observability hooks for the election loop

use crate::candidate::CandidateId;
use crate::election::LeadershipState;
use crate::error::ElectionError;
use crate::watch::WatchFired;

/// Receives election lifecycle notifications.
///
/// Every method has an empty default, so implementors only override what they
/// care about. Hooks run on the election task and must not block.
pub trait ElectionObserver: Send + Sync {
    fn on_state_change(&self, _previous: &LeadershipState, _current: &LeadershipState) {}

    fn on_registered(&self, _candidate: &CandidateId) {}

    fn on_watch_armed(&self, _candidate: &CandidateId, _target: &CandidateId) {}

    fn on_watch_fired(&self, _candidate: &CandidateId, _fired: &WatchFired) {}

    /// An error the loop recovered from, or the error that ended it
    fn on_error(&self, _error: &ElectionError, _fatal: bool) {}
}

/// Default observer: structured `tracing` events
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

impl ElectionObserver for TracingObserver {
    fn on_state_change(&self, previous: &LeadershipState, current: &LeadershipState) {
        match current {
            LeadershipState::Leader { candidate } => {
                tracing::info!(candidate = %candidate, "Elected leader");
            }
            LeadershipState::Watching {
                candidate,
                predecessor,
            } => {
                tracing::info!(
                    candidate = %candidate,
                    predecessor = %predecessor,
                    "Following, watching predecessor"
                );
            }
            _ => tracing::debug!("Election state {} -> {}", previous, current),
        }
    }

    fn on_registered(&self, candidate: &CandidateId) {
        tracing::debug!(candidate = %candidate, "Candidate registered");
    }

    fn on_watch_fired(&self, candidate: &CandidateId, fired: &WatchFired) {
        match fired {
            WatchFired::Deleted(target) => tracing::info!(
                candidate = %candidate,
                predecessor = %target,
                "Predecessor left, re-running election"
            ),
            WatchFired::Abandoned { target, error } => tracing::warn!(
                candidate = %candidate,
                predecessor = %target,
                error = %error,
                "Watch abandoned"
            ),
        }
    }

    fn on_error(&self, error: &ElectionError, fatal: bool) {
        if fatal {
            tracing::error!(error = %error, "Election loop terminated");
        } else {
            tracing::warn!(error = %error, "Election recovering");
        }
    }
}
