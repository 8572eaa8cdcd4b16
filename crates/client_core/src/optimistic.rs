use std::{collections::HashMap, time::Duration};

use shared::domain::{LocalId, MessageId};
use tokio::time::Instant;
use tracing::debug;

use crate::model::Draft;

/// Handle for one in-flight optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackingToken(LocalId);

impl TrackingToken {
    pub fn local_id(&self) -> LocalId {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    InFlight,
    Expired,
}

#[derive(Debug, Clone)]
struct TrackedSend {
    draft: Draft,
    deadline: Instant,
    state: SendState,
    attempts: u32,
}

/// Correlates local sends with their server-confirmed copies and owns the
/// confirmation deadline of each one.
///
/// Entries live from `begin_send` until `reconcile` or `forget`. An expired
/// entry is kept so that a late confirmation can still be matched.
#[derive(Debug)]
pub struct OptimisticSendTracker {
    timeout: Duration,
    sends: HashMap<LocalId, TrackedSend>,
}

impl OptimisticSendTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sends: HashMap::new(),
        }
    }

    /// Starts tracking `local_id`. Calling it again for the same id (a retry)
    /// resets the deadline and bumps the attempt counter.
    pub fn begin_send(&mut self, local_id: LocalId, draft: Draft) -> TrackingToken {
        let deadline = Instant::now() + self.timeout;
        self.sends
            .entry(local_id)
            .and_modify(|send| {
                send.draft = draft.clone();
                send.deadline = deadline;
                send.state = SendState::InFlight;
                send.attempts += 1;
            })
            .or_insert(TrackedSend {
                draft,
                deadline,
                state: SendState::InFlight,
                attempts: 1,
            });
        TrackingToken(local_id)
    }

    /// When the server must have confirmed the send. `None` once the send
    /// expired or stopped being tracked.
    pub fn deadline(&self, token: TrackingToken) -> Option<Instant> {
        self.sends
            .get(&token.0)
            .filter(|send| send.state == SendState::InFlight)
            .map(|send| send.deadline)
    }

    /// Marks the send confirmed as `message_id`. Returns false when the token
    /// was unknown or already reconciled.
    pub fn reconcile(&mut self, token: TrackingToken, message_id: &MessageId) -> bool {
        let Some(send) = self.sends.remove(&token.0) else {
            return false;
        };
        if send.state == SendState::Expired {
            debug!(local_id = %token.0, message_id = %message_id, "send: late confirmation");
        }
        true
    }

    /// Flags an in-flight send as timed out. Returns false if it was not
    /// in flight.
    pub fn expire(&mut self, token: TrackingToken) -> bool {
        match self.sends.get_mut(&token.0) {
            Some(send) if send.state == SendState::InFlight => {
                send.state = SendState::Expired;
                true
            }
            _ => false,
        }
    }

    pub fn forget(&mut self, token: TrackingToken) -> Option<Draft> {
        self.sends.remove(&token.0).map(|send| send.draft)
    }

    /// Token for a `clientRef` echoed back by the server, if that send is
    /// still tracked.
    pub fn token_for_client_ref(&self, client_ref: &LocalId) -> Option<TrackingToken> {
        self.sends.contains_key(client_ref).then_some(TrackingToken(*client_ref))
    }

    pub fn attempts(&self, token: TrackingToken) -> u32 {
        self.sends.get(&token.0).map_or(0, |send| send.attempts)
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
