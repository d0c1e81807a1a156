use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::Member;

/// Liveness tracking for the assignment authority, based on heartbeat advancement.
///
/// A member is live while its heartbeat keeps changing. Heartbeats are opaque tokens, so only
/// a change is observed, never their value relative to a clock. Members observed for the first
/// time are considered live until the timeout elapses without their heartbeat changing.
#[derive(Debug)]
pub struct LivenessTracker {
    timeout: Duration,
    /// The last heartbeat seen per member UUID, along with when it last changed.
    seen: HashMap<String, (i64, Instant)>,
}

impl LivenessTracker {
    /// Create a new instance.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, seen: HashMap::new() }
    }

    /// Observe the given listing of members at the given instant, returning the live members
    /// in listing order.
    ///
    /// Members which are no longer listed are forgotten.
    pub fn observe(&mut self, members: &[Member], now: Instant) -> Vec<Member> {
        self.seen.retain(|uuid, _| members.iter().any(|member| &member.uuid == uuid));

        let mut live = Vec::with_capacity(members.len());
        for member in members {
            let (heartbeat, changed_at) = self.seen.entry(member.uuid.clone()).or_insert((member.heartbeat, now));
            if *heartbeat != member.heartbeat {
                *heartbeat = member.heartbeat;
                *changed_at = now;
            }
            if now.saturating_duration_since(*changed_at) <= self.timeout {
                live.push(member.clone());
            }
        }
        live
    }

    /// The number of members currently tracked.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}
