//! Notification coalescing.
//!
//! Match events may be held back for a short window so that transient
//! churn (disconnect followed by a prompt reconnect, rapid re-publish)
//! collapses into a single notification carrying the final state.
//! Events for the same (subscription, service) pair combine; a window
//! of zero delivers everything immediately. The window is capped by the
//! service TTL so a notification is never outlived by its record.

use crate::proto::MatchType;
use crate::sd::{MatchEvent, SubscriptionId};

#[derive(Debug)]
struct Pending {
    due_ms: u64,
    event: MatchEvent,
}

#[derive(Debug)]
pub struct Coalescer {
    window_ms: u64,
    pending: Vec<Pending>,
}

impl Coalescer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            pending: Vec::new(),
        }
    }

    /// Absorb one event. Returns it back when it should be delivered
    /// right away (coalescing disabled).
    pub fn push(&mut self, event: MatchEvent, now_ms: u64) -> Option<MatchEvent> {
        if self.window_ms == 0 {
            return Some(event);
        }

        let key = (event.sub_id, event.service_id);
        let slot = self
            .pending
            .iter()
            .position(|p| (p.event.sub_id, p.event.service_id) == key);

        match slot {
            None => {
                let window = match &event.state {
                    Some(state) => self.window_ms.min(state.ttl.saturating_mul(1000)),
                    None => self.window_ms,
                };
                self.pending.push(Pending {
                    due_ms: now_ms.saturating_add(window),
                    event,
                });
                None
            }
            Some(at) => {
                let combined = combine(self.pending[at].event.match_type, event.match_type);
                match combined {
                    None => {
                        // Appeared and gone again within the window:
                        // nothing ever becomes visible.
                        self.pending.remove(at);
                    }
                    Some(match_type) => {
                        let held = &mut self.pending[at].event;
                        held.match_type = match_type;
                        held.state = if match_type == MatchType::Disappeared {
                            None
                        } else {
                            event.state
                        };
                    }
                }
                None
            }
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.iter().map(|p| p.due_ms).min()
    }

    /// Hand out every event whose window has closed, in arrival order.
    pub fn flush_due(&mut self, now_ms: u64) -> Vec<MatchEvent> {
        let mut due = Vec::new();
        let mut kept = Vec::new();
        for pending in self.pending.drain(..) {
            if pending.due_ms <= now_ms {
                due.push(pending.event);
            } else {
                kept.push(pending);
            }
        }
        self.pending = kept;
        due
    }

    /// A cancelled subscription must not notify again.
    pub fn drop_subscription(&mut self, sub_id: SubscriptionId) {
        self.pending.retain(|p| p.event.sub_id != sub_id);
    }
}

/// The combine algebra: the held kind plus the incoming kind. `None`
/// means the pair nets out to nothing.
fn combine(held: MatchType, incoming: MatchType) -> Option<MatchType> {
    match (held, incoming) {
        (MatchType::Appeared, MatchType::Modified) => Some(MatchType::Appeared),
        (MatchType::Appeared, MatchType::Disappeared) => None,
        (MatchType::Modified, MatchType::Modified) => Some(MatchType::Modified),
        (MatchType::Modified, MatchType::Disappeared) => Some(MatchType::Disappeared),
        (MatchType::Disappeared, MatchType::Appeared) => Some(MatchType::Modified),
        // The store cannot produce the remaining sequences; keep the
        // latest kind if it ever sees one.
        (_, incoming) => Some(incoming),
    }
}
