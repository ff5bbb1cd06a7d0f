//! Service records.

use crate::props::PropMap;

use super::{ClientId, ServiceId};

/// One published service. `owner` is a lookup key into the domain's
/// client map, never an owning handle; when the owner is gone,
/// `orphan_since` records the disconnect time instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Service {
    pub service_id: ServiceId,
    pub generation: u64,
    pub props: PropMap,
    pub ttl: u64,
    pub owner: ClientId,
    pub user_id: String,
    pub orphan_since: Option<u64>,
}

impl Service {
    pub fn is_orphan(&self) -> bool {
        self.orphan_since.is_some()
    }

    /// The instant at which an unclaimed orphan is reaped.
    pub fn orphan_deadline_ms(&self) -> Option<u64> {
        self.orphan_since
            .map(|since| since.saturating_add(self.ttl.saturating_mul(1000)))
    }

    /// Whether a re-publish carries the exact body already stored.
    pub fn same_body(&self, generation: u64, props: &PropMap, ttl: u64) -> bool {
        self.generation == generation && self.ttl == ttl && &self.props == props
    }
}
