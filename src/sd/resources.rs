//! Resource accounting.
//!
//! Every admission (client connect, service publish, subscription
//! install) is charged against both a per-user and a per-domain ceiling.
//! Absent limits mean no limit.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Clients,
    Services,
    Subscriptions,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Clients => "clients",
            ResourceType::Services => "services",
            ResourceType::Subscriptions => "subscriptions",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("user \"{user}\" already holds the maximum ({limit}) {resource}")]
    UserLimit {
        user: String,
        resource: ResourceType,
        limit: u64,
    },
    #[error("domain total maximum ({limit}) of {resource} already reached")]
    TotalLimit { resource: ResourceType, limit: u64 },
}

/// Per-class ceilings; `None` means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub clients: Option<u64>,
    pub services: Option<u64>,
    pub subscriptions: Option<u64>,
}

impl ResourceLimits {
    fn get(&self, resource: ResourceType) -> Option<u64> {
        match resource {
            ResourceType::Clients => self.clients,
            ResourceType::Services => self.services,
            ResourceType::Subscriptions => self.subscriptions,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Counts {
    clients: u64,
    services: u64,
    subscriptions: u64,
}

impl Counts {
    fn get(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Clients => self.clients,
            ResourceType::Services => self.services,
            ResourceType::Subscriptions => self.subscriptions,
        }
    }

    fn get_mut(&mut self, resource: ResourceType) -> &mut u64 {
        match resource {
            ResourceType::Clients => &mut self.clients,
            ResourceType::Services => &mut self.services,
            ResourceType::Subscriptions => &mut self.subscriptions,
        }
    }

    fn is_zero(&self) -> bool {
        self.clients == 0 && self.services == 0 && self.subscriptions == 0
    }
}

#[derive(Clone, Debug)]
pub struct ResourceManager {
    user_limits: ResourceLimits,
    total_limits: ResourceLimits,
    consumers: HashMap<String, Counts>,
    totals: Counts,
}

impl ResourceManager {
    pub fn new(user_limits: ResourceLimits, total_limits: ResourceLimits) -> Self {
        Self {
            user_limits,
            total_limits,
            consumers: HashMap::new(),
            totals: Counts::default(),
        }
    }

    pub fn allocate(&mut self, user: &str, resource: ResourceType) -> Result<(), ResourceError> {
        if let Some(limit) = self.total_limits.get(resource) {
            if self.totals.get(resource) >= limit {
                return Err(ResourceError::TotalLimit { resource, limit });
            }
        }
        let counts = self.consumers.entry(user.to_string()).or_default();
        if let Some(limit) = self.user_limits.get(resource) {
            if counts.get(resource) >= limit {
                return Err(ResourceError::UserLimit {
                    user: user.to_string(),
                    resource,
                    limit,
                });
            }
        }
        *counts.get_mut(resource) += 1;
        *self.totals.get_mut(resource) += 1;
        Ok(())
    }

    pub fn deallocate(&mut self, user: &str, resource: ResourceType) {
        let remove = match self.consumers.get_mut(user) {
            Some(counts) => {
                let held = counts.get_mut(resource);
                debug_assert!(*held > 0, "deallocate of unheld {resource}");
                *held = held.saturating_sub(1);
                counts.is_zero()
            }
            None => {
                debug_assert!(false, "deallocate for unknown user {user}");
                false
            }
        };
        if remove {
            self.consumers.remove(user);
        }
        let total = self.totals.get_mut(resource);
        *total = total.saturating_sub(1);
    }

    /// Move one held resource between users. Deallocation happens first
    /// so the move cannot trip the domain total; a per-user failure on
    /// the receiving side rolls the unit back.
    pub fn transfer(
        &mut self,
        from_user: &str,
        to_user: &str,
        resource: ResourceType,
    ) -> Result<(), ResourceError> {
        if from_user == to_user {
            return Ok(());
        }
        self.deallocate(from_user, resource);
        if let Err(err) = self.allocate(to_user, resource) {
            let restored = self.allocate(from_user, resource);
            debug_assert!(restored.is_ok(), "rollback re-allocation failed");
            return Err(err);
        }
        Ok(())
    }

    pub fn total(&self, resource: ResourceType) -> u64 {
        self.totals.get(resource)
    }

    pub fn user_held(&self, user: &str, resource: ResourceType) -> u64 {
        self.consumers
            .get(user)
            .map(|counts| counts.get(resource))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(clients: Option<u64>, services: Option<u64>, subscriptions: Option<u64>) -> ResourceLimits {
        ResourceLimits {
            clients,
            services,
            subscriptions,
        }
    }

    #[test]
    fn user_limit_is_enforced() {
        let mut rm = ResourceManager::new(
            limits(None, Some(2), None),
            ResourceLimits::default(),
        );
        rm.allocate("u", ResourceType::Services).expect("first");
        rm.allocate("u", ResourceType::Services).expect("second");
        assert!(matches!(
            rm.allocate("u", ResourceType::Services),
            Err(ResourceError::UserLimit { .. })
        ));
        // Another user is unaffected.
        rm.allocate("v", ResourceType::Services).expect("other user");
    }

    #[test]
    fn total_limit_is_enforced_across_users() {
        let mut rm = ResourceManager::new(
            ResourceLimits::default(),
            limits(Some(2), None, None),
        );
        rm.allocate("a", ResourceType::Clients).expect("a");
        rm.allocate("b", ResourceType::Clients).expect("b");
        assert!(matches!(
            rm.allocate("c", ResourceType::Clients),
            Err(ResourceError::TotalLimit { .. })
        ));
        rm.deallocate("a", ResourceType::Clients);
        rm.allocate("c", ResourceType::Clients).expect("freed slot");
    }

    #[test]
    fn deallocate_forgets_idle_users() {
        let mut rm = ResourceManager::new(ResourceLimits::default(), ResourceLimits::default());
        rm.allocate("u", ResourceType::Subscriptions).expect("alloc");
        rm.deallocate("u", ResourceType::Subscriptions);
        assert_eq!(rm.total(ResourceType::Subscriptions), 0);
        assert!(rm.consumers.is_empty());
    }

    #[test]
    fn transfer_rolls_back_on_receiver_limit() {
        let mut rm = ResourceManager::new(
            limits(None, Some(1), None),
            ResourceLimits::default(),
        );
        rm.allocate("a", ResourceType::Services).expect("a");
        rm.allocate("b", ResourceType::Services).expect("b");
        assert!(rm.transfer("a", "b", ResourceType::Services).is_err());
        assert_eq!(rm.user_held("a", ResourceType::Services), 1);
        assert_eq!(rm.user_held("b", ResourceType::Services), 1);
    }

    #[test]
    fn transfer_does_not_trip_the_total_limit() {
        let mut rm = ResourceManager::new(
            ResourceLimits::default(),
            limits(None, Some(1), None),
        );
        rm.allocate("a", ResourceType::Services).expect("a");
        rm.transfer("a", "b", ResourceType::Services).expect("transfer");
        assert_eq!(rm.user_held("b", ResourceType::Services), 1);
        assert_eq!(rm.total(ResourceType::Services), 1);
    }
}
