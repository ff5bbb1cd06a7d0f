//! The service discovery domain store.
//!
//! One [`Domain`] owns every client, service and subscription record of
//! a discovery domain, plus the resource counters and the orphan
//! timeout queue. All mutations funnel through here and return the
//! subscription match events they caused; the caller (the server
//! engine) decides how to deliver them. The store itself never touches
//! a socket, which is also what makes it directly testable.

mod deadline;
mod resources;
mod service;
mod subscription;

use std::collections::HashMap;

use thiserror::Error;

pub use deadline::DeadlineQueue;
pub use resources::{ResourceError, ResourceLimits, ResourceManager, ResourceType};
pub use service::Service;
pub use subscription::Subscription;

use crate::filter::Filter;
use crate::props::PropMap;
use crate::proto::MatchType;

pub type ClientId = u64;
pub type ServiceId = u64;
pub type SubscriptionId = u64;

/// Cross-user access knobs. Same-user access from a different client is
/// always permitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub cross_user_publish: bool,
    pub cross_user_unpublish: bool,
}

#[derive(Debug, Error)]
pub enum SdError {
    #[error("client id {0} already connected")]
    ClientExists(ClientId),
    #[error("client id {0} not found")]
    UnknownClient(ClientId),
    #[error("service id {0} not found")]
    UnknownService(ServiceId),
    #[error("subscription id {0} not found")]
    UnknownSubscription(SubscriptionId),
    #[error("subscription id {0} already exists")]
    SubscriptionExists(SubscriptionId),
    #[error("user \"{user}\" may not change a service owned by user \"{owner}\"")]
    UserMismatch { user: String, owner: String },
    #[error("client id {client} may not cancel a subscription owned by client id {owner}")]
    SubscriptionOwner { client: ClientId, owner: ClientId },
    #[error("invalid generation {requested}: existing service already at generation {current}")]
    OldGeneration { requested: u64, current: u64 },
    #[error("properties or TTL changed, but generation is left at {0}")]
    SameGenerationButDifferent(u64),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// A connected client, as the store sees it. Everything session-shaped
/// (transport, transactions, liveness) lives with the server engine.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub user_id: String,
}

/// A snapshot of service state carried by a match event.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceState {
    pub generation: u64,
    pub props: PropMap,
    pub ttl: u64,
    pub owner: ClientId,
    pub orphan_since: Option<u64>,
}

impl ServiceState {
    fn of(service: &Service) -> Self {
        Self {
            generation: service.generation,
            props: service.props.clone(),
            ttl: service.ttl,
            owner: service.owner,
            orphan_since: service.orphan_since,
        }
    }
}

/// One notification owed to one subscription. `state` is present for
/// `appeared` and `modified`, absent for `disappeared`.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchEvent {
    pub sub_id: SubscriptionId,
    pub subscriber: ClientId,
    pub match_type: MatchType,
    pub service_id: ServiceId,
    pub state: Option<ServiceState>,
}

/// The result of a client disconnect.
#[derive(Debug, Default)]
pub struct DisconnectOutcome {
    pub events: Vec<MatchEvent>,
    pub dropped_subscriptions: Vec<SubscriptionId>,
}

pub struct Domain {
    clients: HashMap<ClientId, ClientRecord>,
    services: HashMap<ServiceId, Service>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    resources: ResourceManager,
    orphans: DeadlineQueue<ServiceId>,
    policy: AccessPolicy,
}

impl Domain {
    pub fn new(
        user_limits: ResourceLimits,
        total_limits: ResourceLimits,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            services: HashMap::new(),
            subscriptions: HashMap::new(),
            resources: ResourceManager::new(user_limits, total_limits),
            orphans: DeadlineQueue::new(),
            policy,
        }
    }

    pub fn has_client(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// The shortest TTL over the client's services, which tightens its
    /// liveness requirement.
    pub fn min_owned_ttl(&self, client_id: ClientId) -> Option<u64> {
        self.services
            .values()
            .filter(|svc| svc.owner == client_id && !svc.is_orphan())
            .map(|svc| svc.ttl)
            .min()
    }

    pub fn client_connect(&mut self, client_id: ClientId, user_id: &str) -> Result<(), SdError> {
        if self.clients.contains_key(&client_id) {
            return Err(SdError::ClientExists(client_id));
        }
        self.resources.allocate(user_id, ResourceType::Clients)?;
        self.clients.insert(
            client_id,
            ClientRecord {
                user_id: user_id.to_string(),
            },
        );
        Ok(())
    }

    /// Remove a departing client: its subscriptions go silently, its
    /// services become orphans (a modification visible to every other
    /// matching subscription) with reapers scheduled at TTL.
    pub fn client_disconnect(
        &mut self,
        client_id: ClientId,
        now_ms: u64,
    ) -> Result<DisconnectOutcome, SdError> {
        let client = self
            .clients
            .remove(&client_id)
            .ok_or(SdError::UnknownClient(client_id))?;

        let mut outcome = DisconnectOutcome::default();

        let owned_subs: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|sub| sub.owner == client_id)
            .map(|sub| sub.sub_id)
            .collect();
        for sub_id in owned_subs {
            if let Some(sub) = self.subscriptions.remove(&sub_id) {
                self.resources
                    .deallocate(&sub.user_id, ResourceType::Subscriptions);
                outcome.dropped_subscriptions.push(sub_id);
            }
        }

        let owned_services: Vec<ServiceId> = self
            .services
            .values()
            .filter(|svc| svc.owner == client_id)
            .map(|svc| svc.service_id)
            .collect();
        for service_id in owned_services {
            if let Some(svc) = self.services.get_mut(&service_id) {
                svc.orphan_since = Some(now_ms);
                if let Some(deadline) = svc.orphan_deadline_ms() {
                    self.orphans.insert(service_id, deadline);
                }
            }
            outcome
                .events
                .extend(fan_out(&mut self.subscriptions, &self.services, service_id));
        }

        self.resources
            .deallocate(&client.user_id, ResourceType::Clients);
        Ok(outcome)
    }

    pub fn publish(
        &mut self,
        client_id: ClientId,
        service_id: ServiceId,
        generation: u64,
        props: PropMap,
        ttl: u64,
    ) -> Result<Vec<MatchEvent>, SdError> {
        let user_id = self.client_user(client_id)?;

        let (prev_user, was_orphan) = match self.services.get(&service_id) {
            None => {
                self.resources.allocate(&user_id, ResourceType::Services)?;
                self.services.insert(
                    service_id,
                    Service {
                        service_id,
                        generation,
                        props,
                        ttl,
                        owner: client_id,
                        user_id,
                        orphan_since: None,
                    },
                );
                return Ok(fan_out(
                    &mut self.subscriptions,
                    &self.services,
                    service_id,
                ));
            }
            Some(existing) => {
                if existing.user_id != user_id && !self.policy.cross_user_publish {
                    return Err(SdError::UserMismatch {
                        user: user_id,
                        owner: existing.user_id.clone(),
                    });
                }
                if generation < existing.generation {
                    return Err(SdError::OldGeneration {
                        requested: generation,
                        current: existing.generation,
                    });
                }
                if generation == existing.generation {
                    if !existing.same_body(generation, &props, ttl) {
                        return Err(SdError::SameGenerationButDifferent(generation));
                    }
                    if existing.owner == client_id && !existing.is_orphan() {
                        // Exact re-publish; this is what makes client
                        // reconnect-and-republish cheap.
                        return Ok(Vec::new());
                    }
                }
                (existing.user_id.clone(), existing.is_orphan())
            }
        };

        // The record changes: a newer generation overwrites the body,
        // and in every case the service is (re-)homed to the caller.
        if prev_user != user_id {
            self.resources
                .transfer(&prev_user, &user_id, ResourceType::Services)?;
        }
        if was_orphan {
            self.orphans.remove(&service_id);
        }
        if let Some(existing) = self.services.get_mut(&service_id) {
            existing.generation = generation;
            existing.props = props;
            existing.ttl = ttl;
            existing.owner = client_id;
            existing.user_id = user_id;
            existing.orphan_since = None;
        }

        Ok(fan_out(
            &mut self.subscriptions,
            &self.services,
            service_id,
        ))
    }

    pub fn unpublish(
        &mut self,
        client_id: ClientId,
        service_id: ServiceId,
    ) -> Result<Vec<MatchEvent>, SdError> {
        let user_id = self.client_user(client_id)?;
        let service = self
            .services
            .get(&service_id)
            .ok_or(SdError::UnknownService(service_id))?;
        if service.user_id != user_id && !self.policy.cross_user_unpublish {
            return Err(SdError::UserMismatch {
                user: user_id,
                owner: service.user_id.clone(),
            });
        }
        Ok(self.remove_service(service_id))
    }

    pub fn subscribe(
        &mut self,
        client_id: ClientId,
        sub_id: SubscriptionId,
        filter: Option<Filter>,
    ) -> Result<(), SdError> {
        let user_id = self.client_user(client_id)?;
        if self.subscriptions.contains_key(&sub_id) {
            return Err(SdError::SubscriptionExists(sub_id));
        }
        self.resources
            .allocate(&user_id, ResourceType::Subscriptions)?;
        self.subscriptions
            .insert(sub_id, Subscription::new(sub_id, client_id, user_id, filter));
        Ok(())
    }

    /// Produce the initial `appeared` backlog of a fresh subscription.
    /// Scans the whole service table; subscribe is rare next to match
    /// evaluation on publish.
    pub fn activate_subscription(&mut self, sub_id: SubscriptionId) -> Vec<MatchEvent> {
        let mut events = Vec::new();
        let Some(sub) = self.subscriptions.get_mut(&sub_id) else {
            return events;
        };
        for service in self.services.values() {
            if let Some(match_type) =
                sub.on_service_change(service.service_id, Some(&service.props))
            {
                events.push(MatchEvent {
                    sub_id,
                    subscriber: sub.owner,
                    match_type,
                    service_id: service.service_id,
                    state: Some(ServiceState::of(service)),
                });
            }
        }
        events
    }

    pub fn unsubscribe(
        &mut self,
        client_id: ClientId,
        sub_id: SubscriptionId,
    ) -> Result<(), SdError> {
        self.client_user(client_id)?;
        let sub = self
            .subscriptions
            .get(&sub_id)
            .ok_or(SdError::UnknownSubscription(sub_id))?;
        if sub.owner != client_id {
            return Err(SdError::SubscriptionOwner {
                client: client_id,
                owner: sub.owner,
            });
        }
        if let Some(sub) = self.subscriptions.remove(&sub_id) {
            self.resources
                .deallocate(&sub.user_id, ResourceType::Subscriptions);
        }
        Ok(())
    }

    /// When the earliest orphan TTL runs out.
    pub fn next_orphan_deadline(&self) -> Option<u64> {
        self.orphans.next_deadline()
    }

    /// Reap every orphan whose TTL has expired.
    pub fn purge_due_orphans(&mut self, now_ms: u64) -> Vec<MatchEvent> {
        let mut events = Vec::new();
        for service_id in self.orphans.pop_due(now_ms) {
            // A timer for a service that was re-claimed or removed in
            // the meantime no longer has a queue entry, so everything
            // popped here is still an orphan.
            events.extend(self.remove_service(service_id));
        }
        events
    }

    fn remove_service(&mut self, service_id: ServiceId) -> Vec<MatchEvent> {
        let Some(service) = self.services.remove(&service_id) else {
            return Vec::new();
        };
        if service.is_orphan() {
            self.orphans.remove(&service_id);
        }
        self.resources
            .deallocate(&service.user_id, ResourceType::Services);
        fan_out(&mut self.subscriptions, &self.services, service_id)
    }

    fn client_user(&self, client_id: ClientId) -> Result<String, SdError> {
        self.clients
            .get(&client_id)
            .map(|client| client.user_id.clone())
            .ok_or(SdError::UnknownClient(client_id))
    }
}

/// Re-evaluate every subscription against the current state of one
/// service (absent from `services` = removed) and collect the owed
/// notifications. O(|subscriptions|) per mutation, which is fine for
/// the intended population.
fn fan_out(
    subscriptions: &mut HashMap<SubscriptionId, Subscription>,
    services: &HashMap<ServiceId, Service>,
    service_id: ServiceId,
) -> Vec<MatchEvent> {
    let service = services.get(&service_id);
    let mut events = Vec::new();
    for sub in subscriptions.values_mut() {
        let match_type = sub.on_service_change(service_id, service.map(|svc| &svc.props));
        if let Some(match_type) = match_type {
            events.push(MatchEvent {
                sub_id: sub.sub_id,
                subscriber: sub.owner,
                match_type,
                service_id,
                state: if match_type == MatchType::Disappeared {
                    None
                } else {
                    service.map(ServiceState::of)
                },
            });
        }
    }
    events
}
