//! Subscriptions and match bookkeeping.

use std::collections::HashSet;

use crate::filter::Filter;
use crate::props::PropMap;
use crate::proto::MatchType;

use super::{ClientId, ServiceId, SubscriptionId};

/// One installed subscription, together with the set of services it
/// currently matches. Membership is what turns a stream of service
/// mutations into appeared/modified/disappeared notifications.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub sub_id: SubscriptionId,
    pub owner: ClientId,
    pub user_id: String,
    pub filter: Option<Filter>,
    matched: HashSet<ServiceId>,
}

impl Subscription {
    pub fn new(
        sub_id: SubscriptionId,
        owner: ClientId,
        user_id: String,
        filter: Option<Filter>,
    ) -> Self {
        Self {
            sub_id,
            owner,
            user_id,
            filter,
            matched: HashSet::new(),
        }
    }

    pub fn matches(&self, props: &PropMap) -> bool {
        match &self.filter {
            Some(filter) => filter.matches(props),
            None => true,
        }
    }

    pub fn is_matched(&self, service_id: ServiceId) -> bool {
        self.matched.contains(&service_id)
    }

    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }

    /// Record a service mutation. `props` is the new property state, or
    /// `None` when the service was removed. Returns the notification
    /// this subscription owes its client, if any.
    pub fn on_service_change(
        &mut self,
        service_id: ServiceId,
        props: Option<&PropMap>,
    ) -> Option<MatchType> {
        let was_member = self.matched.contains(&service_id);
        let now_matches = props.is_some_and(|props| self.matches(props));
        match (was_member, now_matches) {
            (false, true) => {
                self.matched.insert(service_id);
                Some(MatchType::Appeared)
            }
            (true, true) => Some(MatchType::Modified),
            (true, false) => {
                self.matched.remove(&service_id);
                Some(MatchType::Disappeared)
            }
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;

    fn sub(filter_expr: Option<&str>) -> Subscription {
        let filter = filter_expr.map(|expr| filter::parse(expr).expect("filter"));
        Subscription::new(1, 10, "default".into(), filter)
    }

    fn named(name: &str) -> PropMap {
        [("name", name)].into_iter().collect()
    }

    #[test]
    fn membership_transitions_drive_match_types() {
        let mut s = sub(Some("(name=foo)"));

        assert_eq!(s.on_service_change(7, Some(&named("foo"))), Some(MatchType::Appeared));
        assert_eq!(s.on_service_change(7, Some(&named("foo"))), Some(MatchType::Modified));
        assert_eq!(
            s.on_service_change(7, Some(&named("bar"))),
            Some(MatchType::Disappeared)
        );
        assert_eq!(s.on_service_change(7, Some(&named("bar"))), None);
        assert_eq!(s.matched_count(), 0);
    }

    #[test]
    fn removal_of_a_member_disappears() {
        let mut s = sub(None);
        assert_eq!(s.on_service_change(7, Some(&named("x"))), Some(MatchType::Appeared));
        assert_eq!(s.on_service_change(7, None), Some(MatchType::Disappeared));
    }

    #[test]
    fn removal_of_a_non_member_is_silent() {
        let mut s = sub(Some("(name=foo)"));
        assert_eq!(s.on_service_change(7, None), None);
    }

    #[test]
    fn match_all_subscription_has_no_filter() {
        let mut s = sub(None);
        assert_eq!(s.on_service_change(1, Some(&named("anything"))), Some(MatchType::Appeared));
    }
}
