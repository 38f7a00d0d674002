//! Subscription and notification bus.
//!
//! Each binding owns a [`SubscriberList`]. After a computation settles the
//! cache picks the callbacks that should hear about it and runs them once the
//! cache lock is released, in subscription order.
//!
//! Two delivery modes exist:
//!
//! - `Distinct` (public): only when the value changed, or on a new failure
//! - `Settled` (internal): after every settle, used by aggregate consumers
//!   that compose many bindings and need to know when all of them are done

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::descriptor::CacheKey;
use crate::ledger::LedgerError;
use crate::types::Value;

/// A binding notification.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingEvent {
    /// A new value was computed
    Updated {
        key: CacheKey,
        value: Value,
        computed_at: DateTime<Utc>,
    },
    /// The computation failed; `last_good` is the value still served by `peek`
    Failed {
        key: CacheKey,
        error: LedgerError,
        last_good: Option<Value>,
    },
}

impl BindingEvent {
    /// Key of the binding the event is about.
    pub fn key(&self) -> &CacheKey {
        match self {
            BindingEvent::Updated { key, .. } | BindingEvent::Failed { key, .. } => key,
        }
    }

    /// The current value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            BindingEvent::Updated { value, .. } => Some(value),
            BindingEvent::Failed { last_good, .. } => last_good.as_ref(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BindingEvent::Failed { .. })
    }
}

/// Consumer callback.
pub type Callback = Arc<dyn Fn(&BindingEvent) + Send + Sync>;

/// Identifies a subscription for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Identifies one acquired handle. Subscriptions are owned by the handle that
/// created them and go away when it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleToken(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Distinct,
    Settled,
}

struct Subscriber {
    id: SubscriptionId,
    owner: HandleToken,
    delivery: Delivery,
    callback: Callback,
}

/// Subscribers of one binding, in subscription order.
#[derive(Default)]
pub(crate) struct SubscriberList {
    entries: Vec<Subscriber>,
}

impl SubscriberList {
    pub(crate) fn push(&mut self, id: SubscriptionId, owner: HandleToken, delivery: Delivery, callback: Callback) {
        self.entries.push(Subscriber {
            id,
            owner,
            delivery,
            callback,
        });
    }

    /// Remove one subscription if `owner` holds it.
    pub(crate) fn remove(&mut self, id: SubscriptionId, owner: HandleToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| !(s.id == id && s.owner == owner));
        self.entries.len() != before
    }

    /// Remove every subscription of a released handle.
    pub(crate) fn remove_owner(&mut self, owner: HandleToken) -> usize {
        let before = self.entries.len();
        self.entries.retain(|s| s.owner != owner);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Callbacks to run for a settle. `publish` is true when public
    /// subscribers should hear about it.
    pub(crate) fn targets(&self, publish: bool) -> Vec<Callback> {
        self.entries
            .iter()
            .filter(|s| publish || s.delivery == Delivery::Settled)
            .map(|s| Arc::clone(&s.callback))
            .collect()
    }
}

/// Run callbacks in order. Called with no cache lock held.
pub(crate) fn dispatch(targets: &[Callback], event: &BindingEvent) {
    for callback in targets {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cents;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Callback {
        let log = Arc::clone(log);
        let name = name.to_string();
        Arc::new(move |_event: &BindingEvent| log.lock().unwrap().push(name.clone()))
    }

    fn event() -> BindingEvent {
        BindingEvent::Failed {
            key: crate::descriptor::canonicalize(&crate::QueryDescriptor::balance("checking")).unwrap(),
            error: LedgerError::Unavailable("offline".into()),
            last_good: Some(Value::Amount(Cents(12_000))),
        }
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SubscriberList::default();
        list.push(SubscriptionId(1), HandleToken(1), Delivery::Distinct, recorder(&log, "a"));
        list.push(SubscriptionId(2), HandleToken(2), Delivery::Settled, recorder(&log, "b"));
        list.push(SubscriptionId(3), HandleToken(1), Delivery::Distinct, recorder(&log, "c"));

        dispatch(&list.targets(true), &event());
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);

        log.lock().unwrap().clear();
        dispatch(&list.targets(false), &event());
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_remove_checks_owner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = SubscriberList::default();
        list.push(SubscriptionId(1), HandleToken(1), Delivery::Distinct, recorder(&log, "a"));
        list.push(SubscriptionId(2), HandleToken(1), Delivery::Distinct, recorder(&log, "b"));
        list.push(SubscriptionId(3), HandleToken(2), Delivery::Distinct, recorder(&log, "c"));

        assert!(!list.remove(SubscriptionId(1), HandleToken(2)));
        assert!(list.remove(SubscriptionId(1), HandleToken(1)));
        assert_eq!(list.remove_owner(HandleToken(1)), 1);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_event_accessors() {
        let event = event();
        assert!(event.is_failure());
        assert_eq!(event.value(), Some(&Value::Amount(Cents(12_000))));
        assert!(event.key().as_str().starts_with("account/balance"));
    }
}
