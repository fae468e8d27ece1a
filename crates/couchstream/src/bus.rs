//! In-process event bus
//!
//! Membership changes and rebalance requests are multiplexed to both the
//! stream coordinator and, when leader election is enabled, the follower
//! RPC layer. Dispatch is synchronous on the publisher's thread, in
//! registration order; subscribers that must not block the publisher hand
//! off to their own task.

use crate::membership::Model;
use parking_lot::RwLock;
use std::sync::Arc;

/// Events carried on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The group's `(member_number, total_members)` tuple changed
    MembershipChanged(Model),
    /// A vbucket redistribution was requested explicitly
    RebalanceRequested,
    /// This instance no longer has an assignment (leader lost); streams
    /// must close until a new model arrives
    MembershipLost,
    /// The process must stop (fatal condition or signal)
    ShutdownRequested,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Process-wide typed publish/subscribe registry.
///
/// No persistence, no replay; a handler panic is the handler's problem.
#[derive(Clone, Default)]
pub struct Bus {
    handlers: Arc<RwLock<Vec<Handler>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, invoked for every subsequent publish
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Publish an event to all handlers, synchronously, in registration order
    pub fn publish(&self, event: Event) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(Event::RebalanceRequested);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dispatch_is_in_registration_order() {
        let bus = Bus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = order.clone();
            bus.subscribe(move |_| order.lock().unwrap().push(i));
        }

        bus.publish(Event::ShutdownRequested);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_membership_event_carries_model() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = seen.clone();
        bus.subscribe(move |event| {
            if let Event::MembershipChanged(model) = event {
                *seen_clone.lock().unwrap() = Some(*model);
            }
        });

        bus.publish(Event::MembershipChanged(Model::new(2, 3)));
        assert_eq!(*seen.lock().unwrap(), Some(Model::new(2, 3)));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = Bus::new();
        bus.publish(Event::RebalanceRequested);
    }
}
