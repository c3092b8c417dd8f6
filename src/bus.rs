//! C1 — the in-process publish/subscribe bus.
//!
//! Delivery is asynchronous with respect to the publisher: `publish`
//! dispatches each handler onto its own tokio task and returns immediately,
//! so a subscriber living in the same guest that is publishing never
//! observes its own call synchronously re-entering guest memory (see
//! the host/guest boundary discussion in the host bridge).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

pub type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
pub struct Bus {
    topics: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
}

/// A live `(topic, handler)` registration. Dropping this does *not*
/// cancel it — cancellation is explicit, matching the host bridge's
/// need to hold the canceller in a module's cleanup list until `Close`.
pub struct Subscription {
    bus: Arc<Bus>,
    topic: String,
    id: u64,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Delivers `msg` to every handler currently registered on `topic`.
    /// A publish to a topic with no handlers is a no-op, not an error.
    /// Returns after dispatching; handler execution completes later.
    pub fn publish(&self, topic: &str, msg: Vec<u8>) {
        let registrations = match self.topics.get(topic) {
            Some(r) => r,
            None => return,
        };
        for reg in registrations.iter() {
            let handler = reg.handler.clone();
            let payload = msg.clone();
            tokio::spawn(async move {
                handler(payload).await;
            });
        }
    }

    /// Registers `handler` on `topic` and returns a cancellation handle.
    /// Subscribing is total: it never fails.
    pub fn subscribe(self: &Arc<Self>, topic: &str, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(Vec::new)
            .push(Registration { id, handler });
        Subscription {
            bus: self.clone(),
            topic: topic.to_string(),
            id,
        }
    }

    fn cancel(&self, topic: &str, id: u64) {
        if let Some(mut regs) = self.topics.get_mut(topic) {
            regs.retain(|r| r.id != id);
            if regs.is_empty() {
                drop(regs);
                self.topics.remove_if(topic, |_, v| v.is_empty());
            }
        }
    }
}

impl Subscription {
    /// Idempotent. After this returns, no further invocation of the
    /// associated handler will start; invocations already in flight are
    /// allowed to finish.
    pub fn cancel(&self) {
        self.bus.cancel(&self.topic, self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn publish_with_no_handlers_is_noop() {
        let bus = Bus::new();
        bus.publish("nobody-home", b"hi".to_vec());
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _sub = bus.subscribe("events", counting_handler(counter.clone()));

        bus.publish("events", b"hello".to_vec());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_receives_no_further_messages() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let sub = bus.subscribe("events", counting_handler(counter.clone()));

        sub.cancel();
        bus.publish("events", b"hello".to_vec());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let sub = bus.subscribe("events", counting_handler(counter));

        sub.cancel();
        sub.cancel();
    }

    #[tokio::test]
    async fn multiple_handlers_on_same_topic_all_fire() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _a = bus.subscribe("events", counting_handler(counter.clone()));
        let _b = bus.subscribe("events", counting_handler(counter.clone()));

        bus.publish("events", b"hello".to_vec());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
