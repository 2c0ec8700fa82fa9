//! Typed event bus for inbound call messages
//!
//! Handlers register against one message kind or against every message.
//! Dispatch invokes the per-kind handlers in registration order, then the
//! wildcard handlers in registration order. The handler list is snapshotted
//! before any handler runs, so a handler may subscribe or unsubscribe without
//! deadlocking; such changes apply from the next dispatch on.

use crate::protocol::{IncomingMessage, MessageKind};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type Handler = Arc<dyn Fn(&IncomingMessage) + Send + Sync>;

/// What a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Kind(MessageKind),
    /// Every inbound message regardless of type
    Any,
}

impl Topic {
    fn matches(&self, kind: MessageKind) -> bool {
        match self {
            Topic::Kind(k) => *k == kind,
            Topic::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&IncomingMessage) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.entries.push(Entry {
            id,
            topic,
            handler: Arc::new(handler),
        });
        id
    }

    /// Subscribe and receive matching messages on a channel instead of a callback
    pub fn subscribe_channel(
        &self,
        topic: Topic,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<IncomingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(topic, move |msg| {
            // Receiver gone means the consumer stopped listening
            let _ = tx.send(msg.clone());
        });
        (id, rx)
    }

    /// Returns false if the subscription was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one message; returns how many handlers ran
    pub fn dispatch(&self, msg: &IncomingMessage) -> usize {
        let kind = msg.kind();
        let handlers: Vec<Handler> = {
            let registry = self.lock();
            let typed = registry
                .entries
                .iter()
                .filter(|e| matches!(e.topic, Topic::Kind(_)) && e.topic.matches(kind));
            let wildcard = registry.entries.iter().filter(|e| e.topic == Topic::Any);
            typed.chain(wildcard).map(|e| e.handler.clone()).collect()
        };

        for handler in &handlers {
            handler(msg);
        }
        handlers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // Handlers never run under the lock
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
