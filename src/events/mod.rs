//! Lifecycle events for external instrumentation.
//!
//! Observers are called synchronously, in registration order, on the task
//! that raised the event. An observer that needs to do async work should
//! forward into a channel; [`ChannelObserver`] does exactly that.

use crate::protocol::types::{ClientInfo, RequestId};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Events raised by the server side of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Request { id: RequestId, method: String },
    Response { id: RequestId, is_error: bool },
    Notification { method: String },
    ToolRegistered { name: String },
    ToolUnregistered { name: String },
    ToolCalled { name: String, is_error: bool },
    ClientConnected { client_info: Option<ClientInfo> },
    ClientDisconnected,
}

impl ServerEvent {
    /// Wire-style event name, e.g. `tool:called`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Notification { .. } => "notification",
            Self::ToolRegistered { .. } => "tool:registered",
            Self::ToolUnregistered { .. } => "tool:unregistered",
            Self::ToolCalled { .. } => "tool:called",
            Self::ClientConnected { .. } => "client:connected",
            Self::ClientDisconnected => "client:disconnected",
        }
    }
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event)
    }
}

/// Handle returned by [`EventEmitter::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<dyn EventObserver>)>,
}

/// Ordered, synchronous fan-out of [`ServerEvent`]s.
#[derive(Clone, Default)]
pub struct EventEmitter {
    observers: Arc<RwLock<Observers>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: impl EventObserver + 'static) -> SubscriptionId {
        let mut observers = self.observers.write();
        let id = SubscriptionId(observers.next_id);
        observers.next_id += 1;
        observers.entries.push((id, Arc::new(observer)));
        id
    }

    /// Subscribe through an unbounded channel.
    pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(ChannelObserver { tx }), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.entries.len();
        observers.entries.retain(|(entry_id, _)| *entry_id != id);
        observers.entries.len() != before
    }

    pub fn emit(&self, event: ServerEvent) {
        // Snapshot so observers may subscribe or unsubscribe while being notified.
        let observers: Vec<Arc<dyn EventObserver>> = self
            .observers
            .read()
            .entries
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        trace!(event = event.name(), observers = observers.len(), "Emitting event");
        for observer in observers {
            observer.on_event(&event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().entries.len()
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &ServerEvent) {
        // A closed receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_delivery_in_registration_order() {
        let emitter = EventEmitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            emitter.subscribe(move |event: &ServerEvent| {
                log.lock().push(format!("{tag}:{}", event.name()));
            });
        }

        emitter.emit(ServerEvent::ClientDisconnected);
        assert_eq!(
            *log.lock(),
            vec![
                "first:client:disconnected",
                "second:client:disconnected",
                "third:client:disconnected"
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let emitter = EventEmitter::new();
        let id = emitter.subscribe(|_: &ServerEvent| {});
        assert_eq!(emitter.observer_count(), 1);
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        assert_eq!(emitter.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_observer() {
        let emitter = EventEmitter::new();
        let (_, mut rx) = emitter.channel();
        emitter.emit(ServerEvent::ToolRegistered {
            name: "echo".into(),
        });
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::ToolRegistered {
                name: "echo".into()
            })
        );
    }
}
