use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::source::Speed;

/// Notifications a file emits for observers such as a source picker.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    SourceAvailabilityChanged {
        source_id: String,
    },
    SourceSpeedChanged {
        source_id: String,
        domain: String,
        url: String,
        speed: Speed,
    },
    ProcessingStarted,
    ProcessingStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&AcquisitionEvent) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<AcquisitionEvent>),
}

/// Subscribers are called in the order they subscribed.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, subscriber));
        id
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AcquisitionEvent) + Send + Sync + 'static,
    {
        self.add(Subscriber::Callback(Arc::new(callback)))
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<AcquisitionEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.add(Subscriber::Channel(sender));
        receiver
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Delivers `event` to every subscriber. Callbacks run without the
    /// subscriber list locked, so they may subscribe or emit themselves.
    pub fn emit(&self, event: AcquisitionEvent) {
        let snapshot: Vec<(SubscriptionId, Subscriber)> = self.subscribers.lock().clone();

        let mut closed = Vec::new();
        for (id, subscriber) in snapshot {
            match subscriber {
                Subscriber::Callback(callback) => callback(&event),
                Subscriber::Channel(sender) => {
                    if sender.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers
                .lock()
                .retain(|(id, _)| !closed.contains(id));
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBus({} subscribers)", self.subscriber_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_called_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| seen.lock().push((tag, event.clone())));
        }
        bus.emit(AcquisitionEvent::ProcessingStarted);
        bus.emit(AcquisitionEvent::ProcessingStopped);

        let tags: Vec<&str> = seen.lock().iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, ["first", "second", "third", "first", "second", "third"]);
        assert_eq!(seen.lock()[3].1, AcquisitionEvent::ProcessingStopped);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AcquisitionEvent::ProcessingStarted);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(AcquisitionEvent::ProcessingStarted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_subscriber_dropped_when_closed() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe_channel();
        bus.emit(AcquisitionEvent::SourceAvailabilityChanged {
            source_id: "a".to_string(),
        });
        assert_eq!(
            receiver.try_recv().unwrap(),
            AcquisitionEvent::SourceAvailabilityChanged {
                source_id: "a".to_string()
            }
        );

        drop(receiver);
        bus.emit(AcquisitionEvent::ProcessingStopped);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_emit_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let mut receiver = bus.subscribe_channel();
        let inner = Arc::clone(&bus);
        bus.subscribe(move |event| {
            if *event == AcquisitionEvent::ProcessingStarted {
                inner.emit(AcquisitionEvent::ProcessingStopped);
            }
        });

        bus.emit(AcquisitionEvent::ProcessingStarted);
        assert_eq!(receiver.try_recv().unwrap(), AcquisitionEvent::ProcessingStarted);
        assert_eq!(receiver.try_recv().unwrap(), AcquisitionEvent::ProcessingStopped);
    }
}
