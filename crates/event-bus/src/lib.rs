//! Per-session publish/subscribe for progress events.
//!
//! Delivery is best-effort: a subscriber that falls behind the channel
//! capacity loses the oldest events, and a subscriber whose receiver is
//! dropped is forgotten by the underlying channel. The bus keeps no history;
//! late subscribers observe only events published after they subscribed.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

/// Lossy in-memory fan-out owned by a single session.
pub struct SessionBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> SessionBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was handed to. Zero
    /// subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Bridge a bus subscription into an mpsc receiver so callers can await
/// events without handling broadcast lag semantics directly. Lagged gaps are
/// skipped; the forwarding task exits when either side closes.
pub fn to_mpsc<E>(bus: Arc<SessionBus<E>>, capacity: usize) -> mpsc::Receiver<E>
where
    E: Event,
{
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = SessionBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish("hello".to_string()), 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus: Arc<SessionBus<String>> = SessionBus::new(8);
        assert_eq!(bus.publish("nobody listening".to_string()), 0);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_new_events() {
        let bus = SessionBus::new(8);
        bus.publish("early".to_string());
        let mut rx = bus.subscribe();
        bus.publish("late".to_string());
        assert_eq!(rx.recv().await.unwrap(), "late");
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest() {
        let bus = SessionBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(format!("event-{i}"));
        }
        // The first recv reports the lag, subsequent recvs resume at the
        // oldest retained event.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap(), "event-3");
    }

    #[tokio::test]
    async fn mpsc_bridge_forwards_events() {
        let bus = SessionBus::new(8);
        let mut rx = to_mpsc(bus.clone(), 8);
        tokio::task::yield_now().await;
        bus.publish(42u32);
        assert_eq!(rx.recv().await, Some(42));
    }
}
