use chart_core::Event;
use tokio::sync::mpsc;

/// Bounded channel shared by every module producer
///
/// `publish` waits for capacity, so a slow router pushes back on producers.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

impl EventBus {
    /// Create a new EventBus holding at most `capacity` queued events
    ///
    /// Returns the bus (for producers) and the receiver (for the router)
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Publish an event, waiting while the channel is full
    ///
    /// Returns false once the router has closed the channel.
    pub async fn publish(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Check if the channel is closed (router stopped receiving)
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let (bus, mut rx) = EventBus::new(4);
        assert!(bus.publish(Event::new("101", "call_start")).await);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.target, "101");
        assert_eq!(event.name, "call_start");
    }

    #[test]
    fn test_publish_waits_for_capacity() {
        let (bus, mut rx) = EventBus::new(1);
        assert!(tokio_test::block_on(bus.publish(Event::new("101", "a"))));

        let mut pending = tokio_test::task::spawn(bus.publish(Event::new("101", "b")));
        tokio_test::assert_pending!(pending.poll());

        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert!(pending.is_woken());
        tokio_test::assert_ready_eq!(pending.poll(), true);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_events() {
        let (bus, mut rx) = EventBus::new(4);
        let clone = bus.clone();
        rx.close();

        assert!(bus.is_closed());
        assert!(!bus.publish(Event::new("101", "a")).await);
        assert!(!clone.publish(Event::new("101", "b")).await);
    }
}
