//! Broadcast event bus for distributing `JobEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Subscribers receive owned copies of
//! every event published after they subscribed; publishing with no active
//! subscribers is a no-op. Events for a given job are published in commit
//! order (after the state change they describe has been persisted), so a
//! subscriber observes each job's lifecycle in order.

use inkforge_types::event::JobEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for job and step lifecycle events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers to share one channel.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped. The
    /// publisher never blocks on subscribers.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkforge_types::event::JobEventKind;
    use uuid::Uuid;

    fn sample_event() -> JobEvent {
        JobEvent::new(
            JobEventKind::JobSubmitted {
                workflow_id: "article-pipeline".to_string(),
            },
            Uuid::now_v7(),
            "corr-1",
        )
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received.kind, JobEventKind::JobSubmitted { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
    }

    #[tokio::test]
    async fn per_job_events_arrive_in_publish_order() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let job_id = Uuid::now_v7();

        bus.publish(JobEvent::new(JobEventKind::JobStarted, job_id, "c"));
        bus.publish(JobEvent::new(
            JobEventKind::StepStarted {
                agent_id: "a".to_string(),
            },
            job_id,
            "c",
        ));
        bus.publish(JobEvent::new(
            JobEventKind::JobCompleted { completed_steps: 1 },
            job_id,
            "c",
        ));

        assert!(matches!(rx.recv().await.unwrap().kind, JobEventKind::JobStarted));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            JobEventKind::StepStarted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            JobEventKind::JobCompleted { .. }
        ));
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn lagged_receiver_handles_gracefully() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for _ in 0..10 {
            bus.publish(sample_event());
        }

        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
