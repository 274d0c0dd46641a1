//! Broadcast bus for engine lifecycle events.
//!
//! Observers (the SSE status stream, CLI `--wait`) use events only as a
//! wake-up hint and re-read persisted state, so a lagged receiver loses
//! nothing but latency.

use stepwave_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for `EngineEvent`s. Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; dropped when there are none.
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("engine event dropped, no subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
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
    use broadcast::error::TryRecvError;
    use stepwave_types::workflow::StepStatus;
    use uuid::Uuid;

    fn step_changed(instance_id: Uuid, order: u32, status: StepStatus) -> EngineEvent {
        EngineEvent::StepStatusChanged {
            instance_id,
            step_id: Uuid::now_v7(),
            slot_key: format!("s{order}"),
            order,
            status,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish(step_changed(id, 1, StepStatus::Executing));
        bus.publish(step_changed(id, 1, StepStatus::Completed));
        bus.publish(EngineEvent::WaveMaterialized {
            instance_id: id,
            order: 2,
            steps: 1,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::StepStatusChanged { status: StepStatus::Executing, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::StepStatusChanged { status: StepStatus::Completed, .. }
        ));
        let last = rx.recv().await.unwrap();
        assert_eq!(last.instance_id(), id);
        assert!(matches!(last, EngineEvent::WaveMaterialized { order: 2, .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(step_changed(Uuid::now_v7(), 1, StepStatus::Pending));

        // Late subscribers never see earlier events.
        let mut rx = bus.subscribe();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_slow_observer_is_told_how_much_it_missed() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        for order in 0..10 {
            bus.publish(step_changed(id, order, StepStatus::Pending));
        }

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(6))));
        // After the lag report the receiver resumes at the oldest retained event.
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::StepStatusChanged { order: 6, .. })
        ));
    }

    #[test]
    fn test_clones_share_one_channel() {
        let bus = EventBus::default();
        let engine_side = bus.clone();
        let mut rx = bus.subscribe();
        assert_eq!(engine_side.receiver_count(), 1);

        engine_side.publish(step_changed(Uuid::now_v7(), 3, StepStatus::Failed));

        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::StepStatusChanged { order: 3, .. })
        ));
        assert!(format!("{bus:?}").contains("receiver_count: 1"));
    }
}
