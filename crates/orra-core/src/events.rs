use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use orra_types::EngineEvent;

const TAP_DEPTH: usize = 1024;

/// In-process event fan-out. Durable state lives in the KV store; the hub
/// exists so loops can react without polling it. Two surfaces with different
/// delivery guarantees:
///
/// * `observe` taps the full event stream; a slow observer loses the oldest
///   events first and never blocks an emitter.
/// * `connectivity` is a monotone epoch that ticks on every service connect
///   or disconnect. Orchestration drivers await it to re-evaluate the health
///   of the services they are waiting on; coalescing intermediate ticks is
///   fine because drivers re-read the connection table, not the event.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tap: broadcast::Sender<EngineEvent>,
    connectivity: watch::Sender<u64>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_DEPTH);
        let (connectivity, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner { tap, connectivity }),
        }
    }

    /// Emit one event. Connection lifecycle events additionally tick the
    /// connectivity epoch.
    pub fn emit(&self, event: EngineEvent) {
        if matches!(
            event,
            EngineEvent::ServiceConnected { .. } | EngineEvent::ServiceDisconnected { .. }
        ) {
            self.inner.connectivity.send_modify(|epoch| *epoch += 1);
        }
        let _ = self.inner.tap.send(event);
    }

    /// Tap the full event stream.
    pub fn observe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.tap.subscribe()
    }

    /// Watch the connectivity epoch; `changed()` resolves once any service
    /// connects or disconnects after the subscription.
    pub fn connectivity(&self) -> watch::Receiver<u64> {
        self.inner.connectivity.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orra_types::TaskStatus;

    fn connected() -> EngineEvent {
        EngineEvent::ServiceConnected {
            project_id: "p_1".into(),
            service_id: "svc_1".into(),
        }
    }

    #[tokio::test]
    async fn connection_events_tick_the_epoch() {
        let hub = EventHub::new();
        let mut connectivity = hub.connectivity();
        assert_eq!(*connectivity.borrow(), 0);

        hub.emit(connected());
        connectivity.changed().await.unwrap();
        assert_eq!(*connectivity.borrow_and_update(), 1);

        hub.emit(EngineEvent::ServiceDisconnected {
            project_id: "p_1".into(),
            service_id: "svc_1".into(),
        });
        connectivity.changed().await.unwrap();
        assert_eq!(*connectivity.borrow_and_update(), 2);
    }

    #[tokio::test]
    async fn task_events_reach_observers_without_ticking() {
        let hub = EventHub::new();
        let mut observer = hub.observe();
        let connectivity = hub.connectivity();

        hub.emit(EngineEvent::TaskStatusChanged {
            orchestration_id: "o_1".into(),
            task_id: "task1".into(),
            status: TaskStatus::Completed,
        });
        let EngineEvent::TaskStatusChanged { task_id, .. } = observer.recv().await.unwrap()
        else {
            panic!("expected task event");
        };
        assert_eq!(task_id, "task1");
        assert_eq!(*connectivity.borrow(), 0);
    }

    #[tokio::test]
    async fn coalesced_ticks_still_wake_a_watcher_once() {
        let hub = EventHub::new();
        let mut connectivity = hub.connectivity();
        hub.emit(connected());
        hub.emit(connected());
        hub.emit(connected());
        connectivity.changed().await.unwrap();
        assert_eq!(*connectivity.borrow_and_update(), 3);
        // No further unseen change is pending.
        assert!(!connectivity.has_changed().unwrap());
    }
}
