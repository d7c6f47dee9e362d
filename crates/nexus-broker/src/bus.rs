use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nexus_core::events::{BrokerEvent, EventKind};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

pub type Listener = Arc<dyn Fn(&BrokerEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// In-process publish point for lifecycle events.
///
/// Synchronous listeners run on the emitting task in registration order; a
/// panicking listener is logged and skipped. Async consumers use
/// [`EventBus::subscribe`].
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, EventKind, Listener)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tx,
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, kind, Arc::new(listener)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        let kind = event.kind();
        // Snapshot so listeners may call on/off without deadlocking.
        let matching: Vec<(ListenerId, Listener)> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(id, _, l)| (*id, Arc::clone(l)))
            .collect();

        for (id, listener) in matching {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                warn!(
                    event = kind.as_str(),
                    listener = id.0,
                    error = %panic_message(panic.as_ref()),
                    "event listener panicked"
                );
            }
        }

        let _ = self.tx.send(event);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nexus_core::agent::AgentStatus;
    use nexus_core::ids::AgentId;
    use parking_lot::Mutex;

    fn status_event() -> BrokerEvent {
        BrokerEvent::AgentStatusChanged {
            agent_id: AgentId::from_raw("toolbox-ea-x"),
            old_status: None,
            new_status: AgentStatus::Active,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn listeners_receive_only_their_kind() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.on(EventKind::AgentStatusChanged, move |e| s.lock().push(e.event_type()));
        let s = seen.clone();
        bus.on(EventKind::AgentStarted, move |e| s.lock().push(e.event_type()));

        bus.emit(status_event());
        assert_eq!(*seen.lock(), vec!["agent_status_changed"]);
    }

    #[test]
    fn off_unregisters() {
        let bus = EventBus::new(8);
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = bus.on(EventKind::AgentStatusChanged, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(status_event());
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(status_event());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let bus = EventBus::new(8);
        let count = Arc::new(AtomicU64::new(0));
        bus.on(EventKind::AgentStatusChanged, |_| panic!("listener bug"));
        let c = count.clone();
        bus.on(EventKind::AgentStatusChanged, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(status_event());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn listener_may_unregister_itself() {
        let bus = Arc::new(EventBus::new(8));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let (b, s) = (bus.clone(), slot.clone());
        let id = bus.on(EventKind::AgentStatusChanged, move |_| {
            if let Some(id) = *s.lock() {
                b.off(id);
            }
        });
        *slot.lock() = Some(id);

        bus.emit(status_event());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_get_every_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(status_event());
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.kind(), EventKind::AgentStatusChanged);
    }

    #[test]
    fn panic_message_extracts_text() {
        let err = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "boom");
        let err = catch_unwind(|| panic!("{}", String::from("owned"))).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "owned");
    }
}
