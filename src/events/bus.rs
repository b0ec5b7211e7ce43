use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{error, trace};

use crate::events::models::{EventKind, MonitoringEvent};
use crate::utils::panic_message;

const DEFAULT_TAP_CAPACITY: usize = 256;

pub type EventHandler = Arc<dyn Fn(&MonitoringEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`] and [`EventBus::once`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    once: bool,
    handler: EventHandler,
}

/// Synchronous in-process publish/subscribe keyed by [`EventKind`].
///
/// `emit` calls every listener registered for the event's kind on the
/// caller's thread, in registration order. A panicking listener is logged
/// and skipped; the rest still run. Listeners may subscribe, unsubscribe or
/// emit from inside a handler.
///
/// Every emitted event is also forwarded to a broadcast tap (see
/// [`EventBus::subscribe`]) for async consumers.
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    next_id: AtomicU64,
    tap: broadcast::Sender<MonitoringEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_tap_capacity(DEFAULT_TAP_CAPACITY)
    }

    pub fn with_tap_capacity(capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tap,
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&MonitoringEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(handler))
    }

    /// Like [`EventBus::on`], but the listener is removed before its first invocation.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&MonitoringEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(handler))
    }

    /// Removes a listener. Returns `false` if it was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let Some(registered) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|listener| listener.id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    pub fn emit(&self, event: MonitoringEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self.read().get(&kind).cloned().unwrap_or_default();
        trace!(event = kind.as_str(), listeners = snapshot.len(), "Emitting event");

        for listener in snapshot {
            if listener.once {
                // Claiming the listener before the call keeps re-entrant emits from running it twice.
                if !self.off(kind, listener.id) {
                    continue;
                }
            } else if !self.is_registered(kind, listener.id) {
                continue;
            }

            let handler = &listener.handler;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(
                    event = kind.as_str(),
                    panic = %panic_message(payload.as_ref()),
                    "Event listener panicked"
                );
            }
        }

        if self.tap.receiver_count() > 0 {
            // Only fails when every receiver dropped in between.
            let _ = self.tap.send(event);
        }
    }

    /// Removes every listener for `kind`, or every listener on the bus when `None`.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut listeners = self.write();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.read().get(&kind).map_or(0, Vec::len)
    }

    /// Event kinds that currently have at least one listener.
    pub fn events(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Receives a copy of every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.tap.subscribe()
    }

    fn register(&self, kind: EventKind, once: bool, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write()
            .entry(kind)
            .or_default()
            .push(Listener { id, once, handler });
        id
    }

    fn is_registered(&self, kind: EventKind, id: ListenerId) -> bool {
        self.read()
            .get(&kind)
            .is_some_and(|listeners| listeners.iter().any(|listener| listener.id == id))
    }

    // Handlers never run under the lock, so a poisoned lock still holds consistent data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<EventKind, Vec<Listener>>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EventKind, Vec<Listener>>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .read()
            .iter()
            .map(|(kind, listeners)| (kind.as_str(), listeners.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("listeners", &counts)
            .field("tap_receivers", &self.tap.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::models::{IncidentResolvedPayload, TargetPayload};
    use std::sync::Mutex;

    fn removed(target_id: &str) -> MonitoringEvent {
        MonitoringEvent::MonitoringTargetRemoved(TargetPayload {
            target_id: target_id.to_string(),
        })
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = log.clone();
            bus.on(EventKind::MonitoringTargetRemoved, move |_| {
                log.lock().unwrap().push(name.to_string());
            });
        }

        bus.emit(removed("t1"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listeners_only_receive_their_kind() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        bus.on(EventKind::IncidentResolved, move |event| {
            log_clone.lock().unwrap().push(event.name().to_string());
        });

        bus.emit(removed("t1"));
        bus.emit(MonitoringEvent::IncidentResolved(IncidentResolvedPayload { id: 1 }));
        assert_eq!(*log.lock().unwrap(), vec!["INCIDENT_RESOLVED"]);
    }

    #[test]
    fn test_off_unsubscribes() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = bus.on(EventKind::MonitoringTargetRemoved, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(removed("t1"));
        assert!(bus.off(EventKind::MonitoringTargetRemoved, id));
        assert!(!bus.off(EventKind::MonitoringTargetRemoved, id));
        bus.emit(removed("t1"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::MonitoringTargetRemoved), 0);
        assert!(bus.events().is_empty());
    }

    #[test]
    fn test_once_fires_a_single_time_even_when_reentrant() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let inner_bus = bus.clone();
        bus.once(EventKind::MonitoringTargetRemoved, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner_bus.emit(removed("nested"));
        });

        bus.emit(removed("t1"));
        bus.emit(removed("t1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::MonitoringTargetRemoved), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.on(EventKind::MonitoringTargetRemoved, |_| panic!("listener failure"));
        let counter = count.clone();
        bus.on(EventKind::MonitoringTargetRemoved, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(removed("t1"));
        bus.emit(removed("t1"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.listener_count(EventKind::MonitoringTargetRemoved), 2);
    }

    #[test]
    fn test_listener_removed_during_emit_is_skipped() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicU64::new(0));
        let victim_slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let inner_bus = bus.clone();
        let slot = victim_slot.clone();
        bus.on(EventKind::MonitoringTargetRemoved, move |_| {
            if let Some(id) = slot.lock().unwrap().take() {
                inner_bus.off(EventKind::MonitoringTargetRemoved, id);
            }
        });
        let counter = count.clone();
        let victim = bus.on(EventKind::MonitoringTargetRemoved, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *victim_slot.lock().unwrap() = Some(victim);

        bus.emit(removed("t1"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new();
        bus.on(EventKind::MonitoringTargetRemoved, |_| {});
        bus.on(EventKind::MonitoringTargetRemoved, |_| {});
        bus.on(EventKind::IncidentResolved, |_| {});
        assert_eq!(bus.listener_count(EventKind::MonitoringTargetRemoved), 2);
        assert_eq!(
            bus.events(),
            vec![EventKind::IncidentResolved, EventKind::MonitoringTargetRemoved]
        );

        bus.remove_all_listeners(Some(EventKind::MonitoringTargetRemoved));
        assert_eq!(bus.events(), vec![EventKind::IncidentResolved]);

        bus.remove_all_listeners(None);
        assert!(bus.events().is_empty());
    }

    #[tokio::test]
    async fn test_tap_receives_emitted_events() {
        let bus = EventBus::new();
        bus.emit(removed("before"));
        let mut rx = bus.subscribe();
        bus.emit(removed("after"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.target_id(), Some("after"));
    }
}
