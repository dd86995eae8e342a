/// file: src/registry.rs
/// description: per-job listener registry with snapshot dispatch and panic isolation
use crate::monitoring::LISTENER_PANICS_COUNTER;
use crate::types::{ChannelEvent, EventKind};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// A registered callback. Identity is the `Arc` allocation: keep a clone to `off` it later.
pub type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Wraps a closure into a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&ChannelEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub panicked: usize,
}

/// Event kind to ordered listener list.
///
/// Delivery follows registration order. Dispatch works on a snapshot taken
/// when the event arrives, so listeners may call `add`/`remove` (or drop the
/// whole registry) from inside a callback. A listener removed during a round
/// is not invoked for the rest of that round; one added during a round first
/// sees the next event.
#[derive(Default)]
pub struct ListenerRegistry {
    slots: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Listener>>> {
        // Listeners never run under this lock, so a poisoned map is still consistent.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false when the same listener was already registered for `kind`.
    pub fn add(&self, kind: EventKind, listener: Listener) -> bool {
        let mut slots = self.slots();
        let entries = slots.entry(kind).or_default();
        if entries.iter().any(|existing| same_listener(existing, &listener)) {
            return false;
        }
        entries.push(listener);
        true
    }

    /// Returns false when the listener wasn't registered for `kind`.
    pub fn remove(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut slots = self.slots();
        let Some(entries) = slots.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|existing| !same_listener(existing, listener));
        let removed = entries.len() != before;
        if entries.is_empty() {
            slots.remove(&kind);
        }
        removed
    }

    pub fn contains(&self, kind: EventKind, listener: &Listener) -> bool {
        self.slots()
            .get(&kind)
            .is_some_and(|entries| entries.iter().any(|e| same_listener(e, listener)))
    }

    pub fn clear(&self) {
        self.slots().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.slots().get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Invokes every listener registered for the event's kind.
    ///
    /// A panicking listener is logged and counted; the others still run.
    pub fn dispatch(&self, event: &ChannelEvent) -> DispatchReport {
        let kind = event.kind();
        let snapshot: Vec<Listener> = match self.slots().get(&kind) {
            Some(entries) => entries.clone(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for listener in &snapshot {
            if !self.contains(kind, listener) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.panicked += 1;
                    LISTENER_PANICS_COUNTER.increment(1);
                    warn!(
                        event = %kind,
                        job_id = %event.job_id(),
                        panic = panic_message(&*panic),
                        "Listener panicked during dispatch"
                    );
                }
            }
        }
        report
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn progress(p: i64) -> ChannelEvent {
        ChannelEvent::ProgressUpdate {
            job_id: JobId::from("abc"),
            progress: p,
        }
    }

    fn counting() -> (Listener, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let l = listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (l, hits)
    }

    #[test]
    fn duplicate_registration_is_suppressed() {
        let registry = ListenerRegistry::new();
        let (l, hits) = counting();
        assert!(registry.add(EventKind::ProgressUpdate, l.clone()));
        assert!(!registry.add(EventKind::ProgressUpdate, l.clone()));
        assert_eq!(registry.listener_count(EventKind::ProgressUpdate), 1);

        registry.dispatch(&progress(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_closure_under_two_kinds_is_two_registrations() {
        let registry = ListenerRegistry::new();
        let (l, _) = counting();
        assert!(registry.add(EventKind::ProgressUpdate, l.clone()));
        assert!(registry.add(EventKind::LessonCompleted, l.clone()));
        assert!(registry.remove(EventKind::ProgressUpdate, &l));
        assert!(registry.contains(EventKind::LessonCompleted, &l));
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let registry = ListenerRegistry::new();
        let (l, _) = counting();
        assert!(!registry.remove(EventKind::LessonError, &l));
    }

    #[test]
    fn dispatch_only_reaches_matching_kind() {
        let registry = ListenerRegistry::new();
        let (l, hits) = counting();
        registry.add(EventKind::LessonError, l);
        let report = registry.dispatch(&progress(3));
        assert_eq!(report, DispatchReport::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delivery_follows_registration_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry.add(
                EventKind::ProgressUpdate,
                listener(move |_| order.lock().unwrap().push(tag)),
            );
        }
        registry.dispatch(&progress(5));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let (before, before_hits) = counting();
        let (after, after_hits) = counting();
        registry.add(EventKind::ProgressUpdate, before);
        registry.add(
            EventKind::ProgressUpdate,
            listener(|_| panic!("render blew up")),
        );
        registry.add(EventKind::ProgressUpdate, after);

        let report = registry.dispatch(&progress(9));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.panicked, 1);
        assert_eq!(before_hits.load(Ordering::SeqCst), 1);
        assert_eq!(after_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_from_inside_dispatch_silences_later_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let (victim, victim_hits) = counting();

        let reg = registry.clone();
        let target = victim.clone();
        let remover = listener(move |_| {
            reg.remove(EventKind::ProgressUpdate, &target);
        });

        registry.add(EventKind::ProgressUpdate, remover);
        registry.add(EventKind::ProgressUpdate, victim);

        registry.dispatch(&progress(1));
        registry.dispatch(&progress(2));
        assert_eq!(victim_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_added_mid_round_waits_for_next_event() {
        let registry = Arc::new(ListenerRegistry::new());
        let (late, late_hits) = counting();

        let reg = registry.clone();
        let adder = listener(move |_| {
            reg.add(EventKind::ProgressUpdate, late.clone());
        });
        registry.add(EventKind::ProgressUpdate, adder);

        registry.dispatch(&progress(1));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        registry.dispatch(&progress(2));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn self_removal_still_completes_current_call_once() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let reg = registry.clone();
        let me = slot.clone();
        let seen = hits.clone();
        let once = listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = me.lock().unwrap().as_ref() {
                reg.remove(EventKind::ProgressUpdate, me);
            }
        });
        *slot.lock().unwrap() = Some(once.clone());
        registry.add(EventKind::ProgressUpdate, once);

        registry.dispatch(&progress(1));
        registry.dispatch(&progress(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_drops_every_kind() {
        let registry = ListenerRegistry::new();
        for kind in EventKind::ALL {
            let (l, _) = counting();
            registry.add(kind, l);
        }
        registry.clear();
        assert!(registry.is_empty());
    }
}
