// file: src/reconciler.rs
// description: per-job status state machine fed by channel events

use crate::channel::ChannelManager;
use crate::monitoring::TRANSITIONS_COUNTER;
use crate::registry::{Listener, listener, panic_message};
use crate::transport::Connector;
use crate::types::{ChannelEvent, EventKind, JobId, JobSnapshot, JobStatus, clamp_progress};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Event kinds the reconciler consumes.
pub const RECONCILED_EVENTS: [EventKind; 3] = [
    EventKind::ProgressUpdate,
    EventKind::LessonCompleted,
    EventKind::LessonError,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accepted,
    /// Valid event that leaves the snapshot unchanged (e.g. a repeated completion).
    Unchanged,
    /// Dropped: terminal state, foreign job, or an event kind that carries no status.
    Ignored,
}

/// States run draft → queued → processing → {completed, failed}. Terminal
/// states absorb every later event. Progress while processing is
/// last-write-wins: `40` followed by `25` shows `25`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    snapshot: JobSnapshot,
}

impl JobState {
    pub fn new(seed: JobSnapshot) -> Self {
        Self { snapshot: seed }
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    pub fn apply(&mut self, event: &ChannelEvent) -> Transition {
        if event.job_id() != &self.snapshot.job_id {
            return Transition::Ignored;
        }
        let current = self.snapshot.status;

        let next = match event {
            ChannelEvent::ProgressUpdate { progress, .. } => {
                if current.is_terminal() {
                    return Transition::Ignored;
                }
                // draft/queued are promoted and adopt the value in the same step
                JobSnapshot {
                    status: JobStatus::Processing,
                    progress: clamp_progress(*progress),
                    ..self.snapshot.clone()
                }
            }
            ChannelEvent::LessonCompleted { .. } => {
                if current == JobStatus::Failed {
                    return Transition::Ignored;
                }
                JobSnapshot {
                    status: JobStatus::Completed,
                    progress: 100,
                    error: None,
                    ..self.snapshot.clone()
                }
            }
            ChannelEvent::LessonError { message, .. } => {
                if current == JobStatus::Completed {
                    return Transition::Ignored;
                }
                if current == JobStatus::Failed {
                    return Transition::Unchanged;
                }
                JobSnapshot {
                    status: JobStatus::Failed,
                    error: Some(message.clone()),
                    ..self.snapshot.clone()
                }
            }
            ChannelEvent::DiscussionUpdate { .. } => return Transition::Ignored,
        };

        if next == self.snapshot {
            return Transition::Unchanged;
        }
        self.snapshot = next;
        Transition::Accepted
    }
}

pub type UpdateCallback = Arc<dyn Fn(&JobSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscribers {
    next_id: u64,
    entries: Vec<(SubscriptionId, UpdateCallback)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reconciles one job's channel events into an authoritative snapshot.
pub struct JobStatusReconciler {
    job_id: JobId,
    state: Mutex<JobState>,
    updates: watch::Sender<JobSnapshot>,
    subscribers: Mutex<Subscribers>,
    /// Held from a state change until its subscribers have seen it, so every
    /// subscriber observes snapshots in transition order.
    delivery: Mutex<()>,
    listeners: Vec<(EventKind, Listener)>,
}

impl JobStatusReconciler {
    /// Builds a reconciler seeded with an externally fetched snapshot.
    /// Not yet registered anywhere; see [`attach`](Self::attach).
    pub fn new(seed: JobSnapshot) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let listeners = RECONCILED_EVENTS
                .into_iter()
                .map(|kind| {
                    let weak = weak.clone();
                    let l = listener(move |event: &ChannelEvent| {
                        if let Some(reconciler) = weak.upgrade() {
                            reconciler.apply(event);
                        }
                    });
                    (kind, l)
                })
                .collect();

            let (updates, _) = watch::channel(seed.clone());
            Self {
                job_id: seed.job_id.clone(),
                state: Mutex::new(JobState::new(seed)),
                updates,
                subscribers: Mutex::new(Subscribers {
                    next_id: 0,
                    entries: Vec::new(),
                }),
                delivery: Mutex::new(()),
                listeners,
            }
        })
    }

    /// Builds a reconciler and registers it on the job's channel scope.
    pub fn attach<C: Connector>(manager: &ChannelManager<C>, seed: JobSnapshot) -> Arc<Self> {
        let reconciler = Self::new(seed);
        for (kind, l) in &reconciler.listeners {
            manager.on(&reconciler.job_id, *kind, l.clone());
        }
        debug!(job_id = %reconciler.job_id, "Reconciler attached");
        reconciler
    }

    /// Removes this reconciler's listeners from the job's channel scope.
    pub fn detach<C: Connector>(&self, manager: &ChannelManager<C>) {
        for (kind, l) in &self.listeners {
            manager.off(&self.job_id, *kind, l);
        }
        debug!(job_id = %self.job_id, "Reconciler detached");
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn snapshot(&self) -> JobSnapshot {
        lock(&self.state).snapshot().clone()
    }

    /// Feeds one event through the state machine and notifies subscribers if
    /// the snapshot changed. Subscribers must not call `apply` or `subscribe`
    /// on the same reconciler from inside their callback.
    pub fn apply(&self, event: &ChannelEvent) -> Transition {
        let _delivery = lock(&self.delivery);
        let (transition, snapshot) = {
            let mut state = lock(&self.state);
            let transition = state.apply(event);
            let snapshot = state.snapshot().clone();
            if transition == Transition::Accepted {
                self.updates.send_replace(snapshot.clone());
            }
            (transition, snapshot)
        };

        match transition {
            Transition::Accepted => {
                TRANSITIONS_COUNTER.increment(1);
                if snapshot.status.is_terminal() {
                    info!(
                        job_id = %self.job_id,
                        status = %snapshot.status,
                        error = snapshot.error.as_deref().unwrap_or(""),
                        "Job reached terminal state"
                    );
                } else {
                    debug!(
                        job_id = %self.job_id,
                        status = %snapshot.status,
                        progress = snapshot.progress,
                        "Job status updated"
                    );
                }
                self.notify(&snapshot);
            }
            Transition::Unchanged => {}
            Transition::Ignored => {
                debug!(
                    job_id = %self.job_id,
                    event = %event.kind(),
                    event_job = %event.job_id(),
                    status = %snapshot.status,
                    "Event ignored"
                );
            }
        }
        transition
    }

    /// Calls `callback` with the current snapshot right away, then once per
    /// accepted transition until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&JobSnapshot) + Send + Sync + 'static,
    {
        let callback: UpdateCallback = Arc::new(callback);
        let _delivery = lock(&self.delivery);
        let id = {
            let mut subs = lock(&self.subscribers);
            let id = SubscriptionId(subs.next_id);
            subs.next_id += 1;
            subs.entries.push((id, callback.clone()));
            id
        };
        invoke(&callback, &self.snapshot());
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        let before = subs.entries.len();
        subs.entries.retain(|(existing, _)| *existing != id);
        subs.entries.len() != before
    }

    /// Latest-value receiver for async renderers; holds the current snapshot immediately.
    pub fn watch(&self) -> watch::Receiver<JobSnapshot> {
        self.updates.subscribe()
    }

    fn notify(&self, snapshot: &JobSnapshot) {
        let callbacks: Vec<UpdateCallback> = lock(&self.subscribers)
            .entries
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in &callbacks {
            invoke(callback, snapshot);
        }
    }
}

fn invoke(callback: &UpdateCallback, snapshot: &JobSnapshot) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
        warn!(
            job_id = %snapshot.job_id,
            panic = panic_message(&*panic),
            "Status subscriber panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn abc() -> JobId {
        JobId::from("abc")
    }

    fn seeded(status: JobStatus, progress: i64) -> JobState {
        JobState::new(JobSnapshot::seed(abc(), status, progress))
    }

    fn progress(p: i64) -> ChannelEvent {
        ChannelEvent::ProgressUpdate {
            job_id: abc(),
            progress: p,
        }
    }

    fn completed() -> ChannelEvent {
        ChannelEvent::LessonCompleted {
            job_id: abc(),
            result: json!({}),
        }
    }

    fn failed(message: &str) -> ChannelEvent {
        ChannelEvent::LessonError {
            job_id: abc(),
            message: message.into(),
        }
    }

    #[test]
    fn progress_promotes_draft_in_one_step() {
        let mut state = seeded(JobStatus::Draft, 0);
        assert_eq!(state.apply(&progress(30)), Transition::Accepted);
        assert_eq!(state.snapshot().status, JobStatus::Processing);
        assert_eq!(state.snapshot().progress, 30);
    }

    #[test]
    fn progress_is_last_write_wins() {
        let mut state = seeded(JobStatus::Processing, 0);
        state.apply(&progress(40));
        state.apply(&progress(25));
        assert_eq!(state.snapshot().progress, 25);
    }

    #[test]
    fn progress_is_clamped() {
        let mut state = seeded(JobStatus::Queued, 0);
        state.apply(&progress(250));
        assert_eq!(state.snapshot().progress, 100);
        state.apply(&progress(-3));
        assert_eq!(state.snapshot().progress, 0);
        assert_eq!(state.snapshot().status, JobStatus::Processing);
    }

    #[test]
    fn completion_is_idempotent_and_absorbing() {
        let mut once = seeded(JobStatus::Processing, 60);
        once.apply(&completed());

        let mut many = seeded(JobStatus::Processing, 60);
        assert_eq!(many.apply(&completed()), Transition::Accepted);
        assert_eq!(many.apply(&completed()), Transition::Unchanged);
        assert_eq!(many.apply(&completed()), Transition::Unchanged);
        assert_eq!(once, many);

        assert_eq!(many.apply(&progress(10)), Transition::Ignored);
        assert_eq!(many.apply(&failed("late")), Transition::Ignored);
        assert_eq!(many.snapshot().status, JobStatus::Completed);
        assert_eq!(many.snapshot().progress, 100);
    }

    #[test]
    fn error_then_progress_keeps_failure() {
        let mut state = seeded(JobStatus::Processing, 35);
        state.apply(&failed("timeout"));
        assert_eq!(state.apply(&progress(90)), Transition::Ignored);
        assert_eq!(state.apply(&completed()), Transition::Ignored);
        assert_eq!(state.apply(&failed("second")), Transition::Unchanged);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.progress, 35);
        assert_eq!(snapshot.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn completion_overrides_queued() {
        let mut state = seeded(JobStatus::Queued, 0);
        state.apply(&completed());
        assert_eq!(state.snapshot().status, JobStatus::Completed);
        assert_eq!(state.snapshot().progress, 100);
    }

    #[test]
    fn foreign_job_is_ignored() {
        let mut state = seeded(JobStatus::Processing, 20);
        let before = state.clone();
        let foreign = ChannelEvent::ProgressUpdate {
            job_id: JobId::from("xyz"),
            progress: 80,
        };
        assert_eq!(state.apply(&foreign), Transition::Ignored);
        let foreign_error = ChannelEvent::LessonError {
            job_id: JobId::from("xyz"),
            message: "boom".into(),
        };
        assert_eq!(state.apply(&foreign_error), Transition::Ignored);
        assert_eq!(state, before);
    }

    #[test]
    fn discussion_carries_no_status() {
        let mut state = seeded(JobStatus::Processing, 20);
        let discussion = ChannelEvent::DiscussionUpdate {
            job_id: abc(),
            content: json!({"text": "hi"}),
        };
        assert_eq!(state.apply(&discussion), Transition::Ignored);
    }

    #[test]
    fn subscribe_gets_current_snapshot_then_transitions() {
        let reconciler = JobStatusReconciler::new(JobSnapshot::seed(abc(), JobStatus::Queued, 0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = reconciler.subscribe(move |snap| {
            sink.lock().unwrap().push((snap.status, snap.progress));
        });

        reconciler.apply(&progress(10));
        reconciler.apply(&progress(10));
        reconciler.apply(&completed());
        reconciler.apply(&completed());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (JobStatus::Queued, 0),
                (JobStatus::Processing, 10),
                (JobStatus::Completed, 100),
            ]
        );

        assert!(reconciler.unsubscribe(id));
        assert!(!reconciler.unsubscribe(id));
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let reconciler = JobStatusReconciler::new(JobSnapshot::seed(abc(), JobStatus::Queued, 0));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        reconciler.subscribe(|snap| {
            if snap.status == JobStatus::Processing {
                panic!("bad renderer");
            }
        });
        reconciler.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(reconciler.apply(&progress(50)), Transition::Accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reconciler.snapshot().progress, 50);
    }

    #[tokio::test]
    async fn watch_receiver_sees_latest_state() {
        let reconciler = JobStatusReconciler::new(JobSnapshot::seed(abc(), JobStatus::Draft, 0));
        let mut rx = reconciler.watch();
        assert_eq!(rx.borrow().status, JobStatus::Draft);

        reconciler.apply(&progress(70));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().progress, 70);
    }

    #[test]
    fn concurrent_subscribers_never_settle_on_a_stale_snapshot() {
        for _ in 0..50 {
            let reconciler =
                JobStatusReconciler::new(JobSnapshot::seed(abc(), JobStatus::Processing, 0));
            let sequences: Vec<Arc<Mutex<Vec<u8>>>> = std::thread::scope(|scope| {
                let applier = reconciler.clone();
                scope.spawn(move || {
                    for p in 1..=100 {
                        applier.apply(&progress(p));
                        std::hint::spin_loop();
                    }
                });

                (0..200)
                    .map(|_| {
                        let seen = Arc::new(Mutex::new(Vec::new()));
                        let sink = seen.clone();
                        reconciler.subscribe(move |snap| sink.lock().unwrap().push(snap.progress));
                        seen
                    })
                    .collect()
            });

            let last = reconciler.snapshot().progress;
            assert_eq!(last, 100);
            for seen in &sequences {
                let seen = seen.lock().unwrap();
                assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
                assert_eq!(seen.last(), Some(&last));
            }
        }
    }
}
