use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use log::{debug, trace};
use parking_lot::Mutex;
use crate::error::EvalError;

/// Lifecycle state of an [Observation].
///
/// `Observing` is the only state from which events are delivered. The other
/// three are terminal and absorbing: once entered they never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationState {
    Observing,
    Cancelled,
    Completed,
    Failed,
}

const OBSERVING: u8 = 0;
const CANCELLED: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;

/// One active subscription: the token returned by [Observable::observe].
///
/// The creator of an Observation exclusively owns it and is solely
/// responsible for cancelling it. Cancellation only flips a flag consulted
/// before each delivery attempt; it cannot interrupt an event already in
/// progress.
#[derive(Clone)]
pub struct Observation {
    state: Arc<AtomicU8>,
}

impl Observation {
    /// A fresh subscription in the `Observing` state.
    ///
    /// Sources call this from their `observe` implementation.
    pub fn new() -> Self {
        Observation {
            state: Arc::new(AtomicU8::new(OBSERVING)),
        }
    }

    pub fn state(&self) -> ObservationState {
        match self.state.load(Ordering::Acquire) {
            OBSERVING => ObservationState::Observing,
            CANCELLED => ObservationState::Cancelled,
            COMPLETED => ObservationState::Completed,
            _ => ObservationState::Failed,
        }
    }

    /// `true` while events may still be delivered to this subscription.
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == OBSERVING
    }

    /// Cancel the subscription. Idempotent; a no-op once any terminal state
    /// has been reached. After this returns no further event is delivered,
    /// though already-delivered effects are not reversed.
    pub fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(OBSERVING, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Move to `Completed` or `Failed` before delivering the terminal event.
    ///
    /// Returns `false` when the subscription was cancelled in the meantime
    /// (the terminal event must then be skipped). A second terminal
    /// transition is a decorator bug and aborts.
    pub(crate) fn terminate(&self, terminal: ObservationState) -> bool {
        let code = match terminal {
            ObservationState::Completed => COMPLETED,
            ObservationState::Failed => FAILED,
            _ => unreachable!("terminate called with a non-terminal state"),
        };
        match self
            .state
            .compare_exchange(OBSERVING, code, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(CANCELLED) => false,
            Err(_) => panic!("protocol violation: observation received a second terminal event"),
        }
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Observation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("state", &self.state())
            .finish()
    }
}

/// Four-event sink attached to an [Observation].
///
/// For any subscription the delivered sequence is `on_observe` exactly once,
/// then zero or more `on_next`, then at most one of `on_complete`/`on_fail`.
/// Delivery is synchronous on whatever thread performs the triggering
/// mutation; an observer that blocks will block the mutator.
pub trait Observer<M>: Send + Sync {
    /// The subscription was established. Invoked before any other event.
    fn on_observe(&self, _observation: &Observation) {}

    /// The source pushed a message.
    fn on_next(&self, message: &M);

    /// The source completed; no further events follow.
    fn on_complete(&self) {}

    /// The source failed; no further events follow.
    fn on_fail(&self, _error: &EvalError) {}
}

/// A message source which accepts [Observer]s.
pub trait Observable<M> {
    /// Attach `observer`, returning the [Observation] that controls the
    /// subscription's lifetime. Synchronously invokes
    /// [Observer::on_observe] on the calling thread, so the subscription is
    /// established before any `on_next` can occur.
    fn observe(&self, observer: Arc<dyn Observer<M>>) -> Observation;
}

/// A free-standing push source, driven by [Subject::next],
/// [Subject::complete] and [Subject::fail].
///
/// Messages are delivered inline, in subscription order, to every live
/// subscriber. There is no buffering, batching or dispatch thread. Pushing
/// into a closed subject is a protocol violation and panics; observing a
/// closed subject replays the recorded terminal event after `on_observe`.
pub struct Subject<M> {
    inner: Mutex<SubjectInner<M>>,
}

struct SubjectInner<M> {
    entries: Vec<SubjectEntry<M>>,
    phase: SubjectPhase,
}

struct SubjectEntry<M> {
    observer: Arc<dyn Observer<M>>,
    observation: Observation,
}

enum SubjectPhase {
    Open,
    Completed,
    Failed(EvalError),
}

impl<M> Subject<M> {
    pub fn new() -> Self {
        Subject {
            inner: Mutex::new(SubjectInner {
                entries: Vec::new(),
                phase: SubjectPhase::Open,
            }),
        }
    }

    /// Push a message to every live subscriber.
    pub fn next(&self, message: M) {
        let entries = {
            let mut inner = self.inner.lock();
            assert!(
                matches!(inner.phase, SubjectPhase::Open),
                "protocol violation: message pushed into a closed subject"
            );
            inner.snapshot_live()
        };
        for entry in entries {
            if entry.observation.is_live() {
                entry.observer.on_next(&message);
            }
        }
    }

    /// Complete the subject. Every live subscription receives `on_complete`
    /// exactly once; the subscriber list is dropped.
    pub fn complete(&self) {
        let entries = self.close(SubjectPhase::Completed);
        debug!("subject completed with {} live subscriptions", entries.len());
        for entry in entries {
            if entry.observation.terminate(ObservationState::Completed) {
                entry.observer.on_complete();
            }
        }
    }

    /// Fail the subject. Every live subscription receives `on_fail` exactly
    /// once; the subscriber list is dropped.
    pub fn fail(&self, error: EvalError) {
        let entries = self.close(SubjectPhase::Failed(error.clone()));
        debug!("subject failed with {} live subscriptions", entries.len());
        for entry in entries {
            if entry.observation.terminate(ObservationState::Failed) {
                entry.observer.on_fail(&error);
            }
        }
    }

    fn close(&self, phase: SubjectPhase) -> Vec<SubjectEntry<M>> {
        let mut inner = self.inner.lock();
        assert!(
            matches!(inner.phase, SubjectPhase::Open),
            "protocol violation: subject closed twice"
        );
        inner.phase = phase;
        std::mem::take(&mut inner.entries)
    }
}

impl<M> SubjectInner<M> {
    fn snapshot_live(&mut self) -> Vec<SubjectEntry<M>> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.observation.is_live());
        if self.entries.len() < before {
            trace!("pruned {} cancelled subscriptions", before - self.entries.len());
        }
        self.entries
            .iter()
            .map(|entry| SubjectEntry {
                observer: Arc::clone(&entry.observer),
                observation: entry.observation.clone(),
            })
            .collect()
    }
}

impl<M> Observable<M> for Subject<M> {
    fn observe(&self, observer: Arc<dyn Observer<M>>) -> Observation {
        let observation = Observation::new();
        observer.on_observe(&observation);
        let replay = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &inner.phase {
                SubjectPhase::Open => {
                    inner.entries.push(SubjectEntry {
                        observer: Arc::clone(&observer),
                        observation: observation.clone(),
                    });
                    None
                }
                SubjectPhase::Completed => Some(None),
                SubjectPhase::Failed(error) => Some(Some(error.clone())),
            }
        };
        // A late subscriber to a closed subject gets the terminal event
        // straight away.
        if let Some(error) = replay {
            match error {
                None => {
                    if observation.terminate(ObservationState::Completed) {
                        observer.on_complete();
                    }
                }
                Some(error) => {
                    if observation.terminate(ObservationState::Failed) {
                        observer.on_fail(&error);
                    }
                }
            }
        }
        observation
    }
}

impl<M> Default for Subject<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Debug for Subject<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Subject")
            .field("subscriptions", &inner.entries.len())
            .field("open", &matches!(inner.phase, SubjectPhase::Open))
            .finish()
    }
}
