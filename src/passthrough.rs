use std::sync::Arc;
use log::trace;
use parking_lot::Mutex;
use crate::error::EvalError;
use crate::observe::{Observable, Observation, ObservationState, Observer};

/// Behavior hooks for one link of a notification chain.
///
/// Every event defaults to an identity relay to the downstream observer; a
/// concrete decorator overrides only the event it alters. This is the
/// composition primitive behind [FilteringObservation](crate::FilteringObservation)
/// and friends: small single-purpose wrappers around one shared relay,
/// instead of a decorator class hierarchy.
pub trait Passthrough<M>: Send + Sync {
    fn relay_observe(&self, downstream: &dyn Observer<M>, observation: &Observation) {
        downstream.on_observe(observation);
    }

    fn relay_next(&self, downstream: &dyn Observer<M>, message: &M) {
        downstream.on_next(message);
    }

    fn relay_complete(&self, downstream: &dyn Observer<M>) {
        downstream.on_complete();
    }

    fn relay_fail(&self, downstream: &dyn Observer<M>, error: &EvalError) {
        downstream.on_fail(error);
    }
}

/// The identity decorator: relays every event unchanged.
#[derive(Debug, Default)]
pub struct IdentityPassthrough;

impl<M> Passthrough<M> for IdentityPassthrough {}

/// Observer side of a passthrough link.
///
/// Subscribed to the upstream source; relays events to the downstream
/// observer under the downstream-facing [Observation]. The downstream
/// observation's state is consulted before each relay: a cancellation is
/// propagated to the upstream subscription at the next delivery attempt, and
/// a relay after a terminal event panics (it indicates a decorator bug).
pub struct PassthroughObserver<M> {
    behavior: Arc<dyn Passthrough<M>>,
    downstream: Arc<dyn Observer<M>>,
    /// The observation handed to the downstream observer.
    handle: Observation,
    /// The observation for the upstream subscription, recorded at `on_observe`.
    upstream: Mutex<Option<Observation>>,
}

impl<M> PassthroughObserver<M> {
    fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.lock().as_ref() {
            trace!("downstream observation cancelled, cancelling upstream");
            upstream.cancel();
        }
    }
}

impl<M> Observer<M> for PassthroughObserver<M> {
    fn on_observe(&self, observation: &Observation) {
        *self.upstream.lock() = Some(observation.clone());
        // The downstream observer sees its own observation, not the
        // upstream one.
        self.behavior.relay_observe(self.downstream.as_ref(), &self.handle);
    }

    fn on_next(&self, message: &M) {
        match self.handle.state() {
            ObservationState::Observing => {
                self.behavior.relay_next(self.downstream.as_ref(), message);
            }
            ObservationState::Cancelled => self.cancel_upstream(),
            ObservationState::Completed | ObservationState::Failed => {
                panic!("protocol violation: relay invoked after a terminal event")
            }
        }
    }

    fn on_complete(&self) {
        if self.handle.terminate(ObservationState::Completed) {
            self.behavior.relay_complete(self.downstream.as_ref());
        } else {
            self.cancel_upstream();
        }
    }

    fn on_fail(&self, error: &EvalError) {
        if self.handle.terminate(ObservationState::Failed) {
            self.behavior.relay_fail(self.downstream.as_ref(), error);
        } else {
            self.cancel_upstream();
        }
    }
}

/// Binds a downstream [Observation] to an upstream [Observable].
///
/// Constructing the link performs the upstream subscription immediately.
pub struct PassthroughObservation;

impl PassthroughObservation {
    /// Subscribe `downstream` to `upstream` through `behavior`, returning
    /// the downstream-facing [Observation].
    pub fn bind<M: 'static>(
        upstream: &dyn Observable<M>,
        behavior: Arc<dyn Passthrough<M>>,
        downstream: Arc<dyn Observer<M>>,
    ) -> Observation {
        let handle = Observation::new();
        let relay = Arc::new(PassthroughObserver {
            behavior,
            downstream,
            handle: handle.clone(),
            upstream: Mutex::new(None),
        });
        upstream.observe(relay);
        handle
    }

    /// An identity link: every event relayed unchanged.
    pub fn identity<M: 'static>(upstream: &dyn Observable<M>, downstream: Arc<dyn Observer<M>>) -> Observation {
        Self::bind(upstream, Arc::new(IdentityPassthrough), downstream)
    }
}
