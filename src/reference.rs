use std::sync::{Arc, Weak};
use log::debug;
use parking_lot::Mutex;
use crate::error::EvalError;
use crate::observe::{Observation, Observer};

/// Forwards events to a weakly-held downstream observer.
///
/// Lets a long-lived [Observable](crate::Observable) hold a subscription
/// without keeping an otherwise-droppable observer alive. Before every
/// dispatch the wrapper upgrades its handle: if the target is live the event
/// is forwarded, otherwise the wrapper cancels its own [Observation] and
/// makes no further attempts.
///
/// Delivery is best-effort: a target dropped between events misses
/// everything from that point on, including terminal events. That is
/// expected behavior, not a defect.
pub struct ReferenceObserver<M> {
    target: Weak<dyn Observer<M>>,
    observation: Mutex<Option<Observation>>,
}

impl<M> ReferenceObserver<M> {
    /// Wrap `observer` behind a weak, non-owning handle.
    pub fn weak(observer: &Arc<dyn Observer<M>>) -> Arc<Self> {
        Arc::new(ReferenceObserver {
            target: Arc::downgrade(observer),
            observation: Mutex::new(None),
        })
    }

    fn target(&self) -> Option<Arc<dyn Observer<M>>> {
        let target = self.target.upgrade();
        if target.is_none() {
            // Reference loss is the expected end of life here, not an error.
            debug!("weak observer target dropped, cancelling the observation");
            if let Some(observation) = self.observation.lock().as_ref() {
                observation.cancel();
            }
        }
        target
    }
}

impl<M> Observer<M> for ReferenceObserver<M> {
    fn on_observe(&self, observation: &Observation) {
        *self.observation.lock() = Some(observation.clone());
        if let Some(target) = self.target() {
            target.on_observe(observation);
        }
    }

    fn on_next(&self, message: &M) {
        if let Some(target) = self.target() {
            target.on_next(message);
        }
    }

    fn on_complete(&self) {
        if let Some(target) = self.target() {
            target.on_complete();
        }
    }

    fn on_fail(&self, error: &EvalError) {
        if let Some(target) = self.target() {
            target.on_fail(error);
        }
    }
}
