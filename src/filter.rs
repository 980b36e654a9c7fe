use std::marker::PhantomData;
use std::sync::Arc;
use log::trace;
use crate::observe::{Observable, Observation, Observer};
use crate::passthrough::{Passthrough, PassthroughObservation};

/// Passthrough link that suppresses messages failing a predicate.
///
/// The downstream observer never sees a message for which the predicate is
/// false; order among passing messages matches the upstream order. All other
/// events relay unchanged.
pub struct FilteringObservation;

impl FilteringObservation {
    /// Subscribe `downstream` to `upstream`, keeping only messages for which
    /// `predicate` holds.
    pub fn observe<M, P>(
        upstream: &dyn Observable<M>,
        predicate: P,
        downstream: Arc<dyn Observer<M>>,
    ) -> Observation
    where
        M: 'static,
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let filter = Filter {
            predicate,
            _marker: PhantomData,
        };
        PassthroughObservation::bind(upstream, Arc::new(filter), downstream)
    }
}

struct Filter<M, P> {
    predicate: P,
    _marker: PhantomData<fn(&M)>,
}

impl<M, P> Passthrough<M> for Filter<M, P>
where
    P: Fn(&M) -> bool + Send + Sync,
{
    fn relay_next(&self, downstream: &dyn Observer<M>, message: &M) {
        if (self.predicate)(message) {
            downstream.on_next(message);
        } else {
            trace!("message suppressed by filter");
        }
    }
}
