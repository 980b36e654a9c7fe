use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use derivative::Derivative;
use log::trace;
use parking_lot::{Condvar, Mutex, RwLock};
use crate::error::{EvalError, EvalResult};
use crate::observe::{Observable, Observation, Observer};

/// Erased view of a graph node used for invalidation edges.
///
/// Both edge directions are non-owning: dependents are stored as
/// `Weak<dyn Node>` so a dead subgraph is never retained by its neighbours.
pub(crate) trait Node: Send + Sync {
    /// Mark the node dirty, propagating to its own dependents.
    fn invalidate(&self);

    fn attach_dependent(&self, _dependent: Weak<dyn Node>) {}

    fn detach_dependent(&self, _dependent: &Weak<dyn Node>) {}
}

/// Recomputation state of one node.
///
/// An explicit three-way phase (rather than a reentrant lock) keeps the
/// invalidate-during-computation race deterministic: `redirty` records an
/// invalidation that arrived while the computation was in flight, and the
/// computing thread consults it before publishing.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Clean,
    Dirty,
    Computing { thread: ThreadId, redirty: bool },
}

pub(crate) type EvalFn<T> = Arc<dyn Fn() -> EvalResult<T> + Send + Sync>;

pub(crate) struct ExprCore<T> {
    phase: Mutex<Phase>,
    published: Condvar,
    value: RwLock<Option<T>>,
    eval: EvalFn<T>,
    /// Leaf slot; `Some` only for source nodes.
    slot: Option<Arc<RwLock<T>>>,
    /// Upstream nodes this one was built over, kept for re-registering copies.
    upstreams: Vec<Weak<dyn Node>>,
    dependents: Mutex<Vec<Weak<dyn Node>>>,
    observers: Mutex<Vec<ObserverEntry<T>>>,
}

struct ObserverEntry<T> {
    observer: Arc<dyn Observer<T>>,
    observation: Observation,
}

/// A cacheable computed value with a declared set of upstream dependencies.
///
/// An expression caches its value until explicitly invalidated and
/// recomputes lazily: [Expression::invalidate] marks the node and its
/// transitive dependents dirty without recomputing anything, and the next
/// [Expression::get] on a dirty node re-derives the value from *current*
/// dependency values, recursively forcing any dirty dependency first.
/// Successful recomputation publishes the value, clears the dirty phase and
/// notifies the node's observers with the fresh value.
///
/// `Clone` is shallow: both handles address the same node. For an
/// independent node use [Expression::copy].
///
/// Concurrency: concurrent `get` callers on a clean node read in parallel;
/// on a dirty node the first reader recomputes while the rest block until
/// it publishes, so the work is never duplicated. A `get` that re-enters a
/// node its own thread is already computing fails fast with
/// [EvalError::Cycle].
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Expression<T> {
    pub(crate) core: Arc<ExprCore<T>>,
}

impl<T: Clone + Send + Sync + 'static> Expression<T> {
    /// A settable leaf holding `init`.
    pub fn source(init: T) -> Self {
        let slot = Arc::new(RwLock::new(init.clone()));
        let eval_slot = Arc::clone(&slot);
        Self::build(
            Phase::Clean,
            Some(init),
            Some(slot),
            Arc::new(move || Ok(eval_slot.read().clone())),
            Vec::new(),
        )
    }

    /// Derive a value from one upstream expression.
    pub fn derived<S, F>(input: &Expression<S>, f: F) -> Self
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(&S) -> EvalResult<T> + Send + Sync + 'static,
    {
        let upstream = Arc::downgrade(&input.core);
        Self::computed(
            Arc::new(move || f(&ExprCore::pull(&upstream)?)),
            vec![input.node_weak()],
        )
    }

    /// Combine two upstream expressions of possibly different types.
    pub fn combined<S1, S2, F>(lhs: &Expression<S1>, rhs: &Expression<S2>, f: F) -> Self
    where
        S1: Clone + Send + Sync + 'static,
        S2: Clone + Send + Sync + 'static,
        F: Fn(&S1, &S2) -> EvalResult<T> + Send + Sync + 'static,
    {
        let left = Arc::downgrade(&lhs.core);
        let right = Arc::downgrade(&rhs.core);
        Self::computed(
            Arc::new(move || f(&ExprCore::pull(&left)?, &ExprCore::pull(&right)?)),
            vec![lhs.node_weak(), rhs.node_weak()],
        )
    }

    /// A derived node over an erased evaluation function, registered as a
    /// dependent of every upstream. Starts dirty.
    pub(crate) fn computed(eval: EvalFn<T>, upstreams: Vec<Weak<dyn Node>>) -> Self {
        let expr = Self::build(Phase::Dirty, None, None, eval, upstreams);
        let weak = expr.node_weak();
        for upstream in &expr.core.upstreams {
            if let Some(upstream) = upstream.upgrade() {
                upstream.attach_dependent(weak.clone());
            }
        }
        expr
    }

    fn build(
        phase: Phase,
        value: Option<T>,
        slot: Option<Arc<RwLock<T>>>,
        eval: EvalFn<T>,
        upstreams: Vec<Weak<dyn Node>>,
    ) -> Self {
        Expression {
            core: Arc::new(ExprCore {
                phase: Mutex::new(phase),
                published: Condvar::new(),
                value: RwLock::new(value),
                eval,
                slot,
                upstreams,
                dependents: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current value, recomputing first if the node is dirty.
    ///
    /// A failed evaluation leaves the node dirty, fires no notification and
    /// returns the error to the caller; there is no poisoned cache of a
    /// failed computation.
    pub fn get(&self) -> EvalResult<T> {
        let this = thread::current().id();
        let mut phase = self.core.phase.lock();
        loop {
            match *phase {
                Phase::Clean => {
                    drop(phase);
                    let value = self.core.value.read();
                    return Ok(value
                        .as_ref()
                        .expect("broken expression graph: clean node with no published value")
                        .clone());
                }
                Phase::Dirty => {
                    *phase = Phase::Computing {
                        thread: this,
                        redirty: false,
                    };
                    drop(phase);
                    return self.recompute();
                }
                Phase::Computing { thread, .. } if thread == this => {
                    return Err(EvalError::Cycle);
                }
                Phase::Computing { .. } => {
                    self.core.published.wait(&mut phase);
                }
            }
        }
    }

    fn recompute(&self) -> EvalResult<T> {
        trace!("recomputing expression");
        let result = {
            // A panicking evaluation must not leave the node computing:
            // blocked readers would never wake.
            let reset = ResetOnPanic(&self.core);
            let result = (self.core.eval)();
            std::mem::forget(reset);
            result
        };
        let mut phase = self.core.phase.lock();
        match result {
            Ok(value) => {
                let fresh = matches!(*phase, Phase::Computing { redirty: false, .. });
                if fresh {
                    *self.core.value.write() = Some(value.clone());
                    *phase = Phase::Clean;
                    self.core.published.notify_all();
                    drop(phase);
                    self.core.notify_observers(&value);
                } else {
                    // Invalidation won the race: the result is current for
                    // this caller but must not be published or announced.
                    trace!("recomputation raced an invalidation, node stays dirty");
                    *phase = Phase::Dirty;
                    self.core.published.notify_all();
                }
                Ok(value)
            }
            Err(error) => {
                *phase = Phase::Dirty;
                self.core.published.notify_all();
                drop(phase);
                Err(error)
            }
        }
    }

    /// Mark this node and its transitive dependents dirty without
    /// recomputing anything. Idempotent: a second call with no intervening
    /// read has no further effect.
    pub fn invalidate(&self) {
        self.core.invalidate();
    }

    /// Store a new value into a source leaf and dirty the node and its
    /// transitive dependents.
    ///
    /// Panics on a derived node: computed values are derived, not assigned.
    pub fn set(&self, value: T) {
        let slot = self
            .core
            .slot
            .as_ref()
            .expect("protocol violation: set called on a derived expression");
        *slot.write() = value;
        self.core.invalidate();
    }

    /// Transform the current leaf value in place.
    ///
    /// Panics on a derived node, like [Expression::set].
    pub fn update<F: FnOnce(&T) -> T>(&self, f: F) {
        let slot = self
            .core
            .slot
            .as_ref()
            .expect("protocol violation: update called on a derived expression");
        {
            let mut slot = slot.write();
            let next = f(&slot);
            *slot = next;
        }
        self.core.invalidate();
    }

    /// An independent node over the same dependencies.
    ///
    /// The copy shares nothing mutable with the original: it has its own
    /// cache (starting dirty), its own observer list, and for source nodes
    /// its own slot seeded with the current value. Derived copies are
    /// re-registered with the original's upstream nodes, so future
    /// invalidations reach both.
    pub fn copy(&self) -> Expression<T> {
        if let Some(slot) = &self.core.slot {
            return Expression::source(slot.read().clone());
        }
        Self::computed(Arc::clone(&self.core.eval), self.core.upstreams.clone())
    }

    /// Attach an observer for value-changed notifications.
    ///
    /// Equivalent to [Observable::observe]; the observer receives `on_next`
    /// with the freshly published value after each successful recomputation.
    pub fn add_observer(&self, observer: Arc<dyn Observer<T>>) -> Observation {
        self.observe(observer)
    }

    /// Cancel and drop every subscription of `observer` on this node.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer<T>>) {
        let target = Arc::as_ptr(observer) as *const ();
        self.core.observers.lock().retain(|entry| {
            if Arc::as_ptr(&entry.observer) as *const () == target {
                entry.observation.cancel();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn node_weak(&self) -> Weak<dyn Node> {
        let node: Arc<dyn Node> = self.core.clone();
        Arc::downgrade(&node)
    }

    pub(crate) fn attach_node(&self, dependent: Weak<dyn Node>) {
        self.core.attach_dependent(dependent);
    }

    pub(crate) fn detach_node(&self, dependent: &Weak<dyn Node>) {
        self.core.detach_dependent(dependent);
    }
}

struct ResetOnPanic<'a, T>(&'a ExprCore<T>);

impl<T> Drop for ResetOnPanic<'_, T> {
    fn drop(&mut self) {
        *self.0.phase.lock() = Phase::Dirty;
        self.0.published.notify_all();
    }
}

impl<T: Clone + Send + Sync + 'static> ExprCore<T> {
    /// Read a dependency through its non-owning edge, forcing evaluation.
    pub(crate) fn pull(weak: &Weak<ExprCore<T>>) -> EvalResult<T> {
        match weak.upgrade() {
            Some(core) => Expression { core }.get(),
            None => Err(EvalError::DroppedDependency),
        }
    }

    fn notify_observers(&self, value: &T) {
        let entries: Vec<ObserverEntry<T>> = {
            let mut observers = self.observers.lock();
            observers.retain(|entry| entry.observation.is_live());
            observers
                .iter()
                .map(|entry| ObserverEntry {
                    observer: Arc::clone(&entry.observer),
                    observation: entry.observation.clone(),
                })
                .collect()
        };
        for entry in entries {
            if entry.observation.is_live() {
                entry.observer.on_next(value);
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Node for ExprCore<T> {
    fn invalidate(&self) {
        let propagate = {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Clean => {
                    *phase = Phase::Dirty;
                    true
                }
                // Already dirty: every dependent was dirtied when this node
                // was, so there is nothing left to propagate.
                Phase::Dirty => false,
                Phase::Computing { thread, .. } => {
                    *phase = Phase::Computing {
                        thread,
                        redirty: true,
                    };
                    false
                }
            }
        };
        if propagate {
            trace!("expression invalidated, propagating to dependents");
            let dependents: Vec<Arc<dyn Node>> = {
                let mut list = self.dependents.lock();
                list.retain(|dependent| dependent.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };
            for dependent in dependents {
                dependent.invalidate();
            }
        }
    }

    fn attach_dependent(&self, dependent: Weak<dyn Node>) {
        self.dependents.lock().push(dependent);
    }

    fn detach_dependent(&self, dependent: &Weak<dyn Node>) {
        // Compare allocation addresses only: two fat pointers to the same
        // node may carry distinct vtables.
        let target = dependent.as_ptr() as *const ();
        self.dependents
            .lock()
            .retain(|entry| entry.as_ptr() as *const () != target);
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> for Expression<T> {
    fn observe(&self, observer: Arc<dyn Observer<T>>) -> Observation {
        let observation = Observation::new();
        observer.on_observe(&observation);
        self.core.observers.lock().push(ObserverEntry {
            observer,
            observation: observation.clone(),
        });
        observation
    }
}

impl<T> Debug for Expression<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expression")
            .field("phase", &*self.core.phase.lock())
            .field("observers", &self.core.observers.lock().len())
            .finish_non_exhaustive()
    }
}
