use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use derivative::Derivative;
use log::trace;
use parking_lot::Mutex;
use crate::error::EvalResult;
use crate::expr::{EvalFn, ExprCore, Expression, Node};
use crate::observe::{Observation, Observer};

type CombineFn<S, T> = Arc<dyn Fn(&[S]) -> EvalResult<T> + Send + Sync>;
type DepList<S> = Arc<Mutex<Vec<Weak<ExprCore<S>>>>>;

/// An [Expression] over a *mutable* set of same-typed dependencies.
///
/// Evaluation pulls the current value of every dependency, in order, and
/// hands the slice to the combining function. [CompoundExpression::set_dependencies]
/// replaces the set wholesale: the node stops listening to the old members,
/// starts listening to the new ones and is invalidated, so the next read
/// recombines from the new set.
///
/// `Clone` is shallow (both handles address the same node), matching
/// [Expression]; use [CompoundExpression::copy] for an independent node.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct CompoundExpression<S, T> {
    expr: Expression<T>,
    deps: DepList<S>,
    combine: CombineFn<S, T>,
}

impl<S, T> CompoundExpression<S, T>
where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Build a node combining the values of `deps` with `combine`.
    pub fn new<F>(deps: &[Expression<S>], combine: F) -> Self
    where
        F: Fn(&[S]) -> EvalResult<T> + Send + Sync + 'static,
    {
        Self::from_parts(
            deps.iter().map(|dep| Arc::downgrade(&dep.core)).collect(),
            Arc::new(combine),
        )
    }

    fn from_parts(deps: Vec<Weak<ExprCore<S>>>, combine: CombineFn<S, T>) -> Self {
        let dep_list: DepList<S> = Arc::new(Mutex::new(deps));
        let eval: EvalFn<T> = {
            let deps = Arc::clone(&dep_list);
            let combine = Arc::clone(&combine);
            Arc::new(move || {
                // Snapshot first: evaluation recurses into dependencies and
                // must not hold the list lock while doing so.
                let snapshot: Vec<Weak<ExprCore<S>>> = deps.lock().clone();
                let mut values = Vec::with_capacity(snapshot.len());
                for dep in &snapshot {
                    values.push(ExprCore::pull(dep)?);
                }
                combine(&values)
            })
        };
        let expr = Expression::computed(eval, Vec::new());
        let compound = CompoundExpression {
            expr,
            deps: dep_list,
            combine,
        };
        compound.attach_all();
        compound
    }

    fn attach_all(&self) {
        let node = self.expr.node_weak();
        for dep in self.deps.lock().iter() {
            if let Some(dep) = dep.upgrade() {
                dep.attach_dependent(node.clone());
            }
        }
    }

    /// Replace the dependency set.
    ///
    /// Tears down listening on the old members, establishes it on the new
    /// ones and invalidates the node.
    pub fn set_dependencies(&self, deps: &[Expression<S>]) {
        trace!("replacing {} compound dependencies", deps.len());
        let node = self.expr.node_weak();
        let old: Vec<Weak<ExprCore<S>>> = {
            let mut list = self.deps.lock();
            std::mem::replace(
                &mut *list,
                deps.iter().map(|dep| Arc::downgrade(&dep.core)).collect(),
            )
        };
        for dep in old {
            if let Some(dep) = dep.upgrade() {
                dep.detach_dependent(&node);
            }
        }
        for dep in deps {
            dep.attach_node(node.clone());
        }
        self.expr.invalidate();
    }

    /// An independent node over a snapshot of the current dependency set.
    ///
    /// Like [Expression::copy] the new node shares no cache or observer
    /// list with the original; the dependency list is frozen at copy time,
    /// so a later [CompoundExpression::set_dependencies] on either node
    /// leaves the other untouched.
    pub fn copy(&self) -> CompoundExpression<S, T> {
        Self::from_parts(self.deps.lock().clone(), Arc::clone(&self.combine))
    }

    /// The underlying [Expression] handle, for collaborators that consume
    /// the plain expression contract.
    pub fn expression(&self) -> &Expression<T> {
        &self.expr
    }

    pub fn get(&self) -> EvalResult<T> {
        self.expr.get()
    }

    pub fn invalidate(&self) {
        self.expr.invalidate();
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer<T>>) -> Observation {
        self.expr.add_observer(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn Observer<T>>) {
        self.expr.remove_observer(observer);
    }
}

impl<S, T> Debug for CompoundExpression<S, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompoundExpression")
            .field("dependencies", &self.deps.lock().len())
            .finish_non_exhaustive()
    }
}
