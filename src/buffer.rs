use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use derivative::Derivative;
use log::trace;
use parking_lot::Mutex;
use crate::error::EvalResult;
use crate::expr::{Expression, Node};

/// The combining function of a buffer: either the one-argument ("map") form
/// over the back value alone, or the two-argument ("fold") form over the
/// previous front value and the back value.
enum Combine<F, T> {
    Map(Box<dyn Fn(&F) -> EvalResult<T> + Send + Sync>),
    Fold(Box<dyn Fn(&T, &F) -> EvalResult<T> + Send + Sync>),
}

impl<F, T> Combine<F, T> {
    fn apply(&self, front: &Option<T>, back: &F) -> EvalResult<T> {
        match self {
            Combine::Map(f) => f(back),
            Combine::Fold(f) => f(
                front
                    .as_ref()
                    .expect("broken buffer: fold form with no front seed"),
                back,
            ),
        }
    }
}

struct BufferState<B, T> {
    front: Option<T>,
    back: B,
    dirty: bool,
}

/// A two-value cache: a "front" cached result recomputed on demand from a
/// "back" source value.
///
/// [FunctionBuffer::set_back] swaps in a new back value, dirties the front
/// and hands the previous back to the caller for further cleanup. Reading
/// the front behaves like [Expression::get]: lazy recompute-on-read, with a
/// failed combine leaving the front dirty and the error with the caller.
pub struct FunctionBuffer<F, T> {
    state: Mutex<BufferState<F, T>>,
    combine: Combine<F, T>,
}

impl<F, T: Clone> FunctionBuffer<F, T> {
    /// The map form: the front is derived from the back value alone.
    pub fn map(back: F, f: impl Fn(&F) -> EvalResult<T> + Send + Sync + 'static) -> Self {
        FunctionBuffer {
            state: Mutex::new(BufferState {
                front: None,
                back,
                dirty: true,
            }),
            combine: Combine::Map(Box::new(f)),
        }
    }

    /// The fold form: each recomputation combines the previous front value
    /// with the current back value, starting from `front`.
    pub fn fold(front: T, back: F, f: impl Fn(&T, &F) -> EvalResult<T> + Send + Sync + 'static) -> Self {
        FunctionBuffer {
            state: Mutex::new(BufferState {
                front: Some(front),
                back,
                dirty: true,
            }),
            combine: Combine::Fold(Box::new(f)),
        }
    }

    /// Replace the back value, dirtying the front; returns the previous
    /// back.
    pub fn set_back(&self, next: F) -> F {
        let mut state = self.state.lock();
        state.dirty = true;
        std::mem::replace(&mut state.back, next)
    }

    /// The front value, recombined from the current back if dirty.
    pub fn front(&self) -> EvalResult<T> {
        let mut state = self.state.lock();
        if !state.dirty {
            if let Some(front) = &state.front {
                return Ok(front.clone());
            }
        }
        let next = self.combine.apply(&state.front, &state.back)?;
        state.front = Some(next.clone());
        state.dirty = false;
        Ok(next)
    }
}

impl<F, T> Debug for FunctionBuffer<F, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FunctionBuffer")
            .field("dirty", &state.dirty)
            .finish_non_exhaustive()
    }
}

/// A [FunctionBuffer] whose back is itself an [Expression].
///
/// The buffer registers as an invalidation dependent of its back, so any
/// invalidation of the back expression dirties the front. This is the
/// mechanism by which one expression re-exposes another's changes as a
/// differently-typed cached value without re-deriving the upstream graph.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct ExpressionBuffer<F, T> {
    inner: Arc<EbCore<F, T>>,
}

struct EbCore<F, T> {
    state: Mutex<BufferState<Expression<F>, T>>,
    combine: Combine<F, T>,
}

impl<F, T> ExpressionBuffer<F, T>
where
    F: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// The map form over the back expression's value.
    pub fn map(back: Expression<F>, f: impl Fn(&F) -> EvalResult<T> + Send + Sync + 'static) -> Self {
        Self::build(None, back, Combine::Map(Box::new(f)))
    }

    /// The fold form, starting from `front`.
    pub fn fold(
        front: T,
        back: Expression<F>,
        f: impl Fn(&T, &F) -> EvalResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self::build(Some(front), back, Combine::Fold(Box::new(f)))
    }

    fn build(front: Option<T>, back: Expression<F>, combine: Combine<F, T>) -> Self {
        let inner = Arc::new(EbCore {
            state: Mutex::new(BufferState {
                front,
                back: back.clone(),
                dirty: true,
            }),
            combine,
        });
        let buffer = ExpressionBuffer { inner };
        back.attach_node(buffer.node_weak());
        buffer
    }

    /// Replace the back expression.
    ///
    /// Detaches the buffer's invalidation listener from the previous back,
    /// attaches it to `next`, dirties the front and returns the previous
    /// back so the caller can perform its own cleanup.
    pub fn set_back(&self, next: Expression<F>) -> Expression<F> {
        let node = self.node_weak();
        let mut state = self.inner.state.lock();
        let same = Arc::ptr_eq(&state.back.core, &next.core);
        if !same {
            next.attach_node(node.clone());
        }
        let prev = std::mem::replace(&mut state.back, next);
        state.dirty = true;
        drop(state);
        if !same {
            prev.detach_node(&node);
        }
        prev
    }

    /// The front value, recombined from the back expression if dirty.
    ///
    /// Forces evaluation of a dirty back first, exactly like a dependency
    /// read.
    pub fn front(&self) -> EvalResult<T> {
        let mut state = self.inner.state.lock();
        if !state.dirty {
            if let Some(front) = &state.front {
                return Ok(front.clone());
            }
        }
        let back = state.back.get()?;
        let next = self.inner.combine.apply(&state.front, &back)?;
        state.front = Some(next.clone());
        state.dirty = false;
        Ok(next)
    }

    fn node_weak(&self) -> Weak<dyn Node> {
        let node: Arc<dyn Node> = self.inner.clone();
        Arc::downgrade(&node)
    }
}

impl<F, T> Node for EbCore<F, T>
where
    F: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn invalidate(&self) {
        trace!("buffer back invalidated, dirtying the front");
        self.state.lock().dirty = true;
    }
}

impl<F, T> Debug for ExpressionBuffer<F, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExpressionBuffer")
            .field("dirty", &state.dirty)
            .finish_non_exhaustive()
    }
}
