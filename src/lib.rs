//! A lazily-recomputed dependency graph with push change notifications.
//!
//! An [Expression] is a wrapper for a cached value derived from other
//! expressions. Changing a leaf marks every transitive dependent dirty
//! ([Expression::invalidate] is cheap and propagates eagerly), but nothing
//! recomputes until somebody actually reads a dirty node with
//! [Expression::get]: recomputation is lazy and pulls current values from
//! the dependencies, recursively forcing any dirty one first. A successful
//! recomputation publishes the new value and pushes it to the node's
//! observers.
//!
//! The notification side is the [Observable]/[Observer]/[Observation]
//! triple: a source accepts an observer and hands back a cancellable
//! observation, delivering `on_observe`, then `on_next`s, then at most one
//! terminal event, all synchronously on the mutating thread (there is no
//! dispatch thread or queue). Decorators compose around the [Passthrough]
//! relay: [FilteringObservation] drops messages failing a predicate, and
//! [ReferenceObserver] holds its target weakly and cancels itself once the
//! target is gone.
//!
//! [CompoundExpression] is an expression whose dependency set can be
//! replaced at runtime, and [FunctionBuffer]/[ExpressionBuffer] cache a
//! "front" value recombined from a swappable "back" value whenever the back
//! changes.
//!
//! Everything is synchronous and in-process: an observer that blocks will
//! block the mutator that triggered it, and all recovery from evaluation
//! failures belongs to the caller.

pub(crate) mod error;
pub(crate) mod observe;
pub(crate) mod passthrough;
pub(crate) mod filter;
pub(crate) mod reference;
pub(crate) mod expr;
pub(crate) mod compound;
pub(crate) mod buffer;

pub use error::*;
pub use observe::*;
pub use passthrough::*;
pub use filter::*;
pub use reference::*;
pub use expr::*;
pub use compound::*;
pub use buffer::*;
