use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by [Expression::get](crate::Expression::get) and the buffer read paths.
///
/// `Clone` so a cached failure can be handed to several callers and re-returned
/// through observer chains.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum EvalError {
    /// The expression transitively depends on itself.
    #[error("expression depends on itself")]
    Cycle,
    /// An upstream expression was dropped before this node re-evaluated.
    #[error("dependency was dropped before evaluation")]
    DroppedDependency,
    /// The user-supplied evaluation function failed.
    #[error("evaluation failed: {0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl EvalError {
    /// Wrap an arbitrary error from an evaluation function.
    pub fn failed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        EvalError::Failed(Arc::new(error))
    }

    /// A plain-text evaluation failure.
    pub fn message(message: impl Into<String>) -> Self {
        EvalError::Failed(Arc::new(Message(message.into())))
    }
}

/// Alias for the result of evaluating an expression.
pub type EvalResult<T> = Result<T, EvalError>;

#[derive(Debug)]
struct Message(String);

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}
