//! Error types for the cell store.
//!
//! Every fallible store operation returns [`Result`]. Derivation failures are
//! stored on the cell state and handed back to every reader, so [`Error`] is
//! cheap to clone.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::reactive::CellId;

/// All errors produced by the store.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The cell's value is not available yet.
    ///
    /// Derivations that read a pending cell should propagate this with `?`;
    /// the deriving cell then becomes pending as well.
    #[error("cell {0} is pending")]
    Pending(CellId),

    /// A derivation failed with a message.
    #[error("{0}")]
    Message(String),

    /// A derivation failed with a foreign error.
    #[error("{0}")]
    Source(SharedError),

    /// The cell has no write function, or no backing value to commit to.
    #[error("cell {0} is not writable")]
    NotWritable(CellId),

    /// A derivation read the cell it is defining.
    #[error("cell {0} read itself during derivation")]
    SelfRead(CellId),

    /// A write function wrote its own cell through `set` instead of `set_value`.
    #[error("cell {0} wrote itself through set")]
    SelfWrite(CellId),

    /// An async derivation wrote its own cell before its future started.
    #[error("cell {0} wrote itself during its synchronous derivation")]
    SetSelfInRead(CellId),

    /// `recurse` was called from an effect cleanup.
    #[error("set.recurse is not allowed in cleanup")]
    RecurseInCleanup,

    /// A stored value did not have the type the handle expects.
    #[error("cell {0} holds a value of an unexpected type")]
    TypeMismatch(CellId),

    /// A pending cell was awaited but no asynchronous work is left to settle it.
    #[error("cell {0} is pending with no work left to settle it")]
    Stalled(CellId),

    /// Engine bookkeeping reached a state it should never reach.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// More than one hook failed during a single flush.
    #[error("{}", describe_aggregate(.0))]
    Aggregate(Vec<Error>),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a derivation failure from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// Wrap a foreign error as a derivation failure.
    pub fn source<E>(error: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Error::Source(SharedError(Rc::new(error)))
    }

    /// Check if this error only signals a value that is not available yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Pending(_))
    }

    /// Fold a list of hook errors into one error, if there are any.
    pub(crate) fn collect(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

fn describe_aggregate(errors: &[Error]) -> String {
    match errors.first() {
        Some(first) => format!("{} hooks failed; first: {first}", errors.len()),
        None => "no hooks failed".to_string(),
    }
}

/// A reference-counted foreign error.
#[derive(Clone)]
pub struct SharedError(Rc<dyn std::error::Error>);

impl SharedError {
    /// Access the wrapped error.
    pub fn inner(&self) -> &(dyn std::error::Error + 'static) {
        &*self.0
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_folds_errors() {
        assert!(Error::collect(Vec::new()).is_ok());

        let single = Error::collect(vec![Error::msg("a")]).unwrap_err();
        assert!(matches!(single, Error::Message(ref m) if m == "a"));

        let many = Error::collect(vec![Error::msg("a"), Error::msg("b")]).unwrap_err();
        match many {
            Error::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn aggregate_display_names_the_first_failure() {
        let many = Error::Aggregate(vec![Error::msg("mount a"), Error::msg("mount b")]);
        assert_eq!(many.to_string(), "2 hooks failed; first: mount a");

        let empty = Error::Aggregate(Vec::new());
        assert_eq!(empty.to_string(), "no hooks failed");
    }

    #[test]
    fn source_errors_display_inner_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::source(io);
        assert_eq!(err.to_string(), "disk gone");
        assert!(!err.is_pending());
    }
}
