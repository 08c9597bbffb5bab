//! Operation records and the failure values they complete with.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chain::capability::Capability;

/// Error reported by an operation through its completion signal
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationError {
    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Payload was rejected by the model
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Storage adapter failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// The member dropped its responder without answering
    #[error("Operation '{member}' was abandoned without completing")]
    Abandoned {
        /// Member that never answered
        member: String,
    },

    /// The invocation panicked while running
    #[error("Operation '{member}' panicked: {message}")]
    Panicked {
        /// Member whose invocation panicked
        member: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// What a failed operation reports: one error, or a sequence of them.
///
/// Sequences are flattened element by element into the batch aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A single error value
    Single(OperationError),
    /// Several errors reported together (e.g. per-field validation)
    Many(Vec<OperationError>),
}

impl Failure {
    /// Number of aggregate entries this failure contributes
    pub fn len(&self) -> usize {
        match self {
            Failure::Single(_) => 1,
            Failure::Many(errors) => errors.len(),
        }
    }

    /// True for an empty `Many`
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the individual errors in reported order
    pub fn iter(&self) -> impl Iterator<Item = &OperationError> {
        let slice: &[OperationError] = match self {
            Failure::Single(error) => std::slice::from_ref(error),
            Failure::Many(errors) => errors,
        };
        slice.iter()
    }

    /// Consume into the flat list of errors
    pub fn into_errors(self) -> Vec<OperationError> {
        match self {
            Failure::Single(error) => vec![error],
            Failure::Many(errors) => errors,
        }
    }
}

impl From<OperationError> for Failure {
    fn from(error: OperationError) -> Self {
        Failure::Single(error)
    }
}

impl From<Vec<OperationError>> for Failure {
    fn from(errors: Vec<OperationError>) -> Self {
        Failure::Many(errors)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Single(error) => write!(f, "{}", error),
            Failure::Many(errors) => {
                write!(f, "{} errors", errors.len())?;
                for error in errors {
                    write!(f, "; {}", error)?;
                }
                Ok(())
            }
        }
    }
}

/// What an invocation resolves to
pub type OperationResult = std::result::Result<Option<Value>, Failure>;

/// Per-operation completion handler, called with `(error, result)`
pub type CompletionHandler = Box<dyn FnOnce(Option<&Failure>, Option<&Value>) + Send>;

/// Final handler, called once with the aggregated errors or `None`
pub type FinalHandler = Box<dyn FnOnce(Option<Vec<OperationError>>) + Send>;

/// One unit of work to register on a [`Batch`](crate::chain::Batch).
///
/// `target` and `member` identify the call; both are required. A missing one
/// makes the registration invalid and the batch ignores it.
#[derive(Default)]
pub struct Operation {
    pub(crate) target: Option<Arc<dyn Capability>>,
    pub(crate) member: Option<String>,
    pub(crate) argument: Option<Value>,
    pub(crate) on_complete: Option<CompletionHandler>,
}

impl Operation {
    /// Empty operation, to be filled with the builder methods
    pub fn new() -> Self {
        Self::default()
    }

    /// Shortcut for `Operation::new().target(target).member(member)`
    pub fn call(target: Arc<dyn Capability>, member: impl Into<String>) -> Self {
        Self::new().target(target).member(member)
    }

    /// Set the capability to invoke
    pub fn target(mut self, target: Arc<dyn Capability>) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the member name
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Set the argument payload
    pub fn argument(mut self, argument: Value) -> Self {
        self.argument = Some(argument);
        self
    }

    /// Set the per-operation completion handler
    pub fn on_complete<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Option<&Failure>, Option<&Value>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(handler));
        self
    }

    /// Member name, if set
    pub fn member_name(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// Whether both identifying fields are present
    pub fn is_identified(&self) -> bool {
        self.target.is_some() && self.member.as_deref().is_some_and(|m| !m.is_empty())
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("target", &self.target.as_ref().map(|t| t.name().to_string()))
            .field("member", &self.member)
            .field("argument", &self.argument)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}
