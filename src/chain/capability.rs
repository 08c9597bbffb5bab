//! Capabilities: targets that resolve member names into bound callables.
//!
//! A [`Capability`] stands in for "an object with named methods". Resolution
//! happens once per operation, before anything is dispatched, so a bad name
//! surfaces as a [`SetupFault`] rather than a runtime error.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::chain::operation::{Failure, OperationError, OperationResult};

/// Synchronous failure while binding an operation to its target
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetupFault {
    /// The target does not expose the requested member
    #[error("'{target}' has no member '{member}'")]
    UnknownMember {
        /// Target capability name
        target: String,
        /// Requested member
        member: String,
    },

    /// The member does not accept this argument shape
    #[error("Arity mismatch: {0}")]
    Arity(String),

    /// The target itself cannot service calls
    #[error("Malformed target: {0}")]
    MalformedTarget(String),
}

/// A started-on-first-poll call. Nothing runs until the batch dispatches it.
pub type Invocation = BoxFuture<'static, OperationResult>;

/// A bound callable member of a capability
pub trait Member: Send + Sync {
    /// Bind the argument and produce the pending call, or reject it
    fn invoke(&self, argument: Option<Value>) -> Result<Invocation, SetupFault>;
}

/// Anything that exposes named members to a batch
pub trait Capability: Send + Sync {
    /// Name used in logs and setup faults
    fn name(&self) -> &str;

    /// Resolve a member name into a bound callable
    fn resolve(&self, member: &str) -> Result<Arc<dyn Member>, SetupFault>;
}

/// Member backed by an async closure
pub struct FnMember<F> {
    f: F,
}

impl<F, Fut> Member for FnMember<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    fn invoke(&self, argument: Option<Value>) -> Result<Invocation, SetupFault> {
        Ok(Box::pin((self.f)(argument)))
    }
}

/// Wrap an async closure as a [`Member`]
pub fn member_fn<F, Fut>(f: F) -> FnMember<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    FnMember { f }
}

/// Completion handle passed to callback-style members.
///
/// Consumed by answering, so a member can answer at most once. Dropping it
/// unanswered completes the operation with [`OperationError::Abandoned`].
pub struct Responder {
    tx: oneshot::Sender<OperationResult>,
}

impl Responder {
    /// Answer with `(error, result)`
    pub fn respond(self, error: Option<Failure>, result: Option<Value>) {
        let outcome = match error {
            Some(failure) => Err(failure),
            None => Ok(result),
        };
        // The receiver only goes away if the batch task was torn down
        let _ = self.tx.send(outcome);
    }

    /// Answer with a result and no error
    pub fn ok(self, result: impl Into<Option<Value>>) {
        self.respond(None, result.into());
    }

    /// Answer with an error
    pub fn fail(self, failure: impl Into<Failure>) {
        self.respond(Some(failure.into()), None);
    }
}

/// Member with the `(argument?, completion)` calling convention.
///
/// The callback runs when the batch dispatches the operation. It may answer
/// synchronously or hand the [`Responder`] to another task or thread.
pub struct CallbackMember<F> {
    name: String,
    f: Arc<F>,
}

impl<F> CallbackMember<F>
where
    F: Fn(Option<Value>, Responder) + Send + Sync + 'static,
{
    /// Wrap a callback under the given member name
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl<F> Member for CallbackMember<F>
where
    F: Fn(Option<Value>, Responder) + Send + Sync + 'static,
{
    fn invoke(&self, argument: Option<Value>) -> Result<Invocation, SetupFault> {
        let f = Arc::clone(&self.f);
        let member = self.name.clone();
        Ok(Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            f(argument, Responder { tx });
            rx.await
                .unwrap_or_else(|_| Err(OperationError::Abandoned { member }.into()))
        }))
    }
}

/// Whether a member takes an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArityRule {
    /// Argument must be present
    Required,
    /// Argument must be absent
    Forbidden,
    /// Either is fine
    Any,
}

/// Member wrapper that rejects the wrong argument shape at bind time
pub struct Arity<M> {
    rule: ArityRule,
    inner: M,
}

impl<M: Member> Arity<M> {
    /// Require an argument
    pub fn required(inner: M) -> Self {
        Self { rule: ArityRule::Required, inner }
    }

    /// Reject any argument
    pub fn forbidden(inner: M) -> Self {
        Self { rule: ArityRule::Forbidden, inner }
    }
}

impl<M: Member> Member for Arity<M> {
    fn invoke(&self, argument: Option<Value>) -> Result<Invocation, SetupFault> {
        match (self.rule, &argument) {
            (ArityRule::Required, None) => {
                Err(SetupFault::Arity("argument required".to_string()))
            }
            (ArityRule::Forbidden, Some(_)) => {
                Err(SetupFault::Arity("member takes no argument".to_string()))
            }
            _ => self.inner.invoke(argument),
        }
    }
}

/// Name-to-member table usable as a [`Capability`].
///
/// ```rust
/// use modelchain::chain::Methods;
/// use serde_json::json;
///
/// let users = Methods::new("User")
///     .member("count", |_arg| async { Ok(Some(json!(3))) });
/// assert!(users.has_member("count"));
/// ```
pub struct Methods {
    name: String,
    members: HashMap<String, Arc<dyn Member>>,
}

impl Methods {
    /// Create an empty table for the named target
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
        }
    }

    /// Add an async-closure member accepting any argument shape
    pub fn member<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        self.bind(name, Arc::new(member_fn(f)))
    }

    /// Add a callback-style member
    pub fn callback<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>, Responder) + Send + Sync + 'static,
    {
        let name = name.into();
        let member = CallbackMember::new(name.clone(), f);
        self.bind(name, Arc::new(member))
    }

    /// Add an already-built member
    pub fn bind(mut self, name: impl Into<String>, member: Arc<dyn Member>) -> Self {
        self.members.insert(name.into(), member);
        self
    }

    /// Whether `name` resolves
    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    /// Registered member names
    pub fn member_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }
}

impl Capability for Methods {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, member: &str) -> Result<Arc<dyn Member>, SetupFault> {
        self.members
            .get(member)
            .cloned()
            .ok_or_else(|| SetupFault::UnknownMember {
                target: self.name.clone(),
                member: member.to_string(),
            })
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.member_names();
        names.sort();
        f.debug_struct("Methods")
            .field("name", &self.name)
            .field("members", &names)
            .finish()
    }
}
