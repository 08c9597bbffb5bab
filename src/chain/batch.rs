//! Batch orchestration: fan out registered operations, join on all of them,
//! and report one aggregated outcome.
//!
//! A run happens in two phases. First every registered operation is bound to
//! its target member; operations whose binding fails are dropped and do not
//! count toward the expected total. Then every bound invocation is dispatched
//! without waiting on any other. Completions update shared bookkeeping under a
//! mutex, and the one that brings `finished` up to `total` takes the final
//! handler out of the state and fires it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::chain::capability::{Capability, Invocation, SetupFault};
use crate::chain::config::{ChainConfig, DispatchMode};
use crate::chain::metrics::{ChainMetrics, Outcome};
use crate::chain::operation::{
    CompletionHandler, FinalHandler, Operation, OperationError, OperationResult,
};
use crate::{ChainError, Result};

/// A registered operation with both identifying fields present
struct PendingOperation {
    target: Arc<dyn Capability>,
    member: String,
    argument: Option<Value>,
    on_complete: Option<CompletionHandler>,
}

impl PendingOperation {
    fn from_operation(operation: Operation) -> Result<Self> {
        let Operation {
            target,
            member,
            argument,
            on_complete,
        } = operation;

        match (target, member) {
            (Some(target), Some(member)) if !member.is_empty() => Ok(Self {
                target,
                member,
                argument,
                on_complete,
            }),
            (None, _) => Err(ChainError::InvalidRegistration("missing target".to_string())),
            _ => Err(ChainError::InvalidRegistration("missing member".to_string())),
        }
    }
}

/// A bound invocation ready to dispatch
struct Dispatch {
    member: String,
    invocation: Invocation,
    on_complete: Option<CompletionHandler>,
}

/// Completion bookkeeping shared by every in-flight operation
struct BatchState {
    total: usize,
    finished: usize,
    errors: Vec<OperationError>,
    running: bool,
    terminated: bool,
    final_handler: Option<FinalHandler>,
    started: Instant,
}

struct Shared {
    label: String,
    metrics: ChainMetrics,
    state: Mutex<BatchState>,
}

impl Shared {
    /// Record one completion and fire the final handler if it was the last
    fn complete(&self, member: &str, on_complete: Option<CompletionHandler>, outcome: OperationResult) {
        let (failure, result) = match outcome {
            Ok(result) => (None, result),
            Err(failure) => (Some(failure), None),
        };

        if let Some(handler) = on_complete {
            let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                handler(failure.as_ref(), result.as_ref())
            }));
            if let Err(payload) = handled {
                error!(
                    batch = %self.label,
                    member = %member,
                    panic = %panic_message(payload.as_ref()),
                    "Completion handler panicked"
                );
            }
        }

        self.metrics.operation(if failure.is_some() {
            Outcome::Error
        } else {
            Outcome::Ok
        });

        let fire = {
            let mut state = self.state.lock();
            if state.terminated {
                warn!(batch = %self.label, member = %member, "Completion after batch terminated, ignoring");
                return;
            }

            state.finished += 1;
            if let Some(failure) = failure {
                debug!(batch = %self.label, member = %member, error = %failure, "Operation failed");
                state.errors.extend(failure.into_errors());
            }

            debug!(
                batch = %self.label,
                member = %member,
                finished = state.finished,
                total = state.total,
                "Operation completed"
            );

            if state.finished == state.total {
                state.running = false;
                state.terminated = true;
                let aggregate = if state.errors.is_empty() {
                    None
                } else {
                    Some(state.errors.clone())
                };
                let elapsed = state.started.elapsed();
                state
                    .final_handler
                    .take()
                    .map(|handler| (handler, aggregate, elapsed))
            } else {
                None
            }
        };

        if let Some((handler, aggregate, elapsed)) = fire {
            let error_count = aggregate.as_ref().map_or(0, Vec::len);
            self.metrics
                .batch_finished(aggregate.is_some(), elapsed.as_secs_f64(), true);
            info!(
                batch = %self.label,
                errors = error_count,
                duration_ms = elapsed.as_millis(),
                "Batch completed"
            );
            handler(aggregate);
        }
    }
}

/// Read-only view of a running batch
#[derive(Clone)]
pub struct Progress {
    shared: Arc<Shared>,
}

impl Progress {
    /// Operations expected to complete (setup faults excluded)
    pub fn total(&self) -> usize {
        self.shared.state.lock().total
    }

    /// Operations that have completed so far
    pub fn finished(&self) -> usize {
        self.shared.state.lock().finished
    }

    /// Errors collected so far
    pub fn error_count(&self) -> usize {
        self.shared.state.lock().errors.len()
    }

    /// Whether completions are still outstanding
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Whether the final handler has fired
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Progress")
            .field("label", &self.shared.label)
            .field("total", &state.total)
            .field("finished", &state.finished)
            .field("errors", &state.errors.len())
            .field("running", &state.running)
            .field("terminated", &state.terminated)
            .finish()
    }
}

/// Collects operations against model capabilities and runs them as one unit.
///
/// ```rust
/// use std::sync::Arc;
/// use modelchain::chain::{Batch, Methods};
/// use serde_json::json;
///
/// # async fn example() -> modelchain::Result<()> {
/// let users = Arc::new(Methods::new("User").member("count", |_| async { Ok(Some(json!(2))) }));
///
/// let mut batch = Batch::new();
/// batch.call(users.clone(), "count").call(users, "count");
///
/// let errors = batch.finish().await?;
/// assert!(errors.is_none());
/// # Ok(())
/// # }
/// ```
pub struct Batch {
    config: ChainConfig,
    operations: Vec<PendingOperation>,
}

impl Batch {
    /// Create an empty batch with default configuration
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    /// Create an empty batch with the given configuration
    pub fn with_config(config: ChainConfig) -> Self {
        Self {
            config,
            operations: Vec::new(),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Register an operation, ignoring it if `target` or `member` is missing
    pub fn register(&mut self, operation: Operation) -> &mut Self {
        match PendingOperation::from_operation(operation) {
            Ok(pending) => self.operations.push(pending),
            Err(e) => warn!(batch = %self.config.label, error = %e, "Ignoring operation"),
        }
        self
    }

    /// Register an operation, reporting a missing identifying field
    pub fn try_register(&mut self, operation: Operation) -> Result<&mut Self> {
        let pending = PendingOperation::from_operation(operation)?;
        self.operations.push(pending);
        Ok(self)
    }

    /// Register `target.member()` with no argument and no handler
    pub fn call(&mut self, target: Arc<dyn Capability>, member: &str) -> &mut Self {
        self.register(Operation::call(target, member))
    }

    /// Register `target.member(argument)` with no handler
    pub fn call_with(&mut self, target: Arc<dyn Capability>, member: &str, argument: Value) -> &mut Self {
        self.register(Operation::call(target, member).argument(argument))
    }

    /// Bind every registered operation, member and argument, without
    /// dispatching anything, returning the first setup fault.
    ///
    /// Bound invocations are dropped unpolled.
    pub fn check(&self) -> Result<()> {
        for op in &self.operations {
            let member = op.target.resolve(&op.member)?;
            member.invoke(op.argument.clone())?;
        }
        Ok(())
    }

    /// Dispatch every registered operation and call `final_handler` exactly
    /// once when all of them have completed.
    ///
    /// The handler receives `None` when every operation succeeded, otherwise
    /// the errors in the order they were reported. With nothing to dispatch it
    /// is called before `run` returns. Operation failures never surface here;
    /// the only error is [`ChainError::NoRuntime`] for a non-empty batch run
    /// outside Tokio, in which case nothing was bound or dispatched and the
    /// handler is dropped uncalled.
    #[instrument(skip_all, fields(batch = %self.config.label, registered = self.operations.len()))]
    pub fn run<F>(self, final_handler: F) -> Result<Progress>
    where
        F: FnOnce(Option<Vec<OperationError>>) + Send + 'static,
    {
        let Batch { config, operations } = self;
        let metrics = ChainMetrics::new(config.label.clone(), config.record_metrics);

        let handle = if operations.is_empty() {
            None
        } else {
            Some(Handle::try_current().map_err(|_| ChainError::NoRuntime)?)
        };

        let dispatches = resolve(&config.label, &metrics, operations);
        let total = dispatches.len();

        let shared = Arc::new(Shared {
            label: config.label.clone(),
            metrics,
            state: Mutex::new(BatchState {
                total,
                finished: 0,
                errors: Vec::new(),
                running: false,
                terminated: false,
                final_handler: None,
                started: Instant::now(),
            }),
        });

        if total == 0 {
            shared.state.lock().terminated = true;
            shared.metrics.batch_finished(false, 0.0, false);
            info!(batch = %config.label, "Nothing to dispatch, batch complete");
            final_handler(None);
            return Ok(Progress { shared });
        }

        let Some(handle) = handle else {
            return Err(ChainError::NoRuntime);
        };

        {
            let mut state = shared.state.lock();
            state.final_handler = Some(Box::new(final_handler));
            state.running = true;
            state.started = Instant::now();
        }
        shared.metrics.batch_started();

        info!(
            batch = %config.label,
            total = total,
            dispatch = ?config.dispatch,
            "Dispatching batch"
        );

        match config.dispatch {
            DispatchMode::Spawn => {
                for dispatch in dispatches {
                    let shared = Arc::clone(&shared);
                    handle.spawn(
                        async move {
                            let outcome = drive(&dispatch.member, dispatch.invocation).await;
                            shared.complete(&dispatch.member, dispatch.on_complete, outcome);
                        }
                        .instrument(Span::current()),
                    );
                }
            }
            DispatchMode::Cooperative => {
                let mut pending: FuturesUnordered<_> = dispatches
                    .into_iter()
                    .map(|dispatch| {
                        let shared = Arc::clone(&shared);
                        async move {
                            let outcome = drive(&dispatch.member, dispatch.invocation).await;
                            shared.complete(&dispatch.member, dispatch.on_complete, outcome);
                        }
                    })
                    .collect();
                handle.spawn(
                    async move { while pending.next().await.is_some() {} }
                        .instrument(Span::current()),
                );
            }
        }

        Ok(Progress { shared })
    }

    /// Run the batch and wait for the aggregated outcome
    pub async fn finish(self) -> Result<Option<Vec<OperationError>>> {
        let (tx, rx) = oneshot::channel();
        self.run(move |errors| {
            let _ = tx.send(errors);
        })?;
        rx.await.map_err(|_| ChainError::Interrupted)
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<String> = self
            .operations
            .iter()
            .map(|op| format!("{}.{}", op.target.name(), op.member))
            .collect();
        f.debug_struct("Batch")
            .field("config", &self.config)
            .field("operations", &members)
            .finish()
    }
}

/// Bind every operation, dropping the ones that fault
fn resolve(label: &str, metrics: &ChainMetrics, operations: Vec<PendingOperation>) -> Vec<Dispatch> {
    operations
        .into_iter()
        .filter_map(|op| {
            let bound = panic::catch_unwind(AssertUnwindSafe(|| {
                op.target
                    .resolve(&op.member)
                    .and_then(|member| member.invoke(op.argument))
            }))
            .unwrap_or_else(|payload| {
                Err(SetupFault::MalformedTarget(panic_message(payload.as_ref())))
            });
            match bound {
                Ok(invocation) => Some(Dispatch {
                    member: op.member,
                    invocation,
                    on_complete: op.on_complete,
                }),
                Err(fault) => {
                    warn!(
                        batch = %label,
                        target = %op.target.name(),
                        member = %op.member,
                        error = %fault,
                        "Setup fault, operation dropped from batch"
                    );
                    metrics.operation(Outcome::SetupFault);
                    None
                }
            }
        })
        .collect()
}

/// Await an invocation, turning a panic into an operation error
async fn drive(member: &str, invocation: Invocation) -> OperationResult {
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(member = %member, panic = %message, "Operation panicked");
            Err(OperationError::Panicked {
                member: member.to_string(),
                message,
            }
            .into())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
