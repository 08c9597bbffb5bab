//! # modelchain
//!
//! Chaining for a data-mapper ORM: register a batch of heterogeneous
//! asynchronous calls against model classes, fire them all at once, and get
//! one aggregated outcome when every call has finished.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use modelchain::chain::{Batch, Operation};
//! use modelchain::model::{MemoryAdapter, ModelClass};
//! use serde_json::json;
//!
//! # async fn example() -> modelchain::Result<()> {
//! let adapter = Arc::new(MemoryAdapter::new());
//! let users = ModelClass::new("User", adapter.clone()).into_capability();
//! let posts = ModelClass::new("Post", adapter).into_capability();
//!
//! let mut batch = Batch::new();
//! batch
//!     .call_with(users.clone(), "create", json!({"name": "Ada"}))
//!     .call_with(posts, "create", json!({"title": "Notes"}))
//!     .register(Operation::call(users, "find").argument(json!("missing")));
//!
//! // One NotFound error; the two creates succeeded
//! let errors = batch.finish().await?;
//! assert_eq!(errors.map(|e| e.len()), Some(1));
//! # Ok(())
//! # }
//! ```
//!
//! ## Semantics
//!
//! - Operation failures never abort the batch; they are collected in
//!   completion order and reported once.
//! - Operations that cannot be bound (unknown member, wrong argument shape)
//!   are dropped before dispatch and are not counted.
//! - The final handler fires exactly once, synchronously when there is
//!   nothing to dispatch.
//!
//! ## Modules
//!
//! - [`chain`]: batch orchestration, capabilities, operation types
//! - [`model`]: storage adapter interface and model-class capability
//! - [`telemetry`]: tracing subscriber setup

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for modelchain operations
pub type Result<T> = std::result::Result<T, ChainError>;

/// Main error type for modelchain
#[derive(Error, Debug)]
pub enum ChainError {
    /// An operation was registered without a target or member
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// A non-empty batch was run outside a Tokio runtime
    #[error("No Tokio runtime available to dispatch the batch")]
    NoRuntime,

    /// The batch was torn down before its final handler fired
    #[error("Batch was interrupted before completing")]
    Interrupted,

    /// Binding an operation to its target failed
    #[error("Setup fault: {0}")]
    Setup(#[from] chain::SetupFault),
}

/// Batch orchestration module
pub mod chain;

/// Model collaborators module
pub mod model;

/// Logging setup
pub mod telemetry;
