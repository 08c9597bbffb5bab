//! Multi-operation chaining: fan out calls against model capabilities, wait
//! for all of them, and report one aggregated outcome.

pub mod batch;
pub mod capability;
pub mod config;
pub mod metrics;
pub mod operation;

pub use batch::*;
pub use capability::*;
pub use config::*;
pub use operation::*;
