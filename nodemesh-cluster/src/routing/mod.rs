//! Request routing: execution, usage accounting and connection binding

pub mod connection_manager;
pub mod executor;
pub mod usage;

pub use connection_manager::{ConnectionManager, Connector};
pub use executor::{ExecuteOptions, RequestExecutor};
pub use usage::{UsageStats, UsageTracker};
