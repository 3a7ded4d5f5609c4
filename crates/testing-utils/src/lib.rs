//! # Batchpool Testing Utils
//!
//! Shared testing utilities for the cluster execution controller.
//!
//! - **Mock Scheduler**: in-memory [`BatchScheduler`](batchpool_domain::BatchScheduler)
//!   that records submissions and cancellations and lets tests drive job states
//! - **Mock Executor**: scripted [`TaskExecutor`](batchpool_domain::TaskExecutor)
//! - **Test Data Builders**: tasks and pool configurations with sensible defaults
//! - **Helpers**: waiting on asynchronous conditions and test logging
//!
//! ```toml
//! [dev-dependencies]
//! batchpool-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
