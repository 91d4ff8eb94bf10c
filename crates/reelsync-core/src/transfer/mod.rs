//! Bounded, retrying downloads from a remote source into the staging directory.
//!
//! - `RetryPolicy` / `retry_async`: explicit backoff policy, one per call
//! - `TransferPool`: semaphore-bounded workers with reusable connections

mod pool;
mod retry;

pub use pool::{LocalFile, TransferPool};
pub use retry::{retry_async, RetryPolicy, RetryStats};
