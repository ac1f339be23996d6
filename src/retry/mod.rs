//! Failure classification and the bounded retry loop.

pub mod classifier;
pub mod executor;
pub mod policy;

pub use classifier::{ErrorClass, classify, classify_message};
pub use executor::{RetryExecutor, RetryMode, RetryOutcome};
pub use policy::RetryPolicy;
