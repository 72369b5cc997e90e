pub mod retry;

pub use retry::{RetryError, RetryPolicy};
