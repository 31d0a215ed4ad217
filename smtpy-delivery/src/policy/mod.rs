//! Delivery policies shared by the direct and relay paths.

pub mod retry;

pub use retry::RetryPolicy;
