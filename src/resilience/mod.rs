//! Retry and timeout wrappers for backend calls.

pub mod retry;
pub mod timeout;
