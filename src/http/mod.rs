//! HTTP transport surface: session-scoped SSE streams and the message endpoint

pub mod handlers;
pub mod hub;
