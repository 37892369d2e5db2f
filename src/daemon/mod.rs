//! Process-level concerns: signal handling for graceful shutdown.

pub mod signals;
