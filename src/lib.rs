//! Manifold MCP Library
//!
//! Transport, session, and middleware runtime for Model Context
//! Protocol servers. This library can be embedded in other
//! applications; the binary wires it to a CLI.

pub mod browser;
pub mod commands;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod events;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use server::McpServer;
pub use transport::Transport;
