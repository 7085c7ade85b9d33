//! hostlink library
//!
//! Relays named tool operations from clients to a host application: tool
//! registry and validation, pooled correlated transport, a cross-process
//! bridge to the host executor, and a dependency-aware batch scheduler.

pub mod batch;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod tool;
pub mod transport;

pub use error::{HostlinkError, Result};
