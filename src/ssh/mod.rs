//! SSH module - handles SSH connections and sessions
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Password and in-memory private key authentication
//! - Optional pinned host key fingerprint
//! - Single-owner Handle task driven by `HandleController`
//! - `RemoteSession` / `SessionConnector` seams used by the connection pool

mod client;
mod config;
mod error;
mod handle_owner;
mod session;

pub use client::{fingerprint, ClientHandler, RusshConnector, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use session::{
    wait_closed, AsyncStream, ExecOutput, ForwardStream, RemoteSession, RusshSession,
    SessionConnector,
};
