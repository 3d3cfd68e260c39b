//! Port Forwarding Module
//!
//! Local port forwarding over a `RemoteSession`, used to expose a remote
//! relay as a loopback TCP endpoint.

mod local;

pub use local::{
    start_local_forward, start_local_forward_with_activity, ActivityHook, ForwardStats,
    LocalForward, LocalForwardHandle,
};
