//! The `session` module runs the per-connection state machine:
//! `Connecting -> Active -> Terminated`.
//!
//! While active, one event loop multiplexes the connection's cancellation,
//! the subscription's error and event queues, and client requests read by a
//! separate receive task. Only transport cancellation ends a session.

pub mod handler;
pub mod identity;

pub use handler::{Session, SessionState};
pub use identity::Identity;

#[cfg(test)]
mod tests;
