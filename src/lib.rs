//! # Propel
//!
//! `propel` is a push-notification relay. Clients hold a long-lived
//! WebSocket connection; backend producers publish events to clients,
//! devices or topics; the relay fans them out through a pluggable broker
//! (NATS, Redis or in-process) and tracks which devices are online.
//!
//! ## Core Modules
//!
//! - `broker`: adapter contract and the NATS, Redis and in-memory backends.
//! - `pubsub`: facade over the selected broker plus the subscription registry.
//! - `persistence`: device presence store and its backends.
//! - `push`: business operations, event model, device validation protocol.
//! - `session`: per-connection state machine.
//! - `transport`: connection boundary, wire messages, WebSocket server.
//! - `config`: layered configuration loading.
//! - `utils`: error taxonomy and logging setup.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod pubsub;
pub mod push;
pub mod session;
pub mod transport;
pub mod utils;
