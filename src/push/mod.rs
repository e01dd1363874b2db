//! The `push` module holds the relay's business operations: publishing to
//! clients, devices and topics, client subscription lifecycle, and the
//! device validation protocol that reconciles the presence store against
//! live sessions.
//!
//! ## Device validation
//!
//! `get_client_active_devices` pings every device recorded for a client on
//! its device channel. A live session answers by echoing the ping to the
//! device's response topic. Devices that stay silent past the validation
//! timeout are evicted from the presence store. Slow devices may be evicted
//! too; the call never waits longer than the timeout.

pub mod metrics;
pub mod model;
pub mod service;

pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use model::{
    ClientActiveDevices, DEVICE_VALIDATION, Device, Event, FormatType, TopicPublish,
    device_channel, response_topic,
};
pub use service::{ClientSubscription, PushService};
