use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::{PushError, Result};

/// Event name reserved for the device liveness ping.
pub const DEVICE_VALIDATION: &str = "DEVICE_VALIDATION";

/// Channel addressing one device of a client.
pub fn device_channel(client_id: &str, device_id: &str) -> String {
    format!("{client_id}--{device_id}")
}

/// Topic a device answers validation pings on.
pub fn response_topic(client_id: &str, device_id: &str) -> String {
    format!("{client_id}#{device_id}#resp")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatType {
    #[default]
    Json,
    Proto,
}

/// Application event carried through the broker as JSON bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub format_type: FormatType,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            format_type: FormatType::Json,
            data,
        }
    }

    /// Liveness ping for `device_id`; the payload is the device id itself.
    pub fn device_validation(device_id: &str) -> Self {
        Self::new(DEVICE_VALIDATION, Value::String(device_id.to_string()))
    }

    pub fn is_device_validation(&self) -> bool {
        self.name == DEVICE_VALIDATION
    }

    /// Null and the empty string count as no payload.
    pub fn has_payload(&self) -> bool {
        match &self.data {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Rejects events with no name or no payload.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PushError::invalid_argument("event name is required"));
        }
        if !self.has_payload() {
            return Err(PushError::invalid_argument("event payload is required"));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// A device of a client as recorded in the presence store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// One item of a bulk topic publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicPublish {
    pub topic: String,
    pub event: Event,
}

impl TopicPublish {
    pub fn new(topic: impl Into<String>, event: Event) -> Self {
        Self {
            topic: topic.into(),
            event,
        }
    }
}

/// Result of a device validation query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientActiveDevices {
    pub devices: Vec<Device>,
    pub is_client_online: bool,
}

pub(crate) fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PushError::invalid_argument(format!("{what} is required")));
    }
    Ok(())
}
