use std::collections::HashMap;

use crate::config::PushSettings;
use crate::push::Device;
use crate::utils::{PushError, Result};

/// Who is on the other end of a connection, taken from transport metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub device: Option<Device>,
}

impl Identity {
    /// Reads the client header and, with device support on, the device
    /// header plus any configured attribute headers.
    ///
    /// `metadata` keys are expected lower-cased.
    pub fn from_metadata(metadata: &HashMap<String, String>, settings: &PushSettings) -> Result<Self> {
        let client_id = header(metadata, &settings.client_header).ok_or_else(|| {
            PushError::invalid_argument(format!("{} header is required", settings.client_header))
        })?;

        if !settings.enable_device_support {
            return Ok(Self {
                client_id,
                device: None,
            });
        }

        let device_id = header(metadata, &settings.device_header).ok_or_else(|| {
            PushError::invalid_argument(format!("{} header is required", settings.device_header))
        })?;
        let mut device = Device::new(device_id);
        for name in &settings.device_attribute_headers {
            if let Some(value) = header(metadata, name) {
                device.attributes.insert(name.to_ascii_lowercase(), value);
            }
        }

        Ok(Self {
            client_id,
            device: Some(device),
        })
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device.as_ref().map(|device| device.id.as_str())
    }
}

fn header(metadata: &HashMap<String, String>, name: &str) -> Option<String> {
    metadata
        .get(&name.to_ascii_lowercase())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
