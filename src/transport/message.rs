use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::push::Event;
use crate::utils::{PushError, Result};

/// Messages a connected client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelRequest {
    TopicSubscribe { topic: String },
    TopicUnsubscribe { topic: String },
}

/// Outcome attached to every acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_code: None,
            message: None,
        }
    }

    pub fn from_error(err: &PushError) -> Self {
        Self {
            success: false,
            error_code: Some(err.code().as_wire().to_string()),
            message: Some(err.message().to_string()),
        }
    }

    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::from_error(err),
        }
    }
}

/// Messages the server sends to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelResponse {
    ConnectAck {
        status: ResponseStatus,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        connected_at: DateTime<Utc>,
    },
    ChannelEvent {
        topic: String,
        event: Event,
    },
    TopicSubscribeAck {
        topic: String,
        status: ResponseStatus,
    },
    TopicUnsubscribeAck {
        topic: String,
        status: ResponseStatus,
    },
    Error {
        status: ResponseStatus,
    },
}

impl ChannelResponse {
    pub fn error(err: &PushError) -> Self {
        ChannelResponse::Error {
            status: ResponseStatus::from_error(err),
        }
    }
}
