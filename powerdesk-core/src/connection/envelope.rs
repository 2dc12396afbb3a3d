//! JSON message envelope shared by every channel

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncResult;

/// Intentional close, never reconnected
pub const CLOSE_NORMAL: u16 = 1000;
/// Transport dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Credential rejected by the server, terminal until the caller reconnects
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Raised locally when no pong arrives within the configured timeout
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4008;

pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_SUBSCRIBE: &str = "subscribe";
pub const TYPE_UNSUBSCRIBE: &str = "unsubscribe";

/// `{ "type", "channel"?, "data"?, "timestamp"?, ...extra }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            channel: None,
            data: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set `timestamp` to the current UTC time in RFC 3339
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(chrono::Utc::now().to_rfc3339());
        self
    }

    pub fn ping() -> Self {
        Self::new(TYPE_PING)
    }

    pub fn pong() -> Self {
        Self::new(TYPE_PONG)
    }

    /// Join channels. Wire shape:
    /// `{"type":"subscribe","data":{"channels":["prices:de","orders"]}}`
    pub fn subscribe<S: AsRef<str>>(channels: &[S]) -> Self {
        Self::new(TYPE_SUBSCRIBE).with_data(channel_list(channels))
    }

    /// Leave channels, same shape as [`Envelope::subscribe`] with
    /// `"type":"unsubscribe"`
    pub fn unsubscribe<S: AsRef<str>>(channels: &[S]) -> Self {
        Self::new(TYPE_UNSUBSCRIBE).with_data(channel_list(channels))
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == TYPE_PING || self.kind == TYPE_PONG
    }

    pub fn is_pong(&self) -> bool {
        self.kind == TYPE_PONG
    }

    /// Decode the payload into a typed structure
    pub fn data_as<T: DeserializeOwned>(&self) -> SyncResult<T> {
        let data = self.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(data)?)
    }

    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn channel_list<S: AsRef<str>>(channels: &[S]) -> Value {
    let channels: Vec<Value> = channels
        .iter()
        .map(|c| Value::String(c.as_ref().to_string()))
        .collect();
    serde_json::json!({ "channels": channels })
}
