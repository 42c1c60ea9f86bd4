//! Core data model shared by the relay hub, the viewer sync engine and the
//! persistence layer.
//!
//! Field names follow the JSON wire contract used by the on-device
//! interceptors and the viewer, so everything serializes camelCase.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time as epoch milliseconds, the timestamp unit used everywhere
/// on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Platform reported by a device-side interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Ios,
    Android,
}

/// One captured network call. Envelopes are immutable once emitted by a
/// device; the relay and the viewer never rewrite their contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEnvelope {
    pub method: String,
    pub url: String,
    /// Request duration in milliseconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Value>,
    /// Capture time as epoch milliseconds, assigned on the device.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_platform: Option<DevicePlatform>,
}

impl LogEnvelope {
    /// Identity used for de-duplication across reconnects and replays.
    pub fn dedup_key(&self) -> LogKey {
        LogKey {
            timestamp: self.timestamp,
            url: self.url.clone(),
            method: self.method.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

/// De-duplication identity of a [`LogEnvelope`]. Two envelopes with the same
/// key are the same capture, whatever path they took to reach us.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub timestamp: i64,
    pub url: String,
    pub method: String,
    pub device_id: Option<String>,
}

/// A device known to the registry and its current connectivity status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DevicePlatform>,
    pub connected: bool,
    /// Epoch milliseconds of the most recent sighting.
    pub last_seen: i64,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            platform: None,
            connected: true,
            last_seen: now_millis(),
        }
    }
}
