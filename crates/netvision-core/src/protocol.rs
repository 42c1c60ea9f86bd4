//! Wire protocol shared by the relay hub, device interceptors and viewers.
//!
//! Every relay frame is a JSON object tagged by `type`:
//!
//! - `network-log` - a captured call, fields inline beside the tag
//! - `device-connected` / `device-disconnected` - explicit attach notices
//! - `devices-list` - full registry snapshot, also the reply to `get-devices`
//! - `get-devices` - bulk sync request from a viewer
//! - `vite-ready` - viewer announcing its dev host is up
//! - `hello` - hub greeting sent once per connection
//!
//! The hub decodes frames only for bookkeeping; what it fans out to peers is
//! always the original text, byte for byte.

use serde::{Deserialize, Serialize};

use crate::types::{DevicePlatform, DeviceRecord, LogEnvelope};

/// Prefix of every UDP discovery datagram.
pub const DISCOVERY_PREFIX: &str = "NETVISION_DISCOVERY:";

/// Control-plane readiness endpoint and the exact body a healthy supervisor
/// answers with. The trigger matches on the body, not just the status.
pub const READY_CHECK_PATH: &str = "/ready-check";
pub const READY_BODY: &str = "debugger-ready";
/// Control-plane shutdown endpoint and its acknowledgement body.
pub const SHUTDOWN_PATH: &str = "/shutdown";
pub const SHUTDOWN_BODY: &str = "Shutting down...";

/// Build the discovery payload advertising the relay WebSocket port.
pub fn discovery_payload(ws_port: u16) -> String {
    format!("{DISCOVERY_PREFIX}{ws_port}")
}

/// Parse a discovery payload back into the advertised port. Returns `None`
/// for anything that is not a well-formed discovery datagram.
pub fn parse_discovery_payload(payload: &str) -> Option<u16> {
    payload.strip_prefix(DISCOVERY_PREFIX)?.trim().parse().ok()
}

/// Messages carried over the relay WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// A captured network call forwarded from a device.
    #[serde(rename = "network-log")]
    NetworkLog(LogEnvelope),
    /// A device announcing itself.
    #[serde(rename = "device-connected", rename_all = "camelCase")]
    DeviceConnected {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_platform: Option<DevicePlatform>,
    },
    /// A device announcing it is going away.
    #[serde(rename = "device-disconnected", rename_all = "camelCase")]
    DeviceDisconnected { device_id: String },
    /// Registry snapshot, sent by the hub and merged additively by viewers.
    #[serde(rename = "devices-list")]
    DevicesList { devices: Vec<DeviceRecord> },
    /// Viewer asking the hub for the current registry snapshot.
    #[serde(rename = "get-devices")]
    GetDevices,
    /// Viewer announcing its dev host finished booting.
    #[serde(rename = "vite-ready")]
    ViteReady,
    /// Hub greeting, sent once right after the handshake.
    #[serde(rename = "hello")]
    Hello { message: String },
}

impl WireMessage {
    /// Decode one text frame. Malformed JSON and unknown `type` tags both
    /// surface as errors; callers log and drop the frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
