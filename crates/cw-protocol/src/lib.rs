// cw-protocol: Upstream chat-service wire types and serialization.
//
// Stream frames use a top-level `type` field for discriminated
// deserialization. Only the kinds the watcher acts on are modelled; every
// other kind decodes to `StreamFrame::Other` and is ignored.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stream frames (server -> client)
// ---------------------------------------------------------------------------

/// A chat line delivered live on the stream or inside a backlog batch.
///
/// Every field defaults when absent: the upstream omits fields freely and a
/// partial frame must still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMessage {
    /// Channel (or query partner) the line was posted to, e.g. `#rust`.
    #[serde(rename = "chan", default)]
    pub channel: String,
    /// Nickname of the sender.
    #[serde(rename = "from", default)]
    pub sender: String,
    /// Raw body; may contain IRC colour and formatting control codes.
    #[serde(rename = "msg", default)]
    pub body: String,
    /// Microseconds since the Unix epoch. Zero on most live lines.
    #[serde(rename = "time", default)]
    pub server_time: i64,
    /// Server-assigned event id, unique and increasing per account.
    #[serde(default)]
    pub eid: i64,
    /// Originating buffer id.
    #[serde(default)]
    pub bid: i64,
}

/// Gap-fill signal: the client must fetch `url` to catch up on history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobInclude {
    /// Usually a path relative to the account's API host.
    pub url: String,
}

/// All stream frame kinds the watcher distinguishes.
///
/// ```json
/// { "type": "buffer_msg", "chan": "#rust", "from": "ferris", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    #[serde(rename = "buffer_msg")]
    BufferMsg(BufferMessage),
    #[serde(rename = "oob_include")]
    OobInclude(OobInclude),
    /// Control and informational frames (`header`, `stat_user`, `idle`, ...).
    #[serde(other)]
    Other,
}

impl StreamFrame {
    /// Decode a single text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Decode a backlog batch (a JSON array of frames).
pub fn decode_backlog(bytes: &[u8]) -> Result<Vec<StreamFrame>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

/// Application-level liveness message.
///
/// Serializes to `{"_method":"heartbeat","_reqid":<unix_seconds>,"last_seen_eid":<int>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "_method")]
    pub method: String,
    #[serde(rename = "_reqid")]
    pub reqid: i64,
    pub last_seen_eid: i64,
}

impl HeartbeatRequest {
    pub fn new(reqid: i64, last_seen_eid: i64) -> Self {
        Self {
            method: "heartbeat".to_owned(),
            reqid,
            last_seen_eid,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP authentication responses
// ---------------------------------------------------------------------------

/// Response of the anti-forgery token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub success: bool,
    #[serde(default)]
    pub token: String,
}

/// Response of the login endpoint.
///
/// On failure only `success` and `message` are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub uid: i64,
    /// Base URL including scheme, e.g. `https://api-2.irccloud.com`.
    #[serde(default)]
    pub api_host: String,
    /// Host only, e.g. `api-2.irccloud.com`.
    #[serde(default)]
    pub websocket_host: String,
    /// Path only, e.g. `/websocket/2`.
    #[serde(default)]
    pub websocket_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Generic failure body returned by the HTTP API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}
