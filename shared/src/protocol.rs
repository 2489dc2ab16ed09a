//! Wire types for Tunnelgate communication.
//!
//! Two channels carry these: the control channel between the controlling
//! context and the worker, and the WebSocket tunnel between the worker and
//! the relay.

use serde::{Deserialize, Serialize};

/// Maximum tunnel frame size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Headers that describe a single hop and never cross the tunnel.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Case-insensitive membership in [`HOP_BY_HOP_HEADERS`].
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Message sent from the controlling context to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Bind the worker to a tunnel endpoint
    Config { wispurl: String },
}

/// Credentials policy carried by a tunneled request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    Omit,
    SameOrigin,
    Include,
}

/// Request mode carried by a tunneled request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Cors,
    NoCors,
    SameOrigin,
    Navigate,
}

impl RequestMode {
    /// Parse a `Sec-Fetch-Mode` style token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "cors" => Some(Self::Cors),
            "no-cors" => Some(Self::NoCors),
            "same-origin" => Some(Self::SameOrigin),
            "navigate" => Some(Self::Navigate),
            _ => None,
        }
    }
}

/// Redirect policy carried by a tunneled request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Redirect {
    Follow,
    Manual,
    Error,
}

/// Request frame sent over the tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub credentials: Credentials,
    pub mode: RequestMode,
    pub cache: Option<String>,
    pub redirect: Redirect,
}

/// Response frame returned over the tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl TunnelResponse {
    /// Synthetic error frame for a request the relay could not complete.
    pub fn error(id: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let status_text = match status {
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            504 => "Gateway Timeout",
            _ => "Error",
        };
        Self {
            id: id.into(),
            status,
            status_text: status_text.into(),
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: Some(reason.into_bytes()),
        }
    }
}
