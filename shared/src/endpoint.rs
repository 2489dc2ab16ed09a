//! Tunnel endpoint validation.

use std::fmt;

use url::Url;

use crate::{Error, Result};

/// A validated tunnel server URL (`ws://` or `wss://`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(Url);

impl Endpoint {
    /// Parse and validate a raw endpoint string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Configuration("tunnel endpoint is empty".into()));
        }

        let url = Url::parse(raw)
            .map_err(|e| Error::Configuration(format!("invalid tunnel endpoint '{}': {}", raw, e)))?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::Configuration(format!(
                    "tunnel endpoint must start with ws:// or wss:// (got '{}://')",
                    other
                )))
            }
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::Configuration(format!("tunnel endpoint '{}' has no host", raw)));
        }

        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}
