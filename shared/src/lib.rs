//! Tunnelgate Shared Library
//!
//! Common types, protocols, and errors for the gateway and the relay.

pub mod protocol;
pub mod endpoint;
pub mod error;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
