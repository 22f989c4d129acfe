//! Error types and result definitions for the xiaomi-gateway crate.
//! Covers wire-level decoding, the write-key primitive, and socket setup.

use thiserror::Error;

/// Represents all possible errors raised by the gateway protocol engine.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Standard IO error (send, receive, socket options)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// The datagram or its `data` payload could not be interpreted
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The gateway sent a `cmd` this engine does not know
    #[error("Unknown gateway command '{0}'")]
    UnknownCommand(String),

    /// An item is bound to an event name this engine does not know
    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    /// The host item registry has no item with this name
    #[error("Item '{0}' not found")]
    ItemNotFound(String),

    /// A wire value could not be converted into a typed value
    #[error("Decode error: {0}")]
    Decode(String),

    /// The write key could not be derived from the session token
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Binding the UDP socket or joining the multicast group failed
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    /// A unicast request was attempted before the gateway answered `whois`
    #[error("Gateway not discovered yet")]
    NotDiscovered,

    /// An item type string is not of the form `sid.[channel.]event`
    #[error("Invalid item binding '{0}'")]
    InvalidBinding(String),

    /// A configuration property holds an unusable value
    #[error("Invalid configuration value for '{0}': {1}")]
    Config(String, String),

    /// The engine has not been started or was stopped
    #[error("Engine is not running")]
    NotRunning,
}

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Json(err.to_string())
    }
}

impl GatewayError {
    /// Whether this error only affects a single datagram or fan-out step.
    ///
    /// The receive loop logs these and keeps going.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            GatewayError::SetupFailed(_) | GatewayError::NotRunning
        )
    }
}
