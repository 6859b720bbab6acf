use thiserror::Error;

/// Errors surfaced by the bridge to native callers.
///
/// `Clone` because a single global failure (load failure, destroy) is fanned
/// out to every pending call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("JS runtime failed to load: {0}")]
    TransportLoad(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("bridge has been destroyed")]
    Destroyed,

    #[error("event handler failed: {0}")]
    Handler(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("JS error in {method}: {message}")]
    Js { method: String, message: String },

    #[error("bridge not ready: {0}")]
    NotReady(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("already initialized with a different configuration")]
    AlreadyInitialized,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Whether this error came from `destroy()` rather than the call itself.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, BridgeError::Destroyed)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}
