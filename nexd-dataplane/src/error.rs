use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("failed to create tunnel interface: {0}")]
    InterfaceCreate(String),

    #[error("failed to program peer {public_key}: {reason}")]
    PeerProgram { public_key: String, reason: String },

    #[error("kernel configuration socket error: {0}")]
    UapiSocket(String),

    #[error("data plane is not initialised")]
    NotInitialised,
}
