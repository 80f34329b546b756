use thiserror::Error;

/// Bad flag combinations, unparseable CIDRs, and other mistakes a human made.
///
/// Fatal at startup, reported back to the RPC caller at runtime; never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CIDR `{0}`")]
    InvalidCidr(String),

    #[error("{flag} cannot be combined with proxy mode")]
    IncompatibleWithProxy { flag: &'static str },

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
}

/// Controller RPC boundary. Authentication failures drive the reconciler into `WaitingForAuth`;
/// everything else is a transient-network condition the caller retries with backoff.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller rejected credentials")]
    Unauthorized,

    #[error("controller request failed: {0}")]
    Transport(String),

    #[error("controller returned malformed response: {0}")]
    Decode(String),
}

impl ControllerError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, ControllerError::Unauthorized)
    }
}
