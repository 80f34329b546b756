use thiserror::Error;

/// Every handler error is reported back to the RPC caller, never fatal to the process (spec §9
/// Open Question: the original sometimes treated a malformed RPC argument as process-fatal; this
/// implementation follows the specification's resolution instead).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("missing required argument")]
    MissingArgument,

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Proxy(#[from] nexd_proxy::ProxyError),

    #[error("tunnel address not available: {0}")]
    NotAvailable(&'static str),
}
