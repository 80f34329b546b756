use thiserror::Error;

use crate::rule::RuleParseError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Parse(#[from] RuleParseError),

    #[error("no such rule registered")]
    NotFound,

    #[error("failed to persist proxy rules: {0}")]
    Persistence(String),
}
