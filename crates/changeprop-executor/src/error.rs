use changeprop_core::http::HttpError;
use thiserror::Error;

/// Why executing a rule on an event failed.
#[derive(Error, Debug)]
pub enum ExecError {
    /// A downstream request answered with a failure status or never answered.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Anything else: template expansion, malformed input, bugs.
    #[error("internal error: {0}")]
    Internal(#[from] changeprop_core::error::Error),
}

impl ExecError {
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            ExecError::Http(e) => Some(e),
            ExecError::Internal(_) => None,
        }
    }
}
