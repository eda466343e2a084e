use dyngrant_core_types::GrantError;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("base policy unavailable: {0}")]
    Unavailable(String),
    #[error("invalid policy: {0}")]
    Invalid(String),
}

impl From<PolicyError> for GrantError {
    fn from(value: PolicyError) -> Self {
        GrantError::BasePolicy(value.to_string())
    }
}
