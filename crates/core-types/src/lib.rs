//! Value types shared by the grant engine, its base policy and its callers.

pub mod capability;
pub mod context;
pub mod identity;
pub mod reclaim;

pub use capability::{pattern_matches, Capability, CapabilitySet};
pub use context::{ContextId, ExecutionContext};
pub use identity::{IdentitySet, OriginKey, Principal};
pub use reclaim::{ReclaimNotifier, Reclaimable};

use thiserror::Error;

/// Error taxonomy surfaced by every grant engine operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GrantError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("security: {0}")]
    Security(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("base policy failure: {0}")]
    BasePolicy(String),
}

impl GrantError {
    /// Hard denials as seen from a permission check call site.
    pub fn is_denial(&self) -> bool {
        matches!(self, GrantError::Security(_) | GrantError::Unsupported(_))
    }
}
