use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::identity::{IdentitySet, OriginKey};
use crate::reclaim::{ReclaimNotifier, Reclaimable};

#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of security identity: code from one origin acting for a set of principals.
///
/// Callers own contexts through `Arc`. The grant engine never keeps one alive; when the
/// last `Arc` goes, the engine's domain cache is told through the reclaim notifier.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
    origin: OriginKey,
    identities: IdentitySet,
    notifier: ReclaimNotifier,
}

impl ExecutionContext {
    pub fn new(origin: OriginKey, identities: IdentitySet) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::new(),
            origin,
            identities,
            notifier: ReclaimNotifier::new(),
        })
    }

    /// Context for code without an identifiable origin and without principals.
    pub fn system() -> Arc<Self> {
        Self::new(OriginKey::System, IdentitySet::empty())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn origin(&self) -> &OriginKey {
        &self.origin
    }

    pub fn identities(&self) -> &IdentitySet {
        &self.identities
    }
}

impl Reclaimable for ExecutionContext {
    fn reclaim_notifier(&self) -> &ReclaimNotifier {
        &self.notifier
    }
}
