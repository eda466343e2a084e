use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dyngrant_core_types::{CapabilitySet, IdentitySet, OriginKey};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::PolicyError;
use crate::model::PolicyRules;

/// Source of the statically configured capabilities the grant engine layers grants on.
///
/// Implementations may be slow or re-enter the engine; the engine never calls them while
/// holding its own locks.
pub trait BasePolicy: Send + Sync {
    fn static_capabilities(
        &self,
        origin: &OriginKey,
        identities: &IdentitySet,
    ) -> Result<CapabilitySet, PolicyError>;

    fn refresh(&self) -> Result<(), PolicyError>;

    /// Whether answers may change without `refresh`. Queried once when the policy is
    /// attached to pick the engine's caching strategy.
    fn is_dynamic(&self) -> bool {
        false
    }
}

/// In-memory rule set published through an `ArcSwap`.
///
/// A static policy only changes on `refresh`, which publishes rules queued with
/// `stage`. A dynamic one publishes staged rules immediately.
pub struct StaticPolicy {
    rules: ArcSwap<PolicyRules>,
    staged: Mutex<Option<PolicyRules>>,
    dynamic: bool,
    revision: AtomicU64,
}

impl StaticPolicy {
    pub fn new(rules: PolicyRules) -> Result<Self, PolicyError> {
        Self::build(rules, false)
    }

    pub fn dynamic(rules: PolicyRules) -> Result<Self, PolicyError> {
        Self::build(rules, true)
    }

    /// Policy that assigns nothing to anyone.
    pub fn empty() -> Self {
        Self {
            rules: ArcSwap::from_pointee(PolicyRules::default()),
            staged: Mutex::new(None),
            dynamic: false,
            revision: AtomicU64::new(1),
        }
    }

    fn build(rules: PolicyRules, dynamic: bool) -> Result<Self, PolicyError> {
        rules.validate()?;
        Ok(Self {
            rules: ArcSwap::from_pointee(rules),
            staged: Mutex::new(None),
            dynamic,
            revision: AtomicU64::new(1),
        })
    }

    pub fn stage(&self, rules: PolicyRules) -> Result<(), PolicyError> {
        rules.validate()?;
        if self.dynamic {
            self.publish(rules);
        } else {
            *self.staged.lock() = Some(rules);
            debug!(target: "policy-center", "staged replacement rules");
        }
        Ok(())
    }

    pub fn rules(&self) -> Arc<PolicyRules> {
        self.rules.load_full()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn publish(&self, rules: PolicyRules) {
        self.rules.store(Arc::new(rules));
        let rev = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        info!(target: "policy-center", rev, "published base policy rules");
    }
}

impl BasePolicy for StaticPolicy {
    fn static_capabilities(
        &self,
        origin: &OriginKey,
        identities: &IdentitySet,
    ) -> Result<CapabilitySet, PolicyError> {
        Ok(self.rules.load().resolve(origin, identities))
    }

    fn refresh(&self) -> Result<(), PolicyError> {
        let staged = self.staged.lock().take();
        if let Some(rules) = staged {
            self.publish(rules);
        }
        Ok(())
    }

    fn is_dynamic(&self) -> bool {
        self.dynamic
    }
}
