mod authority;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod registry;
pub mod scope;

pub use crate::authority::{AccessContext, GrantAuthorizer, SelfAuthorizer};
pub use crate::config::{load_config, CacheMode, ConfigError, EngineConfig};
pub use crate::domain::{DomainCache, DomainHandle};
pub use crate::registry::WeakRegistry;
pub use crate::scope::{GrantRecord, GrantScopeIndex};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dyngrant_core_types::{
    Capability, CapabilitySet, ExecutionContext, GrantError, IdentitySet, OriginKey,
};
use dyngrant_policy_center::BasePolicy;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::scope::validate_grant;

/// How base policy output is kept, chosen once when the base policy is attached.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CachingStrategy {
    /// Computed once per handle and reused until `refresh`.
    Eager,
    /// Asked of the base policy on every check.
    Lazy,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrantOutcome {
    Accepted,
    /// The caller lacked grant authority.
    Denied,
    /// The request was malformed or unsupported.
    Rejected,
}

/// Event emitted for every grant attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrantEvent {
    pub origin: Option<OriginKey>,
    pub identities: IdentitySet,
    pub capabilities: Vec<Capability>,
    /// Tokens that were not already implied by earlier grants.
    pub added: usize,
    pub outcome: GrantOutcome,
    pub detail: Option<String>,
    pub timestamp: SystemTime,
}

struct Attached {
    policy: Arc<dyn BasePolicy>,
    strategy: CachingStrategy,
}

enum GrantTarget {
    Global,
    Origin(String),
}

/// Runtime grants layered over a base policy.
///
/// The engine starts uninitialized; every operation except
/// [`attach_base_policy`](Self::attach_base_policy) fails with `IllegalState` until a base
/// policy is attached, which can happen exactly once.
pub struct GrantEngine {
    config: EngineConfig,
    attached: OnceCell<Attached>,
    authorizer: Arc<dyn GrantAuthorizer>,
    global: GrantScopeIndex,
    by_origin: DashMap<String, Arc<GrantScopeIndex>>,
    domains: DomainCache,
    default_handle: Arc<DomainHandle>,
    static_epoch: AtomicU64,
    events: broadcast::Sender<GrantEvent>,
}

impl GrantEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (tx, _rx) = broadcast::channel(config.audit_capacity.max(1));
        Self {
            config,
            attached: OnceCell::new(),
            authorizer: Arc::new(SelfAuthorizer),
            global: GrantScopeIndex::new(),
            by_origin: DashMap::new(),
            domains: DomainCache::new(),
            default_handle: DomainHandle::process_default(),
            static_epoch: AtomicU64::new(0),
            events: tx,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn GrantAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One-way transition to the initialized state.
    pub fn attach_base_policy(
        &self,
        policy: Arc<dyn BasePolicy>,
    ) -> Result<CachingStrategy, GrantError> {
        let strategy = match self.config.cache_mode {
            CacheMode::Lazy => CachingStrategy::Lazy,
            CacheMode::Auto if policy.is_dynamic() => CachingStrategy::Lazy,
            CacheMode::Auto => CachingStrategy::Eager,
        };
        self.attached
            .set(Attached { policy, strategy })
            .map_err(|_| GrantError::IllegalState("base policy already attached".into()))?;
        info!(target: "grant-engine", ?strategy, "base policy attached");
        Ok(strategy)
    }

    pub fn is_initialized(&self) -> bool {
        self.attached.get().is_some()
    }

    pub fn caching_strategy(&self) -> Result<CachingStrategy, GrantError> {
        Ok(self.attached()?.strategy)
    }

    pub fn grant_supported(&self) -> bool {
        true
    }

    pub fn revocation_supported(&self) -> bool {
        false
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GrantEvent> {
        self.events.subscribe()
    }

    /// Unique handle for `context`, or the process-wide default handle for `None`.
    pub fn for_context(
        &self,
        context: Option<&Arc<ExecutionContext>>,
    ) -> Result<Arc<DomainHandle>, GrantError> {
        self.attached()?;
        let handle = match context {
            Some(context) => self.domains.for_context(context),
            None => Arc::clone(&self.default_handle),
        };
        self.ensure_registered(&handle);
        Ok(handle)
    }

    /// Grants `capabilities` to domains acting for at least `identities`.
    ///
    /// `origin == None` reaches every origin; `Some(OriginKey::System)` is refused. The
    /// caller must hold `GrantAuthority` for each token. Nothing is applied on failure.
    pub fn grant(
        &self,
        caller: &AccessContext,
        origin: Option<&OriginKey>,
        identities: Option<&IdentitySet>,
        capabilities: &[Capability],
    ) -> Result<(), GrantError> {
        self.attached()?;
        let identities = identities.cloned().unwrap_or_default();

        let target = match screen_grant(caller, origin, &identities, capabilities) {
            Ok(target) => target,
            Err(err) => {
                metrics::record_grant("rejected");
                self.publish_event(
                    origin,
                    &identities,
                    capabilities,
                    0,
                    GrantOutcome::Rejected,
                    Some(err.to_string()),
                );
                return Err(err);
            }
        };

        if let Err(err) = self.authorizer.check_grant(self, caller, capabilities) {
            warn!(
                target: "grant-engine",
                origin = ?origin,
                identities = %identities,
                "grant denied: {err}"
            );
            metrics::record_grant("denied");
            self.publish_event(
                origin,
                &identities,
                capabilities,
                0,
                GrantOutcome::Denied,
                Some(err.to_string()),
            );
            return Err(err);
        }

        let added = match &target {
            GrantTarget::Global => self.global.grant(&identities, capabilities)?,
            GrantTarget::Origin(code) => self
                .index_for_origin(code)
                .grant(&identities, capabilities)?,
        };
        info!(
            target: "grant-engine",
            origin = ?origin,
            identities = %identities,
            requested = capabilities.len(),
            added = added.len(),
            "grant accepted"
        );
        metrics::record_grant("accepted");
        self.publish_event(
            origin,
            &identities,
            capabilities,
            added.len(),
            GrantOutcome::Accepted,
            None,
        );
        Ok(())
    }

    /// Always refused: grants are additive only.
    pub fn revoke(
        &self,
        _caller: &AccessContext,
        _origin: Option<&OriginKey>,
        _identities: Option<&IdentitySet>,
        _capabilities: &[Capability],
    ) -> Result<(), GrantError> {
        self.attached()?;
        Err(GrantError::Unsupported(
            "revocation is not supported by this engine".into(),
        ))
    }

    /// Capabilities granted to `identities` (and its subsets), globally plus for `origin`.
    pub fn get_grants(
        &self,
        origin: Option<&OriginKey>,
        identities: Option<&IdentitySet>,
    ) -> Result<CapabilitySet, GrantError> {
        self.attached()?;
        let identities = identities.cloned().unwrap_or_default();
        identities.validate()?;

        let mut grants = self.global.effective_grants_for(&identities);
        if let Some(OriginKey::Code(code)) = origin {
            let index = self
                .by_origin
                .get(code)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(index) = index {
                grants.add_all(index.effective_grants_for(&identities).iter().cloned());
            }
        }
        Ok(grants)
    }

    /// Hot-path permission check.
    pub fn implies(
        &self,
        handle: &Arc<DomainHandle>,
        token: &Capability,
    ) -> Result<bool, GrantError> {
        let attached = self.attached()?;
        self.ensure_registered(handle);
        let allowed = self.static_implies(attached, handle, token)?
            || (handle.has_grants() && handle.granted_implies(token));
        metrics::record_check(allowed);
        Ok(allowed)
    }

    pub fn implies_context(
        &self,
        context: &Arc<ExecutionContext>,
        token: &Capability,
    ) -> Result<bool, GrantError> {
        let handle = self.for_context(Some(context))?;
        self.implies(&handle, token)
    }

    pub fn effective_capabilities(
        &self,
        handle: &Arc<DomainHandle>,
    ) -> Result<CapabilitySet, GrantError> {
        let attached = self.attached()?;
        self.ensure_registered(handle);
        let mut effective = self.static_capabilities(attached, handle)?;
        if handle.has_grants() {
            effective.add_all(handle.granted().iter().cloned());
        }
        Ok(effective)
    }

    /// Refreshes the base policy. Under the eager strategy cached base policy output is
    /// dropped so the next check re-derives it; accumulated grants are kept either way.
    pub fn refresh(&self) -> Result<(), GrantError> {
        let attached = self.attached()?;
        attached.policy.refresh()?;
        if attached.strategy == CachingStrategy::Eager {
            let epoch = self.static_epoch.fetch_add(1, Ordering::AcqRel) + 1;
            let handles = self.domains.handles();
            for handle in &handles {
                handle.clear_static();
            }
            self.default_handle.clear_static();
            debug!(
                target: "grant-engine",
                epoch,
                cleared = handles.len() + 1,
                "cleared cached base policy output"
            );
        }
        info!(target: "grant-engine", "base policy refreshed");
        Ok(())
    }

    /// Live domain handles, excluding the process-wide default.
    pub fn live_domains(&self) -> usize {
        self.domains.len()
    }

    pub fn global_index(&self) -> &GrantScopeIndex {
        &self.global
    }

    /// Origins that have received at least one grant.
    pub fn origin_count(&self) -> usize {
        self.by_origin.len()
    }

    pub fn origin_index(&self, origin: &OriginKey) -> Option<Arc<GrantScopeIndex>> {
        let code = origin.as_code()?;
        self.by_origin
            .get(code)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn attached(&self) -> Result<&Attached, GrantError> {
        self.attached
            .get()
            .ok_or_else(|| GrantError::IllegalState("no base policy attached".into()))
    }

    fn ensure_registered(&self, handle: &Arc<DomainHandle>) {
        handle.ensure_registered(|| {
            self.global.register(handle);
            // an origin without grants has no index; index_for_origin seeds this handle
            // from the global registry if one is created later
            let index = handle
                .origin()
                .as_code()
                .and_then(|code| self.by_origin.get(code))
                .map(|entry| Arc::clone(entry.value()));
            if let Some(index) = index {
                index.register(handle);
            }
        });
    }

    /// Index for grants scoped to `code`, created on the first such grant.
    ///
    /// A new index is seeded with every live domain of that origin while the map shard
    /// is held, so a domain registering concurrently either is seen here or finds the
    /// inserted index.
    fn index_for_origin(&self, code: &str) -> Arc<GrantScopeIndex> {
        if let Some(index) = self.by_origin.get(code) {
            return Arc::clone(index.value());
        }
        match self.by_origin.entry(code.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(slot) => {
                let index = Arc::new(GrantScopeIndex::new());
                let mut seeded = 0usize;
                for handle in self.global.domains() {
                    if handle.origin().as_code() == Some(code) {
                        index.register(&handle);
                        seeded += 1;
                    }
                }
                slot.insert(Arc::clone(&index));
                debug!(target: "grant-engine", origin = code, seeded, "created origin index");
                index
            }
        }
    }

    fn static_implies(
        &self,
        attached: &Attached,
        handle: &DomainHandle,
        token: &Capability,
    ) -> Result<bool, GrantError> {
        if attached.strategy == CachingStrategy::Eager {
            let epoch = self.static_epoch.load(Ordering::Acquire);
            if let Some(hit) = handle.cached_static_implies(epoch, token) {
                return Ok(hit);
            }
        }
        Ok(self.static_capabilities(attached, handle)?.implies(token))
    }

    /// Queries the base policy with no engine lock held.
    fn static_capabilities(
        &self,
        attached: &Attached,
        handle: &DomainHandle,
    ) -> Result<CapabilitySet, GrantError> {
        match attached.strategy {
            CachingStrategy::Lazy => Ok(attached
                .policy
                .static_capabilities(handle.origin(), handle.identities())?),
            CachingStrategy::Eager => {
                let epoch = self.static_epoch.load(Ordering::Acquire);
                if let Some(cached) = handle.cached_static(epoch) {
                    return Ok(cached);
                }
                let computed = attached
                    .policy
                    .static_capabilities(handle.origin(), handle.identities())?;
                handle.store_static(epoch, computed.clone());
                Ok(computed)
            }
        }
    }

    fn publish_event(
        &self,
        origin: Option<&OriginKey>,
        identities: &IdentitySet,
        capabilities: &[Capability],
        added: usize,
        outcome: GrantOutcome,
        detail: Option<String>,
    ) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let event = GrantEvent {
            origin: origin.cloned(),
            identities: identities.clone(),
            capabilities: capabilities.to_vec(),
            added,
            outcome,
            detail,
            timestamp: SystemTime::now(),
        };
        if let Err(err) = self.events.send(event) {
            warn!(target: "grant-engine", "failed to publish grant event: {err}");
        }
    }
}

impl Default for GrantEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

fn screen_grant(
    caller: &AccessContext,
    origin: Option<&OriginKey>,
    identities: &IdentitySet,
    capabilities: &[Capability],
) -> Result<GrantTarget, GrantError> {
    validate_grant(identities, capabilities)?;
    let target = match origin {
        None => GrantTarget::Global,
        Some(OriginKey::System) => {
            return Err(GrantError::Unsupported(
                "grants to code without an identifiable origin are not allowed".into(),
            ))
        }
        Some(OriginKey::Code(code)) => GrantTarget::Origin(code.clone()),
    };
    if caller.is_empty() {
        return Err(GrantError::InvalidArgument(
            "grant requested without a caller context".into(),
        ));
    }
    Ok(target)
}
