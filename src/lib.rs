//! Dynamic permission grants layered over a static base policy.
//!
//! The workspace splits into shared value types (`dyngrant-core-types`), the base policy
//! collaborator (`dyngrant-policy-center`) and the engine itself
//! (`dyngrant-grant-engine`). This crate re-exports all three and adds process-level
//! wiring: logging, the metrics registry and [`bootstrap`].

pub mod metrics;
pub mod telemetry;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

pub use dyngrant_core_types::{
    pattern_matches, Capability, CapabilitySet, ContextId, ExecutionContext, GrantError,
    IdentitySet, OriginKey, Principal,
};
pub use dyngrant_grant_engine::{
    load_config, AccessContext, CacheMode, CachingStrategy, ConfigError, DomainHandle,
    EngineConfig, GrantAuthorizer, GrantEngine, GrantEvent, GrantOutcome, SelfAuthorizer,
};
pub use dyngrant_policy_center::{
    BasePolicy, OriginRule, PolicyError, PolicyRules, PrincipalRule, StaticPolicy,
};

/// Loads configuration (optional file, then `DYNGRANT__*` variables), registers the
/// engine metrics and attaches `policy`.
pub fn bootstrap(
    config_path: Option<&Path>,
    policy: Arc<dyn BasePolicy>,
) -> anyhow::Result<GrantEngine> {
    let config = load_config(config_path).context("failed to load grant engine config")?;
    metrics::register_metrics();

    let engine = GrantEngine::new(config);
    let strategy = engine
        .attach_base_policy(policy)
        .context("failed to attach base policy")?;
    info!(?strategy, audit_capacity = engine.config().audit_capacity, "grant engine ready");
    Ok(engine)
}
