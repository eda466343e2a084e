use dyngrant_core_types::{
    pattern_matches, Capability, CapabilitySet, GrantError, IdentitySet, OriginKey, Principal,
};
use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;

/// Statically configured capability assignments.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyRules {
    #[serde(default)]
    pub version: u32,
    /// Granted to every domain.
    #[serde(default)]
    pub defaults: Vec<Capability>,
    #[serde(default)]
    pub origins: Vec<OriginRule>,
    #[serde(default)]
    pub principals: Vec<PrincipalRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OriginRule {
    pub match_pattern: String,
    pub allow: Vec<Capability>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrincipalRule {
    pub principal: Principal,
    pub allow: Vec<Capability>,
}

impl PolicyRules {
    /// Union of the defaults, every origin rule matching a code origin and every
    /// principal rule whose principal is acting.
    pub fn resolve(&self, origin: &OriginKey, identities: &IdentitySet) -> CapabilitySet {
        let mut resolved: CapabilitySet = self.defaults.iter().cloned().collect();

        if let Some(code) = origin.as_code() {
            for rule in &self.origins {
                if pattern_matches(&rule.match_pattern, code) {
                    resolved.add_all(rule.allow.iter().cloned());
                }
            }
        }

        for rule in &self.principals {
            if identities.contains(&rule.principal) {
                resolved.add_all(rule.allow.iter().cloned());
            }
        }

        resolved
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |err: GrantError| PolicyError::Invalid(err.to_string());

        for token in &self.defaults {
            token.validate().map_err(invalid)?;
        }
        for rule in &self.origins {
            if rule.match_pattern.trim().is_empty() {
                return Err(PolicyError::Invalid("origin rule with empty pattern".into()));
            }
            for token in &rule.allow {
                token.validate().map_err(invalid)?;
            }
        }
        for rule in &self.principals {
            if rule.principal.name().trim().is_empty() {
                return Err(PolicyError::Invalid("principal rule with blank principal".into()));
            }
            for token in &rule.allow {
                token.validate().map_err(invalid)?;
            }
        }
        Ok(())
    }
}
