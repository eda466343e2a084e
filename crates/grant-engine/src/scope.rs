//! Identity-scoped grant records and push propagation to live domains.
//!
//! Lock order is records map, then a record's capability set, then registry lists and
//! handle caches. The base policy is never consulted from here.

use std::collections::HashMap;
use std::sync::Arc;

use dyngrant_core_types::{Capability, CapabilitySet, GrantError, IdentitySet};
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::DomainHandle;
use crate::registry::{Members, WeakRegistry};

/// Capabilities granted to exactly one identity set, and the live domains it reaches.
#[derive(Debug)]
pub struct GrantRecord {
    identities: IdentitySet,
    capabilities: RwLock<CapabilitySet>,
    members: WeakRegistry<DomainHandle>,
}

impl GrantRecord {
    fn new(identities: IdentitySet) -> Self {
        Self {
            identities,
            capabilities: RwLock::new(CapabilitySet::new()),
            members: WeakRegistry::new(),
        }
    }

    pub fn identities(&self) -> &IdentitySet {
        &self.identities
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities.read().clone()
    }

    pub fn members(&self) -> Vec<Arc<DomainHandle>> {
        self.members.iter().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Default)]
pub struct GrantScopeIndex {
    records: RwLock<HashMap<IdentitySet, Arc<GrantRecord>>>,
    domains: WeakRegistry<DomainHandle>,
}

impl GrantScopeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tokens` to the record for `identities` and pushes the new ones to every
    /// live member. Returns the tokens that were not already implied.
    ///
    /// Nothing is applied unless every token and principal is well formed.
    pub fn grant(
        &self,
        identities: &IdentitySet,
        tokens: &[Capability],
    ) -> Result<Vec<Capability>, GrantError> {
        validate_grant(identities, tokens)?;

        let record = self.record_for(identities);
        let mut capabilities = record.capabilities.write();
        let added = capabilities.add_all(tokens.iter().cloned());
        if !added.is_empty() {
            let mut reached = 0usize;
            for member in record.members.iter() {
                member.absorb(&added);
                reached += 1;
            }
            debug!(
                target: "grant-engine",
                identities = %identities,
                added = added.len(),
                reached,
                "pushed grant to live domains"
            );
        }
        Ok(added)
    }

    /// Makes `handle` eligible for grants and applies every record it already qualifies
    /// for. Repeat calls for the same handle do nothing.
    pub fn register(&self, handle: &Arc<DomainHandle>) {
        let records = self.records.read();
        if !self.domains.add(handle) {
            return;
        }
        for record in records.values() {
            if !record.identities.is_subset_of(handle.identities()) {
                continue;
            }
            let capabilities = record.capabilities.write();
            if record.members.add(handle) {
                handle.absorb(&capabilities.to_vec());
            }
        }
    }

    /// Union of every record whose identity set is a subset of `identities`.
    pub fn effective_grants_for(&self, identities: &IdentitySet) -> CapabilitySet {
        let records = self.records.read();
        let mut effective = CapabilitySet::new();
        for record in records.values() {
            if record.identities.is_subset_of(identities) {
                effective.add_all(record.capabilities.read().iter().cloned());
            }
        }
        effective
    }

    pub fn record(&self, identities: &IdentitySet) -> Option<Arc<GrantRecord>> {
        self.records.read().get(identities).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Live domains this index has seen.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub(crate) fn domains(&self) -> Members<DomainHandle> {
        self.domains.iter()
    }

    fn record_for(&self, identities: &IdentitySet) -> Arc<GrantRecord> {
        if let Some(record) = self.records.read().get(identities) {
            return Arc::clone(record);
        }

        let mut records = self.records.write();
        if let Some(record) = records.get(identities) {
            return Arc::clone(record);
        }
        // registrations are excluded while the write lock is held, so every known
        // domain is either seeded here or will find the record when it registers
        let record = Arc::new(GrantRecord::new(identities.clone()));
        let mut seeded = 0usize;
        for domain in self.domains.iter() {
            if identities.is_subset_of(domain.identities()) && record.members.add(&domain) {
                seeded += 1;
            }
        }
        records.insert(identities.clone(), Arc::clone(&record));
        debug!(
            target: "grant-engine",
            identities = %identities,
            seeded,
            "created grant record"
        );
        record
    }
}

pub(crate) fn validate_grant(
    identities: &IdentitySet,
    tokens: &[Capability],
) -> Result<(), GrantError> {
    identities.validate()?;
    tokens.iter().try_for_each(Capability::validate)
}
