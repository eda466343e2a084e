//! Domain handles and the identity-keyed weak cache that hands them out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dyngrant_core_types::{
    Capability, CapabilitySet, ContextId, ExecutionContext, IdentitySet, OriginKey,
    ReclaimNotifier, Reclaimable,
};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::metrics;

/// Security identity of one execution context plus its resolved capabilities.
///
/// The domain cache owns the only long-lived strong reference; grant scope indices
/// reach handles through `Weak`. Only engine code mutates the caches.
#[derive(Debug)]
pub struct DomainHandle {
    context: Option<ContextId>,
    origin: OriginKey,
    identities: IdentitySet,
    granted: RwLock<CapabilitySet>,
    has_grants: AtomicBool,
    static_cache: RwLock<Option<(u64, CapabilitySet)>>,
    registration: OnceCell<()>,
    notifier: ReclaimNotifier,
}

impl DomainHandle {
    fn new(context: Option<ContextId>, origin: OriginKey, identities: IdentitySet) -> Self {
        Self {
            context,
            origin,
            identities,
            granted: RwLock::new(CapabilitySet::new()),
            has_grants: AtomicBool::new(false),
            static_cache: RwLock::new(None),
            registration: OnceCell::new(),
            notifier: ReclaimNotifier::new(),
        }
    }

    /// Handle standing for "no execution context".
    pub(crate) fn process_default() -> Arc<Self> {
        Arc::new(Self::new(None, OriginKey::System, IdentitySet::empty()))
    }

    /// `None` for the process-wide default handle.
    pub fn context_id(&self) -> Option<ContextId> {
        self.context
    }

    pub fn origin(&self) -> &OriginKey {
        &self.origin
    }

    pub fn identities(&self) -> &IdentitySet {
        &self.identities
    }

    /// Whether any grant has reached this handle yet.
    pub fn has_grants(&self) -> bool {
        self.has_grants.load(Ordering::Acquire)
    }

    /// Snapshot of the dynamically granted capabilities.
    pub fn granted(&self) -> CapabilitySet {
        self.granted.read().clone()
    }

    pub(crate) fn granted_implies(&self, token: &Capability) -> bool {
        self.granted.read().implies(token)
    }

    /// Appends tokens under one write lock so a batch becomes visible at once.
    pub(crate) fn absorb(&self, tokens: &[Capability]) {
        if tokens.is_empty() {
            return;
        }
        let mut granted = self.granted.write();
        if !granted.add_all(tokens.iter().cloned()).is_empty() {
            self.has_grants.store(true, Ordering::Release);
        }
    }

    pub(crate) fn cached_static(&self, epoch: u64) -> Option<CapabilitySet> {
        match &*self.static_cache.read() {
            Some((cached_epoch, set)) if *cached_epoch == epoch => Some(set.clone()),
            _ => None,
        }
    }

    pub(crate) fn cached_static_implies(&self, epoch: u64, token: &Capability) -> Option<bool> {
        match &*self.static_cache.read() {
            Some((cached_epoch, set)) if *cached_epoch == epoch => Some(set.implies(token)),
            _ => None,
        }
    }

    pub(crate) fn store_static(&self, epoch: u64, set: CapabilitySet) {
        let mut cache = self.static_cache.write();
        let newer = match &*cache {
            Some((cached_epoch, _)) => *cached_epoch <= epoch,
            None => true,
        };
        if newer {
            *cache = Some((epoch, set));
        }
    }

    pub(crate) fn clear_static(&self) {
        *self.static_cache.write() = None;
    }

    /// Runs `register` the first time only; concurrent callers wait for it to finish.
    pub(crate) fn ensure_registered<F: FnOnce()>(&self, register: F) {
        self.registration.get_or_init(register);
    }
}

impl Reclaimable for DomainHandle {
    fn reclaim_notifier(&self) -> &ReclaimNotifier {
        &self.notifier
    }
}

struct CacheEntry {
    context: Weak<ExecutionContext>,
    handle: Arc<DomainHandle>,
}

/// Maps each live execution context to its unique domain handle.
pub struct DomainCache {
    entries: DashMap<ContextId, CacheEntry>,
    reaped: Arc<Mutex<Vec<ContextId>>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            reaped: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the handle for `context`, creating it on first sight. Racing callers for
    /// the same context all receive the same instance.
    pub fn for_context(&self, context: &Arc<ExecutionContext>) -> Arc<DomainHandle> {
        if let Some(entry) = self.entries.get(&context.id()) {
            return Arc::clone(&entry.handle);
        }

        self.purge();
        match self.entries.entry(context.id()) {
            Entry::Occupied(entry) => Arc::clone(&entry.get().handle),
            Entry::Vacant(slot) => {
                let handle = Arc::new(DomainHandle::new(
                    Some(context.id()),
                    context.origin().clone(),
                    context.identities().clone(),
                ));
                slot.insert(CacheEntry {
                    context: Arc::downgrade(context),
                    handle: Arc::clone(&handle),
                });
                let reaped = Arc::downgrade(&self.reaped);
                let id = context.id();
                context.reclaim_notifier().on_reclaim(move || {
                    if let Some(queue) = reaped.upgrade() {
                        queue.lock().push(id);
                    }
                });
                metrics::record_domain_created();
                debug!(
                    target: "grant-engine",
                    context = %id,
                    origin = %handle.origin(),
                    identities = %handle.identities(),
                    "created domain handle"
                );
                handle
            }
        }
    }

    /// Live handles after dropping the entries of reclaimed contexts.
    pub fn len(&self) -> usize {
        self.purge();
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<Arc<DomainHandle>> {
        self.purge();
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.value().handle))
            .collect()
    }

    fn purge(&self) {
        let dead = std::mem::take(&mut *self.reaped.lock());
        let mut removed = 0usize;
        for id in dead {
            // dropped outside the shard lock so handle reclaim hooks run unlocked
            let entry = self
                .entries
                .remove_if(&id, |_, entry| entry.context.strong_count() == 0);
            if entry.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(target: "grant-engine", removed, "evicted reclaimed domains");
        }
    }
}

impl Default for DomainCache {
    fn default() -> Self {
        Self::new()
    }
}
