//! Self-pruning group of weakly held members.
//!
//! Members live in an index-linked list with a sentinel at slot 0. Vacated slots are
//! recycled with a bumped generation so a late tombstone for a previous occupant cannot
//! unlink the current one. Each member carries a [`ReclaimNotifier`]; when it drops, the
//! hook registered by `add` queues the slot key and the next mutation unlinks it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dyngrant_core_types::{ReclaimNotifier, Reclaimable};
use parking_lot::Mutex;
use tracing::debug;

use crate::metrics;

const SENTINEL: usize = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SlotKey {
    index: usize,
    generation: u64,
}

struct Slot<T> {
    member: Option<Weak<T>>,
    generation: u64,
    prev: usize,
    next: usize,
}

struct SlotList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    by_addr: HashMap<usize, SlotKey>,
}

impl<T> SlotList<T> {
    fn new() -> Self {
        Self {
            slots: vec![Slot {
                member: None,
                generation: 0,
                prev: SENTINEL,
                next: SENTINEL,
            }],
            free: Vec::new(),
            by_addr: HashMap::new(),
        }
    }

    fn link_front(&mut self, member: Weak<T>) -> SlotKey {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    member: None,
                    generation: 0,
                    prev: SENTINEL,
                    next: SENTINEL,
                });
                self.slots.len() - 1
            }
        };
        let head = self.slots[SENTINEL].next;
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.member = Some(member);
        slot.prev = SENTINEL;
        slot.next = head;
        let key = SlotKey {
            index,
            generation: slot.generation,
        };
        self.slots[head].prev = index;
        self.slots[SENTINEL].next = index;
        key
    }

    fn unlink(&mut self, key: SlotKey) -> bool {
        let Some(slot) = self.slots.get_mut(key.index) else {
            return false;
        };
        if key.index == SENTINEL || slot.generation != key.generation {
            return false;
        }
        let Some(member) = slot.member.take() else {
            return false;
        };
        let (prev, next) = (slot.prev, slot.next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        self.by_addr.remove(&addr_of(&member));
        self.free.push(key.index);
        true
    }

    fn members(&self) -> Vec<Weak<T>> {
        let mut collected = Vec::with_capacity(self.by_addr.len());
        let mut cursor = self.slots[SENTINEL].next;
        while cursor != SENTINEL {
            let slot = &self.slots[cursor];
            if let Some(member) = &slot.member {
                collected.push(member.clone());
            }
            cursor = slot.next;
        }
        collected
    }
}

fn addr_of<T>(member: &Weak<T>) -> usize {
    member.as_ptr() as *const () as usize
}

#[derive(Default)]
struct ReapQueue {
    dead: Mutex<Vec<SlotKey>>,
}

/// Concurrency-safe group of members that never keeps them alive.
pub struct WeakRegistry<T: Reclaimable + 'static> {
    list: Mutex<SlotList<T>>,
    reap: Arc<ReapQueue>,
}

impl<T: Reclaimable + 'static> WeakRegistry<T> {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(SlotList::new()),
            reap: Arc::new(ReapQueue::default()),
        }
    }

    /// Registers `member`. Returns `false` when it is already a member.
    ///
    /// A member is a borrowed `Arc`, so the absent member the contract rejects cannot be
    /// expressed here.
    pub fn add(&self, member: &Arc<T>) -> bool {
        let weak = Arc::downgrade(member);
        let key = {
            let mut list = self.list.lock();
            self.purge(&mut list);
            let addr = addr_of(&weak);
            if list.by_addr.contains_key(&addr) {
                return false;
            }
            let key = list.link_front(weak);
            list.by_addr.insert(addr, key);
            key
        };
        watch(member.reclaim_notifier(), &self.reap, key);
        true
    }

    /// Snapshot of the members linked right now. Each call starts a fresh traversal;
    /// members that die before they are reached are skipped.
    pub fn iter(&self) -> Members<T> {
        let pending = self.list.lock().members();
        Members {
            pending: pending.into_iter(),
        }
    }

    /// Number of linked members after unlinking every reported death.
    pub fn len(&self) -> usize {
        let mut list = self.list.lock();
        self.purge(&mut list);
        list.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self, list: &mut SlotList<T>) {
        let dead = std::mem::take(&mut *self.reap.dead.lock());
        if dead.is_empty() {
            return;
        }
        let unlinked = dead.into_iter().filter(|key| list.unlink(*key)).count();
        if unlinked > 0 {
            debug!(target: "grant-engine", unlinked, "pruned dead registry members");
            metrics::record_pruned(unlinked);
        }
    }
}

impl<T: Reclaimable + 'static> Default for WeakRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reclaimable + 'static> fmt::Debug for WeakRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRegistry")
            .field("linked", &self.list.lock().by_addr.len())
            .finish()
    }
}

fn watch(notifier: &ReclaimNotifier, reap: &Arc<ReapQueue>, key: SlotKey) {
    let reap = Arc::downgrade(reap);
    notifier.on_reclaim(move || {
        if let Some(queue) = reap.upgrade() {
            queue.dead.lock().push(key);
        }
    });
}

/// Lazy traversal returned by [`WeakRegistry::iter`].
pub struct Members<T> {
    pending: std::vec::IntoIter<Weak<T>>,
}

impl<T> Iterator for Members<T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pending.by_ref().find_map(|weak| weak.upgrade())
    }
}
