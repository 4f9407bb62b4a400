//! Deferred surrogate keys.
//!
//! A resolver hands out [`Identifier`]s before it knows the integer key behind a natural key.
//! Unresolved identifiers are handles (slot + generation) into the owning resolver's
//! [`IdentityCache`]; the same natural key always maps to the same live handle, so resolving it
//! once resolves every holder. Handles are reference counted and released explicitly: when the
//! last holder releases, the cache forgets the key, which keeps long imports bounded.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

use crate::database_ops::error::{Error, Result};

/// Identity of one resolver instance; placeholders carry it so only the owner resolves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolverId(u64);

impl ResolverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ResolverId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to a pending key. Deliberately not `Clone`: every handle is one counted reference.
#[derive(Debug, PartialEq, Eq)]
pub struct Placeholder {
    owner: ResolverId,
    slot: u32,
    generation: u32,
}

impl Placeholder {
    pub fn owner(&self) -> ResolverId {
        self.owner
    }
}

/// A surrogate key that may not be known yet.
#[derive(Debug, PartialEq, Eq)]
pub enum Identifier {
    Resolved(i64),
    Unresolved(Placeholder),
}

impl Identifier {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Identifier::Resolved(_))
    }

    /// The owning resolver, `None` once resolved.
    pub fn owner(&self) -> Option<ResolverId> {
        match self {
            Identifier::Resolved(_) => None,
            Identifier::Unresolved(placeholder) => Some(placeholder.owner),
        }
    }

    /// Looks the identifier up in `cache`. A resolved identifier ignores the cache.
    pub fn resolve_with<K>(&self, cache: &IdentityCache<K>) -> Result<i64>
    where
        K: Eq + Hash + Clone + Debug,
    {
        match self {
            Identifier::Resolved(value) => Ok(*value),
            Identifier::Unresolved(placeholder) => cache.find(placeholder),
        }
    }
}

#[derive(Debug)]
struct Slot<K> {
    generation: u32,
    refs: u32,
    key: Option<K>,
}

/// Per-resolver cache of resolved keys, pending keys and the placeholder arena.
///
/// `resolved` and `pending` are disjoint. At most one live slot exists per key.
#[derive(Debug)]
pub struct IdentityCache<K> {
    owner: ResolverId,
    resolved: HashMap<K, i64>,
    pending: IndexSet<K>,
    live: HashMap<K, u32>,
    slots: Vec<Slot<K>>,
    free: Vec<u32>,
}

impl<K> IdentityCache<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(owner: ResolverId) -> Self {
        Self {
            owner,
            resolved: HashMap::new(),
            pending: IndexSet::new(),
            live: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn owner(&self) -> ResolverId {
        self.owner
    }

    /// Returns the resolved key when known, otherwise a counted reference to the key's
    /// placeholder, queuing the key for the next resolution pass.
    pub fn unresolved(&mut self, key: K) -> Identifier {
        if let Some(value) = self.resolved.get(&key) {
            return Identifier::Resolved(*value);
        }

        let slot = match self.live.get(&key).copied() {
            Some(slot) => slot,
            None => self.allocate_slot(key.clone()),
        };
        let entry = &mut self.slots[slot as usize];
        entry.refs += 1;
        let generation = entry.generation;
        self.pending.insert(key);

        Identifier::Unresolved(Placeholder {
            owner: self.owner,
            slot,
            generation,
        })
    }

    fn allocate_slot(&mut self, key: K) -> u32 {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].key = Some(key.clone());
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    refs: 0,
                    key: Some(key.clone()),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.live.insert(key, slot);
        slot
    }

    /// Natural key behind a live placeholder owned by this cache.
    pub fn key_of(&self, placeholder: &Placeholder) -> Option<&K> {
        if placeholder.owner != self.owner {
            return None;
        }
        self.slots
            .get(placeholder.slot as usize)
            .filter(|slot| slot.generation == placeholder.generation)
            .and_then(|slot| slot.key.as_ref())
    }

    pub fn find(&self, placeholder: &Placeholder) -> Result<i64> {
        let key = self
            .key_of(placeholder)
            .ok_or_else(|| Error::not_resolved(format!("{placeholder:?}")))?;
        self.resolved
            .get(key)
            .copied()
            .ok_or_else(|| Error::not_resolved(format!("{key:?}")))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Snapshot of pending keys in request order; the pending set is left empty.
    pub fn take_pending(&mut self) -> Vec<K> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Puts keys back after a failed pass so a later pass retries them.
    pub fn restore_pending(&mut self, keys: impl IntoIterator<Item = K>) {
        for key in keys {
            if !self.resolved.contains_key(&key) {
                self.pending.insert(key);
            }
        }
    }

    pub fn mark_resolved(&mut self, key: K, value: i64) {
        self.pending.shift_remove(&key);
        self.resolved.insert(key, value);
    }

    /// Drops one reference. The last release forgets the key in both maps.
    /// Identifiers from other owners and stale handles are ignored.
    pub fn release(&mut self, identifier: Identifier) {
        let Identifier::Unresolved(placeholder) = identifier else {
            return;
        };
        if placeholder.owner != self.owner {
            return;
        }
        let Some(slot) = self.slots.get_mut(placeholder.slot as usize) else {
            return;
        };
        if slot.generation != placeholder.generation || slot.refs == 0 {
            return;
        }

        slot.refs -= 1;
        if slot.refs > 0 {
            return;
        }

        slot.generation = slot.generation.wrapping_add(1);
        if let Some(key) = slot.key.take() {
            self.live.remove(&key);
            self.pending.shift_remove(&key);
            self.resolved.remove(&key);
        }
        self.free.push(placeholder.slot);
    }

    /// Number of placeholders still held by someone.
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn resolved_len(&self) -> usize {
        self.resolved.len()
    }
}
