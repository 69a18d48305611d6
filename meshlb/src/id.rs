use std::hash::Hash;

use ahash::{HashMap, HashMapExt};

use crate::{Error, Result};

/// Hands out small positive integer ids for keys and keeps the binding
/// stable until the key is released. Released ids are tombstoned rather than
/// recycled: in-flight datapath state may still carry the old id, and
/// handing it to a different key would alias connections. The counter only
/// moves backwards on `reset`.
#[derive(Debug)]
pub struct IdAllocator<K> {
    entries: HashMap<K, u16>,
    next_id: u32,
    first_id: u16,
    max_id: u16,
    space: &'static str,
}

impl<K: Eq + Hash + Clone> IdAllocator<K> {
    pub fn new(space: &'static str, first_id: u16, max_id: u16) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: u32::from(first_id),
            first_id,
            max_id,
            space,
        }
    }

    /// Returns the id bound to `key`, allocating the next free one on first
    /// sight.
    pub fn acquire(&mut self, key: &K) -> Result<u16> {
        if let Some(id) = self.entries.get(key) {
            return Ok(*id);
        }
        if self.next_id > u32::from(self.max_id) {
            return Err(Error::IdExhausted { space: self.space });
        }
        let id = self.next_id as u16;
        self.next_id += 1;
        self.entries.insert(key.clone(), id);
        Ok(id)
    }

    /// Drops the binding. The id becomes a tombstone and is not handed out
    /// again until `reset`.
    pub fn release(&mut self, key: &K) -> Option<u16> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &K) -> Option<u16> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u16)> {
        self.entries.iter().map(|(k, id)| (k, *id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_id = u32::from(self.first_id);
    }
}
