//! Source-id → target-id maps shared by both writers.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

pub type IdentifierMap<T> = HashMap<String, T>;

/// Monotonic per-collection maps. Lookups that miss are dropped and counted.
#[derive(Debug, Clone)]
pub struct IdentifierRemapper<T> {
    maps: BTreeMap<String, IdentifierMap<T>>,
    unresolved: BTreeMap<String, usize>,
}

impl<T> Default for IdentifierRemapper<T> {
    fn default() -> Self {
        Self {
            maps: BTreeMap::new(),
            unresolved: BTreeMap::new(),
        }
    }
}

impl<T: Clone> IdentifierRemapper<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping once the target row exists.
    pub fn record(&mut self, collection: &str, source_id: &str, target: T) {
        self.maps
            .entry(collection.to_string())
            .or_default()
            .insert(source_id.to_string(), target);
    }

    pub fn mapping(&self, collection: &str) -> Option<&IdentifierMap<T>> {
        self.maps.get(collection)
    }

    pub fn len(&self, collection: &str) -> usize {
        self.maps.get(collection).map_or(0, HashMap::len)
    }

    /// Lookup without counting a miss.
    pub fn peek(&self, collection: &str, source_id: &str) -> Option<&T> {
        self.maps.get(collection)?.get(source_id)
    }

    pub fn resolve(&mut self, collection: &str, source_id: &str) -> Option<T> {
        match self.peek(collection, source_id) {
            Some(target) => Some(target.clone()),
            None => {
                self.note_miss(collection, source_id);
                None
            }
        }
    }

    /// Resolve every id; unresolved ones are filtered out, not propagated.
    pub fn resolve_all(&mut self, collection: &str, source_ids: &[String]) -> Vec<T> {
        source_ids
            .iter()
            .filter_map(|id| self.resolve(collection, id))
            .collect()
    }

    /// First id in `source_ids` that resolves; misses before it are counted.
    pub fn resolve_first(&mut self, collection: &str, source_ids: &[String]) -> Option<T> {
        source_ids
            .iter()
            .find_map(|id| self.resolve(collection, id))
    }

    /// Resolve against whichever collection holds the id.
    pub fn resolve_anywhere(&mut self, source_id: &str) -> Option<T> {
        let hit = self
            .maps
            .values()
            .find_map(|m| m.get(source_id))
            .cloned();
        if hit.is_none() {
            self.note_miss("<any>", source_id);
        }
        hit
    }

    pub fn unresolved(&self) -> &BTreeMap<String, usize> {
        &self.unresolved
    }

    pub fn unresolved_total(&self) -> usize {
        self.unresolved.values().sum()
    }

    fn note_miss(&mut self, collection: &str, source_id: &str) {
        warn!(collection, source_id, "dropping unresolved reference");
        *self.unresolved.entry(collection.to_string()).or_default() += 1;
    }
}
