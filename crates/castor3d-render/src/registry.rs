//! Stable per-kind instance indices.
//!
//! Components that need a unique index for naming or slot assignment take
//! one from the [`InstanceRegistry`] owned by the render device. The index is
//! the lowest one free for that kind and is given back when the
//! [`RegistryIndex`] drops.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct KindIndices {
    next: u32,
    free: BTreeSet<u32>,
}

/// Hands out instance indices per component kind.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    kinds: Arc<Mutex<HashMap<&'static str, KindIndices>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free index for `kind`.
    pub fn acquire(&self, kind: &'static str) -> RegistryIndex {
        let mut kinds = self.kinds.lock();
        let indices = kinds.entry(kind).or_default();
        let index = match indices.free.pop_first() {
            Some(index) => index,
            None => {
                indices.next += 1;
                indices.next - 1
            }
        };
        tracing::trace!(kind, index, "Acquired instance index");
        RegistryIndex {
            registry: self.kinds.clone(),
            kind,
            index,
        }
    }

    /// Number of live indices of `kind`.
    pub fn live_count(&self, kind: &str) -> usize {
        self.kinds
            .lock()
            .get(kind)
            .map_or(0, |indices| indices.next as usize - indices.free.len())
    }
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("kinds", &self.kinds.lock().len())
            .finish()
    }
}

/// An index held by one live instance.
pub struct RegistryIndex {
    registry: Arc<Mutex<HashMap<&'static str, KindIndices>>>,
    kind: &'static str,
    index: u32,
}

impl RegistryIndex {
    pub const fn index(&self) -> u32 {
        self.index
    }

    pub const fn kind(&self) -> &'static str {
        self.kind
    }
}

impl fmt::Debug for RegistryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.index)
    }
}

impl Drop for RegistryIndex {
    fn drop(&mut self) {
        if let Some(indices) = self.registry.lock().get_mut(self.kind) {
            indices.free.insert(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_index_is_reused() {
        let registry = InstanceRegistry::new();
        let first = registry.acquire("EnvironmentMap");
        let second = registry.acquire("EnvironmentMap");
        let other = registry.acquire("ShadowMap");
        assert_eq!((first.index(), second.index(), other.index()), (0, 1, 0));

        drop(first);
        assert_eq!(registry.live_count("EnvironmentMap"), 1);
        let third = registry.acquire("EnvironmentMap");
        assert_eq!(third.index(), 0);
        assert_eq!(registry.live_count("EnvironmentMap"), 2);
    }
}
