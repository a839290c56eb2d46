//! Connection registries: the UDP registry (keyed by flow-id)
//! and the TCP registry (keyed by adapter identity). Both back
//! onto `rustc_hash::FxHashMap` under a `parking_lot::RwLock`, matching the
//! teacher's choice of a fast non-cryptographic hasher for short-lived
//! in-process keys.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stringified source endpoint (`ip:port`), deliberately keyed on source only
/// since the stack's local port for a UDP flow is ephemeral.
pub type FlowId = String;

/// Typed, lock-protected map from flow-id to UDP adapter with a race-free
/// create-or-get.
pub struct UdpRegistry<V> {
    entries: RwLock<FxHashMap<FlowId, Arc<V>>>,
}

impl<V> Default for UdpRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> UdpRegistry<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<V>> {
        self.entries.read().get(id).cloned()
    }

    /// Double-checked create-or-get: a read-locked fast path, then a
    /// write-locked re-check before invoking `factory`, guaranteeing at most
    /// one factory invocation per id even under concurrent callers.
    pub fn get_or_create(&self, id: &str, factory: impl FnOnce() -> Arc<V>) -> Arc<V> {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(id) {
            return Arc::clone(existing);
        }
        let created = factory();
        entries.insert(id.to_string(), Arc::clone(&created));
        created
    }

    pub fn delete(&self, id: &str) -> Option<Arc<V>> {
        self.entries.write().remove(id)
    }

    /// Iterates a snapshot of the current entries to avoid holding the
    /// registry lock across caller-provided work.
    pub fn range(&self, mut f: impl FnMut(&str, &Arc<V>)) {
        let snapshot: Vec<(FlowId, Arc<V>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (id, entry) in &snapshot {
            f(id, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Opaque, process-unique identity assigned to each TCP adapter at birth.
/// Stands in for "adapter identity" as the registry key since adapters don't
/// otherwise have a natural total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(u64);

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(1);

impl AdapterId {
    pub fn next() -> Self {
        Self(NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A concurrent set of live TCP adapters. `range` tolerates concurrent
/// `delete` by iterating a snapshot, matching the shutdown path's need to
/// abort every live adapter without holding the registry lock across the
/// abort calls.
pub struct TcpRegistry<V> {
    entries: RwLock<FxHashMap<AdapterId, Arc<V>>>,
}

impl<V> Default for TcpRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TcpRegistry<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn insert(&self, id: AdapterId, value: Arc<V>) {
        self.entries.write().insert(id, value);
    }

    pub fn get(&self, id: AdapterId) -> Option<Arc<V>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn remove(&self, id: AdapterId) -> Option<Arc<V>> {
        self.entries.write().remove(&id)
    }

    pub fn range(&self, mut f: impl FnMut(AdapterId, &Arc<V>)) {
        let snapshot: Vec<(AdapterId, Arc<V>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();
        for (id, entry) in &snapshot {
            f(*id, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn get_or_create_invokes_factory_once_per_id() {
        let registry: UdpRegistry<u32> = UdpRegistry::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            registry.get_or_create("10.0.0.2:9", || {
                calls.fetch_add(1, Ordering::Relaxed);
                Arc::new(1)
            });
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn delete_removes_entry() {
        let registry: UdpRegistry<u32> = UdpRegistry::new();
        registry.get_or_create("10.0.0.2:9", || Arc::new(1));
        assert!(registry.delete("10.0.0.2:9").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn tcp_registry_range_tolerates_concurrent_remove() {
        let registry: TcpRegistry<u32> = TcpRegistry::new();
        let a = AdapterId::next();
        let b = AdapterId::next();
        registry.insert(a, Arc::new(1));
        registry.insert(b, Arc::new(2));
        registry.range(|id, _| {
            registry.remove(id);
        });
        assert!(registry.is_empty());
    }
}
