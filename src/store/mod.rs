//! State stores: the single source of truth per entity kind.
//!
//! Grounded on the teacher's `aggregator::ZoneAggregator` — an
//! `Arc<RwLock<HashMap<_, _>>>` guarded single-writer store that the rest of
//! the program reads snapshots from. Generalized here into one `Store<K, V>`
//! reused for zones, clients, and the single global-state record, with a
//! per-entity version counter and a `mutate` that hands back `(old, new)` so
//! callers (the command router, fan-out) never need a second read to diff.

use crate::bus::{BusEvent, SharedBus};
use crate::clock::Clock;
use crate::model::{Client, ClientIndex, ErrorLevel, GlobalState, LastError, Zone, ZoneIndex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct Store<K, V> {
    inner: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Default for Store<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.write().await.insert(key, value);
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn get_all(&self) -> Vec<V> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().await.remove(key)
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.inner.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply `f` to the entry at `key` under a single write-lock acquisition,
    /// returning `(old, new)` so the caller can diff without a second read.
    /// `f` must be total for the existing value (no insert-if-absent); use
    /// `insert` to seed entities at startup.
    pub async fn mutate<F>(&self, key: &K, f: F) -> Option<(V, V)>
    where
        F: FnOnce(&V) -> V,
    {
        let mut guard = self.inner.write().await;
        let old = guard.get(key)?.clone();
        let new = f(&old);
        guard.insert(key.clone(), new.clone());
        Some((old, new))
    }
}

/// Process-wide monotonic counter. Every store mutation stamps its result
/// with the next value, giving a total order across zones, clients, and
/// global state that the fan-out coalescer and HTTP "If-Version" checks can
/// rely on.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub type ZoneStore = Store<ZoneIndex, Zone>;
pub type ClientStore = Store<ClientIndex, Client>;

/// The three stores plus the version counter that stamps every mutation,
/// bundled so the command router and adapters only need one handle.
#[derive(Clone)]
pub struct Stores {
    pub zones: ZoneStore,
    pub clients: ClientStore,
    pub global: Arc<RwLock<GlobalState>>,
    pub versions: Arc<VersionCounter>,
    configured_zones: Arc<Vec<ZoneIndex>>,
    configured_clients: Arc<Vec<ClientIndex>>,
}

impl Stores {
    pub fn new(zone_indices: Vec<ZoneIndex>, client_indices: Vec<ClientIndex>) -> Self {
        let zone_count = zone_indices.len();
        let client_count = client_indices.len();
        Self {
            zones: ZoneStore::new(),
            clients: ClientStore::new(),
            global: Arc::new(RwLock::new(GlobalState::new(zone_count, client_count, 0))),
            versions: Arc::new(VersionCounter::default()),
            configured_zones: Arc::new(zone_indices),
            configured_clients: Arc::new(client_indices),
        }
    }

    pub fn zone_configured(&self, zone: ZoneIndex) -> bool {
        self.configured_zones.contains(&zone)
    }

    pub fn client_configured(&self, client: ClientIndex) -> bool {
        self.configured_clients.contains(&client)
    }

    pub fn configured_zone_indices(&self) -> &[ZoneIndex] {
        &self.configured_zones
    }

    pub fn configured_client_indices(&self) -> &[ClientIndex] {
        &self.configured_clients
    }
}

/// Records an error in `GlobalState.last_error` and fans it out as
/// `BusEvent::SystemError`, per spec.md §7: "Every error also produces a
/// `SYSTEM_ERROR` fan-out event ... and updates `GlobalStore.LastError`."
/// Shared by [`crate::command::Router`] (command failures) and every adapter
/// (failures that never go through the router at all — malformed inbound
/// payloads, reconciliation errors).
pub async fn record_error(
    stores: &Stores,
    bus: &SharedBus,
    clock: &dyn Clock,
    component: &'static str,
    level: ErrorLevel,
    code: &'static str,
    message: String,
) {
    let timestamp_ms = clock.now_millis();
    let next_version = stores.versions.next();
    let state = {
        let mut global = stores.global.write().await;
        global.last_error = Some(LastError {
            timestamp_ms,
            level,
            code: code.to_string(),
            message: message.clone(),
            component: component.to_string(),
        });
        global.version = next_version;
        global.clone()
    };
    bus.publish(BusEvent::GlobalStateChanged { state });
    bus.publish(BusEvent::SystemError {
        level,
        code,
        message,
        component,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutate_returns_old_and_new() {
        let store: Store<u16, i32> = Store::new();
        store.insert(1, 10).await;
        let (old, new) = store.mutate(&1, |v| v + 5).await.unwrap();
        assert_eq!(old, 10);
        assert_eq!(new, 15);
        assert_eq!(store.get(&1).await, Some(15));
    }

    #[tokio::test]
    async fn mutate_on_missing_key_is_none() {
        let store: Store<u16, i32> = Store::new();
        assert!(store.mutate(&99, |v| v + 1).await.is_none());
    }
}
