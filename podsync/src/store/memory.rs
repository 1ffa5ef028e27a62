//! Authoritative in-memory pod table.
//!
//! Keyed records behind per-record locks:
//! ```text
//! RwLock<HashMap<pod_id, Arc<RwLock<Pod>>>>     records, one lock per pod
//! RwLock<HashMap<invite_code, pod_id>>          lookup index
//! RwLock<HashMap<item_id, pod_id>>              lookup index
//! ```
//!
//! `update` runs a closure under a single record's write lock: that is the
//! engine's atomic read-modify-write. Two writes to the same pod serialize
//! on the record lock; writes to different pods never contend. The outer map
//! lock is held only to resolve the record handle, never across a mutation.
//!
//! ## Performance Targets
//!
//! | Metric | Target | Reference |
//! |--------|--------|-----------|
//! | Record resolve | <100ns uncontended | — |
//! | Update (10-item pod) | <1µs | Kleppmann §7 |
//! | Cross-pod writes | zero shared lock | Kleppmann §7 |
//!
//! Reference: Kleppmann, Chapter 7 — Single-Object Writes

use crate::model::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Authoritative pod records plus lookup indexes.
pub struct PodTable {
    pods: RwLock<HashMap<Uuid, Arc<RwLock<Pod>>>>,
    invite_index: RwLock<HashMap<String, Uuid>>,
    item_index: RwLock<HashMap<Uuid, Uuid>>,
}

impl PodTable {
    pub fn new() -> Self {
        Self {
            pods: RwLock::new(HashMap::new()),
            invite_index: RwLock::new(HashMap::new()),
            item_index: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new pod, atomically claiming its invite code.
    ///
    /// Returns `false` (and leaves the table untouched) if the code is
    /// already claimed; the caller regenerates and retries. Items already on
    /// the pod (recovery load) are indexed as part of the insert.
    pub async fn insert(&self, pod: Pod) -> bool {
        let mut invites = self.invite_index.write().await;
        if invites.contains_key(&pod.invite_code) {
            return false;
        }
        invites.insert(pod.invite_code.clone(), pod.id);
        drop(invites);

        if !pod.items.is_empty() {
            let mut items = self.item_index.write().await;
            for item in &pod.items {
                items.insert(item.id, pod.id);
            }
        }

        let pod_id = pod.id;
        let mut pods = self.pods.write().await;
        pods.insert(pod_id, Arc::new(RwLock::new(pod)));
        true
    }

    /// Resolve a record handle. The outer lock is released before return.
    async fn record(&self, pod_id: Uuid) -> Option<Arc<RwLock<Pod>>> {
        let pods = self.pods.read().await;
        pods.get(&pod_id).map(Arc::clone)
    }

    /// Clone the current state of a pod.
    pub async fn snapshot(&self, pod_id: Uuid) -> Option<Pod> {
        let record = self.record(pod_id).await?;
        let pod = record.read().await;
        Some(pod.clone())
    }

    /// Atomic read-modify-write on one pod.
    ///
    /// The closure runs under the record's write lock and must not block;
    /// its return value is handed back to the caller. `None` if the pod does
    /// not exist.
    pub async fn update<R>(&self, pod_id: Uuid, f: impl FnOnce(&mut Pod) -> R) -> Option<R> {
        let record = self.record(pod_id).await?;
        let mut pod = record.write().await;
        Some(f(&mut pod))
    }

    /// Remove a pod and every index entry pointing at it.
    pub async fn remove(&self, pod_id: Uuid) -> Option<Pod> {
        let record = {
            let mut pods = self.pods.write().await;
            pods.remove(&pod_id)?
        };
        let pod = record.read().await.clone();

        let mut invites = self.invite_index.write().await;
        invites.remove(&pod.invite_code);
        drop(invites);

        let mut items = self.item_index.write().await;
        items.retain(|_, owner| *owner != pod_id);

        Some(pod)
    }

    // ─── Indexes ───

    pub async fn pod_id_by_invite(&self, code: &str) -> Option<Uuid> {
        let invites = self.invite_index.read().await;
        invites.get(code).copied()
    }

    pub async fn pod_id_for_item(&self, item_id: Uuid) -> Option<Uuid> {
        let items = self.item_index.read().await;
        items.get(&item_id).copied()
    }

    pub async fn index_item(&self, item_id: Uuid, pod_id: Uuid) {
        let mut items = self.item_index.write().await;
        items.insert(item_id, pod_id);
    }

    pub async fn unindex_item(&self, item_id: Uuid) {
        let mut items = self.item_index.write().await;
        items.remove(&item_id);
    }

    // ─── Queries ───

    /// Pods whose member list contains `member_id`, oldest first.
    pub async fn pods_for_member(&self, member_id: Uuid) -> Vec<Pod> {
        let records: Vec<Arc<RwLock<Pod>>> = {
            let pods = self.pods.read().await;
            pods.values().map(Arc::clone).collect()
        };

        let mut result = Vec::new();
        for record in records {
            let pod = record.read().await;
            if pod.has_member(member_id) {
                result.push(pod.clone());
            }
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result
    }

    /// Every pod in the table (persistence sweeps, stats).
    pub async fn all_pods(&self) -> Vec<Pod> {
        let records: Vec<Arc<RwLock<Pod>>> = {
            let pods = self.pods.read().await;
            pods.values().map(Arc::clone).collect()
        };
        let mut result = Vec::with_capacity(records.len());
        for record in records {
            result.push(record.read().await.clone());
        }
        result
    }

    pub async fn pod_count(&self) -> usize {
        self.pods.read().await.len()
    }

    pub async fn item_count(&self) -> usize {
        self.item_index.read().await.len()
    }
}

impl Default for PodTable {
    fn default() -> Self {
        Self::new()
    }
}
