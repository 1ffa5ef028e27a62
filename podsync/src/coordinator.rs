//! Write coordinator: the single authority for pod mutations.
//!
//! Every write follows the same path:
//! ```text
//! validate input
//!     │
//!     ▼
//! PodTable::update()        ◄── commit under the record lock
//!     │                         (linearization point)
//!     ▼
//! PodStore::put_pod()       ◄── durable write-through, failure logged
//!     │
//!     ▼
//! PodBus::publish()         ◄── exactly one event per state change,
//!                               tagged with the acting session
//! ```
//!
//! Publication is strictly post-commit: a session can never observe an
//! event for a write that did not happen. The reverse (commit without a
//! delivered event) is allowed and repaired by snapshot re-fetch.
//!
//! ## Performance Targets
//!
//! | Metric | Target | Reference |
//! |--------|--------|-----------|
//! | Write commit (uncontended) | <5µs | Kleppmann §7 |
//! | Same-pod writes | serialized on one lock | Kleppmann §7 |
//! | Cross-pod writes | fully parallel | — |
//!
//! Reference: Kleppmann, Chapter 7 — Single-Object Writes

use crate::bus::PodBus;
use crate::model::{
    generate_invite_code, normalize_invite_code, Item, Member, MemberProfile, MemberRef, Pod,
};
use crate::protocol::{ChangeEvent, WireError};
use crate::store::{PodStore, PodTable, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Invite allocation retries before giving up. Collisions need ~36^6 live
/// pods to become likely, so more than a couple of retries means trouble.
const MAX_INVITE_ATTEMPTS: u32 = 8;

/// Write failures, mapped 1:1 onto the wire taxonomy.
#[derive(Debug, Clone)]
pub enum WriteError {
    Validation(String),
    NotFound(String),
    Permission(String),
    Store(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Validation error: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::Permission(msg) => write!(f, "Permission denied: {msg}"),
            Self::Store(msg) => write!(f, "Store error: {msg}"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<StoreError> for WriteError {
    fn from(e: StoreError) -> Self {
        WriteError::Store(e.to_string())
    }
}

impl From<WriteError> for WireError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Validation(msg) => WireError::Validation(msg),
            WriteError::NotFound(msg) => WireError::NotFound(msg),
            WriteError::Permission(msg) => WireError::Permission(msg),
            WriteError::Store(msg) => WireError::Internal(msg),
        }
    }
}

/// Result of `set_item_quantity`: a quantity at or below zero deletes the
/// item instead of leaving a dead row.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantityOutcome {
    Updated { pod_id: Uuid, item: Item },
    Removed { pod_id: Uuid, item_id: Uuid },
}

/// Coordinator statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct WriteStats {
    pub writes_committed: u64,
    pub events_published: u64,
    pub writes_rejected: u64,
}

struct AtomicWriteStats {
    writes_committed: AtomicU64,
    events_published: AtomicU64,
    writes_rejected: AtomicU64,
}

impl AtomicWriteStats {
    fn new() -> Self {
        Self {
            writes_committed: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            writes_rejected: AtomicU64::new(0),
        }
    }
}

/// The write side of the engine: validates, commits, persists, publishes.
///
/// `origin` on every write is the acting session's id (nil for writes that
/// arrive from outside any session); it is stamped on the resulting event so
/// the originator's connection can skip the echo.
pub struct WriteCoordinator {
    table: Arc<PodTable>,
    bus: Arc<PodBus>,
    store: Option<Arc<PodStore>>,
    stats: AtomicWriteStats,
}

impl WriteCoordinator {
    pub fn new(table: Arc<PodTable>, bus: Arc<PodBus>) -> Self {
        Self {
            table,
            bus,
            store: None,
            stats: AtomicWriteStats::new(),
        }
    }

    pub fn with_store(table: Arc<PodTable>, bus: Arc<PodBus>, store: Arc<PodStore>) -> Self {
        Self {
            table,
            bus,
            store: Some(store),
            stats: AtomicWriteStats::new(),
        }
    }

    /// Seed the table from the durable store (startup). Returns how many
    /// pods were loaded; indexes are rebuilt as a side effect of insertion.
    pub async fn recover(&self) -> Result<usize, WriteError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let pods = store.list_pods()?;
        let mut loaded = 0;
        for pod in pods {
            let pod_id = pod.id;
            if self.table.insert(pod).await {
                loaded += 1;
            } else {
                log::warn!("Skipping pod {pod_id} during recovery: invite code already claimed");
            }
        }
        log::info!("Recovered {loaded} pods from {}", store.path().display());
        Ok(loaded)
    }

    // ─── Pod lifecycle ────────────────────────────────────────────────

    /// Create a pod with `owner` as its sole (owning) member.
    pub async fn create_pod(
        &self,
        origin: Uuid,
        name: &str,
        owner: &MemberProfile,
    ) -> Result<Pod, WriteError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(self.rejected(WriteError::Validation(
                "pod name must not be empty".to_string(),
            )));
        }

        let mut pod = Pod::new(name.to_string(), owner, generate_invite_code());
        let mut attempts = 1;
        while !self.table.insert(pod.clone()).await {
            if attempts >= MAX_INVITE_ATTEMPTS {
                return Err(self.rejected(WriteError::Store(
                    "could not allocate a unique invite code".to_string(),
                )));
            }
            attempts += 1;
            pod.invite_code = generate_invite_code();
        }
        if attempts > 1 {
            log::debug!("Invite code allocation took {attempts} attempts");
        }

        self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
        self.write_through(pod.id).await;
        self.publish(
            origin,
            ChangeEvent::PodCreated {
                pod_id: pod.id,
                name: pod.name.clone(),
            },
        )
        .await;
        log::info!("Created pod {} ({})", pod.id, pod.name);
        Ok(pod)
    }

    /// Join a pod by invite code. Joining a pod the member already belongs
    /// to returns the pod unchanged and publishes nothing.
    pub async fn join_pod(
        &self,
        origin: Uuid,
        invite_code: &str,
        member: &MemberProfile,
    ) -> Result<Pod, WriteError> {
        let code = normalize_invite_code(invite_code);
        if code.is_empty() {
            return Err(self.rejected(WriteError::Validation(
                "invite code must not be empty".to_string(),
            )));
        }
        let pod_id = self
            .table
            .pod_id_by_invite(&code)
            .await
            .ok_or_else(|| self.rejected(WriteError::NotFound(format!("no pod for invite code {code}"))))?;

        // Membership check and append under the same record lock, so two
        // concurrent joins of one member cannot both append.
        let committed = self
            .table
            .update(pod_id, |pod| {
                if pod.has_member(member.id) {
                    (pod.clone(), None)
                } else {
                    let joined = Member::from_profile(member, false);
                    pod.members.push(joined.clone());
                    (pod.clone(), Some(joined))
                }
            })
            .await
            .ok_or_else(|| self.rejected(WriteError::NotFound(format!("pod {pod_id} no longer exists"))))?;

        let (pod, joined) = committed;
        if let Some(joined) = joined {
            self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
            self.write_through(pod_id).await;
            self.publish(origin, ChangeEvent::MemberJoined { pod_id, member: joined }).await;
            log::info!("Member {} joined pod {pod_id}", member.id);
        }
        Ok(pod)
    }

    /// Delete a pod and everything attached to it. Owner only.
    ///
    /// No event is published for deletion: the pod's channel closes, and
    /// surviving clients converge through re-fetch.
    pub async fn delete_pod(
        &self,
        _origin: Uuid,
        pod_id: Uuid,
        requester_id: Uuid,
    ) -> Result<(), WriteError> {
        let pod = self
            .table
            .snapshot(pod_id)
            .await
            .ok_or_else(|| self.rejected(WriteError::NotFound(format!("pod {pod_id} not found"))))?;
        if pod.owner_id != requester_id {
            return Err(self.rejected(WriteError::Permission(
                "only the owner can delete a pod".to_string(),
            )));
        }

        if self.table.remove(pod_id).await.is_none() {
            // Lost a race with another delete
            return Err(self.rejected(WriteError::NotFound(format!("pod {pod_id} not found"))));
        }
        self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);

        if let Some(store) = &self.store {
            if let Err(e) = store.delete_pod(pod_id) {
                log::error!("Failed to delete pod {pod_id} from store: {e}");
            }
        }
        self.bus.close(pod_id).await;
        log::info!("Deleted pod {pod_id} ({})", pod.name);
        Ok(())
    }

    // ─── Items ────────────────────────────────────────────────────────

    /// Add a product to the cart. A product already in the cart gains
    /// quantity instead of a duplicate row.
    pub async fn add_item(
        &self,
        origin: Uuid,
        pod_id: Uuid,
        product_id: &str,
        name: &str,
        price: f64,
        added_by: &MemberProfile,
    ) -> Result<Item, WriteError> {
        let product_id = product_id.trim();
        let name = name.trim();
        if product_id.is_empty() {
            return Err(self.rejected(WriteError::Validation(
                "product id must not be empty".to_string(),
            )));
        }
        if name.is_empty() {
            return Err(self.rejected(WriteError::Validation(
                "item name must not be empty".to_string(),
            )));
        }
        if !price.is_finite() || price < 0.0 {
            return Err(self.rejected(WriteError::Validation(
                "price must be a finite, non-negative number".to_string(),
            )));
        }

        let committed = self
            .table
            .update(pod_id, |pod| {
                if let Some(existing) = pod.item_by_product_mut(product_id) {
                    existing.quantity += 1;
                    (existing.clone(), false)
                } else {
                    let item = Item::new(
                        product_id.to_string(),
                        name.to_string(),
                        price,
                        MemberRef::from_profile(added_by),
                    );
                    pod.items.push(item.clone());
                    (item, true)
                }
            })
            .await
            .ok_or_else(|| self.rejected(WriteError::NotFound(format!("pod {pod_id} not found"))))?;

        let (item, created) = committed;
        if created {
            self.table.index_item(item.id, pod_id).await;
        }
        self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
        self.write_through(pod_id).await;

        let event = if created {
            ChangeEvent::ItemAdded { pod_id, item: item.clone() }
        } else {
            ChangeEvent::ItemUpdated { pod_id, item: item.clone() }
        };
        self.publish(origin, event).await;
        Ok(item)
    }

    /// Set an item's quantity. Zero or below deletes the item.
    pub async fn set_item_quantity(
        &self,
        origin: Uuid,
        item_id: Uuid,
        new_quantity: i32,
    ) -> Result<QuantityOutcome, WriteError> {
        let pod_id = self
            .table
            .pod_id_for_item(item_id)
            .await
            .ok_or_else(|| self.rejected(WriteError::NotFound(format!("item {item_id} not found"))))?;

        if new_quantity <= 0 {
            let removed = self
                .table
                .update(pod_id, |pod| pod.take_item(item_id))
                .await
                .flatten();
            if removed.is_none() {
                return Err(self.rejected(WriteError::NotFound(format!("item {item_id} not found"))));
            }
            self.table.unindex_item(item_id).await;
            self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
            self.write_through(pod_id).await;
            self.publish(origin, ChangeEvent::ItemRemoved { pod_id, item_id }).await;
            return Ok(QuantityOutcome::Removed { pod_id, item_id });
        }

        let updated = self
            .table
            .update(pod_id, |pod| {
                pod.item_mut(item_id).map(|item| {
                    item.quantity = new_quantity as u32;
                    item.clone()
                })
            })
            .await
            .flatten();
        match updated {
            Some(item) => {
                self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
                self.write_through(pod_id).await;
                self.publish(origin, ChangeEvent::ItemUpdated { pod_id, item: item.clone() }).await;
                Ok(QuantityOutcome::Updated { pod_id, item })
            }
            None => Err(self.rejected(WriteError::NotFound(format!("item {item_id} not found")))),
        }
    }

    /// Remove an item. An id that resolves to nothing is treated as already
    /// removed: the call succeeds with `None` and nothing is published.
    pub async fn remove_item(
        &self,
        origin: Uuid,
        item_id: Uuid,
    ) -> Result<Option<(Uuid, Uuid)>, WriteError> {
        let Some(pod_id) = self.table.pod_id_for_item(item_id).await else {
            log::debug!("Remove for unresolved item {item_id}, treating as already removed");
            return Ok(None);
        };

        let removed = self
            .table
            .update(pod_id, |pod| pod.take_item(item_id))
            .await
            .flatten();
        self.table.unindex_item(item_id).await;
        if removed.is_none() {
            return Ok(None);
        }

        self.stats.writes_committed.fetch_add(1, Ordering::Relaxed);
        self.write_through(pod_id).await;
        self.publish(origin, ChangeEvent::ItemRemoved { pod_id, item_id }).await;
        Ok(Some((pod_id, item_id)))
    }

    // ─── Invites ──────────────────────────────────────────────────────

    /// Announce an invite share to attached sessions. Advisory: no state
    /// changes, nothing persisted.
    pub async fn share_invite(
        &self,
        origin: Uuid,
        pod_id: Uuid,
        shared_by: Uuid,
    ) -> Result<(), WriteError> {
        let pod = self
            .table
            .snapshot(pod_id)
            .await
            .ok_or_else(|| self.rejected(WriteError::NotFound(format!("pod {pod_id} not found"))))?;
        self.publish(
            origin,
            ChangeEvent::InviteShared {
                pod_id,
                invite_code: pod.invite_code.clone(),
                shared_by,
            },
        )
        .await;
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Current snapshot of one pod. The recovery primitive: a client that
    /// suspects it missed events replaces its copy with this.
    pub async fn get_pod(&self, pod_id: Uuid) -> Result<Pod, WriteError> {
        self.table
            .snapshot(pod_id)
            .await
            .ok_or_else(|| WriteError::NotFound(format!("pod {pod_id} not found")))
    }

    /// Every pod the member belongs to, oldest first.
    pub async fn list_pods(&self, member_id: Uuid) -> Vec<Pod> {
        self.table.pods_for_member(member_id).await
    }

    pub fn stats(&self) -> WriteStats {
        WriteStats {
            writes_committed: self.stats.writes_committed.load(Ordering::Relaxed),
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            writes_rejected: self.stats.writes_rejected.load(Ordering::Relaxed),
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Persist the committed record. Failure is logged, never propagated:
    /// the table commit stands and re-fetch repairs any divergence.
    async fn write_through(&self, pod_id: Uuid) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(pod) = self.table.snapshot(pod_id).await else {
            return;
        };
        if let Err(e) = store.put_pod(&pod) {
            log::error!("Write-through failed for pod {pod_id}: {e}");
        }
    }

    async fn publish(&self, origin: Uuid, event: ChangeEvent) {
        let kind = event.kind();
        let pod_id = event.pod_id();
        let reached = self.bus.publish(origin, event).await;
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        log::debug!("Published {kind} for pod {pod_id} to {reached} sessions");
    }

    fn rejected(&self, err: WriteError) -> WriteError {
        self.stats.writes_rejected.fetch_add(1, Ordering::Relaxed);
        err
    }
}
