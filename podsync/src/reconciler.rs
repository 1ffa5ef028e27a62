//! Client-side reconciler: one idempotent merge for both delivery paths.
//!
//! A client learns about committed writes twice — once from the direct
//! reply to its own request, once from the pod's broadcast channel — with
//! no ordering guarantee between the two, possible duplication, and
//! possible gaps. The reconciler absorbs all of it into a single local
//! view:
//!
//! ```text
//! direct reply ──► absorb_reply() ──┐
//!                                   ├──► merge by entity identity
//! bus event ─────► apply() ─────────┘    (id first, product_id second)
//!                                   │
//!                                   ▼
//!                        pods: Vec<Pod>, active: Option<Uuid>
//! ```
//!
//! Merge rules are defined so that re-applying any event is a no-op and
//! events touching distinct entities commute; the repair path for anything
//! stranger than that is snapshot replacement, not cleverness here.
//!
//! ## Performance Targets
//!
//! | Metric | Target | Reference |
//! |--------|--------|-----------|
//! | Event merge (100-item pod) | <2µs | Kleppmann §5 |
//! | Duplicate detection | O(items) scan | — |
//!
//! Reference: Kleppmann, Chapter 5 — Convergence

use crate::model::{Item, Member, Pod};
use crate::protocol::{ChangeEvent, Reply};
use uuid::Uuid;

/// What a merge did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Local state changed.
    Applied,
    /// The event was already reflected (duplicate or stale delivery).
    Noop,
    /// Advisory event kind; never mutates state.
    Advisory,
    /// Event for a pod this client does not track.
    UnknownPod,
}

/// Merge counters, grouped by outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub duplicates: u64,
    pub advisories: u64,
    pub unknown_pod: u64,
}

/// Local view of the member's pods plus which one is on screen.
///
/// Deliberately transport-free and synchronous: the sync client owns the
/// sockets and feeds this from both paths.
pub struct Reconciler {
    pods: Vec<Pod>,
    active: Option<Uuid>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            pods: Vec::new(),
            active: None,
            stats: ReconcilerStats::default(),
        }
    }

    // ─── Pod list ─────────────────────────────────────────────────────

    /// Replace the whole pod list (session-start fetch).
    pub fn seed(&mut self, pods: Vec<Pod>) {
        self.pods = pods;
    }

    /// Insert or replace one pod by id. Create/join results and the
    /// re-fetch recovery path both land here: the authoritative snapshot
    /// wins wholesale.
    pub fn upsert_pod(&mut self, pod: Pod) -> MergeOutcome {
        match self.pods.iter_mut().find(|p| p.id == pod.id) {
            Some(existing) if *existing == pod => MergeOutcome::Noop,
            Some(existing) => {
                *existing = pod;
                MergeOutcome::Applied
            }
            None => {
                self.pods.push(pod);
                MergeOutcome::Applied
            }
        }
    }

    /// Forget a pod (deletion discovered, or the member left).
    pub fn remove_pod(&mut self, pod_id: Uuid) -> MergeOutcome {
        let before = self.pods.len();
        self.pods.retain(|p| p.id != pod_id);
        if self.active == Some(pod_id) {
            self.active = None;
        }
        if self.pods.len() < before {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Noop
        }
    }

    pub fn set_active(&mut self, pod_id: Option<Uuid>) {
        self.active = pod_id;
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.active
    }

    pub fn active_pod(&self) -> Option<&Pod> {
        self.active.and_then(|id| self.pod(id))
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    pub fn pod(&self, pod_id: Uuid) -> Option<&Pod> {
        self.pods.iter().find(|p| p.id == pod_id)
    }

    fn pod_mut(&mut self, pod_id: Uuid) -> Option<&mut Pod> {
        self.pods.iter_mut().find(|p| p.id == pod_id)
    }

    /// (total units, total price) for one pod's cart.
    pub fn cart_totals(&self, pod_id: Uuid) -> Option<(u64, f64)> {
        self.pod(pod_id).map(|p| (p.total_items(), p.total_price()))
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.clone()
    }

    // ─── Event path ───────────────────────────────────────────────────

    /// Merge one broadcast event. Safe under duplication and under
    /// reordering of events for distinct entities.
    pub fn apply(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let outcome = match event {
            ChangeEvent::PodCreated { .. } | ChangeEvent::InviteShared { .. } => {
                MergeOutcome::Advisory
            }
            ChangeEvent::MemberJoined { pod_id, member } => match self.pod_mut(*pod_id) {
                Some(pod) => Self::merge_member(pod, member),
                None => MergeOutcome::UnknownPod,
            },
            ChangeEvent::ItemAdded { pod_id, item } | ChangeEvent::ItemUpdated { pod_id, item } => {
                match self.pod_mut(*pod_id) {
                    Some(pod) => Self::merge_item(pod, item),
                    None => MergeOutcome::UnknownPod,
                }
            }
            ChangeEvent::ItemRemoved { pod_id, item_id } => match self.pod_mut(*pod_id) {
                Some(pod) => Self::drop_item(pod, *item_id),
                None => MergeOutcome::UnknownPod,
            },
        };
        self.count(event, outcome);
        outcome
    }

    // ─── Direct-response path ─────────────────────────────────────────

    /// Merge the direct reply to a write this client issued. Same merge
    /// rules as the event path, so whichever of the two arrives first
    /// establishes state and the other collapses to a no-op.
    pub fn absorb_reply(&mut self, reply: &Reply) -> MergeOutcome {
        match reply {
            Reply::Pod(pod) => self.upsert_pod(pod.clone()),
            Reply::Pods(pods) => {
                self.seed(pods.clone());
                MergeOutcome::Applied
            }
            Reply::Item { pod_id, item } => match self.pod_mut(*pod_id) {
                Some(pod) => Self::merge_item(pod, item),
                None => MergeOutcome::UnknownPod,
            },
            Reply::Removed { pod_id, item_id } => match self.pod_mut(*pod_id) {
                Some(pod) => Self::drop_item(pod, *item_id),
                None => MergeOutcome::UnknownPod,
            },
            Reply::Attached { pod } => {
                let outcome = self.upsert_pod(pod.clone());
                self.active = Some(pod.id);
                outcome
            }
            Reply::Ack => MergeOutcome::Noop,
        }
    }

    // ─── Merge rules ──────────────────────────────────────────────────

    fn merge_member(pod: &mut Pod, member: &Member) -> MergeOutcome {
        if pod.has_member(member.id) {
            MergeOutcome::Noop
        } else {
            pod.members.push(member.clone());
            MergeOutcome::Applied
        }
    }

    /// Item identity resolution: id first, then product_id. The product
    /// fallback collapses rows the two paths created under different ids
    /// (including re-add after a missed removal) into one.
    fn merge_item(pod: &mut Pod, incoming: &Item) -> MergeOutcome {
        if let Some(existing) = pod.item_mut(incoming.id) {
            if existing == incoming {
                return MergeOutcome::Noop;
            }
            *existing = incoming.clone();
            return MergeOutcome::Applied;
        }
        if let Some(existing) = pod.item_by_product_mut(&incoming.product_id) {
            *existing = incoming.clone();
            return MergeOutcome::Applied;
        }
        pod.items.push(incoming.clone());
        MergeOutcome::Applied
    }

    fn drop_item(pod: &mut Pod, item_id: Uuid) -> MergeOutcome {
        match pod.take_item(item_id) {
            Some(_) => MergeOutcome::Applied,
            None => MergeOutcome::Noop,
        }
    }

    fn count(&mut self, event: &ChangeEvent, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.stats.applied += 1,
            MergeOutcome::Noop => self.stats.duplicates += 1,
            MergeOutcome::Advisory => self.stats.advisories += 1,
            MergeOutcome::UnknownPod => {
                self.stats.unknown_pod += 1;
                log::debug!("Ignoring {} for untracked pod {}", event.kind(), event.pod_id());
            }
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}
