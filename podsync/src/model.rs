//! Domain model for shared shopping pods.
//!
//! A *pod* is one collaboratively edited cart: a membership list plus an
//! ordered list of line items. Pods are small (tens of members, hundreds of
//! items), so entities travel whole over the wire and merge by identity
//! rather than by delta.
//!
//! ## Containment
//!
//! ```text
//! Pod
//!  ├── invite_code   (6-char base-36, unique system-wide)
//!  ├── members: Vec<Member>      (owner always present, flagged)
//!  └── items:   Vec<Item>
//!       └── added_by: MemberRef  (denormalized attribution)
//! ```
//!
//! ## Performance Targets
//!
//! | Metric | Target | Reference |
//! |--------|--------|-----------|
//! | Pod encode (bincode) | <2µs @ 100 items | Kleppmann §4 |
//! | Item lookup by product | O(items) linear scan | — |
//! | Invite code generation | <200ns | — |
//!
//! Reference: Kleppmann, Chapter 4 — Encoding and Evolution

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Seconds since the Unix epoch, clamped to zero on clock trouble.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ───────────────────────────────────────────────────────────────────
// Invite codes
// ───────────────────────────────────────────────────────────────────

const INVITE_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Invite codes are 6 base-36 digits (36^6 ≈ 2.2B combinations).
pub const INVITE_CODE_LEN: usize = 6;

/// Derive an invite code from a UUID's 128-bit value.
///
/// Deterministic: the same UUID always yields the same code. Uppercase
/// alphanumeric so codes survive being typed or read aloud.
pub fn invite_code_from_uuid(id: Uuid) -> String {
    let mut value = id.as_u128();
    let mut code = String::with_capacity(INVITE_CODE_LEN);
    for _ in 0..INVITE_CODE_LEN {
        code.push(INVITE_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    code
}

/// Generate a fresh invite code. Uniqueness is enforced by the caller
/// against the live code index, retrying on collision.
pub fn generate_invite_code() -> String {
    invite_code_from_uuid(Uuid::new_v4())
}

/// Canonical form for lookup: codes are stored uppercase, so user-typed
/// input is trimmed and uppercased before matching.
pub fn normalize_invite_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

// ───────────────────────────────────────────────────────────────────
// Members
// ───────────────────────────────────────────────────────────────────

/// Identity handed to us by the external auth layer when a user creates or
/// joins a pod. Identity provisioning itself is out of scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub id: Uuid,
    pub display_name: String,
    pub avatar: String,
}

impl MemberProfile {
    pub fn new(id: Uuid, display_name: String, avatar: String) -> Self {
        Self { id, display_name, avatar }
    }
}

/// Membership record, scoped to one pod. The same person in two pods is two
/// records. Never mutated after insert; removed only by pod deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub display_name: String,
    pub avatar: String,
    pub is_owner: bool,
}

impl Member {
    pub fn from_profile(profile: &MemberProfile, is_owner: bool) -> Self {
        Self {
            id: profile.id,
            display_name: profile.display_name.clone(),
            avatar: profile.avatar.clone(),
            is_owner,
        }
    }
}

/// Attribution snapshot embedded in each item. Denormalized on purpose:
/// an item stays attributed even if the member record is never consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: Uuid,
    pub name: String,
    pub avatar: String,
}

impl MemberRef {
    pub fn from_profile(profile: &MemberProfile) -> Self {
        Self {
            id: profile.id,
            name: profile.display_name.clone(),
            avatar: profile.avatar.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Items
// ───────────────────────────────────────────────────────────────────

/// One line item in a pod's cart.
///
/// `id` is assigned server-side at creation and is never client-generated.
/// `price` is captured at add time and does not track the catalog.
/// `quantity` is always ≥ 1: an item at or below zero quantity does not
/// exist and is deleted instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
    pub added_by: MemberRef,
    pub added_at: u64,
}

impl Item {
    /// New line item with a fresh id and quantity 1.
    pub fn new(product_id: String, name: String, price: f64, added_by: MemberRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            name,
            price,
            quantity: 1,
            added_by,
            added_at: epoch_secs(),
        }
    }

    pub fn line_total(&self) -> f64 {
        self.price * self.quantity as f64
    }
}

// ───────────────────────────────────────────────────────────────────
// Pods
// ───────────────────────────────────────────────────────────────────

/// One shared cart: identity, invite code, membership, items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: Uuid,
    pub name: String,
    pub invite_code: String,
    pub owner_id: Uuid,
    pub created_at: u64,
    pub members: Vec<Member>,
    pub items: Vec<Item>,
}

impl Pod {
    /// Create a pod with the owner as its sole member.
    pub fn new(name: String, owner: &MemberProfile, invite_code: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            invite_code,
            owner_id: owner.id,
            created_at: epoch_secs(),
            members: vec![Member::from_profile(owner, true)],
            items: Vec::new(),
        }
    }

    pub fn has_member(&self, member_id: Uuid) -> bool {
        self.members.iter().any(|m| m.id == member_id)
    }

    pub fn item(&self, item_id: Uuid) -> Option<&Item> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Option<&mut Item> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    /// Live item matching an external catalog reference, if any. Product ids
    /// are unique among a pod's live items, so first match is the match.
    pub fn item_by_product(&self, product_id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.product_id == product_id)
    }

    pub fn item_by_product_mut(&mut self, product_id: &str) -> Option<&mut Item> {
        self.items.iter_mut().find(|i| i.product_id == product_id)
    }

    /// Remove an item by id, returning it if it was present.
    pub fn take_item(&mut self, item_id: Uuid) -> Option<Item> {
        let idx = self.items.iter().position(|i| i.id == item_id)?;
        Some(self.items.remove(idx))
    }

    /// Total units across all line items.
    pub fn total_items(&self) -> u64 {
        self.items.iter().map(|i| i.quantity as u64).sum()
    }

    /// Cart value: Σ price × quantity.
    pub fn total_price(&self) -> f64 {
        self.items.iter().map(|i| i.line_total()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────
