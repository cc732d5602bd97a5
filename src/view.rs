//! # Partial Membership View
//!
//! A [`View`] is the bounded sample of peers a node currently knows about,
//! each tagged with an age counting gossip rounds since the entry was last
//! refreshed by its origin. Views are immutable: every operation returns a
//! new view, so a gossip round always works on a consistent snapshot.
//!
//! ## Oldest Selection
//!
//! [`View::oldest_item`] returns the first descriptor whose age is strictly
//! greater than every age before it, starting from zero. A view in which all
//! ages are zero therefore has no oldest item, and operations built on it
//! (`move_oldest_items`, `remove_oldest_items`) leave such a view untouched.
//! A freshly populated view is never trimmed by the heal stage.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::identity::PeerAddr;

/// Maximum number of descriptors a view holds after a merge.
pub const DEFAULT_MAX_VIEW_SIZE: usize = 10;

// ============================================================================
// PeerDescriptor
// ============================================================================

/// A peer address plus the number of rounds since it was last refreshed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub host: String,
    pub port: u16,
    pub age: u32,
}

impl PeerDescriptor {
    pub fn new(host: impl Into<String>, port: u16, age: u32) -> Self {
        Self {
            host: host.into(),
            port,
            age,
        }
    }

    /// Descriptor a peer advertises for itself.
    pub fn fresh(addr: &PeerAddr) -> Self {
        Self::new(addr.host.clone(), addr.port, 0)
    }

    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }

    /// True when both descriptors designate the same peer, whatever their age.
    pub fn same_peer(&self, other: &PeerAddr) -> bool {
        self.host == other.host && self.port == other.port
    }
}

// ============================================================================
// View
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct View(Vec<PeerDescriptor>);

impl From<Vec<PeerDescriptor>> for View {
    fn from(descriptors: Vec<PeerDescriptor>) -> Self {
        Self(descriptors)
    }
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PeerDescriptor> {
        self.0.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerDescriptor> {
        self.0.iter()
    }

    pub fn descriptors(&self) -> &[PeerDescriptor] {
        &self.0
    }

    pub fn into_descriptors(self) -> Vec<PeerDescriptor> {
        self.0
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.0.iter().any(|d| d.same_peer(addr))
    }

    pub fn push(&self, descriptor: Option<PeerDescriptor>) -> View {
        let mut next = self.0.clone();
        next.extend(descriptor);
        View(next)
    }

    pub fn push_all(&self, descriptors: &[PeerDescriptor]) -> View {
        let mut next = self.0.clone();
        next.extend_from_slice(descriptors);
        View(next)
    }

    /// Removes `n` consecutive descriptors starting at `index`, clamped to the
    /// end of the view.
    pub fn remove(&self, n: usize, index: usize) -> View {
        let mut next = self.0.clone();
        let start = index.min(next.len());
        let end = start.saturating_add(n).min(next.len());
        next.drain(start..end);
        View(next)
    }

    pub fn remove_first(&self) -> View {
        self.remove(1, 0)
    }

    /// Shuffles by `len²` random pairwise swaps.
    pub fn permute(&self) -> View {
        let mut next = self.0.clone();
        let len = next.len();
        if len > 1 {
            let mut rng = rand::thread_rng();
            for _ in 0..len * len {
                let a = rng.gen_range(0..len);
                let b = rng.gen_range(0..len);
                next.swap(a, b);
            }
        }
        View(next)
    }

    pub fn increase_age(&self) -> View {
        View(
            self.0
                .iter()
                .map(|d| PeerDescriptor::new(d.host.clone(), d.port, d.age.saturating_add(1)))
                .collect(),
        )
    }

    /// Index of the first descriptor with the greatest strictly positive age.
    pub fn oldest_item(&self) -> Option<usize> {
        View::oldest_in(&self.0)
    }

    /// Moves the `n` oldest descriptors to the tail. The oldest one ends last.
    pub fn move_oldest_items(&self, n: usize) -> View {
        let mut rest = self.0.clone();
        let mut moved = Vec::new();
        for _ in 0..n.min(rest.len()) {
            let Some(idx) = View::oldest_in(&rest) else {
                break;
            };
            moved.insert(0, rest.remove(idx));
        }
        rest.extend(moved);
        View(rest)
    }

    /// Keeps one descriptor per peer: the youngest, first occurrence on ties.
    pub fn remove_duplicates(&self) -> View {
        let mut freshest: HashMap<(&str, u16), u32> = HashMap::new();
        for d in &self.0 {
            freshest
                .entry((d.host.as_str(), d.port))
                .and_modify(|age| *age = (*age).min(d.age))
                .or_insert(d.age);
        }

        let mut kept = Vec::with_capacity(freshest.len());
        for d in &self.0 {
            let key = (d.host.as_str(), d.port);
            if freshest.get(&key) == Some(&d.age) {
                freshest.remove(&key);
                kept.push(d.clone());
            }
        }
        View(kept)
    }

    pub fn remove_oldest_items(&self, n: usize) -> View {
        let mut next = self.0.clone();
        for _ in 0..n.min(next.len()) {
            let Some(idx) = View::oldest_in(&next) else {
                break;
            };
            next.remove(idx);
        }
        View(next)
    }

    pub fn remove_head(&self, n: usize) -> View {
        self.remove(n, 0)
    }

    pub fn remove_at_random(&self, n: usize) -> View {
        let mut next = self.0.clone();
        let mut rng = rand::thread_rng();
        for _ in 0..n.min(next.len()) {
            let idx = rng.gen_range(0..next.len());
            next.remove(idx);
        }
        View(next)
    }

    fn oldest_in(descriptors: &[PeerDescriptor]) -> Option<usize> {
        let mut max_age = 0;
        let mut oldest = None;
        for (idx, d) in descriptors.iter().enumerate() {
            if d.age > max_age {
                max_age = d.age;
                oldest = Some(idx);
            }
        }
        oldest
    }
}
