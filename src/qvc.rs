//! # Quasi Vector Clock
//!
//! A causal clock compressed into `m` shared counters. Each peer owns the `k`
//! slots its identifier hashes to (see [`crate::entries_hash`]); several
//! peers may own the same slot, so comparisons are a conservative
//! approximation of the exact vector clock order.
//!
//! Owned slots are stored as a fixed-size bit set of width `m`.
//!
//! ## Wire Form
//!
//! ```json
//! {"clocks": [0, 1, 0, ...], "entries": {"3": 3, "17": 17}}
//! ```
//!
//! Decoding rejects entries outside the clock and keys that disagree with
//! their values.

use std::collections::BTreeMap;
use std::fmt;

use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::entries_hash::MAX_MODULUS;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// Width is zero or above the largest admissible modulus.
    InvalidWidth(usize),
    /// An owned slot lies outside the clock.
    EntryOutOfRange { entry: usize, width: usize },
    /// An `entries` key is not the decimal form of its value.
    MalformedEntry(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWidth(w) => write!(f, "clock width {w} is out of bounds"),
            Self::EntryOutOfRange { entry, width } => {
                write!(f, "entry {entry} outside clock of width {width}")
            }
            Self::MalformedEntry(key) => write!(f, "malformed clock entry {key:?}"),
        }
    }
}

impl std::error::Error for ClockError {}

// ============================================================================
// QuasiVectorClock
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ClockRecord", try_from = "ClockRecord")]
pub struct QuasiVectorClock {
    clocks: Vec<u64>,
    entries: BitVec,
}

impl QuasiVectorClock {
    /// All-zero clock of `width` counters owning `entries`.
    pub fn new(width: usize, entries: &[usize]) -> Result<Self, ClockError> {
        Self::from_parts(vec![0; width], entries)
    }

    fn from_parts(clocks: Vec<u64>, entries: &[usize]) -> Result<Self, ClockError> {
        let width = clocks.len();
        if width == 0 || width as u64 > MAX_MODULUS {
            return Err(ClockError::InvalidWidth(width));
        }
        let mut owned = BitVec::repeat(false, width);
        for &entry in entries {
            if entry >= width {
                return Err(ClockError::EntryOutOfRange { entry, width });
            }
            owned.set(entry, true);
        }
        Ok(Self {
            clocks,
            entries: owned,
        })
    }

    pub fn width(&self) -> usize {
        self.clocks.len()
    }

    pub fn clocks(&self) -> &[u64] {
        &self.clocks
    }

    /// Owned slots, ascending.
    pub fn entries(&self) -> Vec<usize> {
        self.entries.iter_ones().collect()
    }

    pub fn owns(&self, slot: usize) -> bool {
        self.entries.get(slot).is_some_and(|b| *b)
    }

    /// Records a local event on every owned slot.
    pub fn increment(&mut self) {
        for slot in self.entries.iter_ones() {
            self.clocks[slot] += 1;
        }
    }

    /// Records delivery of a message stamped by `other`.
    pub fn increment_from(&mut self, other: &QuasiVectorClock) {
        for slot in other.entries.iter_ones() {
            if let Some(c) = self.clocks.get_mut(slot) {
                *c += 1;
            }
        }
    }

    /// True when a message stamped with `self` can be delivered at a peer
    /// whose clock is `reference`: dominated everywhere except that owned
    /// slots may lead by one.
    pub fn is_causally_ready(&self, reference: &QuasiVectorClock) -> bool {
        if self.width() != reference.width() {
            return false;
        }
        self.clocks
            .iter()
            .zip(&reference.clocks)
            .enumerate()
            .all(|(i, (&mine, &theirs))| {
                if self.entries[i] {
                    mine.saturating_sub(1) <= theirs
                } else {
                    mine <= theirs
                }
            })
    }

    /// Strictly below `other` on every owned slot.
    pub fn is_inferior(&self, other: &QuasiVectorClock) -> bool {
        self.compare_owned(other, |a, b| a < b)
    }

    /// Below or equal to `other` on every owned slot.
    pub fn is_inferior_or_equal(&self, other: &QuasiVectorClock) -> bool {
        self.compare_owned(other, |a, b| a <= b)
    }

    fn compare_owned(&self, other: &QuasiVectorClock, cmp: impl Fn(u64, u64) -> bool) -> bool {
        self.entries
            .iter_ones()
            .all(|slot| other.clocks.get(slot).is_some_and(|&theirs| cmp(self.clocks[slot], theirs)))
    }
}

// ============================================================================
// Wire Record
// ============================================================================

#[derive(Serialize, Deserialize)]
struct ClockRecord {
    clocks: Vec<u64>,
    entries: BTreeMap<String, usize>,
}

impl From<QuasiVectorClock> for ClockRecord {
    fn from(qvc: QuasiVectorClock) -> Self {
        let entries = qvc
            .entries
            .iter_ones()
            .map(|slot| (slot.to_string(), slot))
            .collect();
        Self {
            clocks: qvc.clocks,
            entries,
        }
    }
}

impl TryFrom<ClockRecord> for QuasiVectorClock {
    type Error = ClockError;

    fn try_from(record: ClockRecord) -> Result<Self, Self::Error> {
        let mut slots = Vec::with_capacity(record.entries.len());
        for (key, value) in record.entries {
            if key.parse::<usize>().ok() != Some(value) {
                return Err(ClockError::MalformedEntry(key));
            }
            slots.push(value);
        }
        Self::from_parts(record.clocks, &slots)
    }
}
