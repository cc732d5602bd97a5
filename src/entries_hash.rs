//! # Entries Hash
//!
//! Maps a peer identifier to `k` distinct slots of a shared clock of width
//! `m`. The mapping is a family of linear hash functions over the hex MD5
//! digest of the identifier, one function per coefficient row:
//!
//! ```text
//! entry(j) = (Σ_n coefficients[j][n] · digest[n]) mod m
//! ```
//!
//! Rows are consumed in order and repeated slots are skipped until `k`
//! distinct slots are found. `m` is the smallest prime not below the group
//! size estimate `r`. The coefficient table is drawn once by the founder of
//! a group and handed verbatim to every joiner, so all members agree on the
//! slots of every identifier.
//!
//! ## Row Exhaustion
//!
//! A generated table has `2k` rows. Should all of them be consumed before `k`
//! distinct slots appear, rows are reused in a second cycle with the cycle
//! number added to each sum, which keeps the mapping deterministic and always
//! terminates because `k ≤ m`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use md5::{Digest, Md5};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Length of the hex MD5 digest each row is applied to.
pub const DIGEST_HEX_LEN: usize = 32;

/// Coefficients per row when none is configured.
pub const DEFAULT_KEY_SIZE: usize = 32;

/// Upper bound on the group size estimate `r`.
/// SECURITY: Every broadcast carries a clock of width `m ≥ r`; this keeps
/// per-message metadata and received tables bounded.
pub const MAX_GROUP_BOUND: u64 = 65_536;

/// Smallest prime not below [`MAX_GROUP_BOUND`]; the largest admissible `m`.
pub const MAX_MODULUS: u64 = 65_537;

/// Upper bound on slots per peer.
/// SECURITY: Bounds the coefficient table (`2k` rows) accepted from a peer.
pub const MAX_ENTRIES: usize = 64;

// ============================================================================
// Prime Calculator
// ============================================================================

/// Smallest prime greater than or equal to `bound`.
///
/// Incremental sieve of Eratosthenes: every integer from 2 upward is visited
/// once; each discovered prime schedules its next multiple, so the sieve
/// needs no upper limit.
pub fn next_prime(bound: u64) -> u64 {
    let mut multiples: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut candidate = 2u64;
    loop {
        match multiples.remove(&candidate) {
            Some(factors) => {
                for p in factors {
                    multiples.entry(candidate + p).or_default().push(p);
                }
            }
            None => {
                if candidate >= bound {
                    return candidate;
                }
                multiples.insert(candidate * candidate, vec![candidate]);
            }
        }
        candidate += 1;
    }
}

fn is_prime(n: u64) -> bool {
    n >= 2 && next_prime(n) == n
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons hash parameters are refused at generation or reception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashParamsError {
    /// `k` is zero, above [`MAX_ENTRIES`], or larger than `m`.
    InvalidEntryCount { k: usize, m: u64 },
    /// `r` is below 2 or above [`MAX_GROUP_BOUND`].
    InvalidGroupBound(u64),
    /// Received modulus is not a prime within bounds.
    InvalidModulus(u64),
    /// Coefficient table is empty or has more than `2k` rows.
    RowCount(usize),
    /// A row is shorter than the digest.
    RowLength { row: usize, len: usize },
    /// A coefficient is not in `[0, m)`.
    CoefficientOutOfRange { row: usize, value: u64 },
}

impl fmt::Display for HashParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEntryCount { k, m } => {
                write!(f, "entry count {k} must be in 1..={} and not exceed m = {m}", MAX_ENTRIES)
            }
            Self::InvalidGroupBound(r) => {
                write!(f, "group bound {r} must be in 2..={}", MAX_GROUP_BOUND)
            }
            Self::InvalidModulus(m) => write!(f, "modulus {m} is not an admissible prime"),
            Self::RowCount(n) => write!(f, "coefficient table has an invalid row count ({n})"),
            Self::RowLength { row, len } => {
                write!(f, "coefficient row {row} has {len} values, need {}", DIGEST_HEX_LEN)
            }
            Self::CoefficientOutOfRange { row, value } => {
                write!(f, "coefficient {value} in row {row} is not below the modulus")
            }
        }
    }
}

impl std::error::Error for HashParamsError {}

// ============================================================================
// EntriesHash
// ============================================================================

/// Shared slot assignment for one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntriesHashRecord")]
pub struct EntriesHash {
    coefficients: Vec<Vec<u64>>,
    k: usize,
    m: u64,
}

#[derive(Deserialize)]
struct EntriesHashRecord {
    coefficients: Vec<Vec<u64>>,
    k: usize,
    m: u64,
}

impl TryFrom<EntriesHashRecord> for EntriesHash {
    type Error = HashParamsError;

    fn try_from(record: EntriesHashRecord) -> Result<Self, Self::Error> {
        EntriesHash::from_parts(record.coefficients, record.k, record.m)
    }
}

impl EntriesHash {
    /// Rebuilds a hash from parameters received from another member.
    pub fn from_parts(
        coefficients: Vec<Vec<u64>>,
        k: usize,
        m: u64,
    ) -> Result<Self, HashParamsError> {
        if m > MAX_MODULUS || !is_prime(m) {
            return Err(HashParamsError::InvalidModulus(m));
        }
        if k == 0 || k > MAX_ENTRIES || k as u64 > m {
            return Err(HashParamsError::InvalidEntryCount { k, m });
        }
        if coefficients.is_empty() || coefficients.len() > 2 * k {
            return Err(HashParamsError::RowCount(coefficients.len()));
        }
        for (row, values) in coefficients.iter().enumerate() {
            if values.len() < DIGEST_HEX_LEN {
                return Err(HashParamsError::RowLength {
                    row,
                    len: values.len(),
                });
            }
            if let Some(&value) = values.iter().find(|&&v| v >= m) {
                return Err(HashParamsError::CoefficientOutOfRange { row, value });
            }
        }
        Ok(Self { coefficients, k, m })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> u64 {
        self.m
    }

    /// Width of the clocks built from this hash.
    pub fn width(&self) -> usize {
        self.m as usize
    }

    pub fn coefficients(&self) -> &[Vec<u64>] {
        &self.coefficients
    }

    /// The `k` distinct slots of `id`, ascending.
    pub fn hash(&self, id: &str) -> Vec<usize> {
        let digest = hex::encode(Md5::digest(id.as_bytes()));
        let digest = digest.as_bytes();
        let rows = self.coefficients.len();

        let mut slots = BTreeSet::new();
        let mut j = 0usize;
        while slots.len() < self.k {
            let row = &self.coefficients[j % rows];
            let cycle = (j / rows) as u64;
            let sum: u64 = row
                .iter()
                .zip(digest)
                .map(|(&a, &c)| a * u64::from(c))
                .sum();
            slots.insert(((sum + cycle) % self.m) as usize);
            j += 1;
        }
        slots.into_iter().collect()
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Draws fresh coefficient tables for new groups.
#[derive(Clone, Debug)]
pub struct EntriesHashGenerator {
    key_size: usize,
}

impl Default for EntriesHashGenerator {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_KEY_SIZE,
        }
    }
}

impl EntriesHashGenerator {
    /// Key sizes below the digest length are raised to it.
    pub fn with_key_size(key_size: usize) -> Self {
        Self {
            key_size: key_size.max(DIGEST_HEX_LEN),
        }
    }

    /// Builds `2k` rows of uniform coefficients in `[0, next_prime(r))`.
    pub fn generate(&self, r: u64, k: usize) -> Result<EntriesHash, HashParamsError> {
        if !(2..=MAX_GROUP_BOUND).contains(&r) {
            return Err(HashParamsError::InvalidGroupBound(r));
        }
        let m = next_prime(r);
        if k == 0 || k > MAX_ENTRIES || k as u64 > m {
            return Err(HashParamsError::InvalidEntryCount { k, m });
        }

        let mut rng = rand::thread_rng();
        let coefficients = (0..2 * k)
            .map(|_| (0..self.key_size).map(|_| rng.gen_range(0..m)).collect())
            .collect();

        Ok(EntriesHash { coefficients, k, m })
    }
}
