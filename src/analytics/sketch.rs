//! HyperLogLog cardinality sketch used for unique-visitor estimates
//!
//! Registers start out sparse (an ordered index -> rank map) and switch to a
//! dense byte array once more than a quarter of them are populated. Both the
//! in-memory representation and the serialized encoding are a pure function
//! of the register contents, so two sketches that saw the same set of keys
//! serialize to identical bytes regardless of insertion order.
//!
//! Serialized layout (little endian):
//!
//! ```text
//! [magic 'T'][version 1][precision][encoding]
//!   encoding 0 (sparse): [u32 count] count x [u16 index][u8 rank], index strictly increasing
//!   encoding 1 (dense):  2^precision rank bytes
//! ```

use siphasher::sip::SipHasher13;
use std::collections::BTreeMap;
use std::hash::Hasher;
use thiserror::Error;

/// Precision used for every sketch produced by the rollup buffer (16384 registers).
pub const DEFAULT_PRECISION: u8 = 14;
pub const MIN_PRECISION: u8 = 4;
/// Sparse indexes are stored as `u16`.
pub const MAX_PRECISION: u8 = 16;

const MAGIC: u8 = b'T';
const FORMAT_VERSION: u8 = 1;
const ENCODING_SPARSE: u8 = 0;
const ENCODING_DENSE: u8 = 1;
const HEADER_LEN: usize = 4;
const SPARSE_COUNT_LEN: usize = 4;
const SPARSE_ENTRY_LEN: usize = 3;

// Persisted sketches depend on these never changing.
const HASH_KEY_0: u64 = 0x7461_6c6c_795f_686c;
const HASH_KEY_1: u64 = 0x6c5f_7632_5f73_6970;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SketchError {
    #[error("sketch payload has {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },
    #[error("not a sketch (magic byte {0:#04x})")]
    BadMagic(u8),
    #[error("unsupported sketch format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown sketch encoding {0}")]
    UnknownEncoding(u8),
    #[error("invalid sketch precision {0}")]
    InvalidPrecision(u8),
    #[error("cannot merge a precision {other} sketch into a precision {ours} sketch")]
    PrecisionMismatch { ours: u8, other: u8 },
    #[error("corrupt register at index {index}")]
    CorruptRegister { index: usize },
    #[error("sparse sketch entries are not strictly ordered")]
    Unsorted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Registers {
    Sparse(BTreeMap<u16, u8>),
    Dense(Box<[u8]>),
}

/// Fixed-memory approximate distinct counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardinalitySketch {
    precision: u8,
    registers: Registers,
}

impl CardinalitySketch {
    /// Create an empty sketch with the default precision
    pub fn new() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            registers: Registers::Sparse(BTreeMap::new()),
        }
    }

    /// Create an empty sketch with an explicit precision
    pub fn with_precision(precision: u8) -> Result<Self, SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(SketchError::InvalidPrecision(precision));
        }
        Ok(Self {
            precision,
            registers: Registers::Sparse(BTreeMap::new()),
        })
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Add a key. Adding a key that was already seen never changes the sketch.
    pub fn add(&mut self, key: impl AsRef<[u8]>) {
        let hash = hash_key(key.as_ref());
        let p = u32::from(self.precision);
        let index = (hash >> (64 - p)) as usize;
        // Guard bit caps the rank at 65 - p.
        let remainder = (hash << p) | (1u64 << (p - 1));
        let rank = (remainder.leading_zeros() + 1) as u8;
        self.raise(index, rank);
        self.promote();
    }

    /// Estimated number of distinct keys added
    pub fn estimate(&self) -> u64 {
        let m = self.register_count() as f64;
        let (sum, zeros) = match &self.registers {
            Registers::Sparse(map) => {
                let zeros = self.register_count() - map.len();
                let sum = zeros as f64 + map.values().map(|&rank| inverse_pow2(rank)).sum::<f64>();
                (sum, zeros)
            }
            Registers::Dense(regs) => regs.iter().fold((0.0, 0usize), |(sum, zeros), &rank| {
                (sum + inverse_pow2(rank), zeros + usize::from(rank == 0))
            }),
        };

        let raw = alpha(self.register_count()) * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // Linear counting is far more accurate while registers are still empty.
            m * (m / zeros as f64).ln()
        } else {
            raw
        };

        estimate.round() as u64
    }

    /// True if no key was ever added
    pub fn is_empty(&self) -> bool {
        match &self.registers {
            Registers::Sparse(map) => map.is_empty(),
            Registers::Dense(regs) => regs.iter().all(|&rank| rank == 0),
        }
    }

    /// Union `other` into this sketch. On error `self` is left unchanged.
    pub fn merge(&mut self, other: &CardinalitySketch) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return Err(SketchError::PrecisionMismatch {
                ours: self.precision,
                other: other.precision,
            });
        }

        match &other.registers {
            Registers::Sparse(theirs) => {
                for (&index, &rank) in theirs {
                    self.raise(usize::from(index), rank);
                }
            }
            Registers::Dense(theirs) => {
                self.densify();
                if let Registers::Dense(ours) = &mut self.registers {
                    for (ours, &theirs) in ours.iter_mut().zip(theirs.iter()) {
                        if theirs > *ours {
                            *ours = theirs;
                        }
                    }
                }
            }
        }

        self.promote();
        Ok(())
    }

    /// Union a serialized sketch into this one. Malformed input is rejected
    /// and leaves `self` unchanged.
    pub fn merge_bytes(&mut self, bytes: &[u8]) -> Result<(), SketchError> {
        let other = Self::from_bytes(bytes)?;
        self.merge(&other)
    }

    /// Serialize to the stable wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![MAGIC, FORMAT_VERSION, self.precision];
        match &self.registers {
            Registers::Sparse(map) => {
                out.reserve(SPARSE_COUNT_LEN + map.len() * SPARSE_ENTRY_LEN + 1);
                out.push(ENCODING_SPARSE);
                out.extend_from_slice(&(map.len() as u32).to_le_bytes());
                for (&index, &rank) in map {
                    out.extend_from_slice(&index.to_le_bytes());
                    out.push(rank);
                }
            }
            Registers::Dense(regs) => {
                out.reserve(regs.len() + 1);
                out.push(ENCODING_DENSE);
                out.extend_from_slice(regs);
            }
        }
        out
    }

    /// Deserialize a sketch produced by [`CardinalitySketch::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SketchError> {
        if bytes.len() < HEADER_LEN {
            return Err(SketchError::BadLength {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let (header, body) = bytes.split_at(HEADER_LEN);
        if header[0] != MAGIC {
            return Err(SketchError::BadMagic(header[0]));
        }
        if header[1] != FORMAT_VERSION {
            return Err(SketchError::UnsupportedVersion(header[1]));
        }

        let mut sketch = Self::with_precision(header[2])?;
        let registers = sketch.register_count();
        let max_rank = sketch.max_rank();

        sketch.registers = match header[3] {
            ENCODING_SPARSE => {
                if body.len() < SPARSE_COUNT_LEN {
                    return Err(SketchError::BadLength {
                        expected: HEADER_LEN + SPARSE_COUNT_LEN,
                        actual: bytes.len(),
                    });
                }
                let (count, entries) = body.split_at(SPARSE_COUNT_LEN);
                let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize;
                let expected = count
                    .checked_mul(SPARSE_ENTRY_LEN)
                    .and_then(|len| len.checked_add(HEADER_LEN + SPARSE_COUNT_LEN))
                    .unwrap_or(usize::MAX);
                if bytes.len() != expected {
                    return Err(SketchError::BadLength {
                        expected,
                        actual: bytes.len(),
                    });
                }

                let mut map = BTreeMap::new();
                let mut previous: Option<u16> = None;
                for entry in entries.chunks_exact(SPARSE_ENTRY_LEN) {
                    let index = u16::from_le_bytes([entry[0], entry[1]]);
                    let rank = entry[2];
                    if usize::from(index) >= registers || rank == 0 || rank > max_rank {
                        return Err(SketchError::CorruptRegister {
                            index: usize::from(index),
                        });
                    }
                    if previous.is_some_and(|prev| index <= prev) {
                        return Err(SketchError::Unsorted);
                    }
                    previous = Some(index);
                    map.insert(index, rank);
                }
                Registers::Sparse(map)
            }
            ENCODING_DENSE => {
                if body.len() != registers {
                    return Err(SketchError::BadLength {
                        expected: HEADER_LEN + registers,
                        actual: bytes.len(),
                    });
                }
                if let Some(index) = body.iter().position(|&rank| rank > max_rank) {
                    return Err(SketchError::CorruptRegister { index });
                }
                Registers::Dense(body.to_vec().into_boxed_slice())
            }
            other => return Err(SketchError::UnknownEncoding(other)),
        };

        sketch.normalize();
        Ok(sketch)
    }

    fn register_count(&self) -> usize {
        1usize << self.precision
    }

    fn max_rank(&self) -> u8 {
        65 - self.precision
    }

    fn sparse_limit(&self) -> usize {
        self.register_count() / 4
    }

    fn raise(&mut self, index: usize, rank: u8) {
        match &mut self.registers {
            Registers::Sparse(map) => {
                // index < 2^precision <= 2^16
                let slot = map.entry(index as u16).or_insert(0);
                if rank > *slot {
                    *slot = rank;
                }
            }
            Registers::Dense(regs) => {
                if rank > regs[index] {
                    regs[index] = rank;
                }
            }
        }
    }

    fn densify(&mut self) {
        if let Registers::Sparse(map) = &self.registers {
            let mut dense = vec![0u8; self.register_count()];
            for (&index, &rank) in map {
                dense[usize::from(index)] = rank;
            }
            self.registers = Registers::Dense(dense.into_boxed_slice());
        }
    }

    /// Switch to dense once the sparse map outgrows `sparse_limit`. Adding and
    /// merging never clear a register, so this is the only transition they need.
    fn promote(&mut self) {
        if matches!(&self.registers, Registers::Sparse(map) if map.len() > self.sparse_limit()) {
            self.densify();
        }
    }

    /// Make the representation canonical: sparse iff at most `sparse_limit`
    /// registers are populated.
    fn normalize(&mut self) {
        let limit = self.sparse_limit();
        match &self.registers {
            Registers::Sparse(map) if map.len() > limit => self.densify(),
            Registers::Dense(regs) => {
                let populated = regs.iter().filter(|&&rank| rank != 0).count();
                if populated <= limit {
                    let map = regs
                        .iter()
                        .enumerate()
                        .filter(|(_, &rank)| rank != 0)
                        .map(|(index, &rank)| (index as u16, rank))
                        .collect();
                    self.registers = Registers::Sparse(map);
                }
            }
            Registers::Sparse(_) => {}
        }
    }
}

impl Default for CardinalitySketch {
    fn default() -> Self {
        Self::new()
    }
}

/// Union many serialized sketches into one.
///
/// Malformed payloads are skipped; the number skipped is returned alongside
/// the merged sketch.
pub fn union_serialized<'a, I>(sketches: I) -> (CardinalitySketch, usize)
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut merged = CardinalitySketch::new();
    let mut skipped = 0;
    for bytes in sketches {
        if merged.merge_bytes(bytes).is_err() {
            skipped += 1;
        }
    }
    (merged, skipped)
}

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
    hasher.write(key);
    hasher.finish()
}

fn inverse_pow2(rank: u8) -> f64 {
    2f64.powi(-i32::from(rank))
}

fn alpha(registers: usize) -> f64 {
    match registers {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        m => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}
