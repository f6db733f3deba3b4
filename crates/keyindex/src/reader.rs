use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::format::{decode_offset, IndexHeader, HEADER_BYTES};
use crate::{hex, IndexError};

/// Default bound on same-hash slots inspected by one lookup.
pub const DEFAULT_MAX_PROBES: usize = 32;

/// Outcome of an index lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLookup {
    /// Distinct block offsets that may hold the key, in slot order.
    Offsets(Vec<u64>),
    /// The index explicitly records that no key with this hash survives.
    Absent,
    /// No slot carries this hash.
    NotPresent,
    /// The hash run is longer than the probe bound; the index cannot say
    /// whether the key is here.
    Overflow,
}

/// Value half of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotValue {
    Offset(u64),
    Absent,
}

/// A borrowed view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    pub hash: &'a [u8],
    pub value: SlotValue,
}

/// Read-only, in-memory view of an index file.
///
/// [`open`](IndexReader::open) loads the slot array into memory after
/// checking the header and that the body is a whole number of slots. A file
/// that fails those checks is rejected with [`IndexError::Corrupt`] and never
/// partially served.
///
/// Lookups take `&self` and are safe to call from many threads.
pub struct IndexReader {
    path: PathBuf,
    header: IndexHeader,
    /// Raw slot bytes, `num_slots * slot_width` long.
    slots: Vec<u8>,
    num_slots: usize,
    max_probes: usize,
    /// Lookups that gave up because a hash run exceeded `max_probes`.
    collision_overflows: AtomicU64,
    closed: bool,
}

impl std::fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("num_slots", &self.num_slots)
            .field("max_probes", &self.max_probes)
            .field("closed", &self.closed)
            .finish()
    }
}

impl IndexReader {
    /// Opens an index file and loads its slots.
    ///
    /// # Errors
    ///
    /// [`IndexError::Corrupt`] if the file is shorter than the header, the
    /// magic, flags, hash size or offset width are invalid, or the body is
    /// not an integral multiple of the slot width.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)?;
        let filesize = f.metadata()?.len();

        let corrupt = |reason: String| IndexError::Corrupt {
            path: path.clone(),
            reason,
        };

        if filesize < HEADER_BYTES {
            return Err(corrupt(format!("file too small for header ({} bytes)", filesize)));
        }
        let header = IndexHeader::read_from(&mut f)?.map_err(corrupt)?;

        let body_len = filesize - HEADER_BYTES;
        let width = header.slot_width() as u64;
        if body_len % width != 0 {
            return Err(corrupt(format!(
                "body of {} bytes is not a multiple of the {}-byte slot width",
                body_len, width
            )));
        }

        let mut slots = vec![0u8; body_len as usize];
        f.read_exact(&mut slots)?;

        Ok(Self {
            path,
            header,
            slots,
            num_slots: (body_len / width) as usize,
            max_probes: DEFAULT_MAX_PROBES,
            collision_overflows: AtomicU64::new(0),
            closed: false,
        })
    }

    /// Sets the bound on same-hash slots inspected per lookup.
    #[must_use]
    pub fn with_max_probes(mut self, max_probes: usize) -> Self {
        self.max_probes = max_probes.max(1);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> IndexHeader {
        self.header
    }

    #[must_use]
    pub fn hash_size(&self) -> usize {
        usize::from(self.header.hash_size)
    }

    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.header.is_delta
    }

    /// Number of slots in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_slots
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_slots == 0
    }

    /// Lookups that returned `NotPresent` because a same-hash run was longer
    /// than the probe bound. A rising count means the domain's hash size is
    /// too small for its key count.
    #[must_use]
    pub fn collision_overflows(&self) -> u64 {
        self.collision_overflows.load(Ordering::Relaxed)
    }

    fn slot_hash(&self, i: usize) -> &[u8] {
        let start = i * self.header.slot_width();
        &self.slots[start..start + self.hash_size()]
    }

    fn slot_value(&self, i: usize) -> SlotValue {
        let start = i * self.header.slot_width() + self.hash_size();
        let end = (i + 1) * self.header.slot_width();
        let raw = decode_offset(&self.slots[start..end]);
        if raw == self.header.absent() {
            SlotValue::Absent
        } else {
            SlotValue::Offset(raw)
        }
    }

    /// Index of the first slot whose hash is `>= hash`.
    fn lower_bound(&self, hash: &[u8]) -> usize {
        let (mut lo, mut hi) = (0usize, self.num_slots);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.slot_hash(mid) < hash {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Looks up a truncated key hash.
    ///
    /// Binary-searches for the first slot carrying `hash` and collects the
    /// adjacent same-hash slots. Consecutive duplicate offsets (colliding
    /// keys stored in the same block) are folded into one candidate. When the
    /// run is longer than the probe bound the lookup reports `Overflow` and
    /// bumps [`collision_overflows`](IndexReader::collision_overflows).
    ///
    /// # Errors
    ///
    /// [`IndexError::HashSize`] if `hash` has the wrong length,
    /// [`IndexError::Closed`] after [`close`](IndexReader::close).
    pub fn lookup(&self, hash: &[u8]) -> Result<IndexLookup, IndexError> {
        if self.closed {
            return Err(IndexError::Closed);
        }
        if hash.len() != self.hash_size() {
            return Err(IndexError::HashSize {
                expected: self.hash_size(),
                actual: hash.len(),
            });
        }

        let first = self.lower_bound(hash);
        let mut offsets: Vec<u64> = Vec::new();
        let mut probes = 0usize;
        let mut i = first;

        while i < self.num_slots && self.slot_hash(i) == hash {
            probes += 1;
            if probes > self.max_probes {
                self.collision_overflows.fetch_add(1, Ordering::Relaxed);
                debug!(
                    path = %self.path.display(),
                    hash = %hex(hash),
                    max_probes = self.max_probes,
                    "hash run exceeds probe bound"
                );
                return Ok(IndexLookup::Overflow);
            }
            match self.slot_value(i) {
                SlotValue::Absent => return Ok(IndexLookup::Absent),
                SlotValue::Offset(o) => {
                    if offsets.last() != Some(&o) {
                        offsets.push(o);
                    }
                }
            }
            i += 1;
        }

        if offsets.is_empty() {
            Ok(IndexLookup::NotPresent)
        } else {
            Ok(IndexLookup::Offsets(offsets))
        }
    }

    /// Iterates over all slots in file order.
    pub fn slots(&self) -> impl Iterator<Item = Slot<'_>> + '_ {
        (0..self.num_slots).map(move |i| Slot {
            hash: self.slot_hash(i),
            value: self.slot_value(i),
        })
    }

    /// Iterates over the hashes carrying an ABSENT marker, ascending.
    pub fn absent_hashes(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.slots()
            .filter(|s| s.value == SlotValue::Absent)
            .map(|s| s.hash)
    }

    /// Full structural check of the slot array.
    ///
    /// Verifies ascending hash order, that ABSENT only appears in delta
    /// indexes and never shares a hash with another slot, and (when
    /// `data_end` is given) that every offset points before it.
    pub fn verify(&self, data_end: Option<u64>) -> Result<(), IndexError> {
        let corrupt = |reason: String| IndexError::Corrupt {
            path: self.path.clone(),
            reason,
        };

        let mut prev: Option<Slot<'_>> = None;
        for (i, slot) in self.slots().enumerate() {
            if let SlotValue::Offset(o) = slot.value {
                if let Some(end) = data_end {
                    if o >= end {
                        return Err(corrupt(format!(
                            "slot {} offset {} is past the end of the log ({})",
                            i, o, end
                        )));
                    }
                }
            } else if !self.header.is_delta {
                return Err(corrupt(format!("slot {} is ABSENT in a base index", i)));
            }

            if let Some(p) = prev {
                if slot.hash < p.hash {
                    return Err(corrupt(format!("slot {} breaks ascending hash order", i)));
                }
                let either_absent =
                    slot.value == SlotValue::Absent || p.value == SlotValue::Absent;
                if slot.hash == p.hash && either_absent {
                    return Err(corrupt(format!("slot {} mixes ABSENT into a hash run", i)));
                }
            }
            prev = Some(slot);
        }
        Ok(())
    }

    /// Releases the in-memory slot array. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.slots = Vec::new();
            self.num_slots = 0;
        }
    }
}
