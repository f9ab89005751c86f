//! Approximate Membership Query Filter ([AMQ-Filter](https://en.wikipedia.org/wiki/Approximate_Membership_Query_Filter))
//! based on the classic [quotient filter](https://en.wikipedia.org/wiki/Quotient_filter).
//!
//! This is a small general-purpose AMQ-Filter. It supports approximate membership testing like
//! a bloom filter, but additionally supports deletions, merging two filters and iterating over
//! the stored fingerprints. There are no false negatives (for fingerprints that weren't removed)
//! and the false positive rate is bounded by the remainder size.
//!
//! The filter consumes caller supplied 64-bit hashes and only ever looks at their low `q + r`
//! bits, so callers are free to pick any hash function (or to store raw fingerprints directly).
//!
//! ### Example
//!
//! ```rust
//! let mut f = quotient_filter::Filter::new(16, 10).unwrap();
//! for hash in 0..1000u64 {
//!     f.insert(hash).unwrap();
//! }
//! for hash in 0..1000u64 {
//!     assert!(f.contains(hash));
//! }
//! ```
//!
//! ### Sizing
//!
//! `q` sets the capacity (`2^q` slots, usable up to a 95% load factor) and `r` sets the
//! remainder width. Each slot takes `r + 3` bits. The false positive rate of a filter kept
//! below its load factor cap is approximately `2^-r`.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::cmp::Ordering;
use std::num::NonZeroU8;

#[cfg(feature = "jsonschema")]
use schemars::JsonSchema;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Approximate Membership Query Filter (AMQ-Filter) based on the classic quotient filter.
///
/// The filter is a compact open-addressing hash table storing `r`-bit remainders plus 3 metadata
/// bits per slot. A fingerprint is the low `q + r` bits of a caller supplied hash, split into a
/// `q`-bit quotient (the canonical slot index) and an `r`-bit remainder. All fingerprints sharing
/// a quotient are stored as a contiguous *run* sorted by remainder; runs displaced by collisions
/// form *clusters*. See the [quotient filter Wikipedia page](https://en.wikipedia.org/wiki/Quotient_filter)
/// for a description of the scheme.
///
/// Unlike a bloom filter the quotient filter supports removal and merging.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "jsonschema", derive(JsonSchema))]
pub struct Filter {
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "b",
            serialize_with = "serde_bytes::serialize",
            deserialize_with = "serde_bytes::deserialize"
        )
    )]
    buffer: Box<[u8]>,
    #[cfg_attr(feature = "serde", serde(rename = "l"))]
    len: u64,
    #[cfg_attr(feature = "serde", serde(rename = "q"))]
    qbits: NonZeroU8,
    #[cfg_attr(feature = "serde", serde(rename = "r"))]
    rbits: NonZeroU8,
}

/// Largest supported remainder width. A slot holds the remainder plus 3 metadata
/// bits and must fit in a single `u64`.
const MAX_RBITS: u8 = 61;

const OCCUPIED: u64 = 1;
const CONTINUATION: u64 = 1 << 1;
const SHIFTED: u64 = 1 << 2;
const FLAGS: u64 = OCCUPIED | CONTINUATION | SHIFTED;

#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// `q` or `r` is zero, `q + r` exceeds 64 or `r` exceeds 61
    InvalidParameters,
    /// The filter cannot fit another fingerprint
    CapacityExceeded,
    /// The hash passed to `remove` has bits set above position `q + r - 1`
    FingerprintTooLarge,
    /// The table for the requested parameters doesn't fit the address space
    CapacityTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

/// Accessors for the 3 metadata flags and the remainder packed in a table slot.
///
/// Slot layout (low to high): `occupied` (bit 0), `continuation` (bit 1), `shifted` (bit 2),
/// remainder (bits `3..3+r`).
trait SlotExt: Sized {
    fn is_occupied(&self) -> bool;
    fn set_occupied(self) -> Self;
    fn clr_occupied(self) -> Self;
    fn is_continuation(&self) -> bool;
    fn set_continuation(self) -> Self;
    fn clr_continuation(self) -> Self;
    fn is_shifted(&self) -> bool;
    fn set_shifted(self) -> Self;
    fn clr_shifted(self) -> Self;
    fn remainder(&self) -> u64;
    /// None of the three flags set, the slot was never used and isn't part of any cluster.
    fn is_empty_slot(&self) -> bool;
    /// First slot of a cluster.
    fn is_cluster_start(&self) -> bool;
    /// First slot of some run, whether or not displaced.
    fn is_run_start(&self) -> bool;
}

impl SlotExt for u64 {
    #[inline]
    fn is_occupied(&self) -> bool {
        *self & OCCUPIED != 0
    }

    #[inline]
    fn set_occupied(self) -> Self {
        self | OCCUPIED
    }

    #[inline]
    fn clr_occupied(self) -> Self {
        self & !OCCUPIED
    }

    #[inline]
    fn is_continuation(&self) -> bool {
        *self & CONTINUATION != 0
    }

    #[inline]
    fn set_continuation(self) -> Self {
        self | CONTINUATION
    }

    #[inline]
    fn clr_continuation(self) -> Self {
        self & !CONTINUATION
    }

    #[inline]
    fn is_shifted(&self) -> bool {
        *self & SHIFTED != 0
    }

    #[inline]
    fn set_shifted(self) -> Self {
        self | SHIFTED
    }

    #[inline]
    fn clr_shifted(self) -> Self {
        self & !SHIFTED
    }

    #[inline]
    fn remainder(&self) -> u64 {
        self >> 3
    }

    #[inline]
    fn is_empty_slot(&self) -> bool {
        *self & FLAGS == 0
    }

    #[inline]
    fn is_cluster_start(&self) -> bool {
        *self & FLAGS == OCCUPIED
    }

    #[inline]
    fn is_run_start(&self) -> bool {
        !self.is_continuation() && (self.is_occupied() || self.is_shifted())
    }
}

/// An iterator over the fingerprints of a `Filter`.
///
/// Yields full `(q + r)`-bit fingerprints, `(quotient << r) | remainder`. Traversal is
/// cluster by cluster, run by run, ascending remainder within a run.
pub struct FingerprintIter<'a> {
    filter: &'a Filter,
    index: u64,
    quotient: u64,
    visited: u64,
}

impl<'a> FingerprintIter<'a> {
    fn new(filter: &'a Filter) -> Self {
        let mut index = 0;
        if !filter.is_empty() {
            // Traversal starts at a cluster start so the quotient tracking below
            // never sees a partial cluster. At least one exists while len != 0
            // because the table is never 100% full.
            while !filter.get_elem(index).is_cluster_start() {
                index += 1;
            }
        }
        FingerprintIter {
            filter,
            index,
            quotient: index,
            visited: 0,
        }
    }
}

impl Iterator for FingerprintIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.visited >= self.filter.len {
            return None;
        }
        loop {
            let elt = self.filter.get_elem(self.index);
            if elt.is_cluster_start() {
                self.quotient = self.index;
            } else if elt.is_run_start() {
                // New run within the cluster, advance to the next occupied canonical slot.
                let mut quot = self.quotient;
                loop {
                    quot = self.filter.incr(quot);
                    if self.filter.get_elem(quot).is_occupied() {
                        break;
                    }
                }
                self.quotient = quot;
            }
            self.index = self.filter.incr(self.index);
            if !elt.is_empty_slot() {
                self.visited += 1;
                return Some((self.quotient << self.filter.rbits.get()) | elt.remainder());
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.filter.len - self.visited) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FingerprintIter<'_> {}

impl Filter {
    /// Creates a new filter with `2^q` slots storing `r`-bit remainders.
    ///
    /// Increasing `r` improves the filter's accuracy but uses more space.
    ///
    /// Errors if `q == 0`, `r == 0`, `q + r > 64` or `r > 61`.
    pub fn new(q: u8, r: u8) -> Result<Self, Error> {
        if q == 0 || r == 0 || q as u32 + r as u32 > 64 || r > MAX_RBITS {
            return Err(Error::InvalidParameters);
        }
        let bytes = usize::try_from(Self::table_bytes(q, r)).map_err(|_| Error::CapacityTooLarge)?;
        let buffer = vec![0u8; bytes].into_boxed_slice();
        Ok(Self {
            buffer,
            len: 0,
            qbits: q.try_into().unwrap(),
            rbits: r.try_into().unwrap(),
        })
    }

    /// Size in bytes of the table buffer a filter with the given parameters allocates,
    /// rounded up to whole 64-bit words. The size of the `Filter` struct itself is not
    /// included.
    ///
    /// Returns 0 for parameters rejected by [`Filter::new`].
    pub fn table_size(q: u8, r: u8) -> usize {
        if q == 0 || r == 0 || q as u32 + r as u32 > 64 || r > MAX_RBITS {
            return 0;
        }
        usize::try_from(Self::table_bytes(q, r)).unwrap_or(0)
    }

    fn table_bytes(q: u8, r: u8) -> u128 {
        let bits = (1u128 << q) * (r as u128 + 3);
        bits.div_ceil(64) * 8
    }

    /// The fingerprint size in bits (`q + r`). Only the lowest `q + r` bits
    /// of hashes passed to the filter are consulted.
    #[inline]
    pub fn fingerprint_size(&self) -> u8 {
        self.qbits.get() + self.rbits.get()
    }

    /// The quotient width in bits (`q`).
    #[inline]
    pub fn quotient_bits(&self) -> u8 {
        self.qbits.get()
    }

    /// The remainder width in bits (`r`).
    #[inline]
    pub fn remainder_bits(&self) -> u8 {
        self.rbits.get()
    }

    /// Whether the filter is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of fingerprints admitted to the filter.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Filter capacity: up to 95% of the `2^q` slots. Inserting past it fails.
    ///
    /// The cap keeps clusters short; probe chains grow unboundedly as occupancy
    /// approaches 100%.
    #[inline]
    pub fn capacity(&self) -> u64 {
        // 19/20 == 0.95
        (self.total_slots() as u128 * 19 / 20) as u64
    }

    /// Max error ratio when at full capacity (`len == capacity`).
    pub fn max_error_ratio(&self) -> f64 {
        2f64.powi(-(self.rbits.get() as i32))
    }

    /// Current error ratio at the current occupancy.
    pub fn current_error_ratio(&self) -> f64 {
        let occupancy = self.len as f64 / self.total_slots() as f64;
        1.0 - std::f64::consts::E.powf(-occupancy / 2f64.powi(self.rbits.get() as i32))
    }

    /// Resets/Clears the filter. No memory is deallocated.
    pub fn clear(&mut self) {
        self.buffer.fill(0);
        self.len = 0;
    }

    #[inline]
    fn total_slots(&self) -> u64 {
        1 << self.qbits.get()
    }

    #[inline]
    fn index_mask(&self) -> u64 {
        (1 << self.qbits.get()) - 1
    }

    #[inline]
    fn rmask(&self) -> u64 {
        (1 << self.rbits.get()) - 1
    }

    #[inline]
    fn elem_bits(&self) -> u32 {
        self.rbits.get() as u32 + 3
    }

    #[inline]
    fn elem_mask(&self) -> u64 {
        u64::MAX >> (64 - self.elem_bits())
    }

    #[inline]
    fn incr(&self, idx: u64) -> u64 {
        (idx + 1) & self.index_mask()
    }

    #[inline]
    fn decr(&self, idx: u64) -> u64 {
        idx.wrapping_sub(1) & self.index_mask()
    }

    #[inline]
    fn calc_qr(&self, hash: u64) -> (u64, u64) {
        let quotient = (hash >> self.rbits.get()) & self.index_mask();
        let remainder = hash & self.rmask();
        (quotient, remainder)
    }

    #[inline]
    fn word(&self, i: usize) -> u64 {
        u64::from_le_bytes(self.buffer[i * 8..][..8].try_into().unwrap())
    }

    #[inline]
    fn set_word(&mut self, i: usize, word: u64) {
        self.buffer[i * 8..][..8].copy_from_slice(&word.to_le_bytes());
    }

    /// Reads the `elem_bits`-wide slot `idx`. The field may straddle two adjacent words.
    #[inline]
    fn get_elem(&self, idx: u64) -> u64 {
        debug_assert!(idx < self.total_slots());
        let bitpos = idx * self.elem_bits() as u64;
        let word_idx = (bitpos / 64) as usize;
        let shift = (bitpos % 64) as u32;
        let mut elt = self.word(word_idx) >> shift;
        if shift + self.elem_bits() > 64 {
            elt |= self.word(word_idx + 1) << (64 - shift);
        }
        elt & self.elem_mask()
    }

    /// Stores the low `elem_bits` of `elt` into slot `idx`.
    #[inline]
    fn set_elem(&mut self, idx: u64, elt: u64) {
        debug_assert!(idx < self.total_slots());
        let elt = elt & self.elem_mask();
        let bitpos = idx * self.elem_bits() as u64;
        let word_idx = (bitpos / 64) as usize;
        let shift = (bitpos % 64) as u32;
        let low = (self.word(word_idx) & !(self.elem_mask() << shift)) | (elt << shift);
        self.set_word(word_idx, low);
        let spill = shift + self.elem_bits();
        if spill > 64 {
            let spillbits = spill - 64;
            let high_mask = !(u64::MAX << spillbits);
            let high = (self.word(word_idx + 1) & !high_mask) | (elt >> (64 - shift));
            self.set_word(word_idx + 1, high);
        }
    }

    /// Returns the slot where the run for quotient `fq` begins. The run may have been
    /// displaced to the right of its canonical slot by probing collisions.
    fn find_run_index(&self, fq: u64) -> u64 {
        // Walk back over shifted slots to the start of the enclosing cluster.
        let mut b = fq;
        while self.get_elem(b).is_shifted() {
            b = self.decr(b);
        }

        // Each occupied canonical slot between the cluster start and fq (exclusive)
        // owns one run; skip that many runs forward.
        let mut s = b;
        while b != fq {
            loop {
                s = self.incr(s);
                if !self.get_elem(s).is_continuation() {
                    break;
                }
            }
            loop {
                b = self.incr(b);
                if self.get_elem(b).is_occupied() {
                    break;
                }
            }
        }
        s
    }

    /// Writes `elt` at slot `s`, shifting the remainder of the cluster one slot to
    /// the right. Occupied bits stay with their canonical slot.
    fn insert_into(&mut self, mut s: u64, elt: u64) {
        let mut curr = elt;
        loop {
            let prev = self.get_elem(s);
            let empty = prev.is_empty_slot();
            let mut prev = prev;
            if !empty {
                prev = prev.set_shifted();
                if prev.is_occupied() {
                    curr = curr.set_occupied();
                    prev = prev.clr_occupied();
                }
            }
            self.set_elem(s, curr);
            curr = prev;
            s = self.incr(s);
            if empty {
                return;
            }
        }
    }

    /// Removes the entry at slot `s` (canonical quotient `quot`), sliding the rest of
    /// the cluster one slot to the left and fixing up metadata of entries that land
    /// back in their canonical slot.
    fn delete_entry(&mut self, mut s: u64, mut quot: u64) {
        let orig = s;
        let mut curr = self.get_elem(s);
        let mut sp = self.incr(s);

        loop {
            let next = self.get_elem(sp);
            let curr_occupied = curr.is_occupied();

            if next.is_empty_slot() || next.is_cluster_start() || sp == orig {
                // End of the cluster, zero out the freed slot.
                self.set_elem(s, 0);
                return;
            }

            let mut updated_next = next;
            if next.is_run_start() {
                // Track the quotient owning the run that's about to slide left.
                loop {
                    quot = self.incr(quot);
                    if self.get_elem(quot).is_occupied() {
                        break;
                    }
                }
                if curr_occupied && quot == s {
                    // The run head slides into its canonical slot.
                    updated_next = updated_next.clr_shifted();
                }
            }

            self.set_elem(
                s,
                if curr_occupied {
                    updated_next.set_occupied()
                } else {
                    updated_next.clr_occupied()
                },
            );
            s = sp;
            sp = self.incr(sp);
            curr = next;
        }
    }

    /// Returns whether the fingerprint of `hash` is present (probabilistically) in the filter.
    ///
    /// May return false positives (roughly `2^-r` likely for a filter near capacity)
    /// but never false negatives for fingerprints that weren't removed.
    pub fn contains(&self, hash: u64) -> bool {
        let (fq, fr) = self.calc_qr(hash);
        if !self.get_elem(fq).is_occupied() {
            return false;
        }
        let mut s = self.find_run_index(fq);
        // Remainders in a run are sorted, stop as soon as we pass fr.
        loop {
            let rem = self.get_elem(s).remainder();
            if rem == fr {
                return true;
            }
            if rem > fr {
                return false;
            }
            s = self.incr(s);
            if !self.get_elem(s).is_continuation() {
                return false;
            }
        }
    }

    /// Inserts the fingerprint of `hash` into the filter.
    /// Only the lowest `q + r` bits of `hash` are consulted.
    ///
    /// Returns `Ok(true)` if the fingerprint was added.
    /// Returns `Ok(false)` if the fingerprint was already present (the filter is unchanged).
    /// Returns `Err(Error::CapacityExceeded)` if the filter is at capacity.
    pub fn insert(&mut self, hash: u64) -> Result<bool, Error> {
        let (fq, fr) = self.calc_qr(hash);
        let t_fq = self.get_elem(fq);
        let mut entry = fr << 3;

        // Empty canonical slot, no cluster covers it.
        if t_fq.is_empty_slot() {
            if self.len >= self.capacity() {
                return Err(Error::CapacityExceeded);
            }
            self.set_elem(fq, entry.set_occupied());
            self.len += 1;
            return Ok(true);
        }

        if t_fq.is_occupied() {
            let start = self.find_run_index(fq);
            let mut s = start;
            // Find the sorted position of fr within the run.
            loop {
                match self.get_elem(s).remainder().cmp(&fr) {
                    Ordering::Equal => return Ok(false),
                    Ordering::Greater => break,
                    Ordering::Less => {}
                }
                s = self.incr(s);
                if !self.get_elem(s).is_continuation() {
                    break;
                }
            }
            if self.len >= self.capacity() {
                return Err(Error::CapacityExceeded);
            }
            if s == start {
                // The old run head becomes a continuation.
                let head = self.get_elem(start);
                self.set_elem(start, head.set_continuation());
            } else {
                entry = entry.set_continuation();
            }
            if s != fq {
                entry = entry.set_shifted();
            }
            self.insert_into(s, entry);
        } else {
            if self.len >= self.capacity() {
                return Err(Error::CapacityExceeded);
            }
            // The slot holds a displaced entry of another run; fq starts a new run
            // after the runs preceding it in the cluster.
            self.set_elem(fq, t_fq.set_occupied());
            let start = self.find_run_index(fq);
            if start != fq {
                entry = entry.set_shifted();
            }
            self.insert_into(start, entry);
        }
        self.len += 1;
        Ok(true)
    }

    /// Removes the fingerprint of `hash` from the filter.
    ///
    /// Returns `Ok(true)` if the fingerprint was found and removed, `Ok(false)` if it
    /// wasn't present (the filter is unchanged) and `Err(Error::FingerprintTooLarge)`
    /// if `hash` has bits set above position `q + r - 1`. The latter is rejected because
    /// such a hash is indistinguishable from any same-fingerprint hash via the table
    /// alone and blindly removing it would corrupt unrelated membership answers.
    ///
    /// Note that removing a fingerprint shared by two distinct keys (a collision within
    /// the retained `q + r` bits) removes it for both, introducing a **false negative**
    /// for the other key. Callers that remove must ensure their hashes carry no more
    /// than `q + r` significant bits.
    pub fn remove(&mut self, hash: u64) -> Result<bool, Error> {
        let bits = self.fingerprint_size();
        if bits < 64 && hash >> bits != 0 {
            return Err(Error::FingerprintTooLarge);
        }

        let (fq, fr) = self.calc_qr(hash);
        let mut t_fq = self.get_elem(fq);
        if !t_fq.is_occupied() || self.len == 0 {
            return Ok(false);
        }

        let start = self.find_run_index(fq);
        let mut s = start;
        // Find the slot holding fr (or conclude it's absent).
        loop {
            match self.get_elem(s).remainder().cmp(&fr) {
                Ordering::Equal => break,
                Ordering::Greater => return Ok(false),
                Ordering::Less => {}
            }
            s = self.incr(s);
            if !self.get_elem(s).is_continuation() {
                return Ok(false);
            }
        }

        let kill = if s == fq { t_fq } else { self.get_elem(s) };
        let replace_run_start = kill.is_run_start();

        if kill.is_run_start() {
            let next = self.get_elem(self.incr(s));
            if !next.is_continuation() {
                // Removing the only member of the run, the canonical slot loses it.
                t_fq = t_fq.clr_occupied();
                self.set_elem(fq, t_fq);
            }
        }

        self.delete_entry(s, fq);

        if replace_run_start {
            let next = self.get_elem(s);
            let mut updated_next = next;
            if updated_next.is_continuation() {
                // The continuation that slid in is the new run head.
                updated_next = updated_next.clr_continuation();
            }
            if s == fq && updated_next.is_run_start() {
                // The new run head sits in its canonical slot.
                updated_next = updated_next.clr_shifted();
            }
            if updated_next != next {
                self.set_elem(s, updated_next);
            }
        }

        self.len -= 1;
        Ok(true)
    }

    /// Merges `self` and `other` into a freshly allocated filter holding the union of
    /// both fingerprint sets.
    ///
    /// The output filter has `q' = max(q1, q2) + 1` and `r' = max(r1, r2)`, i.e. twice
    /// the capacity of the larger input, so merging never fails for capacity reasons.
    /// Each fingerprint is re-expressed in the merged `(q', r')` space; duplicates
    /// collapse.
    ///
    /// Errors if the merged parameters aren't representable (`q' + r' > 64`).
    pub fn merge(&self, other: &Filter) -> Result<Filter, Error> {
        let q = self.qbits.max(other.qbits).get() + 1;
        let r = self.rbits.max(other.rbits).get();
        let mut out = Filter::new(q, r)?;
        for hash in self.fingerprints() {
            out.insert(hash)?;
        }
        for hash in other.fingerprints() {
            out.insert(hash)?;
        }
        Ok(out)
    }

    /// Returns an iterator over the fingerprints stored in the filter.
    ///
    /// Yields each stored `(q + r)`-bit fingerprint exactly once, not the original
    /// 64-bit hashes: bits above `q + r` were never retained. The traversal isn't
    /// restartable mid-way; call `fingerprints()` again to start over.
    pub fn fingerprints(&self) -> FingerprintIter<'_> {
        FingerprintIter::new(self)
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("buffer", &"[..]")
            .field("len", &self.len)
            .field("qbits", &self.qbits)
            .field("rbits", &self.rbits)
            .finish()
    }
}
