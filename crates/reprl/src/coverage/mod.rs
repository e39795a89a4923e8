//! Parent-side coverage engine.
//!
//! Owns the virgin and crash bitmaps and evaluates the live edge bitmap the
//! child wrote into shared memory after every execution.

use std::io;

use tracing::info;

use crate::shmem::{self, MAX_EDGES, SharedMemory};

mod test;

#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    #[error("Failed to set up the shared memory region: {_0}")]
    SharedMemory(#[from] io::Error),
    #[error("The target reported no edges, is its instrumentation working?")]
    NotInstrumented,
    #[error("The target reported {num_edges} edges but the region fits only {MAX_EDGES}")]
    TooManyEdges { num_edges: u32 },
    #[error("Edge hit counts are not being tracked")]
    TrackingDisabled,
    #[error("An edge selection must request at least one edge")]
    EmptySelection,
}

/// A coverage context: the shared region plus the accumulated bitmaps.
///
/// Created before the child is spawned; once the child has registered its
/// edge guards, [`CoverageMap::finish_initialization`] sizes the bitmaps.
#[derive(Debug)]
pub struct CoverageMap {
    shmem: SharedMemory,
    /// Bitmap of edges not yet seen in any non-crashing execution. Starts
    /// all-ones and monotonically loses bits.
    virgin_bits: Vec<u64>,
    /// Same, restricted to crashing executions.
    crash_bits: Vec<u64>,
    /// Per-edge hit counts, kept only when tracking was requested.
    edge_count: Option<Vec<u32>>,
    /// Number of edges the child registered. Guard values are 1-based, so
    /// the bitmaps span `num_edges + 1` bits with bit 0 reserved.
    num_edges: u32,
    /// Bitmap length in 64-bit words.
    bitmap_words: usize,
    /// Total number of edges discovered so far (crash edges excluded).
    found_edges: u64,
}

impl CoverageMap {
    /// Create the shared region for context `id` and map it.
    ///
    /// The child has not run yet, so the bitmaps cannot be sized; call
    /// [`Self::finish_initialization`] once the child has started up.
    pub fn new(id: u32) -> Result<Self, CoverageError> {
        let shmem = SharedMemory::create(id)?;
        Ok(Self::from_region(shmem))
    }

    fn from_region(shmem: SharedMemory) -> Self {
        Self {
            shmem,
            virgin_bits: Vec::new(),
            crash_bits: Vec::new(),
            edge_count: None,
            num_edges: 0,
            bitmap_words: 0,
            found_edges: 0,
        }
    }

    /// Size the bitmaps from the edge count the child wrote during startup.
    ///
    /// With `track_edges` set, a per-edge hit counter array is maintained as
    /// well; evaluation is considerably slower in that mode.
    pub fn finish_initialization(&mut self, track_edges: bool) -> Result<(), CoverageError> {
        let num_edges = self.shmem.num_edges();
        if num_edges == 0 {
            return Err(CoverageError::NotInstrumented);
        }
        // The reserved bit 0 occupies one slot of the region's capacity.
        if num_edges as usize + 1 > MAX_EDGES {
            return Err(CoverageError::TooManyEdges { num_edges });
        }

        // Guard values start at 1, so bit num_edges is in use and bit 0 is
        // reserved. Round up to whole words for the 64-bit scan.
        self.num_edges = num_edges;
        self.bitmap_words = (num_edges as usize + 1).div_ceil(64);
        self.virgin_bits = vec![u64::MAX; self.bitmap_words];
        self.crash_bits = vec![u64::MAX; self.bitmap_words];
        self.virgin_bits[0] &= !1;
        self.crash_bits[0] &= !1;
        self.edge_count = track_edges.then(|| vec![0; num_edges as usize + 1]);
        self.found_edges = 0;

        info!(num_edges, track_edges, "Coverage bitmaps initialized");
        Ok(())
    }

    /// Number of edges the child registered.
    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    /// Total number of edges discovered in non-crashing executions.
    pub fn found_edges(&self) -> u64 {
        self.found_edges
    }

    /// Whether evaluations also maintain per-edge hit counts.
    pub fn tracks_edges(&self) -> bool {
        self.edge_count.is_some()
    }

    /// The key the child must open, communicated via the `SHM_ID` variable.
    pub fn shm_key(&self) -> Option<&str> {
        self.shmem.key()
    }

    /// Number of feedback states the target reported, if it tracks any.
    pub fn num_feedback_states(&self) -> Option<u32> {
        self.shmem.num_feedback_states()
    }

    /// The optimization-tier bitmap, if the target reported any tier.
    pub fn tier_bitmap(&self) -> Option<[u8; shmem::TIER_BITMAP_BYTES]> {
        self.shmem.tier_bitmap()
    }

    /// Scan the live bitmap for edges not seen in any earlier non-crashing
    /// execution. New edge indices are appended to `new_edges` (cleared
    /// first); the vector is caller-owned so repeated evaluations reuse its
    /// allocation. Returns whether anything new was found.
    pub fn evaluate(&mut self, new_edges: &mut Vec<u32>) -> bool {
        new_edges.clear();
        let live = self.shmem.edge_bytes(self.bitmap_words * 8);
        scan_new_edges(live, &mut self.virgin_bits, new_edges);

        // The counting pass cannot use the word-level fast path (it must
        // visit every set bit, new or not), which makes it an order of
        // magnitude slower. It only runs when tracking was requested.
        if let Some(counts) = &mut self.edge_count {
            for (word_index, chunk) in live.chunks_exact(8).enumerate() {
                let word = u64::from_le_bytes(chunk.try_into().expect("an 8-byte chunk"));
                if word == 0 {
                    continue;
                }
                for bit in 0..64 {
                    if word >> bit & 1 == 1 {
                        let index = word_index * 64 + bit;
                        if let Some(count) = counts.get_mut(index) {
                            *count += 1;
                        }
                    }
                }
            }
        }

        self.found_edges += new_edges.len() as u64;
        !new_edges.is_empty()
    }

    /// Scan the live bitmap against the crash bitmap. Returns whether any
    /// edge was covered for the first time in a crashing execution. Hit
    /// counts and the found-edges total are not updated on this path.
    pub fn evaluate_crash(&mut self) -> bool {
        let live = self.shmem.edge_bytes(self.bitmap_words * 8);
        let mut new_edges = Vec::new();
        scan_new_edges(live, &mut self.crash_bits, &mut new_edges);
        !new_edges.is_empty()
    }

    /// Whether every index in `edges` is set in the live bitmap.
    pub fn compare_equal(&self, edges: &[u32]) -> bool {
        let live = self.shmem.edge_bytes(self.bitmap_words * 8);
        edges
            .iter()
            .all(|&index| shmem::edge_bit(live, index as usize))
    }

    /// Zero the live bitmap in shared memory. Virgin and crash bitmaps are
    /// untouched; the child's guards are reset separately on its side.
    pub fn clear_bitmap(&mut self) {
        let words = self.bitmap_words;
        self.shmem.edge_bytes_mut(words * 8).fill(0);
    }

    /// Undo the effect of a previously discovered edge: restore its virgin
    /// bit, zero its hit count, and forget the discovery.
    ///
    /// Panics if `index` was never discovered (its virgin bit is still set).
    pub fn clear_edge_data(&mut self, index: u32) {
        let (word, bit) = (index as usize / 64, index as usize % 64);
        assert_eq!(
            self.virgin_bits[word] >> bit & 1,
            0,
            "edge {index} has not been discovered"
        );
        self.virgin_bits[word] |= 1 << bit;
        if let Some(counts) = &mut self.edge_count {
            counts[index as usize] = 0;
        }
        self.found_edges -= 1;
    }

    /// Restore the context to its freshly initialized state: virgin and
    /// crash bitmaps all-ones (bit 0 cleared), counts zeroed.
    pub fn reset_state(&mut self) {
        self.virgin_bits.fill(u64::MAX);
        self.crash_bits.fill(u64::MAX);
        if !self.virgin_bits.is_empty() {
            self.virgin_bits[0] &= !1;
            self.crash_bits[0] &= !1;
        }
        if let Some(counts) = &mut self.edge_count {
            counts.fill(0);
        }
        self.found_edges = 0;
    }

    /// Select up to `desired` edges with the smallest positive hit counts.
    ///
    /// Each selected edge's counter is pre-biased by `expected_rounds` (the
    /// number of rounds the fuzzer expects to spend on the selection) so the
    /// same edges are not immediately re-selected.
    pub fn least_visited_edges(
        &mut self,
        desired: u64,
        expected_rounds: u64,
    ) -> Result<Vec<u32>, CoverageError> {
        if desired == 0 {
            return Err(CoverageError::EmptySelection);
        }
        let counts = self
            .edge_count
            .as_mut()
            .ok_or(CoverageError::TrackingDisabled)?;

        let mut sorted = counts.clone();
        sorted.sort_unstable();
        let Some(first_nonzero) = sorted.iter().position(|&count| count != 0) else {
            return Ok(Vec::new());
        };

        let picked = &sorted[first_nonzero..(first_nonzero + desired as usize).min(sorted.len())];
        let threshold = *picked.last().expect("picked is non-empty");
        let cardinality = picked.len();

        let mut selected = Vec::with_capacity(cardinality);
        for (index, count) in counts.iter_mut().enumerate() {
            if *count != 0 && *count <= threshold {
                *count = count.saturating_add(expected_rounds.min(u32::MAX as u64) as u32);
                selected.push(index as u32);
                if selected.len() == cardinality {
                    break;
                }
            }
        }
        Ok(selected)
    }

    /// Construct a context over an anonymous region for engine tests.
    #[cfg(test)]
    pub(crate) fn for_testing(num_edges: u32, track_edges: bool) -> Self {
        let mut shmem = SharedMemory::anonymous().expect("anonymous mapping");
        shmem.set_num_edges(num_edges);
        let mut map = Self::from_region(shmem);
        map.finish_initialization(track_edges)
            .expect("test region is within limits");
        map
    }

    /// Set a bit in the live bitmap, standing in for the child's guard trip.
    #[cfg(test)]
    pub(crate) fn set_edge(&mut self, index: u32) {
        let words = self.bitmap_words;
        shmem::set_edge_bit(self.shmem.edge_bytes_mut(words * 8), index as usize);
    }

    #[cfg(test)]
    pub(crate) fn virgin_bits(&self) -> &[u64] {
        &self.virgin_bits
    }

    #[cfg(test)]
    pub(crate) fn edge_count_mut(&mut self) -> Option<&mut Vec<u32>> {
        self.edge_count.as_mut()
    }
}

/// Clear every bit that is set in both `live` and `virgin` and record its
/// index. Words with no overlap are skipped without a per-bit scan.
fn scan_new_edges(live: &[u8], virgin: &mut [u64], new_edges: &mut Vec<u32>) {
    for (word_index, chunk) in live.chunks_exact(8).enumerate() {
        let live_word = u64::from_le_bytes(chunk.try_into().expect("an 8-byte chunk"));
        let new = live_word & virgin[word_index];
        if new == 0 {
            continue;
        }
        for bit in 0..64 {
            if new >> bit & 1 == 1 {
                virgin[word_index] &= !(1 << bit);
                new_edges.push((word_index * 64 + bit) as u32);
            }
        }
    }
}
