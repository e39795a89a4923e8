//! Layout of the shared coverage region.
//!
//! The region is a single memory mapping shared between the harness and the
//! instrumented child. The child's instrumentation writes the header and the
//! edge bitmap; the harness only ever reads them (and zeroes the bitmap
//! between executions). Both sides derive the bitmap offset from the same
//! `#[repr(C)]` header so they cannot disagree about where the edges start.

use std::fs::File;
use std::io;
use std::mem;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::getpid;
use static_assertions::const_assert_eq;

/// Size of the shared coverage region in bytes.
pub const SHM_SIZE: usize = 0x200000;

/// Name of the environment variable through which the region's key is
/// communicated to the child process.
pub const SHM_ENV_VAR: &str = "SHM_ID";

/// Width of the optimization-tier bitmap carried in the header.
pub const TIER_BITMAP_BYTES: usize = 8;

/// Header of the shared region, written by the child's instrumentation on
/// startup. The edge bitmap follows immediately after.
#[repr(C)]
#[derive(Debug)]
pub struct ShmemHeader {
    /// Total number of edge guards the child registered.
    pub num_edges: u32,
    /// Number of feedback states the target reported, if it tracks any.
    pub num_feedback_states: u32,
    /// One bit per optimization tier the target entered, if it reports tiers.
    pub tier_bitmap: [u8; TIER_BITMAP_BYTES],
    /// Start of the packed edge bitmap. Bit `i` is set when edge `i` executed
    /// since the last reset; bit 0 is reserved and always ignored.
    pub edges: [u8; 0],
}

/// Byte offset of the edge bitmap within the region.
pub const EDGES_OFFSET: usize = mem::offset_of!(ShmemHeader, edges);

/// Maximum number of edges the bitmap can represent.
pub const MAX_EDGES: usize = (SHM_SIZE - EDGES_OFFSET) * 8;

// The bitmap is scanned in 64-bit words, so it must start on a word boundary.
const_assert_eq!(EDGES_OFFSET % 8, 0);
const_assert_eq!(EDGES_OFFSET, mem::size_of::<ShmemHeader>());

/// Test whether bit `index` is set. Bit order within a byte is
/// `byte[i / 8] >> (i % 8) & 1`.
pub(crate) fn edge_bit(bits: &[u8], index: usize) -> bool {
    (bits[index / 8] >> (index % 8)) & 1 == 1
}

pub(crate) fn set_edge_bit(bits: &mut [u8], index: usize) {
    bits[index / 8] |= 1 << (index % 8);
}

/// The parent-side handle to the shared coverage region.
pub struct SharedMemory {
    /// Name of the POSIX shared memory object, unlinked on drop. `None` for
    /// the anonymous regions used by tests.
    key: Option<String>,
    mapping: MmapMut,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("key", &self.key())
            .field("num_edges", &self.num_edges())
            .finish()
    }
}

impl SharedMemory {
    /// Create and map the shared region for the coverage context `id`.
    ///
    /// The key is derived from the harness pid and the context id so that
    /// multiple contexts in one process get distinct regions.
    pub fn create(id: u32) -> Result<Self, io::Error> {
        let key = format!("shm_id_{}_{}", getpid(), id);
        let fd = shm_open(
            key.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(io::Error::from)?;
        let file = File::from(fd);
        file.set_len(SHM_SIZE as u64)?;
        // SAFETY: The region is private to this harness/child pair and the
        //         mapping outlives every borrow handed out by this type.
        let mapping = unsafe { MmapOptions::new().len(SHM_SIZE).map_mut(&file) }?;

        let mut shmem = Self {
            key: Some(key),
            mapping,
        };
        // A region re-created under a key left over from a crashed run may
        // hold stale data. The child re-writes num_edges on startup.
        shmem.mapping[..EDGES_OFFSET].fill(0);
        Ok(shmem)
    }

    /// Map an anonymous region with the same layout, for tests that exercise
    /// the coverage engine without a child process.
    #[cfg(test)]
    pub(crate) fn anonymous() -> Result<Self, io::Error> {
        let mapping = MmapOptions::new().len(SHM_SIZE).map_anon()?;
        Ok(Self { key: None, mapping })
    }

    /// The key the child must pass to `shm_open`, or `None` for anonymous
    /// test regions.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Number of edges the child registered, as written into the header.
    pub fn num_edges(&self) -> u32 {
        self.header_u32(mem::offset_of!(ShmemHeader, num_edges))
    }

    /// Number of feedback states the target reported, if any.
    pub fn num_feedback_states(&self) -> Option<u32> {
        match self.header_u32(mem::offset_of!(ShmemHeader, num_feedback_states)) {
            0 => None,
            n => Some(n),
        }
    }

    /// The optimization-tier bitmap, if the target reported any tier.
    pub fn tier_bitmap(&self) -> Option<[u8; TIER_BITMAP_BYTES]> {
        let offset = mem::offset_of!(ShmemHeader, tier_bitmap);
        let mut tiers = [0; TIER_BITMAP_BYTES];
        tiers.copy_from_slice(&self.mapping[offset..offset + TIER_BITMAP_BYTES]);
        if tiers == [0; TIER_BITMAP_BYTES] {
            None
        } else {
            Some(tiers)
        }
    }

    fn header_u32(&self, offset: usize) -> u32 {
        let bytes = self.mapping[offset..offset + 4]
            .try_into()
            .expect("a 4-byte header slice");
        u32::from_le_bytes(bytes)
    }

    /// The first `len` bytes of the edge bitmap.
    pub(crate) fn edge_bytes(&self, len: usize) -> &[u8] {
        &self.mapping[EDGES_OFFSET..EDGES_OFFSET + len]
    }

    pub(crate) fn edge_bytes_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.mapping[EDGES_OFFSET..EDGES_OFFSET + len]
    }

    #[cfg(test)]
    pub(crate) fn set_num_edges(&mut self, num_edges: u32) {
        let offset = mem::offset_of!(ShmemHeader, num_edges);
        self.mapping[offset..offset + 4].copy_from_slice(&num_edges.to_le_bytes());
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Some(key) = &self.key {
            if let Err(err) = shm_unlink(key.as_str()) {
                tracing::warn!(%key, %err, "Failed to unlink shared memory region");
            }
        }
    }
}
