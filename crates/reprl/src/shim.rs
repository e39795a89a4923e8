//! Child-side sanitizer-coverage hooks.
//!
//! Link this module into the target binary (feature `shim`) to satisfy the
//! callbacks emitted by `-fsanitize-coverage=trace-pc-guard`-style
//! instrumentation. The callbacks have no user-data pointer, so the state is
//! a process singleton: one guard range, one shared region, initialized
//! exactly once.

use std::env;
use std::fs::File;
use std::mem;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use memmap2::MmapOptions;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;

use crate::shmem::{EDGES_OFFSET, MAX_EDGES, SHM_ENV_VAR, SHM_SIZE, ShmemHeader};

static EDGES_START: AtomicPtr<u32> = AtomicPtr::new(ptr::null_mut());
static EDGES_STOP: AtomicPtr<u32> = AtomicPtr::new(ptr::null_mut());
static SHMEM: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());

fn open_region() -> *mut u8 {
    match env::var(SHM_ENV_VAR) {
        Ok(key) => {
            let fd = shm_open(key.as_str(), OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)
                .unwrap_or_else(|err| {
                    eprintln!("[cov] Failed to open shared memory region {key}: {err}");
                    process::exit(255);
                });
            let file = File::from(fd);
            // SAFETY: The region was created by the harness with exactly
            //         SHM_SIZE bytes and is only shared with it.
            let mapping = unsafe { MmapOptions::new().len(SHM_SIZE).map_mut(&file) }
                .unwrap_or_else(|err| {
                    eprintln!("[cov] Failed to map shared memory region {key}: {err}");
                    process::exit(255);
                });
            // The region lives for the rest of the process.
            Box::leak(Box::new(mapping)).as_mut_ptr()
        }
        Err(_) => {
            eprintln!("[cov] No shared memory bitmap available, tracking locally");
            Box::leak(vec![0u8; SHM_SIZE].into_boxed_slice()).as_mut_ptr()
        }
    }
}

/// Called by the instrumentation once per module with the module's guard
/// range. A single module is supported; a second init with a different
/// range aborts the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    // An already-numbered range means this module was initialized before.
    if start == stop || unsafe { *start } != 0 {
        return;
    }

    if !EDGES_START.load(Ordering::Relaxed).is_null()
        || !EDGES_STOP.load(Ordering::Relaxed).is_null()
    {
        eprintln!("[cov] Coverage instrumentation is only supported for a single module");
        process::exit(255);
    }
    EDGES_START.store(start, Ordering::Relaxed);
    EDGES_STOP.store(stop, Ordering::Relaxed);

    let shmem = open_region();
    SHMEM.store(shmem, Ordering::Relaxed);

    reset_edgeguards();

    // SAFETY: The guard range is valid for the lifetime of the module and
    //         the header lies within the SHM_SIZE-byte region.
    unsafe {
        let num_edges = stop.offset_from(start) as u32;
        let header = shmem.add(mem::offset_of!(ShmemHeader, num_edges)) as *mut u32;
        ptr::write_volatile(header, num_edges);
    }
}

/// Called on every edge trip. Records the edge and disables the guard until
/// the next [`reset_edgeguards`].
///
/// Two threads may race on the same guard: the slower one then reads index
/// 0, which is reserved and ignored by the harness.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    // Guards are zero until initialization has numbered them.
    let index = unsafe { *guard };
    if index == 0 {
        return;
    }
    let shmem = SHMEM.load(Ordering::Relaxed);
    // SAFETY: Initialization has run (the guard carried a nonzero index),
    //         and index stays below MAX_EDGES by construction.
    unsafe {
        let byte = shmem.add(EDGES_OFFSET + index as usize / 8);
        *byte |= 1 << (index % 8);
        *guard = 0;
    }
}

/// Reassign guard values 1..N so already-covered edges register again.
/// Called by the target between executions; the bitmap itself is cleared
/// from the harness side.
pub fn reset_edgeguards() {
    let start = EDGES_START.load(Ordering::Relaxed);
    let stop = EDGES_STOP.load(Ordering::Relaxed);
    if start.is_null() {
        return;
    }
    let mut index = 0u32;
    let mut guard = start;
    while guard < stop && (index as usize) < MAX_EDGES {
        index += 1;
        // SAFETY: `guard` stays within the module's guard range.
        unsafe {
            ptr::write(guard, index);
            guard = guard.add(1);
        }
    }
}

#[cfg(test)]
fn live_edge_bit(index: usize) -> bool {
    let shmem = SHMEM.load(Ordering::Relaxed);
    assert!(!shmem.is_null());
    // SAFETY: The region is SHM_SIZE bytes and index is in range.
    let byte = unsafe { *shmem.add(EDGES_OFFSET + index / 8) };
    byte >> (index % 8) & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    // The hooks are a process singleton, so everything lives in one test.
    #[test]
    fn guards_are_numbered_tripped_and_reset() {
        // SAFETY: No other thread reads the environment at this point.
        unsafe { env::remove_var(SHM_ENV_VAR) };

        let mut guards = [0u32; 8];
        let range = guards.as_mut_ptr_range();
        unsafe { __sanitizer_cov_trace_pc_guard_init(range.start, range.end) };
        assert_eq!(guards, [1, 2, 3, 4, 5, 6, 7, 8]);

        // A second init call for the same (already numbered) range is a
        // no-op rather than an error.
        let range = guards.as_mut_ptr_range();
        unsafe { __sanitizer_cov_trace_pc_guard_init(range.start, range.end) };
        assert_eq!(guards[0], 1);

        unsafe { __sanitizer_cov_trace_pc_guard(&mut guards[2]) };
        assert_eq!(guards[2], 0);
        assert!(live_edge_bit(3));
        assert!(!live_edge_bit(2));

        // A trip of a cleared guard is the benign race case and records
        // nothing.
        unsafe { __sanitizer_cov_trace_pc_guard(&mut guards[2]) };

        reset_edgeguards();
        assert_eq!(guards, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
