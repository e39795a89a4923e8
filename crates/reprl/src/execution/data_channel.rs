use std::fs::File;
use std::io::{self, Seek};
use std::os::fd::{AsRawFd, RawFd};

use memmap2::{MmapMut, MmapOptions};

/// Maximum size for data transferred through REPRL, and in particular the
/// maximum size of a script. Executing a 16 MiB script will almost certainly
/// blow the timeout first, so the limit is not a problem in practice.
pub const REPRL_MAX_DATA_SIZE: usize = 16 << 20;

/// A unidirectional channel for bulk data between harness and child.
///
/// Backed by a RAM-backed file of fixed size which is mapped here and whose
/// descriptor is inherited by the child at a well-known number. The writer
/// seeks to zero before writing; the reader reads up to the current file
/// position. The harness side goes through the mapping, so only the child
/// moves the (shared) file offset.
pub(crate) struct DataChannel {
    file: File,
    mapping: MmapMut,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

impl DataChannel {
    pub(crate) fn new() -> io::Result<Self> {
        // An anonymous (unlinked) temporary file; nothing but the harness
        // and the child ever sees it.
        let file = tempfile::tempfile()?;
        file.set_len(REPRL_MAX_DATA_SIZE as u64)?;
        // SAFETY: The backing file is anonymous and only shared with the
        //         child process, which never remaps or truncates it.
        let mapping = unsafe {
            MmapOptions::new()
                .len(REPRL_MAX_DATA_SIZE)
                .map_mut(&file)
        }?;
        Ok(Self { file, mapping })
    }

    /// The descriptor the child inherits (after a dup2 to its fixed number).
    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Reset the shared file offset so the child can simply read(2) or
    /// write(2) on its descriptor.
    pub(crate) fn rewind(&mut self) -> io::Result<()> {
        self.file.rewind()
    }

    /// Clamp the backing file back to its fixed size. A child writing past
    /// the mapping would otherwise grow the file.
    pub(crate) fn ensure_size(&self) -> io::Result<()> {
        self.file.set_len(REPRL_MAX_DATA_SIZE as u64)
    }

    /// Copy `data` to the start of the channel. The caller has checked the
    /// size limit.
    pub(crate) fn write_contents(&mut self, data: &[u8]) {
        self.mapping[..data.len()].copy_from_slice(data);
    }

    /// The bytes the child wrote since the last rewind: everything up to the
    /// shared file position, capped at one byte below the channel size.
    pub(crate) fn contents(&mut self) -> io::Result<&[u8]> {
        let position = self.file.stream_position()? as usize;
        let len = position.min(REPRL_MAX_DATA_SIZE - 1);
        Ok(&self.mapping[..len])
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom, Write};

    use super::{DataChannel, REPRL_MAX_DATA_SIZE};

    #[test]
    fn contents_track_the_file_position() {
        let mut channel = DataChannel::new().expect("data channel");
        assert_eq!(channel.contents().expect("fetch"), b"");

        // Writing through the descriptor moves the shared offset, just as
        // the child's write(2) would.
        channel.file.write_all(b"fuzzer output").expect("write");
        assert_eq!(channel.contents().expect("fetch"), b"fuzzer output");

        channel.rewind().expect("rewind");
        assert_eq!(channel.contents().expect("fetch"), b"");
    }

    #[test]
    fn harness_writes_do_not_move_the_offset() {
        let mut channel = DataChannel::new().expect("data channel");
        channel.write_contents(b"script");
        assert_eq!(channel.contents().expect("fetch"), b"");
        assert_eq!(&channel.mapping[..6], b"script");
    }

    #[test]
    fn contents_are_capped_below_the_channel_size() {
        let mut channel = DataChannel::new().expect("data channel");
        channel
            .file
            .seek(SeekFrom::Start(REPRL_MAX_DATA_SIZE as u64 + 4096))
            .expect("seek");
        let len = channel.contents().expect("fetch").len();
        assert_eq!(len, REPRL_MAX_DATA_SIZE - 1);
    }
}
