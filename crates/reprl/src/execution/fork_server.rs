//! Forkserver execution of fuzzer inputs.
//!
//! Instead of one long-lived REPRL child, a forkserver target runs a small
//! supervisor loop (see [`serve`]) after its usual startup and JIT warmup.
//! Each input then executes in a grandchild forked from that warm template,
//! so every run gets a fresh address space without paying the process setup
//! cost again.

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{self, Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, fork};
use os_pipe::{PipeReader, PipeWriter};
use tracing::debug;

use super::{dup2_raw_fd, kill_and_reap, reserve_child_fds, wait_readable};

// Well-known file descriptor numbers on the forkserver side. Like the REPRL
// descriptors, these are ABI with the target and must not be changed.
const CHILD_CTRL_IN: RawFd = 137;
const CHILD_CTRL_OUT: RawFd = 138;
const CHILD_OUTPUT: RawFd = 139;

#[derive(Debug, thiserror::Error)]
pub enum ForkserverError {
    #[error("Failed to set up the forkserver pipes: {_0}")]
    Setup(#[source] io::Error),
    #[error("Failed to spawn the forkserver process: {_0}")]
    Spawn(#[source] io::Error),
    #[error("Failed to communicate with the forkserver: {_0}")]
    Communication(#[source] io::Error),
    #[error("Received an invalid HELO message from the forkserver: {received:?}")]
    InvalidHandshake { received: [u8; 4] },
    #[error("The forkserver reported an invalid pid {pid}")]
    InvalidPid { pid: i32 },
}

/// The result of one forkserver spawn.
#[derive(Debug)]
pub struct SpawnResult {
    /// Pid of the grandchild that executed the input.
    pub pid: i32,
    /// The raw `waitpid` status the supervisor observed for the grandchild.
    pub status: i32,
    /// Everything the grandchild wrote to the output descriptor.
    pub output: Vec<u8>,
    /// Wall-clock time from the fork request to the status report.
    pub exec_time: Duration,
}

impl SpawnResult {
    /// The exit code, when the grandchild exited normally.
    pub fn exit_status(&self) -> Option<i32> {
        libc::WIFEXITED(self.status).then(|| libc::WEXITSTATUS(self.status))
    }

    /// The terminating signal, when the grandchild was killed by one.
    pub fn term_sig(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.status).then(|| libc::WTERMSIG(self.status))
    }
}

/// Parent-side handle to a running forkserver target.
#[derive(Debug)]
pub struct Forkserver {
    pid: Pid,
    rx: PipeReader,
    tx: PipeWriter,
    output: PipeReader,
}

impl Forkserver {
    /// Launch the target and complete the startup handshake.
    ///
    /// `envs` entries are added on top of the inherited environment.
    pub fn spinup(argv: &[String], envs: &[(String, String)]) -> Result<Self, ForkserverError> {
        let program = argv.first().ok_or_else(|| {
            ForkserverError::Spawn(io::Error::other(
                "argv must contain at least the program path",
            ))
        })?;
        reserve_child_fds(&[CHILD_CTRL_IN, CHILD_CTRL_OUT, CHILD_OUTPUT])
            .map_err(ForkserverError::Setup)?;

        let (rx, child_tx) = os_pipe::pipe().map_err(ForkserverError::Setup)?;
        let (child_rx, tx) = os_pipe::pipe().map_err(ForkserverError::Setup)?;
        let (output, child_output) = os_pipe::pipe().map_err(ForkserverError::Setup)?;

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .envs(envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let bind_child_fds = {
            let child_rx_fd = child_rx.as_raw_fd();
            let child_tx_fd = child_tx.as_raw_fd();
            let child_output_fd = child_output.as_raw_fd();
            let harness_fds = [rx.as_raw_fd(), tx.as_raw_fd(), output.as_raw_fd()];
            move || {
                use nix::unistd::close;
                dup2_raw_fd(child_rx_fd, CHILD_CTRL_IN)?;
                dup2_raw_fd(child_tx_fd, CHILD_CTRL_OUT)?;
                dup2_raw_fd(child_output_fd, CHILD_OUTPUT)?;
                for fd in [child_rx_fd, child_tx_fd, child_output_fd] {
                    close(fd).map_err(io::Error::from)?;
                }
                for fd in harness_fds {
                    close(fd).map_err(io::Error::from)?;
                }
                Ok(())
            }
        };
        // SAFETY: The closure only performs async-signal-safe syscalls on
        //         captured raw descriptors.
        unsafe { command.pre_exec(bind_child_fds) };

        let child = command.spawn().map_err(ForkserverError::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(child_rx);
        drop(child_tx);
        drop(child_output);
        debug!(%pid, "Spawned forkserver");

        let mut server = Self {
            pid,
            rx,
            tx,
            output,
        };
        let mut helo = [0u8; 4];
        if let Err(err) = server.rx.read_exact(&mut helo) {
            return Err(ForkserverError::Communication(err));
        }
        if &helo != b"HELO" {
            return Err(ForkserverError::InvalidHandshake { received: helo });
        }
        server
            .tx
            .write_all(&helo)
            .map_err(ForkserverError::Communication)?;

        Ok(server)
    }

    /// Fork one grandchild, wait for its completion, and return the result.
    ///
    /// A grandchild still running after `timeout` is SIGKILLed; the reported
    /// status then carries the terminating signal.
    pub fn spawn(&mut self, timeout: Duration) -> Result<SpawnResult, ForkserverError> {
        let start = Instant::now();

        self.tx
            .write_all(b"fork")
            .map_err(ForkserverError::Communication)?;

        let mut buf = [0u8; 4];
        self.rx
            .read_exact(&mut buf)
            .map_err(ForkserverError::Communication)?;
        let pid = i32::from_le_bytes(buf);
        if pid <= 0 {
            return Err(ForkserverError::InvalidPid { pid });
        }

        // SAFETY: The descriptor stays open for the lifetime of `self`.
        let rx_fd = unsafe { BorrowedFd::borrow_raw(self.rx.as_raw_fd()) };
        let ready = wait_readable(rx_fd, timeout)
            .map_err(|err| ForkserverError::Communication(io::Error::from(err)))?;
        if !ready {
            debug!(pid, ?timeout, "Grandchild timed out, killing it");
            // The supervisor reaps the grandchild and reports the status.
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    return Err(ForkserverError::Communication(io::Error::from(err)));
                }
            }
        }

        self.rx
            .read_exact(&mut buf)
            .map_err(ForkserverError::Communication)?;
        let status = i32::from_le_bytes(buf);

        let output = self.drain_output()?;

        Ok(SpawnResult {
            pid,
            status,
            output,
            exec_time: start.elapsed(),
        })
    }

    /// Read whatever the grandchild wrote to the output pipe. The supervisor
    /// keeps its write end open across spawns, so the drain stops once no
    /// more data is immediately available instead of waiting for EOF.
    fn drain_output(&mut self) -> Result<Vec<u8>, ForkserverError> {
        let mut buffer = Vec::with_capacity(0x1000);
        let mut chunk = [0u8; 0x1000];
        loop {
            // SAFETY: The descriptor stays open for the lifetime of `self`.
            let output_fd = unsafe { BorrowedFd::borrow_raw(self.output.as_raw_fd()) };
            match wait_readable(output_fd, Duration::ZERO) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    return Err(ForkserverError::Communication(io::Error::from(err)));
                }
            }
            match self.output.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => buffer.extend_from_slice(&chunk[..read]),
                Err(err) => return Err(ForkserverError::Communication(err)),
            }
        }
        Ok(buffer)
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        kill_and_reap(self.pid);
    }
}

/// The supervisor loop, run inside a forkserver target after its usual
/// startup. Returns only in the forked grandchild, which then continues the
/// target's `main`; the supervisor process loops until the harness closes
/// the control pipe and never returns.
///
/// Protocol on the fixed descriptors: `"HELO"` out, `"HELO"` echo in, then
/// per input one 4-byte token in, grandchild pid out, raw wait status out.
pub fn serve() {
    // The fixed descriptors are owned by the process, not by this function.
    let mut rx = ManuallyDrop::new(
        // SAFETY: Descriptor 137 was put in place by the harness and stays
        //         open for the lifetime of the supervisor.
        unsafe { File::from_raw_fd(CHILD_CTRL_IN) },
    );
    let mut tx = ManuallyDrop::new(
        // SAFETY: Same as above, for descriptor 138.
        unsafe { File::from_raw_fd(CHILD_CTRL_OUT) },
    );

    let mut helo = [0u8; 4];
    let handshake = tx
        .write_all(b"HELO")
        .and_then(|()| rx.read_exact(&mut helo));
    if handshake.is_err() {
        eprintln!("[forkserver] Failed to communicate with the harness");
        process::exit(255);
    }
    if &helo != b"HELO" {
        eprintln!("[forkserver] Invalid response from the harness");
        process::exit(255);
    }

    loop {
        let mut token = [0u8; 4];
        match rx.read(&mut token) {
            // The harness closed the pipe; we are done.
            Ok(0) => process::exit(0),
            Ok(_) => {}
            Err(_) => {
                eprintln!("[forkserver] Failed to communicate with the harness");
                process::exit(255);
            }
        }

        // SAFETY: The supervisor is single-threaded, so the grandchild may
        //         continue with arbitrary (non-async-signal-safe) work.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = nix::unistd::close(CHILD_CTRL_IN);
                let _ = nix::unistd::close(CHILD_CTRL_OUT);
                return;
            }
            Ok(ForkResult::Parent { child }) => {
                if tx.write_all(&child.as_raw().to_le_bytes()).is_err() {
                    process::exit(255);
                }
                let mut status: libc::c_int = 0;
                // Raw waitpid so the status crosses the wire unmodified.
                // SAFETY: `child` is a direct child process of this one.
                let reaped = unsafe { libc::waitpid(child.as_raw(), &mut status, 0) };
                if reaped != child.as_raw() || tx.write_all(&status.to_le_bytes()).is_err() {
                    process::exit(255);
                }
            }
            Err(_) => {
                eprintln!("[forkserver] Failed to fork");
                process::exit(255);
            }
        }
    }
}
