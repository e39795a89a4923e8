//! Read-eval-print-reset-loop execution of fuzzer-generated scripts.
//!
//! A [`Reprl`] context keeps one long-lived instance of the instrumented
//! target alive and feeds it one script per [`Reprl::execute`] call. The
//! child resets its interpreter state between scripts and is respawned
//! transparently when it crashes, times out, or a fresh instance is
//! requested.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use derive_new::new as New;
use nix::errno::Errno;
use nix::sys::select::{FdSet, pselect};
use nix::sys::signal::{SigHandler, SigSet, Signal, SigmaskHow, kill, sigprocmask};
use nix::sys::time::TimeSpec;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, warn};

mod data_channel;
pub mod fork_server;
mod status;

pub use data_channel::REPRL_MAX_DATA_SIZE;
pub use status::ExitStatus;

use data_channel::DataChannel;

// Well-known file descriptor numbers on the child process side. These are
// part of the ABI with instrumented targets and must not be changed.
const CHILD_CTRL_IN: RawFd = 100;
const CHILD_CTRL_OUT: RawFd = 101;
const CHILD_DATA_IN: RawFd = 102;
const CHILD_DATA_OUT: RawFd = 103;

#[derive(Debug, thiserror::Error)]
pub enum ReprlError {
    #[error("The context is already initialized")]
    AlreadyInitialized,
    #[error("The context is not initialized")]
    NotInitialized,
    #[error("The script does not fit into the data channel ({size} of {REPRL_MAX_DATA_SIZE} bytes)")]
    ScriptTooLarge { size: usize },
    #[error("Failed to set up a data channel: {_0}")]
    DataChannel(#[source] io::Error),
    #[error("Failed to communicate with the child over the control pipe: {_0}")]
    ControlChannel(#[source] io::Error),
    #[error("Failed to spawn the child process: {_0}")]
    Spawn(#[source] io::Error),
    #[error("Received an invalid HELO message from the child: {received:?}")]
    InvalidHandshake { received: [u8; 4] },
    #[error("The child unexpectedly terminated between executions ({status})")]
    UnexpectedChildExit { status: ExitStatus },
    #[error("The child is in a weird state after execution")]
    WeirdChildState,
}

/// How to launch and talk to the target process.
#[derive(Debug, New)]
pub struct ReprlOptions {
    /// Program path and arguments for the child. Must not be empty.
    argv: Vec<String>,
    /// The complete environment of the child; nothing is inherited.
    envp: Vec<(String, String)>,
    /// Capture the child's stdout into a data channel.
    capture_stdout: bool,
    /// Capture the child's stderr into a data channel.
    capture_stderr: bool,
}

/// The result of one script execution.
#[derive(Debug, Clone, Copy)]
pub struct Execution {
    pub status: ExitStatus,
    pub execution_time: Duration,
}

/// A REPRL execution context.
///
/// While a child is alive, its control pipes and all data channels are open;
/// when it is declared dead, both control pipes are closed in the same step.
#[derive(Debug)]
pub struct Reprl {
    state: Option<Initialized>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct Initialized {
    argv: Vec<String>,
    envp: Vec<(String, String)>,
    /// Scripts travel harness -> child through here (child fd 102).
    data_in: DataChannel,
    /// Dedicated fuzzer output travels child -> harness (child fd 103).
    data_out: DataChannel,
    child_stdout: Option<DataChannel>,
    child_stderr: Option<DataChannel>,
    child: Option<ChildHandle>,
}

/// The running child and both halves of its control connection. Bundled so
/// the pipes cannot outlive the pid or vice versa.
#[derive(Debug)]
struct ChildHandle {
    pid: Pid,
    rx: PipeReader,
    tx: PipeWriter,
}

impl Reprl {
    /// Allocate an uninitialized context.
    ///
    /// Occupies the well-known child descriptor numbers with `/dev/null`
    /// so that no descriptor handed out later can collide with them before
    /// the child is set up.
    pub fn new() -> io::Result<Self> {
        reserve_child_fds(&[CHILD_CTRL_IN, CHILD_CTRL_OUT, CHILD_DATA_IN, CHILD_DATA_OUT])?;
        Ok(Self {
            state: None,
            last_error: None,
        })
    }

    /// Create the data channels and store the child's argv and environment.
    /// No child is spawned yet; that happens lazily on the first execution.
    pub fn initialize(&mut self, options: ReprlOptions) -> Result<(), ReprlError> {
        let result = Self::initialize_inner(&mut self.state, options);
        self.record_error(result)
    }

    fn initialize_inner(
        state: &mut Option<Initialized>,
        options: ReprlOptions,
    ) -> Result<(), ReprlError> {
        if state.is_some() {
            return Err(ReprlError::AlreadyInitialized);
        }
        if options.argv.is_empty() {
            return Err(ReprlError::Spawn(io::Error::other(
                "argv must contain at least the program path",
            )));
        }

        // We may end up writing to the control pipe after the child died.
        // SAFETY: Replacing the disposition of SIGPIPE with SIG_IGN does not
        //         race with any handler this library installs.
        unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
            .map_err(|err| ReprlError::ControlChannel(io::Error::from(err)))?;

        let data_in = DataChannel::new().map_err(ReprlError::DataChannel)?;
        let data_out = DataChannel::new().map_err(ReprlError::DataChannel)?;
        let child_stdout = options
            .capture_stdout
            .then(DataChannel::new)
            .transpose()
            .map_err(ReprlError::DataChannel)?;
        let child_stderr = options
            .capture_stderr
            .then(DataChannel::new)
            .transpose()
            .map_err(ReprlError::DataChannel)?;

        *state = Some(Initialized {
            argv: options.argv,
            envp: options.envp,
            data_in,
            data_out,
            child_stdout,
            child_stderr,
            child: None,
        });
        Ok(())
    }

    /// Execute `script` in the target, waiting at most `timeout` for the
    /// child's status report.
    ///
    /// A crashing child is a normal outcome and is reported through the
    /// returned [`ExitStatus`]; the next call spawns a fresh instance. With
    /// `fresh_instance` set, any existing child is terminated first.
    pub fn execute(
        &mut self,
        script: &[u8],
        timeout: Duration,
        fresh_instance: bool,
    ) -> Result<Execution, ReprlError> {
        let result = match self.state.as_mut() {
            Some(inner) => inner.execute(script, timeout, fresh_instance),
            None => Err(ReprlError::NotInitialized),
        };
        self.record_error(result)
    }

    /// The dedicated fuzzer output of the last execution. The returned slice
    /// is invalidated by the next call to [`Self::execute`].
    pub fn fetch_fuzzout(&mut self) -> Result<&[u8], ReprlError> {
        let inner = self.state.as_mut().ok_or(ReprlError::NotInitialized)?;
        inner.data_out.contents().map_err(ReprlError::DataChannel)
    }

    /// The captured stdout of the last execution, empty unless stdout
    /// capture was requested at initialization.
    pub fn fetch_stdout(&mut self) -> Result<&[u8], ReprlError> {
        let inner = self.state.as_mut().ok_or(ReprlError::NotInitialized)?;
        match &mut inner.child_stdout {
            Some(channel) => channel.contents().map_err(ReprlError::DataChannel),
            None => Ok(&[]),
        }
    }

    /// The captured stderr of the last execution, empty unless stderr
    /// capture was requested at initialization.
    pub fn fetch_stderr(&mut self) -> Result<&[u8], ReprlError> {
        let inner = self.state.as_mut().ok_or(ReprlError::NotInitialized)?;
        match &mut inner.child_stderr {
            Some(channel) => channel.contents().map_err(ReprlError::DataChannel),
            None => Ok(&[]),
        }
    }

    /// A description of the most recent error, replaced on every failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record_error<T>(&mut self, result: Result<T, ReprlError>) -> Result<T, ReprlError> {
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        result
    }
}

impl Drop for Reprl {
    fn drop(&mut self) {
        if let Some(inner) = &mut self.state {
            inner.terminate_child();
        }
    }
}

impl Initialized {
    fn execute(
        &mut self,
        script: &[u8],
        timeout: Duration,
        fresh_instance: bool,
    ) -> Result<Execution, ReprlError> {
        if script.len() > REPRL_MAX_DATA_SIZE {
            return Err(ReprlError::ScriptTooLarge { size: script.len() });
        }

        if fresh_instance && self.child.is_some() {
            self.terminate_child();
        }

        // Reset the shared file offsets so the child can simply read(2) and
        // write(2) on its descriptors.
        self.data_in.rewind().map_err(ReprlError::DataChannel)?;
        self.data_out.rewind().map_err(ReprlError::DataChannel)?;
        if let Some(channel) = &mut self.child_stdout {
            channel.rewind().map_err(ReprlError::DataChannel)?;
        }
        if let Some(channel) = &mut self.child_stderr {
            channel.rewind().map_err(ReprlError::DataChannel)?;
        }

        if self.child.is_none() {
            let handle = self.spawn_child()?;
            self.child = Some(handle);
        }

        self.data_in.write_contents(script);

        // Tell the child to execute the script.
        let send_result = {
            let child = self.child.as_mut().expect("a child was just ensured");
            child.tx.write_all(b"exec").and_then(|()| {
                child.tx.write_all(&(script.len() as u64).to_le_bytes())
            })
        };
        if let Err(err) = send_result {
            // The write fails when the child terminated between executions;
            // check for that to report something better than a broken pipe.
            let pid = self.child.as_ref().expect("a child was just ensured").pid;
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.child = None;
                    return Err(ReprlError::UnexpectedChildExit {
                        status: ExitStatus::from_exit_code(code),
                    });
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.child = None;
                    return Err(ReprlError::UnexpectedChildExit {
                        status: ExitStatus::from_signal(signal as i32),
                    });
                }
                _ => return Err(ReprlError::ControlChannel(err)),
            }
        }

        // Wait for the child to finish execution (or crash).
        let start = Instant::now();
        let readable = {
            let child = self.child.as_ref().expect("a child was just ensured");
            // SAFETY: The descriptor stays open for the lifetime of the
            //         child handle.
            let rx_fd = unsafe { BorrowedFd::borrow_raw(child.rx.as_raw_fd()) };
            wait_readable(rx_fd, timeout)
        };
        let execution_time = start.elapsed();
        match readable {
            Ok(true) => {}
            Ok(false) => {
                debug!(?timeout, "Execution timed out, killing the child");
                self.terminate_child();
                return Ok(Execution {
                    status: ExitStatus::TIMEOUT,
                    execution_time,
                });
            }
            // Signal handlers are expected to be installed with SA_RESTART,
            // so even EINTR is unexpected here.
            Err(err) => return Err(ReprlError::ControlChannel(io::Error::from(err))),
        }

        let mut report = [0u8; 4];
        let read_result = {
            let child = self.child.as_mut().expect("a child was just ensured");
            child.rx.read(&mut report)
        };
        let status = match read_result {
            Err(err) => return Err(ReprlError::ControlChannel(err)),
            Ok(4) => ExitStatus::from_child_report(u32::from_le_bytes(report)),
            Ok(_) => {
                // Most likely the child crashed and closed its end of the
                // pipe. Nothing guarantees that waitpid() succeeds right
                // away, and blocking here is not an option, so retry.
                let pid = self.child.as_ref().expect("a child was just ensured").pid;
                let reaped = loop {
                    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::Exited(_, code)) => {
                            break Some(ExitStatus::from_exit_code(code));
                        }
                        Ok(WaitStatus::Signaled(_, signal, _)) => {
                            break Some(ExitStatus::from_signal(signal as i32));
                        }
                        Ok(WaitStatus::StillAlive) if start.elapsed() < timeout => {
                            thread::sleep(Duration::from_micros(10));
                        }
                        Ok(_) | Err(_) => break None,
                    }
                };
                match reaped {
                    Some(status) => {
                        // The pipes of the dead child close with its handle.
                        self.child = None;
                        status
                    }
                    None => {
                        // The pipe was closed without the child exiting; the
                        // best we can do is kill it and report an error.
                        self.terminate_child();
                        return Err(ReprlError::WeirdChildState);
                    }
                }
            }
        };

        Ok(Execution {
            status,
            execution_time,
        })
    }

    fn spawn_child(&mut self) -> Result<ChildHandle, ReprlError> {
        // A good time to make sure the data channel files have not grown.
        self.data_in.ensure_size().map_err(ReprlError::DataChannel)?;
        self.data_out.ensure_size().map_err(ReprlError::DataChannel)?;
        if let Some(channel) = &self.child_stdout {
            channel.ensure_size().map_err(ReprlError::DataChannel)?;
        }
        if let Some(channel) = &self.child_stderr {
            channel.ensure_size().map_err(ReprlError::DataChannel)?;
        }

        let (rx, child_tx) = os_pipe::pipe().map_err(ReprlError::ControlChannel)?;
        let (child_rx, tx) = os_pipe::pipe().map_err(ReprlError::ControlChannel)?;

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .env_clear()
            .envs(self.envp.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let bind_child_fds = {
            let child_rx_fd = child_rx.as_raw_fd();
            let child_tx_fd = child_tx.as_raw_fd();
            let harness_rx_fd = rx.as_raw_fd();
            let harness_tx_fd = tx.as_raw_fd();
            let data_in_fd = self.data_in.fd();
            let data_out_fd = self.data_out.fd();
            let stdout_fd = self.child_stdout.as_ref().map(DataChannel::fd);
            let stderr_fd = self.child_stderr.as_ref().map(DataChannel::fd);
            move || {
                use nix::unistd::close;
                dup2_raw_fd(child_rx_fd, CHILD_CTRL_IN)?;
                dup2_raw_fd(child_tx_fd, CHILD_CTRL_OUT)?;
                dup2_raw_fd(data_in_fd, CHILD_DATA_IN)?;
                dup2_raw_fd(data_out_fd, CHILD_DATA_OUT)?;
                if let Some(fd) = stdout_fd {
                    dup2_raw_fd(fd, libc::STDOUT_FILENO)?;
                }
                if let Some(fd) = stderr_fd {
                    dup2_raw_fd(fd, libc::STDERR_FILENO)?;
                }
                // Some runtimes leave signals blocked across fork.
                sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                    .map_err(io::Error::from)?;
                for fd in [
                    child_rx_fd,
                    child_tx_fd,
                    harness_rx_fd,
                    harness_tx_fd,
                    data_in_fd,
                    data_out_fd,
                ] {
                    close(fd).map_err(io::Error::from)?;
                }
                Ok(())
            }
        };
        // SAFETY: The closure only performs async-signal-safe syscalls on
        //         captured raw descriptors.
        unsafe { command.pre_exec(bind_child_fds) };

        let child = command.spawn().map_err(ReprlError::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(child_rx);
        drop(child_tx);
        debug!(%pid, "Spawned REPRL child");

        let mut handle = ChildHandle { pid, rx, tx };
        let mut helo = [0u8; 4];
        if let Err(err) = handle.rx.read_exact(&mut helo) {
            kill_and_reap(pid);
            return Err(ReprlError::ControlChannel(err));
        }
        if &helo != b"HELO" {
            kill_and_reap(pid);
            return Err(ReprlError::InvalidHandshake { received: helo });
        }
        if let Err(err) = handle.tx.write_all(&helo) {
            kill_and_reap(pid);
            return Err(ReprlError::ControlChannel(err));
        }

        Ok(handle)
    }

    fn terminate_child(&mut self) {
        if let Some(child) = self.child.take() {
            kill_and_reap(child.pid);
        }
    }
}

fn kill_and_reap(pid: Pid) {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(%pid, %err, "Failed to deliver SIGKILL to child"),
    }
    if let Err(err) = waitpid(pid, None) {
        warn!(%pid, %err, "Failed to reap child");
    }
}

/// Wait for `fd` to become readable, for at most `timeout`.
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> nix::Result<bool> {
    let mut readfds = FdSet::new();
    readfds.insert(fd);

    let mut sigset = SigSet::empty();
    sigset.add(Signal::SIGINT);

    let timeout = TimeSpec::from_duration(timeout);
    let ready = pselect(None, &mut readfds, None, None, Some(&timeout), Some(&sigset))?;
    Ok(ready > 0)
}

/// Occupy well-known child descriptor numbers with `/dev/null` handles.
pub(crate) fn reserve_child_fds(fds: &[RawFd]) -> io::Result<()> {
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for &fd in fds {
        dup2_raw_fd(devnull.as_raw_fd(), fd)?;
    }
    Ok(())
}

/// Duplicate `oldfd` onto the arbitrary raw descriptor `newfd`.
///
/// `nix::unistd::dup2` requires an owned `newfd`, which does not fit the
/// well-known, externally-numbered descriptors used here (some of which are
/// also manipulated from an async-signal-safe `pre_exec` context), so we call
/// the underlying syscall directly instead.
pub(crate) fn dup2_raw_fd(oldfd: RawFd, newfd: RawFd) -> io::Result<()> {
    let res = unsafe { libc::dup2(oldfd, newfd) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
