//! A stand-in target speaking the REPRL and forkserver wire protocols.
//!
//! Used by the integration tests in place of a real instrumented
//! interpreter. "Scripts" are newline-separated actions such as `exit:7`,
//! `crash`, `sleep:5000`, `fuzzout:text`, `stdout:text` or `status:N`.

use std::env;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};
use std::process;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigHandler, Signal, raise, signal};
use reprl::execution::fork_server;

const CTRL_IN: RawFd = 100;
const CTRL_OUT: RawFd = 101;
const DATA_IN: RawFd = 102;
const DATA_OUT: RawFd = 103;
const FORKSERVER_OUTPUT: RawFd = 139;

/// Borrow an inherited descriptor as a `File` without closing it on drop.
fn fd_file(fd: RawFd) -> ManuallyDrop<File> {
    // SAFETY: The harness put the descriptor in place before exec and it
    //         stays open for the lifetime of this process.
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

fn die(message: &str) -> ! {
    eprintln!("[mock-target] {message}");
    process::exit(255);
}

/// Run one action. Returns a status override, if the action carries one.
fn perform(action: &str, output_fd: RawFd) -> Option<u32> {
    if action.is_empty() {
        return None;
    }
    if let Some(code) = action.strip_prefix("exit:") {
        let code = code.parse().unwrap_or_else(|_| die("bad exit code"));
        process::exit(code);
    }
    if action == "crash" {
        // The Rust runtime installs a SIGSEGV handler for stack-overflow
        // detection; restore the default disposition so the signal kills us.
        // SAFETY: The process is about to die, nothing relies on the handler.
        unsafe {
            let _ = signal(Signal::SIGSEGV, SigHandler::SigDfl);
        }
        let _ = raise(Signal::SIGSEGV);
        die("survived a SIGSEGV");
    }
    if let Some(millis) = action.strip_prefix("sleep:") {
        let millis = millis.parse().unwrap_or_else(|_| die("bad sleep duration"));
        thread::sleep(Duration::from_millis(millis));
        return None;
    }
    if let Some(text) = action.strip_prefix("fuzzout:") {
        let mut out = fd_file(output_fd);
        if out.write_all(text.as_bytes()).is_err() {
            die("failed to write fuzzer output");
        }
        return None;
    }
    if let Some(text) = action.strip_prefix("stdout:") {
        println!("{text}");
        let _ = io::stdout().flush();
        return None;
    }
    if let Some(text) = action.strip_prefix("stderr:") {
        eprintln!("{text}");
        return None;
    }
    if let Some(status) = action.strip_prefix("status:") {
        let status = status.parse().unwrap_or_else(|_| die("bad status"));
        return Some(status);
    }
    die("unknown action");
}

fn reprl_main() -> ! {
    let mut ctrl_in = fd_file(CTRL_IN);
    let mut ctrl_out = fd_file(CTRL_OUT);
    let mut data_in = fd_file(DATA_IN);

    let mut helo = [0u8; 4];
    if ctrl_out.write_all(b"HELO").is_err() || ctrl_in.read_exact(&mut helo).is_err() {
        die("handshake with the harness failed");
    }
    if &helo != b"HELO" {
        die("invalid handshake response from the harness");
    }

    loop {
        let mut command = [0u8; 4];
        if ctrl_in.read_exact(&mut command).is_err() {
            // The harness closed the control pipe.
            process::exit(0);
        }
        // Reject anything that is not the ASCII exec command, including the
        // legacy 'cexe' spelling.
        if &command != b"exec" {
            die("unknown command from the harness");
        }

        let mut length = [0u8; 8];
        if ctrl_in.read_exact(&mut length).is_err() {
            die("failed to read the script length");
        }
        let mut script = vec![0u8; u64::from_le_bytes(length) as usize];
        if data_in.read_exact(&mut script).is_err() {
            die("failed to read the script");
        }

        let script = String::from_utf8_lossy(&script);
        let mut status = 0u32;
        for action in script.lines() {
            if let Some(report) = perform(action.trim(), DATA_OUT) {
                status = report;
            }
        }

        if ctrl_out.write_all(&status.to_le_bytes()).is_err() {
            die("failed to report the status");
        }
    }
}

fn forkserver_main(actions: &[String]) -> ! {
    fork_server::serve();
    // Only the forked grandchild gets here and plays the target's main.
    for action in actions {
        perform(action, FORKSERVER_OUTPUT);
    }
    process::exit(0);
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("forkserver") => forkserver_main(&args[1..]),
        _ => reprl_main(),
    }
}
