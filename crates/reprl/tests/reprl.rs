//! End-to-end REPRL tests against the `mock-target` binary.

use std::time::Duration;

use reprl::execution::{REPRL_MAX_DATA_SIZE, Reprl, ReprlError, ReprlOptions};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start(capture_stdout: bool, capture_stderr: bool) -> Reprl {
    let mut reprl = Reprl::new().expect("reserving descriptors");
    let argv = vec![env!("CARGO_BIN_EXE_mock-target").to_string()];
    let options = ReprlOptions::new(argv, Vec::new(), capture_stdout, capture_stderr);
    reprl.initialize(options).expect("initializing context");
    reprl
}

#[test]
fn handshake_and_empty_script() {
    let mut reprl = start(false, false);
    let execution = reprl.execute(b"", TIMEOUT, false).expect("executing");
    assert_eq!(execution.status.as_raw(), 0);
    assert!(execution.status.is_exited());
    assert_eq!(execution.status.exit_status(), 0);
}

#[test]
fn exit_codes_are_reported() {
    let mut reprl = start(false, false);
    let execution = reprl.execute(b"exit:7", TIMEOUT, false).expect("executing");
    assert_eq!(execution.status.as_raw(), 0x0700);
    assert!(execution.status.is_exited());
    assert_eq!(execution.status.exit_status(), 7);
}

#[test]
fn crashes_are_reported_and_the_child_is_respawned() {
    let mut reprl = start(false, false);
    let execution = reprl.execute(b"crash", TIMEOUT, false).expect("executing");
    assert!(execution.status.is_signaled());
    assert_eq!(execution.status.term_sig(), libc::SIGSEGV);

    // The next execution transparently gets a fresh child.
    let execution = reprl.execute(b"", TIMEOUT, false).expect("executing");
    assert!(execution.status.is_exited());
    assert_eq!(execution.status.exit_status(), 0);
}

#[test]
fn timeouts_kill_the_child() {
    let mut reprl = start(false, false);
    let execution = reprl
        .execute(b"sleep:10000", Duration::from_millis(100), false)
        .expect("executing");
    assert_eq!(execution.status.as_raw(), 0x10000);
    assert!(execution.status.is_timed_out());
    assert!(execution.execution_time < Duration::from_secs(5));

    let execution = reprl.execute(b"", TIMEOUT, false).expect("executing");
    assert!(execution.status.is_exited());
}

#[test]
fn oversized_scripts_are_rejected() {
    let mut reprl = start(false, false);
    let script = vec![b'a'; REPRL_MAX_DATA_SIZE + 1];
    let err = reprl
        .execute(&script, TIMEOUT, false)
        .expect_err("the script exceeds the data channel size");
    assert!(matches!(
        err,
        ReprlError::ScriptTooLarge {
            size
        } if size == REPRL_MAX_DATA_SIZE + 1
    ));
    assert!(reprl.last_error().expect("recorded error").contains("data channel"));
}

#[test]
fn child_reported_statuses_are_masked() {
    let mut reprl = start(false, false);
    // Only the low 16 bits belong to the child; it cannot claim a timeout.
    let execution = reprl
        .execute(b"status:65541", TIMEOUT, false)
        .expect("executing");
    assert_eq!(execution.status.as_raw(), 5);
    assert!(execution.status.is_signaled());
    assert_eq!(execution.status.term_sig(), 5);
}

#[test]
fn fuzzout_is_fetched_from_the_data_channel() {
    let mut reprl = start(false, false);
    let execution = reprl
        .execute(b"fuzzout:hello", TIMEOUT, false)
        .expect("executing");
    assert!(execution.status.is_exited());
    assert_eq!(reprl.fetch_fuzzout().expect("fetching"), b"hello");

    // The next execution rewinds the channel.
    reprl.execute(b"", TIMEOUT, false).expect("executing");
    assert_eq!(reprl.fetch_fuzzout().expect("fetching"), b"");
}

#[test]
fn stdout_and_stderr_are_captured_on_request() {
    let mut reprl = start(true, true);
    reprl
        .execute(b"stdout:hi\nstderr:oops", TIMEOUT, false)
        .expect("executing");
    assert_eq!(reprl.fetch_stdout().expect("fetching"), b"hi\n");
    assert_eq!(reprl.fetch_stderr().expect("fetching"), b"oops\n");
}

#[test]
fn captures_are_empty_when_not_requested() {
    let mut reprl = start(false, false);
    reprl
        .execute(b"stdout:hi", TIMEOUT, false)
        .expect("executing");
    assert_eq!(reprl.fetch_stdout().expect("fetching"), b"");
    assert_eq!(reprl.fetch_stderr().expect("fetching"), b"");
}

#[test]
fn fresh_instances_can_be_requested() {
    let mut reprl = start(false, false);
    reprl.execute(b"", TIMEOUT, false).expect("executing");
    let execution = reprl.execute(b"", TIMEOUT, true).expect("executing");
    assert!(execution.status.is_exited());
}

#[test]
fn lifecycle_misuse_is_reported() {
    let mut reprl = Reprl::new().expect("reserving descriptors");
    let err = reprl
        .execute(b"", TIMEOUT, false)
        .expect_err("the context is not initialized");
    assert!(matches!(err, ReprlError::NotInitialized));

    let argv = vec![env!("CARGO_BIN_EXE_mock-target").to_string()];
    reprl
        .initialize(ReprlOptions::new(argv.clone(), Vec::new(), false, false))
        .expect("initializing context");
    let err = reprl
        .initialize(ReprlOptions::new(argv, Vec::new(), false, false))
        .expect_err("the context is already initialized");
    assert!(matches!(err, ReprlError::AlreadyInitialized));
}
