//! End-to-end forkserver tests against `mock-target forkserver`.

use std::time::Duration;

use reprl::execution::fork_server::Forkserver;

const TIMEOUT: Duration = Duration::from_secs(5);

fn spinup(actions: &[&str]) -> Forkserver {
    let mut argv = vec![
        env!("CARGO_BIN_EXE_mock-target").to_string(),
        "forkserver".to_string(),
    ];
    argv.extend(actions.iter().map(ToString::to_string));
    Forkserver::spinup(&argv, &[]).expect("spinning up the forkserver")
}

#[test]
fn grandchildren_run_to_completion() {
    let mut server = spinup(&["fuzzout:hi", "exit:3"]);
    for _ in 0..3 {
        let result = server.spawn(TIMEOUT).expect("spawning");
        assert!(result.pid > 0);
        assert_eq!(result.exit_status(), Some(3));
        assert_eq!(result.term_sig(), None);
        assert_eq!(result.output, b"hi");
    }
}

#[test]
fn output_is_drained_per_spawn() {
    let mut server = spinup(&["fuzzout:hello"]);
    let first = server.spawn(TIMEOUT).expect("spawning");
    assert_eq!(first.output, b"hello");
    assert_eq!(first.exit_status(), Some(0));
    let second = server.spawn(TIMEOUT).expect("spawning");
    assert_eq!(second.output, b"hello");
}

#[test]
fn timed_out_grandchildren_are_killed() {
    let mut server = spinup(&["sleep:10000"]);
    let result = server
        .spawn(Duration::from_millis(100))
        .expect("spawning");
    assert_eq!(result.term_sig(), Some(libc::SIGKILL));
    assert_eq!(result.exit_status(), None);
    assert!(result.exec_time < Duration::from_secs(5));
}
