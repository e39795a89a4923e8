use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reprl::execution::fork_server::Forkserver;
use serde::Serialize;
use tracing::info;

use crate::cli::parse_env_pair;

/// Spins up a forkserver target and runs a number of inputs through forked
/// children, reporting their statuses, output, and spawn latency.
#[derive(Debug, clap::Parser)]
pub struct ForkserverCommand {
    /// The path to the target executable.
    #[clap(long, short)]
    target: PathBuf,

    /// Arguments passed to the target.
    #[clap(long)]
    target_args: Vec<String>,

    /// Extra environment of the target (repeatable KEY=VALUE pairs).
    #[clap(long, value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// How many children to spawn.
    #[clap(long, default_value_t = 1)]
    spawns: u32,

    /// Per-spawn timeout in milliseconds.
    #[clap(long, default_value_t = 1000)]
    timeout: u64,

    /// Write a JSON report to stdout.
    #[clap(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct SpawnReport {
    pid: i32,
    exit_status: Option<i32>,
    term_sig: Option<i32>,
    exec_time_ms: u128,
    output: String,
}

impl ForkserverCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let Self {
            target,
            target_args,
            env,
            spawns,
            timeout,
            json,
        } = self;

        let mut argv = vec![target.to_string_lossy().into_owned()];
        argv.extend(target_args);
        let mut server =
            Forkserver::spinup(&argv, &env).context("Spinning up the forkserver")?;
        let timeout = Duration::from_millis(timeout);

        let mut reports = Vec::new();
        for _ in 0..spawns.max(1) {
            let result = server.spawn(timeout).context("Spawning a child")?;
            let report = SpawnReport {
                pid: result.pid,
                exit_status: result.exit_status(),
                term_sig: result.term_sig(),
                exec_time_ms: result.exec_time.as_millis(),
                output: String::from_utf8_lossy(&result.output).into_owned(),
            };
            info!(
                pid = report.pid,
                exit_status = ?report.exit_status,
                term_sig = ?report.term_sig,
                time_ms = report.exec_time_ms,
                "Child completed"
            );
            reports.push(report);
        }

        if json {
            serde_json::to_writer_pretty(io::stdout().lock(), &reports)
                .context("Writing JSON report")?;
            println!();
        }
        Ok(())
    }
}
