use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reprl::coverage::{CoverageError, CoverageMap};
use reprl::execution::{Reprl, ReprlOptions};
use reprl::shmem::SHM_ENV_VAR;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::parse_env_pair;

/// Executes script files in a REPRL target and reports exit statuses and
/// newly covered edges.
#[derive(Debug, clap::Parser)]
pub struct ExecuteCommand {
    /// The path to the target executable.
    #[clap(long, short)]
    target: PathBuf,

    /// Arguments passed to the target.
    #[clap(long)]
    target_args: Vec<String>,

    /// Environment of the target (repeatable KEY=VALUE pairs). The shared
    /// memory key is added automatically.
    #[clap(long, value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// The script files to execute, in order.
    scripts: Vec<PathBuf>,

    /// Per-execution timeout in milliseconds.
    #[clap(long, default_value_t = 1000)]
    timeout: u64,

    /// How often to execute each script.
    #[clap(long, default_value_t = 1)]
    repetitions: u32,

    /// Spawn a fresh target instance for every execution.
    #[clap(long)]
    fresh_instance: bool,

    /// Capture the target's stdout and stderr.
    #[clap(long)]
    capture_output: bool,

    /// Maintain per-edge hit counts (slower evaluation).
    #[clap(long)]
    track_edges: bool,

    /// Identifier of the coverage context, part of the shared memory key.
    #[clap(long, default_value_t = 0)]
    coverage_id: u32,

    /// Write a JSON report to stdout.
    #[clap(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ExecutionReport {
    script: String,
    status: u32,
    outcome: String,
    execution_time_us: u128,
    new_edges: usize,
    new_crash_edges: bool,
    total_edges_found: u64,
    fuzzout: String,
    stdout: String,
    stderr: String,
}

impl ExecuteCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let Self {
            target,
            target_args,
            env,
            scripts,
            timeout,
            repetitions,
            fresh_instance,
            capture_output,
            track_edges,
            coverage_id,
            json,
        } = self;

        let mut coverage =
            CoverageMap::new(coverage_id).context("Creating coverage context")?;

        let mut envp = env;
        if let Some(key) = coverage.shm_key() {
            envp.push((SHM_ENV_VAR.to_owned(), key.to_owned()));
        }
        let mut argv = vec![target.to_string_lossy().into_owned()];
        argv.extend(target_args);

        let mut reprl = Reprl::new().context("Reserving child descriptors")?;
        reprl
            .initialize(ReprlOptions::new(argv, envp, capture_output, capture_output))
            .context("Initializing REPRL context")?;

        let timeout = Duration::from_millis(timeout);

        // The child registers its edge guards during startup, so run one
        // empty script before sizing the bitmaps.
        reprl
            .execute(b"", timeout, false)
            .context("Warm-up execution")?;
        let mut evaluating = true;
        match coverage.finish_initialization(track_edges) {
            Ok(()) => info!(edges = coverage.num_edges(), "Coverage initialized"),
            Err(CoverageError::NotInstrumented) => {
                warn!("The target reported no edges, coverage evaluation disabled");
                evaluating = false;
            }
            Err(err) => return Err(err).context("Sizing coverage bitmaps"),
        }

        let mut reports = Vec::new();
        let mut new_edges = Vec::new();
        for script_path in &scripts {
            let script = fs::read(script_path)
                .with_context(|| format!("Reading {}", script_path.display()))?;
            for _ in 0..repetitions.max(1) {
                if evaluating {
                    coverage.clear_bitmap();
                }
                let execution = reprl
                    .execute(&script, timeout, fresh_instance)
                    .with_context(|| format!("Executing {}", script_path.display()))?;

                let mut new_edge_count = 0;
                let mut new_crash_edges = false;
                if evaluating {
                    if execution.status.is_signaled() {
                        new_crash_edges = coverage.evaluate_crash();
                    } else if !execution.status.is_timed_out() {
                        coverage.evaluate(&mut new_edges);
                        new_edge_count = new_edges.len();
                    }
                }

                let report = ExecutionReport {
                    script: script_path.display().to_string(),
                    status: execution.status.as_raw(),
                    outcome: execution.status.to_string(),
                    execution_time_us: execution.execution_time.as_micros(),
                    new_edges: new_edge_count,
                    new_crash_edges,
                    total_edges_found: coverage.found_edges(),
                    fuzzout: fetch_lossy(reprl.fetch_fuzzout())?,
                    stdout: fetch_lossy(reprl.fetch_stdout())?,
                    stderr: fetch_lossy(reprl.fetch_stderr())?,
                };
                info!(
                    script = %report.script,
                    outcome = %report.outcome,
                    time_us = report.execution_time_us,
                    new_edges = report.new_edges,
                    total_edges = report.total_edges_found,
                    "Executed script"
                );
                reports.push(report);
            }
        }

        if evaluating && coverage.tracks_edges() {
            let least_visited = coverage
                .least_visited_edges(8, 0)
                .context("Selecting least visited edges")?;
            info!(edges = ?least_visited, "Least visited edges");
        }

        if json {
            serde_json::to_writer_pretty(io::stdout().lock(), &reports)
                .context("Writing JSON report")?;
            println!();
        }
        Ok(())
    }
}

fn fetch_lossy(bytes: Result<&[u8], reprl::execution::ReprlError>) -> anyhow::Result<String> {
    let bytes = bytes.context("Fetching data channel contents")?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}
