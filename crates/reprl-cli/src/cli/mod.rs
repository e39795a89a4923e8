mod execute;
mod fork_server;

use anyhow::Context;
use execute::ExecuteCommand;
use fork_server::ForkserverCommand;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        setup_logger(&self.global_options).context("Setting up logger")?;
        match self.command {
            Command::Execute(cmd) => cmd.run(),
            Command::Forkserver(cmd) => cmd.run(),
        }
    }
}

#[derive(Debug, clap::Parser)]
struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Drive a REPRL target: execute scripts and report status and coverage.
    Execute(ExecuteCommand),
    /// Spin up a forkserver target and run inputs through forked children.
    Forkserver(ForkserverCommand),
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_owned())))
        .with(
            EnvFilter::builder()
                .with_default_directive(global_opts.default_log_level.into())
                .from_env()
                .context("Constructing log filter from env.")?,
        )
        .init();

    Ok(())
}

pub fn parse_env_pair(s: &str) -> Result<(String, String), anyhow::Error> {
    let (key, value) = s.split_once('=').context("Expected KEY=VALUE")?;
    Ok((key.to_owned(), value.to_owned()))
}
