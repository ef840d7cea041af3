use std::path::PathBuf;
use std::time::Duration;

use actionflow_counter::{Counter, CounterOptions, CounterState};
use actionflow_engine::{load_config, Agent, AgentConfig};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "actionflow-counter", about = "Periodic counter driven by an action agent")]
struct Cli {
    /// Tick period in milliseconds
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    period_ms: u64,

    /// Initial increment
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    step: i64,

    /// Stop after this many ticks instead of reading commands from stdin
    #[arg(long)]
    ticks: Option<u32>,

    /// Agent config TOML file (defaults to ACTIONFLOW_* env vars)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("actionflow=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AgentConfig::from_env().context("Invalid ACTIONFLOW_* environment")?,
    };

    let agent = Agent::with_config(config);
    let period = Duration::from_millis(cli.period_ms);
    let counter = Counter::mount(
        &agent,
        CounterOptions {
            period,
            initial: CounterState {
                count: 0,
                step: cli.step,
            },
        },
    )?;
    info!(agent = %agent.id(), period_ms = cli.period_ms, step = cli.step, "Counter mounted");

    match cli.ticks {
        Some(ticks) => {
            tokio::time::sleep(run_length(period, ticks)?).await;
            counter.stop()?;
        }
        None => run_commands(&counter).await?,
    }

    let state = counter.unmount();
    println!("{}", state.count);
    Ok(())
}

/// Time to let `ticks` ticks land, plus half a period of slack.
fn run_length(period: Duration, ticks: u32) -> Result<Duration> {
    period
        .checked_mul(ticks)
        .and_then(|total| total.checked_add(period / 2))
        .with_context(|| format!("{ticks} ticks of {period:?} overflows the run length"))
}

/// Reads one command per line: an integer sets the step, `stop` halts the
/// ticker, `count` prints the current count, `quit` (or EOF) exits.
async fn run_commands(counter: &Counter) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let command = line.trim();
        match command {
            "" => continue,
            "quit" | "exit" => break,
            "stop" => {
                counter.stop()?;
            }
            "count" => println!("{}", counter.state().count),
            other => match other.parse::<i64>() {
                Ok(step) => {
                    counter.set_step(step)?;
                }
                Err(_) => warn!(command = other, "Unknown command"),
            },
        }
    }
    Ok(())
}
