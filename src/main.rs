use anyhow::Context;
use clap::Parser;
use procmeter::config::{ConfigLoader, CustomTag, MeterConfig};
use procmeter::subprocess::{CommandKind, LiveLines, Meter};
use procmeter::RunOutcome;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

const EXIT_TIMED_OUT: u8 = 124;
const EXIT_FAILURE: u8 = 2;

/// Run a command and measure it
#[derive(Parser, Debug)]
#[command(name = "procmeter", version)]
#[command(about = "Run a benchmark command and report its timing and runtime statistics", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Kill the command after this long (e.g. "30s", "2m")
    #[arg(short = 't', long, value_parser = humantime_serde::re::humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Working directory for the command
    #[arg(short = 'C', long = "dir")]
    working_dir: Option<PathBuf>,

    /// Extra environment variable for the command
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Harvest a custom tag from stdout (kind: int, double or string)
    #[arg(long = "tag", value_name = "TAG[:KIND]")]
    tags: Vec<CustomTag>,

    /// Run the command through the configured shell
    #[arg(long)]
    shell: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// Command to measure
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PROCMETER_LOG").unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("procmeter started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConfigLoader::load_default()
            .await
            .context("Failed to load default config")?,
    };
    apply_cli_overrides(&mut config, &cli);
    config.validate().context("Invalid command-line options")?;

    let kind = if cli.shell {
        CommandKind::Shell(cli.command.join(" "))
    } else {
        let (program, args) = cli
            .command
            .split_first()
            .context("No command given")?;
        CommandKind::Raw {
            program: program.clone(),
            args: args.to_vec(),
        }
    };
    let mut command = config.command(kind);
    command.env.extend(cli.env.iter().cloned());

    let meter = Meter::new(Arc::new(config.launcher()));
    let mut process = meter
        .measure(&command, config.harvesters())
        .with_context(|| format!("Failed to start {}", command.display()))?;

    let relay_out = tokio::spawn(relay(process.take_stdout(), false));
    let relay_err = tokio::spawn(relay(process.take_stderr(), true));
    let outcome = process.wait().await;
    let _ = tokio::join!(relay_out, relay_err);

    let outcome = outcome.with_context(|| format!("Failed to measure {}", command.display()))?;
    report(&outcome, cli.json)?;
    Ok(ExitCode::from(exit_status(&outcome)))
}

fn apply_cli_overrides(config: &mut MeterConfig, cli: &Cli) {
    if cli.timeout.is_some() {
        config.timeout = cli.timeout;
    }
    if cli.working_dir.is_some() {
        config.working_dir = cli.working_dir.clone();
    }
    config.harvest.custom.extend(cli.tags.iter().cloned());
}

async fn relay(lines: Option<LiveLines>, to_stderr: bool) {
    let Some(mut lines) = lines else {
        return;
    };
    while let Some(line) = lines.next_line().await {
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

fn report(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        let rendered = serde_json::to_string(outcome).context("Failed to serialize outcome")?;
        println!("{rendered}");
    } else {
        eprintln!("procmeter: {outcome}");
    }
    Ok(())
}

/// 0 when completed, the child's own code when it failed.
fn exit_status(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Completed(_) => 0,
        RunOutcome::ExitError { code } => match u8::try_from(*code & 0xff) {
            Ok(0) | Err(_) => 1,
            Ok(code) => code,
        },
        RunOutcome::TimedOut => EXIT_TIMED_OUT,
    }
}
