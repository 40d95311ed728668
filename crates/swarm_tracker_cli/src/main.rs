use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use swarm_tracker::{
    TrackerOptions,
    tracing_subscriber_config_utils::{InitLoggingOptions, init_logging},
};
use tracing::info;

mod simulate;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The loglevel
    #[arg(value_enum, short = 'v')]
    log_level: Option<LogLevel>,

    /// Also write JSON logs to this file.
    #[arg(long = "log-file")]
    log_file: Option<String>,

    /// RUST_LOG value for the log file.
    #[arg(long = "log-file-rust-log", default_value = "info,swarm_tracker=debug")]
    log_file_rust_log: String,

    /// Tracker options as JSON. Missing fields take their defaults.
    #[arg(long = "config", env = "SWARMTRACK_CONFIG")]
    config: Option<PathBuf>,

    /// A peer silent for this long becomes stale, e.g. 30s, 2m.
    #[arg(long = "heartbeat-timeout", value_parser = parse_duration::parse)]
    heartbeat_timeout: Option<Duration>,

    /// How much longer a stale peer is kept before it's considered gone.
    #[arg(long = "departure-grace", value_parser = parse_duration::parse)]
    departure_grace: Option<Duration>,

    /// How often the tracker sweeps stale peers and expired transfers, e.g. 1s, 100ms.
    #[arg(long = "sweep-interval", value_parser = parse_duration::parse)]
    sweep_interval: Option<Duration>,

    #[arg(long = "request-timeout", value_parser = parse_duration::parse)]
    request_timeout: Option<Duration>,

    #[arg(long = "transfer-timeout", value_parser = parse_duration::parse)]
    transfer_timeout: Option<Duration>,

    /// Max concurrent transfers a single peer is asked to serve.
    #[arg(long = "max-fan-out")]
    max_fan_out: Option<usize>,

    #[arg(long = "max-attempts")]
    max_attempts: Option<u32>,

    /// Set this flag if you want to use tokio's single threaded runtime.
    #[arg(short, long)]
    single_thread_runtime: bool,

    /// How many threads to spawn for the executor.
    #[arg(short = 't', long)]
    worker_threads: Option<usize>,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Run a simulated swarm against an in-process tracker.
    Simulate(simulate::SimulateOpts),
    /// Print the effective tracker options as JSON.
    PrintConfig,
}

impl Opts {
    fn tracker_options(&self) -> anyhow::Result<TrackerOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("error reading {path:?}"))?;
                TrackerOptions::from_json(&json).with_context(|| format!("error parsing {path:?}"))?
            }
            None => TrackerOptions::default(),
        };
        if let Some(v) = self.heartbeat_timeout {
            options.heartbeat_timeout = v;
        }
        if let Some(v) = self.departure_grace {
            options.departure_grace = v;
        }
        if let Some(v) = self.sweep_interval {
            options.sweep_interval = v;
        }
        if let Some(v) = self.request_timeout {
            options.request_timeout = v;
        }
        if let Some(v) = self.transfer_timeout {
            options.transfer_timeout = v;
        }
        if let Some(v) = self.max_fan_out {
            options.max_fan_out = v;
        }
        if let Some(v) = self.max_attempts {
            options.max_attempts = v;
        }
        options.validate()?;
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let mut rt_builder = match opts.single_thread_runtime {
        true => tokio::runtime::Builder::new_current_thread(),
        false => {
            let mut b = tokio::runtime::Builder::new_multi_thread();
            if let Some(e) = opts.worker_threads {
                b.worker_threads(e);
            }
            b
        }
    };

    let rt = rt_builder.enable_time().build()?;

    rt.block_on(async_main(opts))
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    let default_rust_log = match opts.log_level {
        Some(LogLevel::Trace) => "trace",
        Some(LogLevel::Debug) => "debug",
        Some(LogLevel::Info) | None => "info",
        Some(LogLevel::Warn) => "warn",
        Some(LogLevel::Error) => "error",
    };
    init_logging(InitLoggingOptions {
        default_rust_log_value: Some(default_rust_log),
        log_file: opts.log_file.as_deref(),
        log_file_rust_log: Some(&opts.log_file_rust_log),
    })?;

    let options = opts.tracker_options()?;

    match &opts.subcommand {
        SubCommand::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&options)?);
            Ok(())
        }
        SubCommand::Simulate(sim_opts) => {
            info!(version = swarm_tracker::version(), "starting simulation");
            simulate::run(options, sim_opts).await
        }
    }
}
