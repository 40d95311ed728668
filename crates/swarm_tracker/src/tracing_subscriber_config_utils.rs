use std::io::LineWriter;

use anyhow::Context;

pub struct InitLoggingOptions<'a> {
    pub default_rust_log_value: Option<&'a str>,
    /// Optional JSON-lines log file, filtered separately from stderr.
    pub log_file: Option<&'a str>,
    pub log_file_rust_log: Option<&'a str>,
}

/// Installs the global subscriber: stderr filtered by RUST_LOG, plus the
/// optional JSON file.
#[inline(never)]
pub fn init_logging(opts: InitLoggingOptions) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let stderr_filter = EnvFilter::builder()
        .with_default_directive(
            opts.default_rust_log_value
                .unwrap_or("info")
                .parse()
                .context("can't parse provided rust_log value")?,
        )
        .from_env()
        .context("invalid RUST_LOG value")?;

    let layered = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(stderr_filter));

    if let Some(log_file) = &opts.log_file {
        let log_file = log_file.to_string();
        let log_file = std::sync::Mutex::new(LineWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("error opening log file {:?}", log_file))?,
        ));
        layered
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .fmt_fields(fmt::format::JsonFields::new())
                    .event_format(fmt::format().with_ansi(false).json())
                    .with_writer(log_file)
                    .with_filter(
                        EnvFilter::builder()
                            .parse(opts.log_file_rust_log.unwrap_or("info,swarm_tracker=debug"))
                            .context("can't parse log-file-rust-log")?,
                    ),
            )
            .try_init()
            .context("can't init logging")?;
    } else {
        layered.try_init().context("can't init logging")?;
    }
    Ok(())
}
