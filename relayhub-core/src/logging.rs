//! Process-wide `tracing` subscriber
//!
//! One formatting layer (JSON for log shippers, pretty for terminals)
//! writing to stdout or an append-only file, under an `EnvFilter`.

use std::sync::Arc;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Crates whose debug output drowns the hub's own events
const QUIET_TARGETS: &[&str] = &["hyper=warn", "h2=warn", "tungstenite=info", "redis=info"];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`
///
/// `RUST_LOG`, when set, replaces the configured level entirely.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => level_filter(&config.level)?,
    };

    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(Arc::new(open_log_file(path)?)),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::registry()
        .with(format_layer(&config.format, writer))
        .with(filter)
        .try_init()?;

    Ok(())
}

fn format_layer(format: &str, writer: BoxMakeWriter) -> BoxedLayer {
    if format == "json" {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed()
    }
}

/// Filter for `level` with the noisy dependencies turned down
fn level_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        level @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => level.to_string(),
        _ => anyhow::bail!("Invalid log level: {level}"),
    };

    let directives = std::iter::once(level.as_str())
        .chain(QUIET_TARGETS.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    Ok(EnvFilter::try_new(directives)?)
}

fn open_log_file(path: &str) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file {path}: {e}"))
}
