//! Logging (M): a `tracing` subscriber wired the same way across both the client and server
//! binaries, configured from the single `log_level` field each config shape carries plus two
//! environment variables for format/output that have no config-file equivalent because neither
//! config shape in §4.13 exposes them.

use std::io;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// `level` comes from config (`log_level`); `ELDATUN_LOG_FORMAT` (`text`|`json`, default `text`)
/// and `ELDATUN_LOG_OUTPUT` (`stderr`|`stdout`|`discard`|a file path, default `stderr`) are read
/// directly from the environment since they're operational knobs, not tunnel behaviour.
pub fn init(level: &str) -> anyhow::Result<LoggingRuntime> {
    let level = level.trim().to_ascii_lowercase();
    let format = std::env::var("ELDATUN_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let output = std::env::var("ELDATUN_LOG_OUTPUT").unwrap_or_else(|_| "stderr".to_string());

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let directive = match level.as_str() {
                "trace" => "trace",
                "debug" => "debug",
                "info" => "info",
                "warn" => "warn",
                "error" => "error",
                _ => "info",
            };
            EnvFilter::try_new(directive)
        })
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(output.trim())?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format != "json")
        .with_target(true);

    let base_fmt = if format == "json" { base_fmt.json().boxed() } else { base_fmt.boxed() };

    tracing_subscriber::registry().with(filter).with(base_fmt).init();

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(output: &str) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
