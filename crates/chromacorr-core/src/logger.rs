//! Stderr logging for the command-line tools.
//!
//! Records print as `[elapsed LEVEL target] message`. Library code only uses
//! the `log` macros; a binary picks a sink once at startup with
//! [`init_with_level`] or, with the `tracing` feature, [`init_tracing`].

use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt, EnvFilter};

struct StderrLogger {
    level: LevelFilter,
    started: Instant,
}

impl StderrLogger {
    fn format(&self, record: &Record) -> String {
        let target = record.target();
        let short = target.rsplit("::").next().unwrap_or(target);
        format!(
            "[{:8.3}s {:>5} {}] {}",
            self.started.elapsed().as_secs_f64(),
            record.level(),
            short,
            record.args()
        )
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

/// Install the stderr logger.
///
/// Only the first call installs anything; later calls return `Ok(())`.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_none() {
        let logger = LOGGER.get_or_init(|| StderrLogger {
            level,
            started: Instant::now(),
        });
        log::set_logger(logger)?;
        log::set_max_level(level);
    }
    Ok(())
}

/// `Debug` when detailed messages are requested, `Info` otherwise.
pub fn level_for_verbosity(detailed: bool) -> LevelFilter {
    if detailed {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Span close events are emitted so the instrumented build and TRE passes
/// report their duration.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder
            .with_timer(fmt::time::Uptime::default())
            .finish()
            .try_init()
    };
}
