//! Provide tracing, tailored to this crate.
//!
//! Binaries should call [`init_journald_or_stderr`] at startup to install a
//! tracing subscriber. The library itself only emits events.
//!
//! The rest of the crate can include `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and
//! `error!()` macros. Register traffic is logged at TRACE, so
//! `RUST_LOG=emc2101=trace` shows every transaction.

use std::fmt;
use std::io::IsTerminal;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

#[cfg(target_os = "linux")]
use prelude::*;

/// Check if stderr is connected to the systemd journal.
///
/// JOURNAL_STREAM holds "device:inode" of the journal socket. It is only
/// trusted when it matches stderr's own file, since the variable is
/// inherited by children whose stderr has been redirected.
///
/// See: https://www.freedesktop.org/software/systemd/man/latest/systemd.exec.html#%24JOURNAL_STREAM
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    use nix::libc;
    use std::os::unix::io::AsRawFd;

    let Ok(journal_stream) = std::env::var("JOURNAL_STREAM") else {
        return false;
    };
    let Some((dev, ino)) = journal_stream.split_once(':') else {
        return false;
    };
    let (Ok(expected_dev), Ok(expected_ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let fd = std::io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev == expected_dev && stat.st_ino == expected_ino
}

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stderr,
/// which keeps stdout free for command output. `default_level` applies when
/// RUST_LOG is unset.
pub fn init_journald_or_stderr(default_level: LevelFilter) {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry()
                        .with(env_filter(default_level))
                        .with(layer)
                        .init();
                    return;
                }
                Err(e) => {
                    use_stderr(default_level);
                    error!(error = %e, "Failed to initialize journald logging, using stderr.");
                    return;
                }
            }
        }
    }

    use_stderr(default_level);
}

// Filter according to environment variable RUST_LOG, falling back to
// `default_level`.
fn env_filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stderr(default_level: LevelFilter) {
    let formatter = CompactFormatter {
        color: std::io::stderr().is_terminal(),
    };

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .fmt_fields(DefaultFields::new())
                .event_format(formatter),
        )
        .init();
}

/// One line per event: local time, level, target without the crate
/// prefix, message, then the structured fields as `key=value`.
struct CompactFormatter {
    color: bool,
}

/// Visitor that splits the message from the other fields.
#[derive(Default)]
struct FieldCollector {
    fields: Vec<(&'static str, String)>,
    message: Option<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name(), formatted));
        }
    }
}

fn short_target(target: &str) -> &str {
    target.strip_prefix("emc2101::").unwrap_or(target)
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::ERROR => ("\x1b[31m", "ERROR"),
        Level::WARN => ("\x1b[33m", "WARN "),
        Level::INFO => ("\x1b[32m", "INFO "),
        Level::DEBUG => ("\x1b[34m", "DEBUG"),
        Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

impl<S, N> FormatEvent<S, N> for CompactFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, level) = level_style(*event.metadata().level());
        if self.color {
            write!(writer, " {}{}\x1b[0m ", color, level)?;
        } else {
            write!(writer, " {} ", level)?;
        }

        write!(writer, "{}:", short_target(event.metadata().target()))?;
        if let Some(msg) = &visitor.message {
            write!(writer, " {}", msg)?;
        }

        if !visitor.fields.is_empty() {
            if self.color {
                write!(writer, " \x1b[90m")?;
            } else {
                write!(writer, " ")?;
            }
            for (i, (key, value)) in visitor.fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value)?;
            }
            if self.color {
                write!(writer, "\x1b[0m")?;
            }
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second. Falls back to UTC when the local
/// offset cannot be determined.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
