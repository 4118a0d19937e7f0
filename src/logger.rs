//! Logging setup for applications and benchmarks built on posefit.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the caller. These helpers install a `tracing-subscriber` fmt
//! subscriber with an `EnvFilter` and a compact bracketed format.

use tracing::Level;

/// Install the standard subscriber at INFO level.
///
/// Output format: `[LEVEL YYYY-MM-DD HH:MM:SS module] message`, with
/// `file:line` in place of the module for DEBUG and TRACE events.
///
/// # Example
/// ```no_run
/// posefit::init_logger();
/// tracing::info!("Tracking started");
/// ```
///
/// # Environment Variables
/// `RUST_LOG` overrides the default level:
/// ```bash
/// RUST_LOG=debug cargo bench
/// RUST_LOG=posefit::optimizer=debug cargo run
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the standard subscriber with a custom default level.
///
/// Does nothing if a global subscriber is already installed.
///
/// # Example
/// ```no_run
/// use tracing::Level;
///
/// posefit::init_logger_with_level(Level::DEBUG);
/// tracing::debug!("Per-iteration tables enabled");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Module path without the crate prefix
fn short_target(target: &str) -> &str {
    target.strip_prefix("posefit::").unwrap_or(target)
}

/// Bracketed event formatter with colored levels
struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = *metadata.level();

        let (color, name) = match level {
            Level::ERROR => (31, "ERROR"),
            Level::WARN => (33, "WARN"),
            Level::INFO => (32, "INFO"),
            Level::DEBUG => (34, "DEBUG"),
            Level::TRACE => (35, "TRACE"),
        };
        write!(
            writer,
            "[\x1b[{color}m{name}\x1b[0m {} ",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        match (level >= Level::DEBUG, metadata.file()) {
            (true, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{filename}:{}", metadata.line().unwrap_or(0))?;
            }
            _ => write!(writer, "{}", short_target(metadata.target()))?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("posefit::optimizer::bfgs"), "optimizer::bfgs");
        assert_eq!(short_target("my_app"), "my_app");
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logger_with_level(Level::WARN);
        init_logger();
    }
}
