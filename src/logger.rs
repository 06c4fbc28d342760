//! Logging setup for the apex-preprocessor binary and benchmarks.
//!
//! Output format: `[LEVEL YYYY-MM-DD HH:MM:SS.mmm target] message`. Debug and trace events
//! show `file:line` instead of the target, which is where the pipeline stages report their
//! intermediate results.

use tracing::Level;

/// Initialize the global subscriber at INFO, overridable via `RUST_LOG`.
///
/// # Example
/// ```no_run
/// use apex_preprocessor::init_logger;
///
/// init_logger();
/// tracing::info!("Preprocessing started");
/// ```
///
/// ```bash
/// RUST_LOG=apex_preprocessor=debug cargo run --features cli --bin preprocess_bal -- --solver all
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the global subscriber with `default_level`.
///
/// Does nothing if a global subscriber is already installed, so it is safe to call from
/// several entry points.
pub fn init_logger_with_level(default_level: Level) {
    if let Err(e) = try_init_logger_with_level(default_level) {
        tracing::debug!("Logger already initialized: {}", e);
    }
}

/// Like [`init_logger_with_level`], but reports a failure to install the subscriber.
pub fn try_init_logger_with_level(
    default_level: Level,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init()
}

/// Event formatter producing `[LEVEL timestamp location] message`.
struct BracketFormatter;

impl BracketFormatter {
    fn level_label(level: Level) -> &'static str {
        match level {
            Level::ERROR => "\x1b[31mERROR\x1b[0m",
            Level::WARN => "\x1b[33mWARN\x1b[0m",
            Level::INFO => "\x1b[32mINFO\x1b[0m",
            Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
            Level::TRACE => "\x1b[35mTRACE\x1b[0m",
        }
    }
}

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
        let metadata = event.metadata();
        let level = *metadata.level();

        write!(
            writer,
            "[{} {} ",
            Self::level_label(level),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        )?;

        let detailed = level == Level::DEBUG || level == Level::TRACE;
        match (detailed, metadata.file()) {
            (true, Some(file)) => {
                let filename = file.rsplit(['/', '\\']).next().unwrap_or(file);
                write!(writer, "{filename}")?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{line}")?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
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
    fn test_repeated_initialization_is_harmless() {
        init_logger_with_level(Level::WARN);
        init_logger_with_level(Level::DEBUG);
        assert!(try_init_logger_with_level(Level::INFO).is_err());
    }
}
