use colored::*;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Name every diagnostic line starts with.
pub const PROGRAM: &str = "quiver-arrow";

/// A tracing event formatter producing `quiver-arrow: <level>: <message>`.
///
/// Lines carry no timestamps or targets. The whole line is colored by level,
/// unless coloring was switched off (see [`init`]).
pub struct PrefixFormatter;

impl<S, N> FormatEvent<S, N> for PrefixFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let level = *event.metadata().level();
        let line = format!("{}: {}: {}", PROGRAM, level_name(level), buffer);

        let colored_output = match level {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

/// Format a fatal diagnostic the same way the subscriber formats errors.
pub fn fatal_line(message: impl fmt::Display) -> String {
    format!("{}: {}: {}", PROGRAM, level_name(Level::ERROR), message)
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` controls verbosity and defaults to `warn`. Color is only used
/// when stderr is a terminal, so captured diagnostics stay plain text.
pub fn init() {
    if !std::io::stderr().is_terminal() {
        colored::control::set_override(false);
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(PrefixFormatter)
        .init();
}
