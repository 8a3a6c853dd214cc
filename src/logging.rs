use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Compact colorized formatter for the user-facing stdout stream.
///
/// One line per event: a short colored level tag followed by the message
/// fields. Timestamps, targets and span context stay in the detailed log;
/// stdout is for a human watching the proxy run.
pub struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
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

        let (tag, line) = match *event.metadata().level() {
            Level::ERROR => ("error:".red().bold(), buffer.red()),
            Level::WARN => (" warn:".yellow().bold(), buffer.yellow()),
            Level::INFO => (" info:".green(), buffer.normal()),
            Level::DEBUG => ("debug:".blue(), buffer.blue()),
            Level::TRACE => ("trace:".purple(), buffer.dimmed()),
        };
        writeln!(writer, "{} {}", tag, line)
    }
}
