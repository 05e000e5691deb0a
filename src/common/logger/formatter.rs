use core::fmt as core_fmt;

use time::{OffsetDateTime, macros::format_description};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{
        FmtContext,
        format::{FormatEvent, FormatFields, Writer},
    },
    registry::LookupSpan,
};

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";

/// `<timestamp> <LEVEL> <thread> <target>:<line> > <message>`
pub struct NodeFormatter {
    ansi: bool,
}

impl NodeFormatter {
    pub fn new(ansi: bool) -> Self {
        Self { ansi }
    }

    fn paint<'a>(&self, code: &'a str) -> &'a str {
        if self.ansi { code } else { "" }
    }
}

fn level_colour(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

impl<S, N> FormatEvent<S, N> for NodeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> core_fmt::Result {
        let meta = event.metadata();
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let timestamp = now
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .unwrap_or_default();

        write!(writer, "{}{}{} ", self.paint(DIM), timestamp, self.paint(RESET))?;
        write!(
            writer,
            "{}{}{:<5}{} ",
            self.paint(level_colour(meta.level())),
            self.paint(BOLD),
            meta.level().as_str(),
            self.paint(RESET)
        )?;

        let thread = std::thread::current();
        match thread.name() {
            Some(name) => write!(writer, "[{name}] ")?,
            None => write!(writer, "[{:?}] ", thread.id())?,
        }

        write!(
            writer,
            "{}{}:{}{} > ",
            self.paint(DIM),
            meta.target(),
            meta.line().unwrap_or_default(),
            self.paint(RESET)
        )?;

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer, "{}", self.paint(RESET))
    }
}
