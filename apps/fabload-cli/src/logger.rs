use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use fabload_pipeline::runner::STATS_TARGET;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Destination of the periodic statistics table.
pub enum StatsSink {
    File(File),
    Stdout(io::Stdout),
}

impl StatsSink {
    /// Opens `path` for appending. Falls back to standard output and hands
    /// back the open error for the caller to report.
    pub fn open(path: &Path) -> (Self, Option<io::Error>) {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => (StatsSink::File(file), None),
            Err(err) => (StatsSink::Stdout(io::stdout()), Some(err)),
        }
    }
}

impl Write for StatsSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StatsSink::File(file) => file.write(buf),
            StatsSink::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StatsSink::File(file) => file.flush(),
            StatsSink::Stdout(stdout) => stdout.flush(),
        }
    }
}

/// Appends events with the statistics target to a writer, one message per
/// event. Other events are ignored.
pub struct StatsFileLayer<W> {
    sink: Mutex<W>,
}

impl<W: Write> StatsFileLayer<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl StatsFileLayer<StatsSink> {
    pub fn open(path: &Path) -> (Self, Option<io::Error>) {
        let (sink, err) = StatsSink::open(path);
        (Self::new(sink), err)
    }
}

impl<S, W> Layer<S> for StatsFileLayer<W>
where
    S: Subscriber,
    W: Write + Send + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != STATS_TARGET {
            return;
        }

        let mut message = String::new();
        let mut visitor = MessageVisitor { message: &mut message };
        event.record(&mut visitor);

        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let _ = writeln!(sink, "{message}");
        let _ = sink.flush();
    }
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.message, "{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }
}
