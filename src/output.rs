use std::io::{self, Write};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Console,
    Json,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives user-facing progress lines.
pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Prints every progress line on stdout.
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn event(&self, event: ProgressEvent) {
        let _ = writeln!(io::stdout(), "{}", event.message);
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub fn sink_for(mode: OutputMode) -> Box<dyn ProgressSink> {
    match mode {
        OutputMode::Console => Box::new(ConsoleSink),
        OutputMode::Json => Box::new(JsonOutput),
    }
}
