use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FetchResult, ProgressEvent, ProgressSink, StatusResult};
use crate::resume::ResumeReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_resume(result: &ResumeReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
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

/// Forwards progress to the log.
pub struct LogOutput;

impl ProgressSink for LogOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}
