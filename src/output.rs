use std::io::{self, Write};

use serde::Serialize;

use crate::app::{RunReport, StageReport};
use crate::emit::EmitSummary;
use crate::validate::ValidationReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_stage(report: &StageReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_validation(report: &ValidationReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_emit(summary: &EmitSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_run(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
