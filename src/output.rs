use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BenchResult, DescribeResult, ExportResult, OptionsResult, OtusResult, SamplesResult};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_describe(result: &DescribeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_options(result: &OptionsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_samples(result: &SamplesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_otus(result: &OtusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_bench(result: &BenchResult) -> io::Result<()> {
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
