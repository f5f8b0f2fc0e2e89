use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{ProgressEvent, ProgressSink, RunReport, StageOutcome, StageState, StageStatus};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_status(status: &[StageStatus]) -> io::Result<()> {
        Self::print_json(&status)
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

/// Progress lines on stderr for interactive runs.
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_run(report: &RunReport) {
        println!("{CYAN}KIRA-BG run summary{RESET}");
        println!(
            "{GREEN}executed: {}{RESET}, skipped: {}",
            report.executed(),
            report.stages.len() - report.executed()
        );
        for stage in &report.stages {
            match stage.outcome {
                StageOutcome::Executed => println!(
                    "{GREEN}  ran     {} -> {} ({} ms){RESET}",
                    stage.stage,
                    stage.artifact,
                    stage.elapsed_ms.unwrap_or(0)
                ),
                StageOutcome::Skipped => {
                    println!("{YELLOW}  cached  {} -> {}{RESET}", stage.stage, stage.artifact)
                }
            }
        }
    }

    pub fn print_status(status: &[StageStatus]) {
        for stage in status {
            let (color, label) = match stage.state {
                StageState::Complete => (GREEN, "complete"),
                _ => (YELLOW, "pending"),
            };
            println!("{color}{label:<9}{RESET} {:<26} {}", stage.stage, stage.path);
        }
    }
}
