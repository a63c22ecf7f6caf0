use super::reporter::{Report, Reporter};
use colored::Colorize;

pub struct CliReporter;

impl CliReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for CliReporter {
    fn error(&mut self, report: Report) {
        eprintln!("{}", report.msg.bright_red());
        for line in &report.trace {
            eprintln!("{line}");
        }
    }
}
