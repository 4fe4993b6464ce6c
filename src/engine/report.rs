use super::record::VolumeRecord;
use crate::error::OpOutcome;
use colored::*;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeOutcome {
    pub line: String,
    pub reduced_gb: u64,
    pub outcome: OpOutcome,
}

/// Per-volume results collected over all batches of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<VolumeOutcome>,
}

impl RunReport {
    pub fn record_batch(&mut self, records: &[VolumeRecord]) {
        let lines: Vec<String> = records.iter().map(VolumeRecord::summary_line).collect();
        info!("===End shrinking for\n{}", lines.join("\n"));

        self.outcomes
            .extend(records.iter().zip(lines).map(|(record, line)| VolumeOutcome {
                line,
                reduced_gb: record.reduced_gb(),
                outcome: record.outcome,
            }));
    }

    pub fn reduced_gb(&self) -> u64 {
        self.outcomes.iter().map(|o| o.reduced_gb).sum()
    }

    pub fn shrunk(&self) -> usize {
        self.outcomes.iter().filter(|o| o.reduced_gb > 0).count()
    }

    /// Volumes whose shrink ended in an error, and how many of them timed out.
    pub fn failures(&self) -> (usize, usize) {
        self.outcomes
            .iter()
            .fold((0, 0), |(failed, timed_out), o| match o.outcome {
                OpOutcome::Ok => (failed, timed_out),
                OpOutcome::TimedOut => (failed + 1, timed_out + 1),
                OpOutcome::ToolingFailed => (failed + 1, timed_out),
            })
    }

    pub fn print(&self) {
        if self.outcomes.is_empty() {
            println!("{}", "No volumes were processed.".yellow());
            return;
        }

        println!("{}", "Shrink Results:".bold());
        for outcome in &self.outcomes {
            if outcome.reduced_gb > 0 {
                println!("  {}", outcome.line.green());
            } else {
                println!("  {}", outcome.line.dimmed());
            }
        }

        println!(
            "\n{} of {} volumes shrunk",
            self.shrunk(),
            self.outcomes.len()
        );
        let (failed, timed_out) = self.failures();
        if failed > 0 {
            let message = format!(
                "{} volumes kept their origin after an error ({} timed out), see the log",
                failed, timed_out
            );
            println!("{}", message.yellow());
        }

        let total = self.reduced_gb();
        if total > 0 {
            let message = format!("TOTALLY reduced {}GB Storage!", total);
            info!("{}", message);
            println!("\n{}", message.bold().green());
        }
    }
}
