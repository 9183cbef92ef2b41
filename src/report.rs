//! Summary table for the `run` command.

use std::time::Duration;

use comfy_table::{
    Cell, Color, ContentArrangement, Table,
    presets::{ASCII_FULL, UTF8_FULL},
};
use taskpool::{DispatchError, PoolStats};

/// How the submitted tasks settled, as seen by the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub submitted: usize,
    /// Returned the expected sum
    pub correct: usize,
    /// Returned something else
    pub wrong: usize,
    pub crashed: usize,
    pub timed_out: usize,
    pub failed: usize,
}

impl RunSummary {
    /// Record a settled task that had an error.
    pub fn record_error(&mut self, err: &DispatchError) {
        match err {
            DispatchError::WorkerCrashed { .. } => self.crashed += 1,
            DispatchError::TimedOut(_) => self.timed_out += 1,
            _ => self.failed += 1,
        }
    }

    /// Every task with an expected value got it, and nothing failed unexpectedly.
    pub fn is_clean(&self) -> bool {
        self.wrong == 0 && self.failed == 0
    }
}

/// Render the run summary and the pool's own counters.
pub fn render(
    summary: &RunSummary,
    stats: &PoolStats,
    elapsed: Duration,
    ascii: bool,
    colors: bool,
) -> String {
    let mut table = Table::new();
    table.load_preset(if ascii { ASCII_FULL } else { UTF8_FULL });
    table.set_content_arrangement(ContentArrangement::Dynamic);
    if !colors {
        table.force_no_tty();
    }
    table.set_header(vec!["Metric", "Value"]);

    let count = |value: usize, bad: Color| {
        let cell = Cell::new(value);
        if value == 0 { cell } else { cell.fg(bad) }
    };

    table.add_row(vec![Cell::new("Tasks submitted"), Cell::new(summary.submitted)]);
    table.add_row(vec![
        Cell::new("Correct results"),
        Cell::new(summary.correct).fg(Color::Green),
    ]);
    table.add_row(vec![Cell::new("Wrong results"), count(summary.wrong, Color::Red)]);
    table.add_row(vec![
        Cell::new("Worker crashes"),
        count(summary.crashed, Color::Yellow),
    ]);
    table.add_row(vec![
        Cell::new("Timed out"),
        count(summary.timed_out, Color::Yellow),
    ]);
    table.add_row(vec![Cell::new("Other errors"), count(summary.failed, Color::Red)]);
    table.add_row(vec![Cell::new("Workers"), Cell::new(stats.worker_count)]);
    table.add_row(vec![Cell::new("Respawned"), Cell::new(stats.respawned)]);
    table.add_row(vec![
        Cell::new("Elapsed"),
        Cell::new(format!("{:.1?}", elapsed)).fg(Color::Cyan),
    ]);

    table.to_string()
}
