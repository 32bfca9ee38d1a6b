use crate::application::coordinator::GlobalTxReport;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    global_tx_id: &'a str,
    phase: String,
    outcome: String,
    health: String,
    legs: usize,
    stuck: usize,
}

impl<'a> From<&'a GlobalTxReport> for ReportRow<'a> {
    fn from(report: &'a GlobalTxReport) -> Self {
        Self {
            global_tx_id: &report.global_tx_id,
            phase: report.phase.to_string(),
            outcome: report.outcome.map(|o| o.to_string()).unwrap_or_default(),
            health: report.health().to_string(),
            legs: report.legs.len(),
            stuck: report.stuck_legs().count(),
        }
    }
}

/// Writes the operator view as CSV, one line per global transaction.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_reports<'a>(&mut self, reports: impl IntoIterator<Item = &'a GlobalTxReport>) -> Result<()> {
        let mut wrote_any = false;
        for report in reports {
            self.writer.serialize(ReportRow::from(report))?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer
                .write_record(["global_tx_id", "phase", "outcome", "health", "legs", "stuck"])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
