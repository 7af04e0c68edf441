//! `ReportSink`: one call per completed backup run
//! with counts/state, grounded on `urbackupserver/Alerts.cpp` and
//! `LogReport.cpp` both funnelling into a single notification point.
//! Mail/script backends are out of scope; this is the seam C7 calls
//! into once a run finishes.

use ub_api_types::{BackupKind, BackupRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Warnings,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub backupid: i64,
    pub client: i64,
    pub kind: BackupKind,
    pub outcome: RunOutcome,
    pub errors: u32,
    pub size_bytes: u64,
    pub duration_secs: i64,
}

impl RunReport {
    pub fn from_run(run: &BackupRun) -> Self {
        let outcome = if run.has_early_error {
            RunOutcome::Failed
        } else if run.errors > 0 {
            RunOutcome::Warnings
        } else {
            RunOutcome::Success
        };
        RunReport {
            backupid: run.backupid,
            client: run.client,
            kind: run.kind,
            outcome,
            errors: run.errors,
            size_bytes: run.size_bytes,
            duration_secs: run.completed_at.unwrap_or(run.started_at) - run.started_at,
        }
    }
}

pub trait ReportSink: Send + Sync {
    fn report(&self, report: RunReport);
}

/// Default sink: one log line per run. Stands in for the mail/script
/// notifiers the original wires `Alerts.cpp` up to, which are out of
/// scope here.
pub struct LoggingReportSink;

impl ReportSink for LoggingReportSink {
    fn report(&self, report: RunReport) {
        match report.outcome {
            RunOutcome::Success => log::info!(
                "backup {} client={} kind={:?} ok, {} bytes in {}s",
                report.backupid, report.client, report.kind, report.size_bytes, report.duration_secs
            ),
            RunOutcome::Warnings => log::warn!(
                "backup {} client={} kind={:?} completed with {} error(s)",
                report.backupid, report.client, report.kind, report.errors
            ),
            RunOutcome::Failed => log::error!(
                "backup {} client={} kind={:?} failed early",
                report.backupid, report.client, report.kind
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ub_api_types::error::LogLine;

    struct RecordingSink {
        reports: Mutex<Vec<RunReport>>,
    }

    impl ReportSink for RecordingSink {
        fn report(&self, report: RunReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    #[test]
    fn classifies_outcome_from_run_state() {
        let mut run = BackupRun::new(1, 1, 0, BackupKind::IncrFile, 1000);
        run.finish(1010);
        assert_eq!(RunReport::from_run(&run).outcome, RunOutcome::Success);

        run.push_log(LogLine::new(log::Level::Warn, 1005, "retry"));
        assert_eq!(RunReport::from_run(&run).outcome, RunOutcome::Warnings);

        run.has_early_error = true;
        assert_eq!(RunReport::from_run(&run).outcome, RunOutcome::Failed);
    }

    #[test]
    fn sink_receives_one_report_per_run() {
        let sink = RecordingSink { reports: Mutex::new(Vec::new()) };
        let mut run = BackupRun::new(5, 2, 0, BackupKind::FullImage, 2000);
        run.finish(2100);
        sink.report(RunReport::from_run(&run));

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].duration_secs, 100);
    }
}
