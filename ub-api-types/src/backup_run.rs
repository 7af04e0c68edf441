//! `BackupRun`. One file or image backup; mutated only by its owning
//! worker, durably marked `complete=1` before becoming visible to cleanup
//! or restore.

use crate::error::LogLine;
use crate::TGroup;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    FullFile,
    IncrFile,
    FullImage,
    IncrImage,
}

impl BackupKind {
    pub fn is_image(self) -> bool {
        matches!(self, BackupKind::FullImage | BackupKind::IncrImage)
    }

    pub fn is_incremental(self) -> bool {
        matches!(self, BackupKind::IncrFile | BackupKind::IncrImage)
    }

    /// Status-page action tag: `sa_full_file|sa_incr_file|sa_full_image|sa_incr_image`.
    pub fn status_tag(self) -> &'static str {
        match self {
            BackupKind::FullFile => "sa_full_file",
            BackupKind::IncrFile => "sa_incr_file",
            BackupKind::FullImage => "sa_full_image",
            BackupKind::IncrImage => "sa_incr_image",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub backupid: i64,
    pub client: i64,
    pub tgroup: TGroup,
    pub kind: BackupKind,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub resumed: bool,
    pub size_calculated: bool,
    pub size_bytes: u64,
    pub archived: bool,
    pub archive_timeout: Option<i64>,
    /// Parent backup id for incrementals.
    pub incremental_ref: Option<i64>,
    pub synctime: i64,
    pub delete_pending: bool,
    pub complete: bool,
    pub errors: u32,
    pub has_early_error: bool,
    pub log: Vec<LogLine>,
}

impl BackupRun {
    pub fn new(backupid: i64, client: i64, tgroup: TGroup, kind: BackupKind, started_at: i64) -> Self {
        Self {
            backupid,
            client,
            tgroup,
            kind,
            started_at,
            completed_at: None,
            resumed: false,
            size_calculated: false,
            size_bytes: 0,
            archived: false,
            archive_timeout: None,
            incremental_ref: None,
            synctime: started_at,
            delete_pending: false,
            complete: false,
            errors: 0,
            has_early_error: false,
            log: Vec::new(),
        }
    }

    pub fn push_log(&mut self, line: LogLine) {
        if line.level <= crate::error::LogLevel::Warn {
            self.errors += 1;
        }
        self.log.push(line);
    }

    /// Callers distinguish success via `errors==0 && !has_early_error`.
    pub fn succeeded(&self) -> bool {
        self.errors == 0 && !self.has_early_error
    }

    pub fn finish(&mut self, completed_at: i64) {
        self.completed_at = Some(completed_at);
        self.complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogLevel;

    #[test]
    fn success_requires_no_errors_and_no_early_error() {
        let mut run = BackupRun::new(1, 1, 0, BackupKind::FullFile, 1000);
        assert!(run.succeeded());
        run.push_log(LogLine::new(LogLevel::Info, 1001, "starting"));
        assert!(run.succeeded());
        run.push_log(LogLine::new(LogLevel::Warn, 1002, "chunk re-read"));
        assert!(!run.succeeded());
    }
}
