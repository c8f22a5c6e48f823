//! Resumes downloads whose restore was requested in an earlier invocation.
//!
//! A pass walks every stored entry in order. Entries whose estimation lies in
//! the future are kept untouched. Ready entries are re-listed without ever
//! triggering another restore and handed to the orchestrator; any failure
//! keeps the entry for the next pass. Only a finished download removes it.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{ArchiveClient, ListingMode};
use crate::app::{
    DownloadAction, DownloadOrchestrator, DownloadOutcome, DownloadRequest, ProgressEvent,
    ProgressSink,
};
use crate::error::KiraError;
use crate::extract::ExtractionTools;
use crate::store::{RestorationEntry, RestoreState, read_entries, write_entries};

#[derive(Debug, Clone, Serialize)]
pub struct ResumeReport {
    pub state_file: String,
    pub ready: usize,
    pub pending: usize,
    pub completed: usize,
    pub retained: usize,
    pub items: Vec<ResumeItem>,
}

impl ResumeReport {
    fn empty(state_file: &Path) -> Self {
        Self {
            state_file: state_file.display().to_string(),
            ready: 0,
            pending: 0,
            completed: 0,
            retained: 0,
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeItem {
    pub analysis_id: String,
    pub file_name: String,
    pub state: ResumeState,
    pub path: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeState {
    /// Estimation still in the future.
    Pending,
    StillArchived,
    NotFound,
    Failed,
    Downloaded,
    Extracted,
    Skipped,
}

impl ResumeState {
    pub fn is_retained(&self) -> bool {
        matches!(
            self,
            ResumeState::Pending
                | ResumeState::StillArchived
                | ResumeState::NotFound
                | ResumeState::Failed
        )
    }

    fn from_error(err: &KiraError) -> Self {
        match err {
            KiraError::StillArchived(_) => ResumeState::StillArchived,
            KiraError::FileNotListed { .. } => ResumeState::NotFound,
            _ => ResumeState::Failed,
        }
    }

    fn from_outcome(outcome: &DownloadOutcome) -> Self {
        match outcome.action {
            DownloadAction::Downloaded => ResumeState::Downloaded,
            DownloadAction::Extracted => ResumeState::Extracted,
            DownloadAction::Skipped => ResumeState::Skipped,
        }
    }
}

pub struct ResumeScheduler<'a, C: ArchiveClient, T: ExtractionTools> {
    client: &'a C,
    orchestrator: DownloadOrchestrator<'a, C, T>,
    stale_after: chrono::Duration,
}

impl<'a, C: ArchiveClient, T: ExtractionTools> ResumeScheduler<'a, C, T> {
    pub fn new(client: &'a C, orchestrator: DownloadOrchestrator<'a, C, T>) -> Self {
        Self {
            client,
            orchestrator,
            stale_after: chrono::Duration::MAX,
        }
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// One pass over the state file. Entries are processed strictly in
    /// order; the retained ones are written back in a single write.
    pub fn run(
        &self,
        state_file: &Path,
        now: DateTime<Utc>,
        sink: &dyn ProgressSink,
    ) -> Result<ResumeReport, KiraError> {
        let Some(entries) = read_entries(state_file) else {
            tracing::debug!(path = %state_file.display(), "no pending restorations");
            return Ok(ResumeReport::empty(state_file));
        };
        let state = RestoreState::with_entries(state_file, entries);
        let partition = state.partition(now);
        let mut report = ResumeReport {
            ready: partition.ready.len(),
            pending: partition.pending.len(),
            ..ResumeReport::empty(state_file)
        };
        tracing::info!(
            ready = report.ready,
            pending = report.pending,
            "resuming restored downloads"
        );

        let mut retained: Vec<RestorationEntry> = Vec::with_capacity(state.len());
        for entry in state.entries() {
            let item = if entry.is_ready(now) {
                self.warn_if_stale(entry, now);
                self.resume_entry(entry, sink)
            } else {
                ResumeItem {
                    analysis_id: entry.analysis_id.clone(),
                    file_name: entry.file_name.clone(),
                    state: ResumeState::Pending,
                    path: None,
                    detail: entry.restore_estimation.map(|ts| ts.to_rfc3339()),
                }
            };
            if item.state.is_retained() {
                retained.push(entry.clone());
            } else {
                report.completed += 1;
            }
            report.items.push(item);
        }

        report.retained = retained.len();
        if report.completed > 0 {
            write_entries(state_file, &retained)?;
        }
        Ok(report)
    }

    fn resume_entry(&self, entry: &RestorationEntry, sink: &dyn ProgressSink) -> ResumeItem {
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resume; {} from analysis {}",
                entry.file_name, entry.analysis_id
            ),
            elapsed: None,
        });
        let mut item = ResumeItem {
            analysis_id: entry.analysis_id.clone(),
            file_name: entry.file_name.clone(),
            state: ResumeState::Failed,
            path: None,
            detail: None,
        };
        match self.try_resume(entry, sink) {
            Ok(outcome) => {
                tracing::info!(
                    analysis_id = %entry.analysis_id,
                    file = %entry.file_name,
                    action = outcome.action.as_str(),
                    "restored file downloaded"
                );
                item.state = ResumeState::from_outcome(&outcome);
                item.path = Some(outcome.path.display().to_string());
            }
            Err(err) => {
                item.state = ResumeState::from_error(&err);
                match item.state {
                    ResumeState::StillArchived => tracing::info!(
                        analysis_id = %entry.analysis_id,
                        file = %entry.file_name,
                        "file still archived, keeping entry"
                    ),
                    _ => tracing::warn!(
                        analysis_id = %entry.analysis_id,
                        file = %entry.file_name,
                        error = %err,
                        "resume failed, keeping entry"
                    ),
                }
                item.detail = Some(err.to_string());
            }
        }
        item
    }

    fn try_resume(
        &self,
        entry: &RestorationEntry,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, KiraError> {
        let listing = self
            .client
            .list_files(&entry.analysis_id, ListingMode::SuppressRestore)?;
        let file = listing
            .iter()
            .find(|record| record.file_name == entry.file_name)
            .ok_or_else(|| KiraError::FileNotListed {
                analysis_id: entry.analysis_id.clone(),
                file_name: entry.file_name.clone(),
            })?;
        if file.currently_archived {
            return Err(KiraError::StillArchived(entry.file_name.clone()));
        }
        let request = DownloadRequest::from_options(&entry.options)?;
        self.orchestrator.download(file, &listing, &request, sink)
    }

    fn warn_if_stale(&self, entry: &RestorationEntry, now: DateTime<Utc>) {
        if let Some(overdue) = entry.overdue_by(now) {
            if overdue > self.stale_after {
                tracing::warn!(
                    analysis_id = %entry.analysis_id,
                    file = %entry.file_name,
                    overdue_hours = overdue.num_hours(),
                    "restoration overdue, still retrying"
                );
            }
        }
    }
}
