use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{ArchiveClient, DownloadLinkRecord, ListingMode};
use crate::domain::{
    FileKind, RegionSet, derive_output_name, index_candidates, index_file_name, is_index_file,
    matches_filetypes,
};
use crate::error::KiraError;
use crate::extract::{ExtractionJob, ExtractionTools};
use crate::restore::{RestorationCoordinator, RestoreDecision, TriggerOutcome};
use crate::resume::{ResumeReport, ResumeScheduler};
use crate::store::{RequestOptions, RestoreState};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Download context rebuilt from [`RequestOptions`].
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub destination: PathBuf,
    pub overwrite: bool,
    pub filetypes: Vec<String>,
    pub regions: RegionSet,
}

impl DownloadRequest {
    pub fn from_options(options: &RequestOptions) -> Result<Self, KiraError> {
        let regions = RegionSet::from_sources(
            options.range.as_deref().filter(|range| !range.trim().is_empty()),
            options.bed.as_deref().map(Path::new),
        )?;
        Ok(Self {
            destination: PathBuf::from(&options.destination),
            overwrite: options.overwrite,
            filetypes: options.filetypes.clone().unwrap_or_default(),
            regions,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadAction {
    Downloaded,
    Extracted,
    Skipped,
}

impl DownloadAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadAction::Downloaded => "downloaded",
            DownloadAction::Extracted => "extracted",
            DownloadAction::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub file_name: String,
    pub action: DownloadAction,
    pub path: PathBuf,
    pub index_path: Option<PathBuf>,
}

/// Chooses between full and ranged download for one listed file.
pub struct DownloadOrchestrator<'a, C: ArchiveClient, T: ExtractionTools> {
    client: &'a C,
    tools: &'a T,
}

impl<'a, C: ArchiveClient, T: ExtractionTools> DownloadOrchestrator<'a, C, T> {
    pub fn new(client: &'a C, tools: &'a T) -> Self {
        Self { client, tools }
    }

    pub fn download(
        &self,
        file: &DownloadLinkRecord,
        listing: &[DownloadLinkRecord],
        request: &DownloadRequest,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, KiraError> {
        if file.currently_archived {
            return Err(KiraError::StillArchived(file.file_name.clone()));
        }
        let url = file
            .download_link
            .as_deref()
            .ok_or_else(|| KiraError::Http(format!("no download link for {}", file.file_name)))?;
        let index = find_index_record(&file.file_name, listing);

        if request.regions.is_empty() {
            self.download_full(file, url, index, request, sink)
        } else {
            self.download_ranged(file, url, index, request, sink)
        }
    }

    fn download_full(
        &self,
        file: &DownloadLinkRecord,
        url: &str,
        index: Option<&DownloadLinkRecord>,
        request: &DownloadRequest,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, KiraError> {
        let kind = FileKind::from_file_name(&file.file_name);
        let path = request.destination.join(&file.file_name);
        let index_path =
            local_index_name(&file.file_name, index).map(|name| request.destination.join(name));

        if !request.overwrite && path.exists() {
            return Ok(skipped(file, path, index_path, sink));
        }

        fs::create_dir_all(&request.destination)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        sink.event(ProgressEvent {
            message: format!("phase=Download; {}", file.file_name),
            elapsed: None,
        });
        let start = Instant::now();
        let bytes = self.client.download(url, &path, sink)?;
        sink.event(ProgressEvent {
            message: format!("phase=Download; {} done bytes={bytes}", file.file_name),
            elapsed: Some(start.elapsed()),
        });

        let Some(index_path) = index_path else {
            return Ok(DownloadOutcome {
                file_name: file.file_name.clone(),
                action: DownloadAction::Downloaded,
                path,
                index_path: None,
            });
        };

        match index.and_then(|record| record.download_link.as_deref()) {
            Some(link) => {
                if let Err(err) = self.client.download(link, &index_path, sink) {
                    tracing::warn!(file = %file.file_name, error = %err, "index download failed");
                }
            }
            None => tracing::debug!(file = %file.file_name, "no remote index listed"),
        }
        if !index_path.exists() {
            sink.event(ProgressEvent {
                message: format!("phase=Index; building index for {}", file.file_name),
                elapsed: None,
            });
            self.tools.build_index(kind, &path)?;
        }

        Ok(DownloadOutcome {
            file_name: file.file_name.clone(),
            action: DownloadAction::Downloaded,
            path,
            index_path: Some(index_path),
        })
    }

    fn download_ranged(
        &self,
        file: &DownloadLinkRecord,
        url: &str,
        index: Option<&DownloadLinkRecord>,
        request: &DownloadRequest,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, KiraError> {
        let kind = FileKind::from_file_name(&file.file_name);
        if !kind.is_alignment() && !kind.is_variant() {
            return Err(KiraError::UnsupportedRange(file.file_name.clone()));
        }
        let index_link = index
            .and_then(|record| record.download_link.as_deref())
            .ok_or_else(|| KiraError::MissingIndex(file.file_name.clone()))?;
        let local_index = local_index_name(&file.file_name, index)
            .map(|name| request.destination.join(name))
            .ok_or_else(|| KiraError::UnsupportedRange(file.file_name.clone()))?;

        let output_name = derive_output_name(&file.file_name, &request.regions.labels());
        let output_path = request.destination.join(&output_name);
        let output_index = index_file_name(&output_name).map(|name| request.destination.join(name));
        if !request.overwrite && output_path.exists() {
            return Ok(skipped(file, output_path, output_index, sink));
        }

        fs::create_dir_all(&request.destination)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if request.overwrite || !local_index.exists() {
            sink.event(ProgressEvent {
                message: format!("phase=Index; fetching index for {}", file.file_name),
                elapsed: None,
            });
            self.client.download(index_link, &local_index, sink)?;
        }

        let job = ExtractionJob {
            source_url: url.to_string(),
            kind,
            regions: request.regions.clone(),
            index_path: local_index,
            output_path: output_path.clone(),
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Extract; {} regions={} -> {output_name}",
                file.file_name,
                job.regions.len()
            ),
            elapsed: None,
        });
        let start = Instant::now();
        self.tools.extract(&job)?;
        self.tools.build_index(kind, &output_path)?;
        sink.event(ProgressEvent {
            message: format!("phase=Extract; {output_name} done"),
            elapsed: Some(start.elapsed()),
        });

        Ok(DownloadOutcome {
            file_name: file.file_name.clone(),
            action: DownloadAction::Extracted,
            path: output_path,
            index_path: output_index,
        })
    }
}

fn skipped(
    file: &DownloadLinkRecord,
    path: PathBuf,
    index_path: Option<PathBuf>,
    sink: &dyn ProgressSink,
) -> DownloadOutcome {
    sink.event(ProgressEvent {
        message: format!("phase=Store; {} already present", path.display()),
        elapsed: None,
    });
    DownloadOutcome {
        file_name: file.file_name.clone(),
        action: DownloadAction::Skipped,
        path,
        index_path,
    }
}

/// Local index name for `file_name`; a CSI index keeps its own extension.
fn local_index_name(file_name: &str, index: Option<&DownloadLinkRecord>) -> Option<String> {
    match index {
        Some(record) if record.file_name.to_ascii_lowercase().ends_with(".csi") => {
            Some(format!("{file_name}.csi"))
        }
        _ => index_file_name(file_name),
    }
}

/// First downloadable listing entry that can serve as the index of `file_name`.
pub fn find_index_record<'l>(
    file_name: &str,
    listing: &'l [DownloadLinkRecord],
) -> Option<&'l DownloadLinkRecord> {
    index_candidates(file_name).into_iter().find_map(|candidate| {
        listing.iter().find(|record| {
            record.file_name == candidate
                && !record.currently_archived
                && record.download_link.is_some()
        })
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub analysis_id: String,
    pub items: Vec<FetchItemResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchItemResult {
    pub file_name: String,
    pub action: String,
    pub path: Option<String>,
    pub restore_estimation: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub state_file: String,
    pub entries: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub analysis_id: String,
    pub file_name: String,
    pub restore_estimation: Option<String>,
    pub ready: bool,
    pub destination: String,
}

pub struct App<C: ArchiveClient, T: ExtractionTools> {
    client: C,
    tools: T,
    state_file: PathBuf,
    stale_after: chrono::Duration,
}

impl<C: ArchiveClient, T: ExtractionTools> App<C, T> {
    pub fn new(client: C, tools: T, state_file: PathBuf) -> Self {
        Self {
            client,
            tools,
            state_file,
            stale_after: stale_window(crate::config::DEFAULT_STALE_AFTER_HOURS),
        }
    }

    pub fn with_stale_after_hours(mut self, hours: u64) -> Self {
        self.stale_after = stale_window(hours);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    pub fn orchestrator(&self) -> DownloadOrchestrator<'_, C, T> {
        DownloadOrchestrator::new(&self.client, &self.tools)
    }

    pub fn fetch(
        &self,
        analysis_id: &str,
        options: &RequestOptions,
        decision: &mut RestoreDecision,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, KiraError> {
        let request = DownloadRequest::from_options(options)?;
        let state_file = options
            .restoration_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_file.clone());
        let coordinator = RestorationCoordinator::new(&self.client, &state_file);
        let orchestrator = self.orchestrator();

        sink.event(ProgressEvent {
            message: format!("phase=Resolve; listing analysis {analysis_id}"),
            elapsed: None,
        });
        let listing = self.client.list_files(analysis_id, ListingMode::Normal)?;
        let selected = select_files(&listing, &request.filetypes);

        let mut items = Vec::new();
        for file in selected {
            if file.currently_archived {
                items.push(self.handle_archived(
                    &coordinator,
                    analysis_id,
                    file,
                    options,
                    decision,
                )?);
                continue;
            }
            let item = match orchestrator.download(file, &listing, &request, sink) {
                Ok(outcome) => FetchItemResult {
                    file_name: outcome.file_name,
                    action: outcome.action.as_str().to_string(),
                    path: Some(outcome.path.display().to_string()),
                    restore_estimation: None,
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(analysis_id, file = %file.file_name, error = %err, "download failed");
                    FetchItemResult {
                        file_name: file.file_name.clone(),
                        action: "failed".to_string(),
                        path: None,
                        restore_estimation: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            items.push(item);
        }

        Ok(FetchResult {
            analysis_id: analysis_id.to_string(),
            items,
        })
    }

    fn handle_archived(
        &self,
        coordinator: &RestorationCoordinator<'_, C>,
        analysis_id: &str,
        file: &DownloadLinkRecord,
        options: &RequestOptions,
        decision: &mut RestoreDecision,
    ) -> Result<FetchItemResult, KiraError> {
        let mut item = FetchItemResult {
            file_name: file.file_name.clone(),
            action: "archived".to_string(),
            path: None,
            restore_estimation: None,
            error: None,
        };
        if !decision.should_restore(analysis_id, &file.file_name) {
            tracing::info!(analysis_id, file = %file.file_name, "archived file left in cold storage");
            return Ok(item);
        }
        match coordinator.trigger(analysis_id, &file.file_name, options)? {
            TriggerOutcome::Recorded {
                restore_estimation, ..
            } => {
                item.action = "restore-requested".to_string();
                item.restore_estimation = restore_estimation.map(|ts| ts.to_rfc3339());
            }
            TriggerOutcome::Unavailable { reason } => {
                item.error = Some(reason);
            }
        }
        Ok(item)
    }

    pub fn resume(
        &self,
        now: DateTime<Utc>,
        sink: &dyn ProgressSink,
    ) -> Result<ResumeReport, KiraError> {
        ResumeScheduler::new(&self.client, self.orchestrator())
            .with_stale_after(self.stale_after)
            .run(&self.state_file, now, sink)
    }

    pub fn status(&self, now: DateTime<Utc>) -> StatusResult {
        let state = RestoreState::load(&self.state_file);
        let entries = state
            .entries()
            .iter()
            .map(|entry| StatusEntry {
                analysis_id: entry.analysis_id.clone(),
                file_name: entry.file_name.clone(),
                restore_estimation: entry.restore_estimation.map(|ts| ts.to_rfc3339()),
                ready: entry.is_ready(now),
                destination: entry.options.destination.clone(),
            })
            .collect();
        StatusResult {
            state_file: self.state_file.display().to_string(),
            entries,
        }
    }
}

fn stale_window(hours: u64) -> chrono::Duration {
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or(chrono::Duration::MAX)
}

/// Applies the file-type filter and drops index files that travel with a
/// listed main file.
pub fn select_files<'l>(
    listing: &'l [DownloadLinkRecord],
    filetypes: &[String],
) -> Vec<&'l DownloadLinkRecord> {
    listing
        .iter()
        .filter(|record| {
            !(is_index_file(&record.file_name)
                && listing.iter().any(|other| {
                    index_candidates(&other.file_name).contains(&record.file_name)
                }))
        })
        .filter(|record| matches_filetypes(&record.file_name, filetypes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> DownloadLinkRecord {
        DownloadLinkRecord {
            file_name: name.to_string(),
            download_link: Some(format!("https://files.test/{name}")),
            currently_archived: false,
        }
    }

    #[test]
    fn select_skips_companion_indexes() {
        let listing = vec![
            record("s.bam"),
            record("s.bam.bai"),
            record("v.vcf.gz"),
            record("v.vcf.gz.tbi"),
            record("orphan.tbi"),
        ];
        let names: Vec<_> = select_files(&listing, &[])
            .into_iter()
            .map(|record| record.file_name.as_str())
            .collect();
        assert_eq!(names, vec!["s.bam", "v.vcf.gz", "orphan.tbi"]);

        let names: Vec<_> = select_files(&listing, &["vcf.gz".to_string()])
            .into_iter()
            .map(|record| record.file_name.as_str())
            .collect();
        assert_eq!(names, vec!["v.vcf.gz"]);
    }

    #[test]
    fn index_lookup_ignores_archived() {
        let mut archived = record("s.bam.bai");
        archived.currently_archived = true;
        let listing = vec![record("s.bam"), archived, record("s.bai")];
        let found = find_index_record("s.bam", &listing).unwrap();
        assert_eq!(found.file_name, "s.bai");
    }

    #[test]
    fn csi_index_keeps_extension() {
        let csi = record("v.vcf.gz.csi");
        assert_eq!(
            local_index_name("v.vcf.gz", Some(&csi)).as_deref(),
            Some("v.vcf.gz.csi")
        );
        let bai = record("s.bai");
        assert_eq!(
            local_index_name("s.bam", Some(&bai)).as_deref(),
            Some("s.bam.bai")
        );
        assert_eq!(local_index_name("notes.txt", None), None);
    }

    #[test]
    fn request_from_options() {
        let options = RequestOptions {
            destination: "/data/out".to_string(),
            overwrite: true,
            range: Some("chr1:1-10,chr2:5-6".to_string()),
            filetypes: Some(vec!["bam".to_string()]),
            ..Default::default()
        };
        let request = DownloadRequest::from_options(&options).unwrap();
        assert_eq!(request.destination, PathBuf::from("/data/out"));
        assert!(request.overwrite);
        assert_eq!(request.regions.len(), 2);
        assert_eq!(request.filetypes, vec!["bam".to_string()]);
    }
}
