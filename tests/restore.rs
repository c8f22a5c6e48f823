use std::fs;
use std::path::Path;
use std::sync::Mutex;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};

use kira_archive_fetch::api::{ArchiveClient, DownloadLinkRecord, ListingMode, RestoreTicket};
use kira_archive_fetch::app::{App, ProgressSink};
use kira_archive_fetch::domain::FileKind;
use kira_archive_fetch::error::KiraError;
use kira_archive_fetch::extract::{ExtractionJob, ExtractionTools};
use kira_archive_fetch::output::JsonOutput;
use kira_archive_fetch::restore::{
    PromptAnswer, RestorationCoordinator, RestoreDecision, RestorePrompt, TriggerOutcome,
};
use kira_archive_fetch::store::{RequestOptions, RestoreState, Upsert, read_entries};

struct MockArchive {
    listing: Vec<DownloadLinkRecord>,
    accept: bool,
    list_modes: Mutex<Vec<ListingMode>>,
    restores: Mutex<Vec<String>>,
}

impl MockArchive {
    fn new(listing: Vec<DownloadLinkRecord>) -> Self {
        Self {
            listing,
            accept: true,
            list_modes: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
        }
    }

    fn rejecting() -> Self {
        Self {
            accept: false,
            ..Self::new(Vec::new())
        }
    }

    fn restored(&self) -> Vec<String> {
        self.restores.lock().unwrap().clone()
    }
}

impl ArchiveClient for MockArchive {
    fn list_files(
        &self,
        _analysis_id: &str,
        mode: ListingMode,
    ) -> Result<Vec<DownloadLinkRecord>, KiraError> {
        self.list_modes.lock().unwrap().push(mode);
        Ok(self.listing.clone())
    }

    fn request_restore(
        &self,
        _analysis_id: &str,
        file_name: &str,
    ) -> Result<RestoreTicket, KiraError> {
        self.restores.lock().unwrap().push(file_name.to_string());
        if !self.accept {
            return Err(KiraError::RestoreRejected("quota_exceeded".to_string()));
        }
        Ok(RestoreTicket {
            restore_estimation: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
        })
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        _sink: &dyn ProgressSink,
    ) -> Result<u64, KiraError> {
        fs::write(destination, url.as_bytes()).unwrap();
        Ok(url.len() as u64)
    }
}

struct NoTools;

impl ExtractionTools for NoTools {
    fn extract(&self, _job: &ExtractionJob) -> Result<(), KiraError> {
        Err(KiraError::MissingTool("samtools".to_string()))
    }

    fn build_index(&self, _kind: FileKind, _path: &Path) -> Result<(), KiraError> {
        Err(KiraError::MissingTool("samtools".to_string()))
    }
}

struct Scripted(Vec<PromptAnswer>);

impl RestorePrompt for Scripted {
    fn ask(&mut self, _analysis_id: &str, _file_name: &str) -> PromptAnswer {
        self.0.remove(0)
    }
}

fn record(name: &str, archived: bool) -> DownloadLinkRecord {
    DownloadLinkRecord {
        file_name: name.to_string(),
        download_link: (!archived).then(|| format!("https://files.test/{name}")),
        currently_archived: archived,
    }
}

fn options(destination: &Path) -> RequestOptions {
    RequestOptions {
        destination: destination.display().to_string(),
        range: Some("chr1:1-1000".to_string()),
        ..Default::default()
    }
}

#[test]
fn repeated_trigger_overwrites_single_entry() {
    let temp = tempfile::tempdir().unwrap();
    let state_file = temp.path().join("restorations.json");
    let client = MockArchive::new(Vec::new());
    let coordinator = RestorationCoordinator::new(&client, &state_file);
    let options = options(temp.path());

    let first = coordinator.trigger("A1", "s.bam", &options).unwrap();
    let second = coordinator.trigger("A1", "s.bam", &options).unwrap();

    assert_matches!(
        first,
        TriggerOutcome::Recorded {
            change: Upsert::Inserted,
            ..
        }
    );
    assert_matches!(
        second,
        TriggerOutcome::Recorded {
            change: Upsert::Updated,
            ..
        }
    );
    let entries = read_entries(&state_file).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].options, options);
    assert_eq!(client.restored().len(), 2);
}

#[test]
fn different_options_are_separate_entries() {
    let temp = tempfile::tempdir().unwrap();
    let state_file = temp.path().join("restorations.json");
    let client = MockArchive::new(Vec::new());
    let coordinator = RestorationCoordinator::new(&client, &state_file);
    let mut other = options(temp.path());
    other.range = Some("chr2:1-1000".to_string());

    coordinator
        .trigger("A1", "s.bam", &options(temp.path()))
        .unwrap();
    coordinator.trigger("A1", "s.bam", &other).unwrap();

    assert_eq!(RestoreState::load(&state_file).len(), 2);
}

#[test]
fn rejected_trigger_persists_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let state_file = temp.path().join("restorations.json");
    let client = MockArchive::rejecting();
    let coordinator = RestorationCoordinator::new(&client, &state_file);

    let outcome = coordinator
        .trigger("A1", "s.bam", &options(temp.path()))
        .unwrap();

    assert_matches!(outcome, TriggerOutcome::Unavailable { reason } if reason.contains("quota_exceeded"));
    assert!(!state_file.exists());
}

#[test]
fn fetch_downloads_available_and_restores_archived() {
    let temp = tempfile::tempdir().unwrap();
    let state_file = temp.path().join("restorations.json");
    let destination = temp.path().join("out");
    let client = MockArchive::new(vec![
        record("notes.txt", false),
        record("s.bam", true),
        record("s.bam.bai", true),
    ]);
    let app = App::new(client, NoTools, state_file.clone());
    let options = RequestOptions {
        destination: destination.display().to_string(),
        ..Default::default()
    };

    let result = app
        .fetch("A1", &options, &mut RestoreDecision::always(), &JsonOutput)
        .unwrap();

    let actions: Vec<_> = result
        .items
        .iter()
        .map(|item| (item.file_name.as_str(), item.action.as_str()))
        .collect();
    assert_eq!(
        actions,
        vec![("notes.txt", "downloaded"), ("s.bam", "restore-requested")]
    );
    assert!(destination.join("notes.txt").exists());
    assert_eq!(app.client().restored(), vec!["s.bam".to_string()]);
    assert_eq!(
        *app.client().list_modes.lock().unwrap(),
        vec![ListingMode::Normal]
    );

    let entries = read_entries(&state_file).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].analysis_id, "A1");
    assert_eq!(entries[0].options, options);
}

#[test]
fn declined_restore_records_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let state_file = temp.path().join("restorations.json");
    let app = App::new(
        MockArchive::new(vec![record("s.bam", true)]),
        NoTools,
        state_file.clone(),
    );

    let result = app
        .fetch(
            "A1",
            &options(temp.path()),
            &mut RestoreDecision::never(),
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.items[0].action, "archived");
    assert!(app.client().restored().is_empty());
    assert!(!state_file.exists());
}

#[test]
fn prompt_none_answer_stops_asking() {
    let temp = tempfile::tempdir().unwrap();
    let state_file = temp.path().join("restorations.json");
    let app = App::new(
        MockArchive::new(vec![
            record("a.bam", true),
            record("b.bam", true),
            record("c.bam", true),
        ]),
        NoTools,
        state_file.clone(),
    );
    let mut decision = RestoreDecision::ask(Box::new(Scripted(vec![
        PromptAnswer::Yes,
        PromptAnswer::None,
    ])));

    let result = app
        .fetch("A1", &options(temp.path()), &mut decision, &JsonOutput)
        .unwrap();

    let actions: Vec<_> = result.items.iter().map(|item| item.action.as_str()).collect();
    assert_eq!(actions, vec!["restore-requested", "archived", "archived"]);
    assert_eq!(app.client().restored(), vec!["a.bam".to_string()]);
}

#[test]
fn restoration_file_option_overrides_state_file() {
    let temp = tempfile::tempdir().unwrap();
    let default_state = temp.path().join("default.json");
    let custom_state = temp.path().join("custom.json");
    let app = App::new(
        MockArchive::new(vec![record("s.bam", true)]),
        NoTools,
        default_state.clone(),
    );
    let mut options = options(temp.path());
    options.restoration_file = Some(custom_state.display().to_string());

    app.fetch("A1", &options, &mut RestoreDecision::always(), &JsonOutput)
        .unwrap();

    assert!(!default_state.exists());
    assert_eq!(read_entries(&custom_state).unwrap().len(), 1);
}

#[test]
fn per_file_failure_does_not_abort_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(
        MockArchive::new(vec![record("s.bam", false), record("t.txt", false)]),
        NoTools,
        temp.path().join("restorations.json"),
    );

    let result = app
        .fetch(
            "A1",
            &options(temp.path()),
            &mut RestoreDecision::never(),
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.items.len(), 2);
    assert_eq!(result.items[0].action, "failed");
    assert!(result.items[0].error.is_some());
    assert_eq!(result.items[1].action, "failed");
}
