use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;

use crate::api::ArchiveClient;
use crate::error::KiraError;
use crate::store::{RequestOptions, RestorationEntry, RestoreState, Upsert};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestoreMode {
    Always,
    Never,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Yes,
    No,
    /// Yes for this file and every later one in the session.
    All,
    /// No for this file and every later one in the session.
    None,
}

impl PromptAnswer {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(PromptAnswer::Yes),
            "n" | "no" => Some(PromptAnswer::No),
            "a" | "all" => Some(PromptAnswer::All),
            "none" => Some(PromptAnswer::None),
            _ => None,
        }
    }
}

pub trait RestorePrompt {
    fn ask(&mut self, analysis_id: &str, file_name: &str) -> PromptAnswer;
}

/// Per-session answer to "restore archived files?". Lives for one command
/// invocation and is passed to whoever needs it.
pub struct RestoreDecision {
    mode: RestoreMode,
    remembered: Option<bool>,
    prompt: Option<Box<dyn RestorePrompt>>,
}

impl RestoreDecision {
    pub fn always() -> Self {
        Self {
            mode: RestoreMode::Always,
            remembered: None,
            prompt: None,
        }
    }

    pub fn never() -> Self {
        Self {
            mode: RestoreMode::Never,
            remembered: None,
            prompt: None,
        }
    }

    pub fn ask(prompt: Box<dyn RestorePrompt>) -> Self {
        Self {
            mode: RestoreMode::Ask,
            remembered: None,
            prompt: Some(prompt),
        }
    }

    pub fn should_restore(&mut self, analysis_id: &str, file_name: &str) -> bool {
        match self.mode {
            RestoreMode::Always => true,
            RestoreMode::Never => false,
            RestoreMode::Ask => {
                if let Some(answer) = self.remembered {
                    return answer;
                }
                let Some(prompt) = self.prompt.as_mut() else {
                    return false;
                };
                match prompt.ask(analysis_id, file_name) {
                    PromptAnswer::Yes => true,
                    PromptAnswer::No => false,
                    PromptAnswer::All => {
                        self.remembered = Some(true);
                        true
                    }
                    PromptAnswer::None => {
                        self.remembered = Some(false);
                        false
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Recorded {
        restore_estimation: Option<DateTime<Utc>>,
        change: Upsert,
    },
    /// Restore could not be requested; nothing was persisted.
    Unavailable { reason: String },
}

/// Requests restores and records each accepted one in the state file.
pub struct RestorationCoordinator<'a, C: ArchiveClient> {
    client: &'a C,
    state_file: PathBuf,
}

impl<'a, C: ArchiveClient> RestorationCoordinator<'a, C> {
    pub fn new(client: &'a C, state_file: &Path) -> Self {
        Self {
            client,
            state_file: state_file.to_path_buf(),
        }
    }

    /// Only a failure to write the state file is returned as an error.
    /// Remote rejections and transport failures are logged and reported as
    /// [`TriggerOutcome::Unavailable`]; the trigger itself is never retried.
    pub fn trigger(
        &self,
        analysis_id: &str,
        file_name: &str,
        options: &RequestOptions,
    ) -> Result<TriggerOutcome, KiraError> {
        let ticket = match self.client.request_restore(analysis_id, file_name) {
            Ok(ticket) => ticket,
            Err(err) => {
                tracing::warn!(analysis_id, file = file_name, error = %err, "restore request failed");
                return Ok(TriggerOutcome::Unavailable {
                    reason: err.to_string(),
                });
            }
        };

        let mut state = RestoreState::load(&self.state_file);
        let change = state.upsert(RestorationEntry {
            analysis_id: analysis_id.to_string(),
            file_name: file_name.to_string(),
            restore_estimation: ticket.restore_estimation,
            options: options.clone(),
        });
        state.save()?;

        tracing::info!(
            analysis_id,
            file = file_name,
            estimation = ?ticket.restore_estimation,
            change = ?change,
            "restore requested"
        );
        Ok(TriggerOutcome::Recorded {
            restore_estimation: ticket.restore_estimation,
            change,
        })
    }
}
