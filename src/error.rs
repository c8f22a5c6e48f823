use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid genomic region: {0}")]
    InvalidRegion(String),

    #[error("invalid BED file {path}: {message}")]
    InvalidBed { path: PathBuf, message: String },

    #[error("ranged download not supported for {0}")]
    UnsupportedRange(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("archive request failed: {0}")]
    Http(String),

    #[error("archive returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("restore request rejected: {0}")]
    RestoreRejected(String),

    #[error("restoration state is corrupt: {0}")]
    StateCorrupt(String),

    #[error("file not listed for analysis {analysis_id}: {file_name}")]
    FileNotListed {
        analysis_id: String,
        file_name: String,
    },

    #[error("file is still archived: {0}")]
    StillArchived(String),

    #[error("index required for ranged download is not available: {0}")]
    MissingIndex(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
