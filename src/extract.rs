//! Ranged extraction through external htslib tools.
//!
//! Alignment files go through a single `samtools view` call. Variant files
//! need two processes: `tabix` streams the requested regions as plain text
//! and `bgzip` recompresses that stream into the final artifact. Output is
//! always written to a temp file beside the destination and only renamed
//! into place once every stage has finished cleanly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;

use crate::config::ToolPaths;
use crate::domain::{FileKind, RegionSet};
use crate::error::KiraError;
use crate::fs_util::{discard, parent_dir, persist, temp_file_beside};

/// One extraction attempt. Built per attempt, never persisted.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub source_url: String,
    pub kind: FileKind,
    pub regions: RegionSet,
    pub index_path: PathBuf,
    pub output_path: PathBuf,
}

impl ExtractionJob {
    pub fn requires_index(&self) -> bool {
        !self.regions.is_empty()
    }

    /// Remote source pinned to the local index, in htslib `##idx##` form.
    pub fn indexed_source(&self) -> String {
        match self.index_path.file_name() {
            Some(name) => format!("{}##idx##{}", self.source_url, name.to_string_lossy()),
            None => self.source_url.clone(),
        }
    }

    /// Directory the extractor runs in; htslib finds the index by file name
    /// relative to the working directory.
    pub fn index_dir(&self) -> &Path {
        parent_dir(&self.index_path)
    }
}

pub trait ExtractionTools: Send + Sync {
    fn extract(&self, job: &ExtractionJob) -> Result<(), KiraError>;
    fn build_index(&self, kind: FileKind, path: &Path) -> Result<(), KiraError>;
}

/// Exit state of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub tool: String,
    pub outcome: Result<(), String>,
}

impl StageResult {
    pub fn succeeded(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            outcome: Ok(()),
        }
    }

    pub fn failed(tool: &str, message: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            outcome: Err(message.into()),
        }
    }

    fn from_output(tool: &str, output: io::Result<Output>) -> Self {
        match output {
            Ok(output) if output.status.success() => Self::succeeded(tool),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    format!("exited with {}: {stderr}", output.status)
                };
                Self::failed(tool, message)
            }
            Err(err) => Self::failed(tool, err.to_string()),
        }
    }

    fn into_error(self) -> Option<KiraError> {
        self.outcome.err().map(|message| KiraError::ToolFailed {
            tool: self.tool,
            message,
        })
    }
}

/// Resolves a two-stage pipeline once both stages are known.
///
/// A failing compressor is reported first. A failing extractor still fails
/// the pipeline when the compressor exited cleanly, since the compressor
/// then only saw a truncated stream.
pub fn settle_pipeline(extractor: StageResult, compressor: StageResult) -> Result<(), KiraError> {
    if let Some(err) = compressor.into_error() {
        return Err(err);
    }
    if let Some(err) = extractor.into_error() {
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SystemTools {
    samtools: Option<PathBuf>,
    tabix: Option<PathBuf>,
    bgzip: Option<PathBuf>,
}

impl SystemTools {
    pub fn new(paths: ToolPaths) -> Self {
        Self {
            samtools: paths.samtools,
            tabix: paths.tabix,
            bgzip: paths.bgzip,
        }
    }

    fn require<'a>(tool: &'a Option<PathBuf>, name: &str) -> Result<&'a Path, KiraError> {
        tool.as_deref()
            .ok_or_else(|| KiraError::MissingTool(name.to_string()))
    }

    fn run_cmd(
        &self,
        tool: &str,
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<(), KiraError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        tracing::debug!(tool, program = %program.display(), ?args, "running");
        let output = cmd.output().map_err(|err| KiraError::ToolFailed {
            tool: tool.to_string(),
            message: err.to_string(),
        })?;
        match StageResult::from_output(tool, Ok(output)).into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn extract_alignment(&self, job: &ExtractionJob) -> Result<(), KiraError> {
        let samtools = Self::require(&self.samtools, "samtools")?;
        let temp = temp_file_beside(&job.output_path, ".kira-af-extract")?;

        let mut args = vec![
            "view".to_string(),
            match job.kind {
                FileKind::Cram => "-C".to_string(),
                _ => "-b".to_string(),
            },
            "-X".to_string(),
            "-o".to_string(),
            temp.path().to_string_lossy().to_string(),
            job.source_url.clone(),
            job.index_path.to_string_lossy().to_string(),
        ];
        args.extend(job.regions.labels());

        if let Err(err) = self.run_cmd("samtools", samtools, &args, Some(job.index_dir())) {
            discard(temp);
            return Err(err);
        }
        persist(temp, &job.output_path)
    }

    fn extract_variants(&self, job: &ExtractionJob) -> Result<(), KiraError> {
        let tabix = Self::require(&self.tabix, "tabix")?;
        let bgzip = Self::require(&self.bgzip, "bgzip")?;
        let temp = temp_file_beside(&job.output_path, ".kira-af-extract")?;

        let mut extractor_args = vec!["-h".to_string(), job.indexed_source()];
        extractor_args.extend(job.regions.labels());
        tracing::debug!(
            program = %tabix.display(),
            args = ?extractor_args,
            cwd = %job.index_dir().display(),
            "starting extractor"
        );
        let mut extractor = Command::new(tabix)
            .args(&extractor_args)
            .current_dir(job.index_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| KiraError::ToolFailed {
                tool: "tabix".to_string(),
                message: err.to_string(),
            })?;

        let compressor = match spawn_compressor(bgzip, &mut extractor, temp.as_file()) {
            Ok(child) => child,
            Err(err) => {
                let _ = extractor.kill();
                let _ = extractor.wait();
                discard(temp);
                return Err(err);
            }
        };

        let (extractor, compressor) = await_both(extractor, compressor);
        let settled = settle_pipeline(
            StageResult::from_output("tabix", extractor),
            StageResult::from_output("bgzip", compressor),
        );

        match settled {
            Ok(()) => persist(temp, &job.output_path),
            Err(err) => {
                discard(temp);
                Err(err)
            }
        }
    }
}

impl ExtractionTools for SystemTools {
    fn extract(&self, job: &ExtractionJob) -> Result<(), KiraError> {
        if job.kind.is_alignment() {
            self.extract_alignment(job)
        } else if job.kind.is_variant() {
            self.extract_variants(job)
        } else {
            Err(KiraError::UnsupportedRange(job.kind.to_string()))
        }
    }

    fn build_index(&self, kind: FileKind, path: &Path) -> Result<(), KiraError> {
        let target = path.to_string_lossy().to_string();
        match kind {
            FileKind::Bam | FileKind::Cram => {
                let samtools = Self::require(&self.samtools, "samtools")?;
                self.run_cmd("samtools", samtools, &["index".to_string(), target], None)
            }
            FileKind::Vcf => {
                let tabix = Self::require(&self.tabix, "tabix")?;
                let args = vec![
                    "-f".to_string(),
                    "-p".to_string(),
                    "vcf".to_string(),
                    target,
                ];
                self.run_cmd("tabix", tabix, &args, None)
            }
            FileKind::Other => Err(KiraError::UnsupportedRange(kind.to_string())),
        }
    }
}

fn spawn_compressor(
    bgzip: &Path,
    extractor: &mut Child,
    output: &fs::File,
) -> Result<Child, KiraError> {
    let stream = extractor.stdout.take().ok_or_else(|| KiraError::ToolFailed {
        tool: "tabix".to_string(),
        message: "stdout not captured".to_string(),
    })?;
    let sink = output
        .try_clone()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    tracing::debug!(program = %bgzip.display(), "starting compressor");
    Command::new(bgzip)
        .arg("-c")
        .stdin(Stdio::from(stream))
        .stdout(Stdio::from(sink))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| KiraError::ToolFailed {
            tool: "bgzip".to_string(),
            message: err.to_string(),
        })
}

/// Waits for both children independently; neither result is acted on
/// before the other one is known.
fn await_both(extractor: Child, compressor: Child) -> (io::Result<Output>, io::Result<Output>) {
    thread::scope(|scope| {
        let upstream = scope.spawn(move || extractor.wait_with_output());
        let downstream = scope.spawn(move || compressor.wait_with_output());
        (joined(upstream.join()), joined(downstream.join()))
    })
}

fn joined(result: thread::Result<io::Result<Output>>) -> io::Result<Output> {
    result.unwrap_or_else(|_| Err(io::Error::other("waiter thread panicked")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn indexed_source_names_local_index() {
        let job = ExtractionJob {
            source_url: "https://files.test/v.vcf.gz?sig=abc".to_string(),
            kind: FileKind::Vcf,
            regions: RegionSet::default(),
            index_path: PathBuf::from("/data/out/v.vcf.gz.tbi"),
            output_path: PathBuf::from("/data/out/v.slice.vcf.gz"),
        };
        assert_eq!(
            job.indexed_source(),
            "https://files.test/v.vcf.gz?sig=abc##idx##v.vcf.gz.tbi"
        );
    }

    #[test]
    fn compressor_failure_wins() {
        let err = settle_pipeline(
            StageResult::failed("tabix", "broken pipe"),
            StageResult::failed("bgzip", "disk full"),
        )
        .unwrap_err();
        assert_matches!(err, KiraError::ToolFailed { tool, .. } if tool == "bgzip");
    }

    #[test]
    fn extractor_failure_fails_clean_compressor() {
        let err = settle_pipeline(
            StageResult::failed("tabix", "exit 1"),
            StageResult::succeeded("bgzip"),
        )
        .unwrap_err();
        assert_matches!(err, KiraError::ToolFailed { tool, .. } if tool == "tabix");
    }

    #[test]
    fn both_clean() {
        assert!(
            settle_pipeline(
                StageResult::succeeded("tabix"),
                StageResult::succeeded("bgzip")
            )
            .is_ok()
        );
    }
}
