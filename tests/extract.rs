#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;

use kira_archive_fetch::config::ToolPaths;
use kira_archive_fetch::domain::{FileKind, RegionSet};
use kira_archive_fetch::error::KiraError;
use kira_archive_fetch::extract::{ExtractionJob, ExtractionTools, SystemTools};

// Writing an executable while another thread forks can fail with ETXTBSY.
static SERIAL: Mutex<()> = Mutex::new(());

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn job(root: &Path, kind: FileKind, output: &str) -> ExtractionJob {
    let index_dir = root.join("index");
    fs::create_dir_all(&index_dir).unwrap();
    ExtractionJob {
        source_url: "https://files.test/source".to_string(),
        kind,
        regions: RegionSet::parse_range("chr1:100-200").unwrap(),
        index_path: index_dir.join("source.idx"),
        output_path: root.join("out").join(output),
    }
}

fn variant_tools(tabix: PathBuf, bgzip: PathBuf) -> SystemTools {
    SystemTools::new(ToolPaths {
        samtools: None,
        tabix: Some(tabix),
        bgzip: Some(bgzip),
    })
}

fn output_dir_entries(root: &Path) -> Vec<String> {
    match fs::read_dir(root.join("out")) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn variant_pipeline_writes_output() {
    let _guard = SERIAL.lock().unwrap_or_else(|err| err.into_inner());
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let cwd_log = root.join("cwd.txt");
    let args_log = root.join("args.txt");
    let tabix = script(
        root,
        "tabix",
        &format!(
            "pwd > '{}'\necho \"$@\" > '{}'\nprintf 'chr1\\t150\\n'",
            cwd_log.display(),
            args_log.display()
        ),
    );
    let bgzip = script(root, "bgzip", "cat");
    let job = job(root, FileKind::Vcf, "slice.vcf.gz");

    variant_tools(tabix, bgzip).extract(&job).unwrap();

    assert_eq!(fs::read_to_string(&job.output_path).unwrap(), "chr1\t150\n");
    let cwd = fs::read_to_string(&cwd_log).unwrap();
    assert_eq!(
        fs::canonicalize(cwd.trim()).unwrap(),
        fs::canonicalize(root.join("index")).unwrap()
    );
    assert_eq!(output_dir_entries(root), vec!["slice.vcf.gz".to_string()]);
    assert_eq!(
        fs::read_to_string(&args_log).unwrap().trim_end(),
        "-h https://files.test/source##idx##source.idx chr1:100-200"
    );
}

#[test]
fn extractor_failure_discards_output_even_if_compressor_succeeds() {
    let _guard = SERIAL.lock().unwrap_or_else(|err| err.into_inner());
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let tabix = script(root, "tabix", "printf 'partial\\n'\necho 'region error' >&2\nexit 1");
    let bgzip = script(root, "bgzip", "cat");
    let job = job(root, FileKind::Vcf, "slice.vcf.gz");

    let err = variant_tools(tabix, bgzip).extract(&job).unwrap_err();

    assert_matches!(
        err,
        KiraError::ToolFailed { tool, message } if tool == "tabix" && message.contains("region error")
    );
    assert!(!job.output_path.exists());
    assert!(output_dir_entries(root).is_empty());
}

#[test]
fn compressor_failure_is_reported_first() {
    let _guard = SERIAL.lock().unwrap_or_else(|err| err.into_inner());
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let tabix = script(root, "tabix", "printf 'chr1\\t150\\n'\nexit 1");
    let bgzip = script(root, "bgzip", "cat > /dev/null\nexit 2");
    let job = job(root, FileKind::Vcf, "slice.vcf.gz");

    let err = variant_tools(tabix, bgzip).extract(&job).unwrap_err();

    assert_matches!(err, KiraError::ToolFailed { tool, .. } if tool == "bgzip");
    assert!(!job.output_path.exists());
}

#[test]
fn alignment_extraction_uses_output_argument() {
    let _guard = SERIAL.lock().unwrap_or_else(|err| err.into_inner());
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let args_log = root.join("args.txt");
    let samtools = script(
        root,
        "samtools",
        &format!(
            "echo \"$@\" > '{}'\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then shift; printf 'bam' > \"$1\"; fi\n  shift\ndone",
            args_log.display()
        ),
    );
    let tools = SystemTools::new(ToolPaths {
        samtools: Some(samtools),
        tabix: None,
        bgzip: None,
    });
    let job = job(root, FileKind::Bam, "slice.bam");

    tools.extract(&job).unwrap();

    assert_eq!(fs::read_to_string(&job.output_path).unwrap(), "bam");
    let args = fs::read_to_string(&args_log).unwrap();
    assert!(args.starts_with("view -b -X -o "));
    assert!(args.contains("https://files.test/source"));
    assert!(args.trim_end().ends_with("chr1:100-200"));
}

#[test]
fn failing_alignment_extraction_leaves_nothing() {
    let _guard = SERIAL.lock().unwrap_or_else(|err| err.into_inner());
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let samtools = script(root, "samtools", "echo 'fail to open index' >&2\nexit 1");
    let tools = SystemTools::new(ToolPaths {
        samtools: Some(samtools),
        tabix: None,
        bgzip: None,
    });
    let job = job(root, FileKind::Cram, "slice.cram");

    assert_matches!(
        tools.extract(&job),
        Err(KiraError::ToolFailed { tool, .. }) if tool == "samtools"
    );
    assert!(output_dir_entries(root).is_empty());
}

#[test]
fn missing_tools_and_unsupported_kinds() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let tools = SystemTools::new(ToolPaths::default());

    assert_matches!(
        tools.extract(&job(root, FileKind::Vcf, "v.vcf.gz")),
        Err(KiraError::MissingTool(name)) if name == "tabix"
    );
    assert_matches!(
        tools.extract(&job(root, FileKind::Other, "notes.txt")),
        Err(KiraError::UnsupportedRange(_))
    );
    assert_matches!(
        tools.build_index(FileKind::Bam, &root.join("a.bam")),
        Err(KiraError::MissingTool(name)) if name == "samtools"
    );
}
