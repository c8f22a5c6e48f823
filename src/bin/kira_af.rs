use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_archive_fetch::api::ArchiveHttpClient;
use kira_archive_fetch::app::{App, FetchResult, ProgressSink, StatusResult};
use kira_archive_fetch::config::{ConfigLoader, ResolvedConfig};
use kira_archive_fetch::error::KiraError;
use kira_archive_fetch::extract::SystemTools;
use kira_archive_fetch::output::{JsonOutput, LogOutput, OutputMode};
use kira_archive_fetch::restore::{PromptAnswer, RestoreDecision, RestoreMode, RestorePrompt};
use kira_archive_fetch::resume::ResumeReport;
use kira_archive_fetch::store::RequestOptions;

#[derive(Parser)]
#[command(name = "kira-af")]
#[command(about = "Download genomic analysis files from an archive-backed API")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download the files of one analysis")]
    Fetch(FetchArgs),
    #[command(about = "Download files whose restore has completed")]
    Resume(StateArgs),
    #[command(about = "List pending restorations")]
    Status(StateArgs),
}

#[derive(Args)]
struct FetchArgs {
    analysis_id: String,

    #[arg(long)]
    destination: PathBuf,

    #[arg(long)]
    overwrite: bool,

    /// Comma-separated regions, e.g. chr1:100-200,chr2:5-10
    #[arg(long, conflicts_with = "bed")]
    range: Option<String>,

    #[arg(long)]
    bed: Option<PathBuf>,

    #[arg(long, value_delimiter = ',')]
    filetypes: Vec<String>,

    #[arg(long, value_enum)]
    restore: Option<RestoreMode>,

    #[arg(long)]
    restoration_file: Option<PathBuf>,
}

#[derive(Args)]
struct StateArgs {
    #[arg(long)]
    restoration_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::InvalidRegion(_)
        | KiraError::InvalidBed { .. }
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::MissingCredentials(_) => 2,
        KiraError::Http(_)
        | KiraError::ApiStatus { .. }
        | KiraError::RestoreRejected(_)
        | KiraError::MissingTool(_)
        | KiraError::ToolFailed { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, &resolved, output_mode),
        Commands::Resume(args) => {
            let app = build_app(&resolved, args.restoration_file)?;
            let report = app.resume(Utc::now(), sink_for(output_mode))?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_resume(&report).into_diagnostic(),
                OutputMode::Interactive => {
                    print_resume_summary(&report);
                    Ok(())
                }
            }
        }
        Commands::Status(args) => {
            let app = build_app(&resolved, args.restoration_file)?;
            let status = app.status(Utc::now());
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_status(&status).into_diagnostic(),
                OutputMode::Interactive => {
                    print_status_summary(&status);
                    Ok(())
                }
            }
        }
    }
}

fn run_fetch(
    args: FetchArgs,
    resolved: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let app = build_app(resolved, args.restoration_file.clone())?;
    let options = RequestOptions {
        destination: args.destination.display().to_string(),
        overwrite: args.overwrite,
        range: args.range,
        bed: args.bed.map(|path| path.display().to_string()),
        filetypes: if args.filetypes.is_empty() {
            None
        } else {
            Some(args.filetypes)
        },
        restoration_file: args
            .restoration_file
            .map(|path| path.display().to_string()),
        ..Default::default()
    };

    let mode = args.restore.unwrap_or(match output_mode {
        OutputMode::Interactive => RestoreMode::Ask,
        OutputMode::NonInteractive => RestoreMode::Never,
    });
    let mut decision = match mode {
        RestoreMode::Always => RestoreDecision::always(),
        RestoreMode::Never => RestoreDecision::never(),
        RestoreMode::Ask => RestoreDecision::ask(Box::new(StdinPrompt)),
    };

    let result = app.fetch(
        &args.analysis_id,
        &options,
        &mut decision,
        sink_for(output_mode),
    )?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_fetch(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_fetch_summary(&result);
            Ok(())
        }
    }
}

fn build_app(
    resolved: &ResolvedConfig,
    restoration_file: Option<PathBuf>,
) -> miette::Result<App<ArchiveHttpClient, SystemTools>> {
    let client = ArchiveHttpClient::new(&resolved.api_base_url, resolved.credentials.clone())?;
    let tools = SystemTools::new(resolved.tools.clone());
    let state_file =
        restoration_file.unwrap_or_else(|| resolved.state_file.clone().into_std_path_buf());
    Ok(App::new(client, tools, state_file).with_stale_after_hours(resolved.stale_after_hours))
}

fn sink_for(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Interactive => &LogOutput,
        OutputMode::NonInteractive => &JsonOutput,
    }
}

struct StdinPrompt;

impl RestorePrompt for StdinPrompt {
    fn ask(&mut self, analysis_id: &str, file_name: &str) -> PromptAnswer {
        let stdin = io::stdin();
        loop {
            eprint!("{file_name} ({analysis_id}) is archived. Restore? [y]es/[n]o/[a]ll/none: ");
            let _ = io::stderr().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return PromptAnswer::None,
                Ok(_) => {}
            }
            if let Some(answer) = PromptAnswer::parse(&line) {
                return answer;
            }
        }
    }
}

fn print_fetch_summary(result: &FetchResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let failed = result
        .items
        .iter()
        .filter(|item| item.error.is_some())
        .count();
    println!("{cyan}KIRA-AF analysis {}{reset}", result.analysis_id);
    println!("{green}Files: {}{reset}", result.items.len());
    println!("{yellow}Errors: {failed}{reset}");

    for item in &result.items {
        let color = match item.action.as_str() {
            "downloaded" | "extracted" => green,
            "failed" => red,
            "skipped" => cyan,
            _ => yellow,
        };
        println!("{color}- {} ({}){reset}", item.file_name, item.action);
        if let Some(path) = &item.path {
            println!("{color}    path: {path}{reset}");
        }
        if let Some(estimation) = &item.restore_estimation {
            println!("{color}    ready after: {estimation}{reset}");
        }
        if let Some(error) = &item.error {
            println!("{red}    error: {error}{reset}");
        }
    }
}

fn print_resume_summary(report: &ResumeReport) {
    println!("Restorations: {}", report.state_file);
    println!(
        "ready={} pending={} completed={} retained={}",
        report.ready, report.pending, report.completed, report.retained
    );
    for item in &report.items {
        let state = serde_json::to_value(item.state)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        println!("- {} {} ({state})", item.analysis_id, item.file_name);
        if let Some(path) = &item.path {
            println!("    path: {path}");
        }
        if let Some(detail) = &item.detail {
            println!("    {detail}");
        }
    }
}

fn print_status_summary(status: &StatusResult) {
    println!("Restorations: {}", status.state_file);
    if status.entries.is_empty() {
        println!("no pending restorations");
        return;
    }
    for entry in &status.entries {
        let state = if entry.ready { "ready" } else { "pending" };
        println!(
            "- {} {} [{state}] estimation={} destination={}",
            entry.analysis_id,
            entry.file_name,
            entry.restore_estimation.as_deref().unwrap_or("unknown"),
            entry.destination
        );
    }
}
