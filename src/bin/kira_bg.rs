use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_biogeo::config::{ConfigLoader, ResolvedConfig};
use kira_biogeo::error::KiraError;
use kira_biogeo::output::{ConsoleSink, HumanOutput, JsonOutput, OutputMode};
use kira_biogeo::pipeline::Pipeline;
use kira_biogeo::store::ArtifactStore;
use kira_biogeo::workflow::{Workflow, default_targets};

#[derive(Parser)]
#[command(name = "kira-bg")]
#[command(about = "Resumable sequence-to-bioclimatic-zone classification pipeline")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run stages whose artifacts are missing")]
    Run(RunArgs),
    #[command(about = "Show which stage artifacts exist")]
    Status,
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Stage to bring up to date (repeatable); defaults to the whole workflow.
    #[arg(long = "target")]
    targets: Vec<String>,
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
    match error.root() {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::MissingCredentials(_)
        | KiraError::UnknownStage(_)
        | KiraError::DuplicateStage(_)
        | KiraError::DependencyCycle(_) => 2,
        KiraError::RemoteUnavailable { .. }
        | KiraError::RemoteRejected { .. }
        | KiraError::InvalidResponse { .. } => 3,
        KiraError::JobFailed { .. } | KiraError::JobsFailed(_) | KiraError::PollTimeout { .. } => 4,
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

    let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
    tracing::debug!(data_dir = %config.data_dir, "configuration resolved");

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_pipeline(args, &config, output_mode),
        Commands::Status => run_status(&config, output_mode),
    }
}

fn build_pipeline(config: &ResolvedConfig) -> miette::Result<Pipeline> {
    let store = ArtifactStore::new(config.data_dir.clone());
    let workflow = Workflow::from_config(config)?;
    Ok(workflow.into_pipeline(store)?)
}

fn run_pipeline(args: RunArgs, config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let pipeline = build_pipeline(config)?;
    let targets = if args.targets.is_empty() {
        default_targets()
    } else {
        args.targets
    };
    match output_mode {
        OutputMode::Interactive => {
            let report = pipeline.run(&targets, &ConsoleSink)?;
            HumanOutput::print_run(&report);
        }
        OutputMode::NonInteractive => {
            let report = pipeline.run(&targets, &JsonOutput)?;
            JsonOutput::print_run(&report).into_diagnostic()?;
        }
    }
    Ok(())
}

fn run_status(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let status = build_pipeline(config)?.status()?;
    match output_mode {
        OutputMode::Interactive => HumanOutput::print_status(&status),
        OutputMode::NonInteractive => JsonOutput::print_status(&status).into_diagnostic()?,
    }
    Ok(())
}
