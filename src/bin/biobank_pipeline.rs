use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use biobank_pipeline::app::Pipeline;
use biobank_pipeline::config::{ConfigLoader, ResolvedConfig};
use biobank_pipeline::error::PipelineError;
use biobank_pipeline::output::JsonOutput;
use biobank_pipeline::publications::{EntrezClient, OfflineClient};

#[derive(Parser)]
#[command(name = "biobank-pipeline")]
#[command(about = "ETL pipeline turning raw biobank exports into research dashboard data")]
#[command(version, author)]
struct Cli {
    /// Path to the pipeline config file (default: biobank-pipeline.json).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Harmonize raw inventory sheets into the sample table")]
    Harmonize,
    #[command(about = "Extract assay rows and declared totals from the tracking workbook")]
    Assays,
    #[command(about = "Resolve citation stubs against the bibliographic index")]
    Publications(PublicationsArgs),
    #[command(about = "Cross-link samples, studies, assays and publications")]
    Link,
    #[command(about = "Validate the linked tables and report findings")]
    Validate,
    #[command(about = "Scrub storage locations for the public sample table")]
    Scrub,
    #[command(about = "Emit the dashboard JSON file set")]
    Emit,
    #[command(about = "Run every stage in order")]
    Run(PublicationsArgs),
}

#[derive(Args, Clone)]
struct PublicationsArgs {
    /// Skip external bibliographic lookups; unresolved stubs stay unresolved.
    #[arg(long)]
    offline: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::MissingConfig
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::InputMissing(_)
        | PipelineError::InputRead { .. }
        | PipelineError::CsvParse { .. }
        | PipelineError::JsonParse { .. }
        | PipelineError::StageOutputMissing(_)
        | PipelineError::InvalidStudyCode(_)
        | PipelineError::InvalidBarcode(_) => 2,
        PipelineError::BibliographicHttp(_) | PipelineError::BibliographicStatus { .. } => 3,
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
    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;

    match cli.command {
        Command::Harmonize => {
            let pipeline = Pipeline::new(config, OfflineClient);
            let report = pipeline.harmonize().into_diagnostic()?;
            JsonOutput::print_stage(&report).into_diagnostic()
        }
        Command::Assays => {
            let pipeline = Pipeline::new(config, OfflineClient);
            let report = pipeline.assays().into_diagnostic()?;
            JsonOutput::print_stage(&report).into_diagnostic()
        }
        Command::Publications(args) => {
            if use_offline(&config, args.offline) {
                let pipeline = Pipeline::new(config, OfflineClient);
                let report = pipeline.publications().into_diagnostic()?;
                JsonOutput::print_stage(&report).into_diagnostic()
            } else {
                let client = EntrezClient::new(&config.lookup).into_diagnostic()?;
                let pipeline = Pipeline::new(config, client);
                let report = pipeline.publications().into_diagnostic()?;
                JsonOutput::print_stage(&report).into_diagnostic()
            }
        }
        Command::Link => {
            let pipeline = Pipeline::new(config, OfflineClient);
            let report = pipeline.link().into_diagnostic()?;
            JsonOutput::print_stage(&report).into_diagnostic()
        }
        Command::Validate => {
            let pipeline = Pipeline::new(config, OfflineClient);
            let report = pipeline.validate().into_diagnostic()?;
            // Findings are advisory; a failed report still exits 0.
            JsonOutput::print_validation(&report).into_diagnostic()
        }
        Command::Scrub => {
            let pipeline = Pipeline::new(config, OfflineClient);
            let report = pipeline.scrub().into_diagnostic()?;
            JsonOutput::print_stage(&report).into_diagnostic()
        }
        Command::Emit => {
            let pipeline = Pipeline::new(config, OfflineClient);
            let summary = pipeline.emit().into_diagnostic()?;
            JsonOutput::print_emit(&summary).into_diagnostic()
        }
        Command::Run(args) => {
            if use_offline(&config, args.offline) {
                let pipeline = Pipeline::new(config, OfflineClient);
                let report = pipeline.run().into_diagnostic()?;
                JsonOutput::print_run(&report).into_diagnostic()
            } else {
                let client = EntrezClient::new(&config.lookup).into_diagnostic()?;
                let pipeline = Pipeline::new(config, client);
                let report = pipeline.run().into_diagnostic()?;
                JsonOutput::print_run(&report).into_diagnostic()
            }
        }
    }
}

fn use_offline(config: &ResolvedConfig, offline_flag: bool) -> bool {
    offline_flag || !config.lookup.enabled
}
