use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::cli::{OutputArgs, init_tracing, report_exit};
use xnat_utils::config::ConfigLoader;
use xnat_utils::convert::SystemTools;
use xnat_utils::daris::DarisImport;
use xnat_utils::output::{JsonOutput, OutputMode, sink_for};

#[derive(Parser)]
#[command(name = "daris2xnat")]
#[command(about = "Imports the primary DICOM studies of a DaRIS project into XNAT")]
#[command(
    long_about = "Imports the primary DICOM studies of a DaRIS project into XNAT.\n\n\
    Zipped datasets are read from the DaRIS store configured in daris2xnat.json, \
    tagged with the XNAT project, subject and session in the patient comments \
    (0010,4000) using dcmodify, and sent to the XNAT DICOM receiver with dcmsend."
)]
#[command(version)]
struct Cli {
    /// XNAT ID of the project to import
    project: String,

    /// Numbers of the subjects to import, all subjects if omitted
    #[arg(long, num_args = 1..)]
    subjects: Vec<u32>,

    /// Path to the migration config, defaults to daris2xnat.json
    #[arg(long)]
    config: Option<String>,

    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        return report_exit(&report);
    }
    ExitCode::SUCCESS
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.output.loglevel);

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let tools = SystemTools::new();
    let mode = cli.output.mode();
    let sink = sink_for(mode);
    let subjects = (!cli.subjects.is_empty()).then_some(cli.subjects.as_slice());

    let result = DarisImport::new(&config, &tools).run(&cli.project, subjects, sink.as_ref())?;
    if mode == OutputMode::Json {
        JsonOutput::print_json(&result).into_diagnostic()?;
    }
    Ok(())
}
