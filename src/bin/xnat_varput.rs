use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::cli::{AuthArgs, init_tracing, report_exit};
use xnat_utils::output::{JsonOutput, OutputMode};

#[derive(Parser)]
#[command(name = "xnat-varput")]
#[command(about = "Sets a custom variable of a subject or session")]
#[command(version)]
struct Cli {
    /// Name of the subject or session to set the variable of
    id: String,

    /// Name of the variable to set
    variable: String,

    /// Value of the variable
    value: String,

    #[command(flatten)]
    auth: AuthArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        return report_exit(&report);
    }
    ExitCode::SUCCESS
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.auth.output.loglevel);

    let app = cli.auth.connect_app()?;
    let result = app.varput(&cli.id, &cli.variable, &cli.value)?;
    if cli.auth.output.mode() == OutputMode::Json {
        JsonOutput::print_json(&result).into_diagnostic()?;
    }
    Ok(())
}
