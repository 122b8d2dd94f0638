use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::cli::{AuthArgs, init_tracing, report_exit};
use xnat_utils::output::{JsonOutput, OutputMode, sink_for};

#[derive(Parser)]
#[command(name = "xnat-rename")]
#[command(about = "Renames a session on an XNAT instance")]
#[command(version)]
struct Cli {
    /// Name of the session to rename
    session: String,

    /// The new name of the session
    new_name: String,

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

    let mode = cli.auth.output.mode();
    let sink = sink_for(mode);
    let app = cli.auth.connect_app()?;
    let result = app.rename(&cli.session, &cli.new_name, sink.as_ref())?;
    if mode == OutputMode::Json {
        JsonOutput::print_json(&result).into_diagnostic()?;
    }
    Ok(())
}
