use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::cli::{AuthArgs, init_tracing, report_exit};
use xnat_utils::output::{JsonOutput, OutputMode};

#[derive(Parser)]
#[command(name = "xnat-varget")]
#[command(about = "Gets the value of a custom variable of a subject or session")]
#[command(version)]
struct Cli {
    /// Name of the subject or session to get the variable from
    id: String,

    /// Name of the variable to get
    variable: String,

    /// Value printed when the object does not have the variable
    #[arg(long, default_value = "")]
    default: String,

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
    let result = app.varget(&cli.id, &cli.variable, &cli.default)?;
    match cli.auth.output.mode() {
        OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic()?,
        OutputMode::Console => {
            let mut stdout = io::stdout();
            stdout.write_all(result.value.as_bytes()).into_diagnostic()?;
            stdout.flush().into_diagnostic()?;
        }
    }
    Ok(())
}
