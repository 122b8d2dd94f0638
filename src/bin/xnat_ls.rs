use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::app::{LsRequest, ReturnAttr};
use xnat_utils::cli::{AuthArgs, init_tracing, report_exit};
use xnat_utils::domain::DataType;
use xnat_utils::output::{JsonOutput, OutputMode};

#[derive(Parser)]
#[command(name = "xnat-ls")]
#[command(about = "Lists projects, subjects, sessions or scan types on an XNAT instance")]
#[command(
    long_about = "Lists the projects, subjects, sessions or scan types on an XNAT instance.\n\n\
    If no ids are given the accessible projects are listed. A project id lists its \
    subjects, a subject id its sessions and a session id the scan types it contains. \
    Regular expressions can be used when '--datatype' is provided, e.g.\n\n    \
    $ xnat-ls -d session 'MRH017_.*_MR01'"
)]
#[command(version)]
struct Cli {
    /// The ID or regular expression of the project/subject/session to list from
    ids: Vec<String>,

    /// The data type to list
    #[arg(long, short = 'd', value_enum)]
    datatype: Option<DataType>,

    /// Only list sessions containing the specified scans
    #[arg(long = "with_scans", short = 'w', alias = "with-scans", num_args = 1..)]
    with_scans: Vec<String>,

    /// Only list sessions that don't contain the specified scans
    #[arg(long = "without_scans", short = 'o', alias = "without-scans", num_args = 1..)]
    without_scans: Vec<String>,

    /// The attribute to return for each matching item. Defaults to 'id' for
    /// projects, 'label' for subjects and sessions, and 'type' for scans
    #[arg(long = "return_attr", short = 't', alias = "return-attr", value_enum)]
    return_attr: Option<ReturnAttr>,

    /// The ID of the project to list the sessions/subjects/scans from
    #[arg(long, short = 'p')]
    project: Option<String>,

    /// The ID of the subject to list the sessions from, requires '--project'
    #[arg(long, short = 'j')]
    subject: Option<String>,

    /// Only select sessions before this date (Y-m-d, e.g. 2018-02-27)
    #[arg(long, short = 'b')]
    before: Option<String>,

    /// Only select sessions after this date (Y-m-d, e.g. 2018-02-27)
    #[arg(long, short = 'a')]
    after: Option<String>,

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
    let result = app.ls(LsRequest {
        ids: cli.ids,
        datatype: cli.datatype,
        project: cli.project,
        subject: cli.subject,
        with_scans: cli.with_scans,
        without_scans: cli.without_scans,
        before: cli.before,
        after: cli.after,
        return_attr: cli.return_attr,
    })?;

    match cli.auth.output.mode() {
        OutputMode::Json => JsonOutput::print_json(&result).into_diagnostic()?,
        OutputMode::Console => {
            for item in &result.items {
                println!("{item}");
            }
        }
    }
    Ok(())
}
