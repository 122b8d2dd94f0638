use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::cli::{AuthArgs, init_tracing, report_exit};
use xnat_utils::domain::Modality;
use xnat_utils::output::{JsonOutput, OutputMode, sink_for};
use xnat_utils::upload::PutRequest;

#[derive(Parser)]
#[command(name = "xnat-put")]
#[command(about = "Uploads datasets to an XNAT instance and checks their digests")]
#[command(
    long_about = "Uploads datasets to a session on an XNAT instance.\n\n\
    The resource name (data format) is taken from the file extension unless \
    '--resource_name' is given, e.g.\n\n    \
    $ xnat-put MRH017_100_MR01 t1_mprage t1.nii.gz\n\n\
    A missing session can be created with '--create_session'. After the upload \
    the MD5 digest of every file is compared with the copy on the server."
)]
#[command(version)]
struct Cli {
    /// Name of the session to upload the dataset to
    session: String,

    /// Name for the dataset (scan) on XNAT
    scan: String,

    /// Filename(s) of the dataset to upload, or a single directory
    #[arg(required = true)]
    filenames: Vec<PathBuf>,

    /// Allow overwrite of an existing dataset
    #[arg(long, short = 'o')]
    overwrite: bool,

    /// Create the session on XNAT if it doesn't exist
    #[arg(long = "create_session", short = 'c', alias = "create-session")]
    create_session: bool,

    /// The name of the resource to upload to, inferred from the extension if
    /// omitted
    #[arg(long = "resource_name", short = 'r', alias = "resource-name")]
    resource_name: Option<String>,

    /// The project ID to use if the session has to be created
    #[arg(long = "project_id", short = 'p', alias = "project-id")]
    project_id: Option<String>,

    /// The subject ID to use if the session has to be created
    #[arg(long = "subject_id", short = 'b', alias = "subject-id")]
    subject_id: Option<String>,

    /// The scan ID, defaults to the scan name
    #[arg(long = "scan_id", alias = "scan-id")]
    scan_id: Option<String>,

    /// Modality of the session, read from the session label if omitted
    #[arg(long, short = 'm', value_enum)]
    modality: Option<Modality>,

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
    let request = PutRequest {
        session: cli.session,
        scan: cli.scan,
        filenames: cli.filenames,
        overwrite: cli.overwrite,
        create_session: cli.create_session,
        resource_name: cli.resource_name,
        project: cli.project_id,
        subject: cli.subject_id,
        scan_id: cli.scan_id,
        modality: cli.modality,
    };
    request.precheck()?;
    let app = cli.auth.connect_app()?;
    let result = app.put(request, sink.as_ref())?;

    if mode == OutputMode::Json {
        JsonOutput::print_json(&result).into_diagnostic()?;
    }
    Ok(())
}
