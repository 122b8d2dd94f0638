use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;

use xnat_utils::cli::{AuthArgs, init_tracing, report_exit};
use xnat_utils::domain::{ConvertTarget, Converter};
use xnat_utils::download::{DownloadOptions, GetRequest};
use xnat_utils::output::{JsonOutput, OutputMode, sink_for};

#[derive(Parser)]
#[command(name = "xnat-get")]
#[command(about = "Downloads datasets (e.g. scans) from an XNAT instance")]
#[command(
    long_about = "Downloads datasets (e.g. scans) from an XNAT instance.\n\n\
    Sessions are given by name or regular expression, e.g.\n\n    \
    $ xnat-get 'MRH017_00(1|2|3|9)_MR0(1|3)' --scans 'ep2d_diff.*'\n\n\
    A \"download images\" XML catalog saved from the XNAT web interface can be \
    passed instead, in which case the resources it lists are downloaded:\n\n    \
    $ xnat-get my-selection.xml\n\n\
    Each session is downloaded into its own directory under '--target' (or under \
    a directory per subject with '--subject_dirs'). Downloads can be converted to \
    NIfTI or MRtrix format with dcm2niix or mrconvert if they are on the path."
)]
#[command(version)]
struct Cli {
    /// Name or regular expression of the session(s) to download, or a
    /// "download images" XML file saved from the web interface
    sessions: Vec<String>,

    /// Path to download the scans to, defaults to the working directory
    #[arg(long, short = 't')]
    target: Option<PathBuf>,

    /// Name of the scans to include in the download, all scans if omitted
    #[arg(long, short = 'x', num_args = 1..)]
    scans: Vec<String>,

    /// The name of the resource to download, only needed when a scan holds
    /// several recognised formats
    #[arg(long = "resource_name", short = 'r', alias = "resource-name")]
    resource_name: Option<String>,

    /// Only download from sessions containing the specified scans
    #[arg(long = "with_scans", short = 'w', alias = "with-scans", num_args = 1..)]
    with_scans: Vec<String>,

    /// Only download from sessions that don't contain the specified scans
    #[arg(long = "without_scans", short = 'o', alias = "without-scans", num_args = 1..)]
    without_scans: Vec<String>,

    /// Convert the downloaded scans to the given format
    #[arg(long = "convert_to", short = 'c', alias = "convert-to", value_enum)]
    convert_to: Option<ConvertTarget>,

    /// The conversion tool to use, by default dcm2niix for DICOM to NIfTI and
    /// mrconvert for everything else
    #[arg(long, short = 'v', value_enum)]
    converter: Option<Converter>,

    /// Organise sessions within subject directories
    #[arg(long = "subject_dirs", short = 'd', alias = "subject-dirs")]
    subject_dirs: bool,

    /// Skip sessions that already have a directory in the target path
    #[arg(long = "skip_downloaded", short = 'k', alias = "skip-downloaded")]
    skip_downloaded: bool,

    /// Only select sessions before this date (Y-m-d, e.g. 2018-02-27)
    #[arg(long, short = 'b')]
    before: Option<String>,

    /// Only select sessions after this date (Y-m-d, e.g. 2018-02-27)
    #[arg(long, short = 'a')]
    after: Option<String>,

    /// The ID of the project to select the sessions from
    #[arg(long, short = 'p')]
    project: Option<String>,

    /// The ID of the subject to select the sessions from, requires '--project'
    #[arg(long, short = 'j')]
    subject: Option<String>,

    /// Don't fall back to the scan ID when a scan has no type
    #[arg(long = "dont_match_scan_id", alias = "dont-match-scan-id")]
    dont_match_scan_id: bool,

    /// Rename DICOM files to their instance number, e.g. 0001.dcm
    #[arg(long = "strip_name", short = 'i', alias = "strip-name")]
    strip_name: bool,

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

    let download_dir = match cli.target {
        Some(target) => target,
        None => std::env::current_dir().into_diagnostic()?,
    };
    let mode = cli.auth.output.mode();
    let sink = sink_for(mode);

    let result = match cli.sessions.as_slice() {
        [catalog] if catalog.ends_with(".xml") => {
            let app = cli.auth.connect_app()?;
            let options = DownloadOptions {
                download_dir,
                convert_to: cli.convert_to,
                converter: cli.converter,
                subject_dirs: cli.subject_dirs,
                strip_name: cli.strip_name,
            };
            app.get_from_catalog(Path::new(catalog), options, sink.as_ref())?
        }
        _ => {
            let request = GetRequest {
                ids: cli.sessions,
                download_dir,
                scans: cli.scans,
                resource_name: cli.resource_name,
                convert_to: cli.convert_to,
                converter: cli.converter,
                subject_dirs: cli.subject_dirs,
                with_scans: cli.with_scans,
                without_scans: cli.without_scans,
                strip_name: cli.strip_name,
                skip_downloaded: cli.skip_downloaded,
                before: cli.before,
                after: cli.after,
                project: cli.project,
                subject: cli.subject,
                match_scan_id: !cli.dont_match_scan_id,
            };
            // Fail on already downloaded sessions before prompting for credentials.
            request.precheck()?;
            let app = cli.auth.connect_app()?;
            app.get(request, sink.as_ref())?
        }
    };

    if mode == OutputMode::Json {
        JsonOutput::print_json(&result).into_diagnostic()?;
    }
    Ok(())
}
