use std::fmt;
use std::process::ExitCode;

use clap::{Args, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::connect::{ConnectOptions, HttpAuthenticator, TerminalPrompt, connect};
use crate::convert::SystemTools;
use crate::error::{ErrorCategory, XnatError};
use crate::output::OutputMode;
use crate::xnat::XnatHttpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(value)
    }
}

/// Flags every tool accepts for logging and output.
#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// The logging level to display, overridden by RUST_LOG
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Print the result as a JSON document instead of progress lines
    #[arg(long)]
    pub json: bool,
}

impl OutputArgs {
    pub fn mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Console
        }
    }
}

/// Connection flags shared by the XNAT tools.
#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// The user to connect to an XNAT instance with
    #[arg(long, short = 'u')]
    pub user: Option<String>,

    /// The XNAT server to connect to. If not provided the first server found in
    /// the netrc file is used, and if it is empty you are prompted for one.
    /// Multiple saved servers can be distinguished by passing part of the URL
    #[arg(long, short = 's')]
    pub server: Option<String>,

    /// Don't use or store user access tokens in the netrc file
    #[arg(long = "no_netrc", short = 'n', alias = "no-netrc")]
    pub no_netrc: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl AuthArgs {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            server: self.server.clone(),
            user: self.user.clone(),
            use_netrc: !self.no_netrc,
            ..ConnectOptions::default()
        }
    }

    /// Logs in interactively and wraps the session with the system tools.
    pub fn connect_app(&self) -> Result<App<XnatHttpClient, SystemTools>, XnatError> {
        let client = connect(&self.connect_options(), &HttpAuthenticator, &TerminalPrompt)?;
        Ok(App::new(client, SystemTools::new()))
    }
}

pub fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Prints a failed run and picks the exit code from the error category.
pub fn report_exit(report: &miette::Report) -> ExitCode {
    let Some(error) = report.downcast_ref::<XnatError>() else {
        eprintln!("{report:?}");
        return ExitCode::from(1);
    };
    match error.category() {
        ErrorCategory::Info => println!("INFO: {error}"),
        ErrorCategory::Usage | ErrorCategory::Lookup | ErrorCategory::Ambiguity => {
            eprintln!("ERROR! {error}")
        }
        _ => eprintln!("{report:?}"),
    }
    ExitCode::from(error.exit_code())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        auth: AuthArgs,
    }

    #[test]
    fn auth_flags_accept_both_spellings() {
        let cli = TestCli::parse_from(["xnat-ls", "-u", "tclose", "--no-netrc", "--json"]);
        assert_eq!(cli.auth.user.as_deref(), Some("tclose"));
        assert!(cli.auth.no_netrc);
        assert_eq!(cli.auth.output.mode(), OutputMode::Json);
        assert!(!cli.auth.connect_options().use_netrc);

        let cli = TestCli::parse_from(["xnat-ls", "--no_netrc", "--loglevel", "debug"]);
        assert!(cli.auth.no_netrc);
        assert_eq!(cli.auth.output.loglevel, LogLevel::Debug);
    }

    #[test]
    fn info_errors_exit_cleanly() {
        let report = miette::Report::new(XnatError::NoMatchingSessions("none".to_string()));
        assert_eq!(report_exit(&report), ExitCode::from(0));
        let report = miette::Report::new(XnatError::Usage("bad".to_string()));
        assert_eq!(report_exit(&report), ExitCode::from(2));
    }
}
