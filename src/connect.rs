use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::XnatError;
use crate::netrc::{Credential, NetrcStore};
use crate::xnat::{XnatClient, XnatHttpClient};

/// Failed logins tolerated after the first before the account is considered blocked.
pub const MAX_LOGIN_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerName {
    pub protocol: Option<String>,
    pub host: String,
}

impl ServerName {
    pub fn parse(value: &str) -> Result<Self, XnatError> {
        let re = Regex::new(r"^(https?://)?([\w\-\.:]+).*")
            .map_err(|err| XnatError::Usage(err.to_string()))?;
        let caps = re
            .captures(value.trim())
            .ok_or_else(|| XnatError::Usage(format!("Invalid server name '{value}'")))?;
        let host = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| XnatError::Usage(format!("Invalid server name '{value}'")))?;
        Ok(Self {
            protocol: caps.get(1).map(|m| m.as_str().to_string()),
            host,
        })
    }

    /// Full base URL, `http://` unless a protocol was given.
    pub fn url(&self) -> String {
        format!(
            "{}{}",
            self.protocol.as_deref().unwrap_or("http://"),
            self.host
        )
    }
}

pub trait Prompt {
    fn read_line(&self, message: &str) -> Result<String, XnatError>;
    fn read_password(&self, message: &str) -> Result<String, XnatError>;
}

pub trait Authenticator {
    type Client: XnatClient;

    fn login(
        &self,
        server_url: &str,
        user: &str,
        password: &str,
    ) -> Result<Self::Client, XnatError>;
}

pub struct HttpAuthenticator;

impl Authenticator for HttpAuthenticator {
    type Client = XnatHttpClient;

    fn login(
        &self,
        server_url: &str,
        user: &str,
        password: &str,
    ) -> Result<Self::Client, XnatError> {
        let client = XnatHttpClient::new(server_url, user, password)?;
        client.login()?;
        Ok(client)
    }
}

pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn read_line(&self, message: &str) -> Result<String, XnatError> {
        let mut stderr = io::stderr();
        write!(stderr, "{message}").map_err(|err| XnatError::Usage(err.to_string()))?;
        stderr
            .flush()
            .map_err(|err| XnatError::Usage(err.to_string()))?;
        Ok(read_plain_line(&mut io::stdin().lock())?.trim().to_string())
    }

    fn read_password(&self, message: &str) -> Result<String, XnatError> {
        let mut stderr = io::stderr();
        write!(stderr, "{message}").map_err(|err| XnatError::Usage(err.to_string()))?;
        stderr
            .flush()
            .map_err(|err| XnatError::Usage(err.to_string()))?;
        if !io::stdin().is_terminal() {
            return read_plain_line(&mut io::stdin().lock());
        }
        if let Err(err) = terminal::enable_raw_mode() {
            debug!(%err, "raw mode unavailable, reading the password as a plain line");
            return read_plain_line(&mut io::stdin().lock());
        }
        let result = read_hidden();
        let restored = terminal::disable_raw_mode();
        let _ = writeln!(stderr);
        restored.map_err(|err| XnatError::Usage(err.to_string()))?;
        result
    }
}

/// One line without its line ending; surrounding spaces are kept.
fn read_plain_line(reader: &mut impl BufRead) -> Result<String, XnatError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|err| XnatError::Usage(err.to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_hidden() -> Result<String, XnatError> {
    let mut password = String::new();
    loop {
        let event = event::read().map_err(|err| XnatError::Usage(err.to_string()))?;
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            ..
        }) = event
        else {
            continue;
        };
        match code {
            KeyCode::Enter => return Ok(password),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(XnatError::Usage("Password entry aborted".to_string()));
            }
            KeyCode::Char(ch) => password.push(ch),
            KeyCode::Backspace => {
                password.pop();
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub server: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub use_netrc: bool,
    /// Overrides the default credential file location.
    pub netrc_path: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            server: None,
            user: None,
            password: None,
            use_netrc: true,
            netrc_path: None,
        }
    }
}

/// Picks the saved host a `--server` value refers to.
///
/// Returns the server to use and whether it came from the credential file.
pub fn select_server(
    server: Option<&str>,
    store: &NetrcStore,
) -> Result<(Option<String>, bool), XnatError> {
    let hosts = store.hosts();
    let Some(first) = hosts.first() else {
        return Ok((server.map(str::to_string), false));
    };
    let Some(server) = server else {
        return Ok((Some(first.to_string()), true));
    };
    let name = ServerName::parse(server)?;
    if name.protocol.is_some() {
        let saved = hosts.contains(&name.host.as_str());
        return Ok((Some(server.to_string()), saved));
    }
    let matches = hosts
        .iter()
        .filter(|host| host.contains(name.host.as_str()))
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [] => Ok((Some(server.to_string()), false)),
        [single] => Ok((Some(single.to_string()), true)),
        many => Err(XnatError::Usage(format!(
            "Given server name (or part thereof) '{}' matches multiple servers in {} file ('{}')",
            server,
            store.path().display(),
            many.iter()
                .map(|host| host.to_string())
                .collect::<Vec<_>>()
                .join("', '")
        ))),
    }
}

/// Resolves credentials, logs in and persists an access token on first use.
pub fn connect<A: Authenticator>(
    options: &ConnectOptions,
    authenticator: &A,
    prompt: &dyn Prompt,
) -> Result<A::Client, XnatError> {
    let netrc_path = match &options.netrc_path {
        Some(path) => path.clone(),
        None => NetrcStore::default_path()?,
    };
    let mut store = if options.use_netrc {
        NetrcStore::load(&netrc_path)?
    } else {
        NetrcStore::empty(&netrc_path)
    };

    let (mut server, mut netrc_match) = select_server(options.server.as_deref(), &store)?;
    let mut user = options.user.clone();
    let mut password = options.password.clone();
    let mut failures = 0usize;

    loop {
        let server_value = match server.take() {
            Some(value) => value,
            None => prompt.read_line("XNAT server hostname (e.g. xnat.sydney.edu.au): ")?,
        };
        let name = ServerName::parse(&server_value)?;
        server = Some(server_value.clone());

        let saved = if netrc_match {
            store.get(&name.host).cloned()
        } else {
            None
        };
        let from_netrc = saved.is_some();
        let (login, secret) = match saved {
            Some(Credential { login, password }) => (login, password),
            None => {
                let login = match user.take() {
                    Some(login) => login,
                    None => prompt.read_line(&format!("XNAT username for '{server_value}': "))?,
                };
                let secret = match password.take() {
                    Some(secret) => secret,
                    None => prompt.read_password("Password: ")?,
                };
                (login, secret)
            }
        };

        match authenticator.login(&name.url(), &login, &secret) {
            Ok(client) => {
                if options.use_netrc && !from_netrc {
                    let token = client.issue_token()?;
                    store.insert(
                        &name.host,
                        Credential {
                            login: token.alias,
                            password: token.secret,
                        },
                    );
                    store.save()?;
                    warn!(
                        "Saved access token for {} in {}. If this isn't desirable (i.e. you don't \
                         want someone to be able to access your XNAT account from this computer \
                         account) please delete the file. To prevent this from happening in the \
                         future pass the '--no_netrc' or '-n' option",
                        name.url(),
                        store.path().display()
                    );
                }
                info!(server = %name.url(), "connected");
                return Ok(client);
            }
            Err(XnatError::LoginFailed(reason)) => {
                let headline = if from_netrc {
                    format!(
                        "The user access token for {} stored in {} has expired!",
                        name.url(),
                        store.path().display()
                    )
                } else {
                    format!("Incorrect user credentials for {}!", name.url())
                };
                warn!(
                    reason = %reason,
                    "{headline} One failed login, note that your account will be automatically \
                     blocked for 1 hour after 3 failed login attempts. Please contact your \
                     administrator to have it reset."
                );
                if store.remove(&name.host).is_some() {
                    store.save()?;
                    warn!("Removed saved credentials for {}...", name.url());
                }
                if failures >= MAX_LOGIN_RETRIES {
                    return Err(XnatError::LoginBlocked { user: login });
                }
                failures += 1;
                netrc_match = false;
            }
            Err(other) => return Err(other),
        }
    }
}
