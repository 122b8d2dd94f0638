use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tracing::debug;

use crate::error::XnatError;

pub const NETRC_ENV: &str = "XNAT_UTILS_NETRC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub login: String,
    pub password: String,
}

/// Saved server credentials, kept in file order.
#[derive(Debug, Clone)]
pub struct NetrcStore {
    path: PathBuf,
    hosts: Vec<(String, Credential)>,
}

impl NetrcStore {
    pub fn default_path() -> Result<PathBuf, XnatError> {
        if let Some(path) = std::env::var_os(NETRC_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        let base = BaseDirs::new()
            .ok_or_else(|| XnatError::Netrc("could not resolve home directory".to_string()))?;
        let name = if cfg!(windows) { "_netrc" } else { ".netrc" };
        Ok(base.home_dir().join(name))
    }

    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            hosts: Vec::new(),
        }
    }

    /// Reads the store at `path`; a missing file gives an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, XnatError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::empty(path));
        }
        let content = fs::read_to_string(&path)
            .map_err(|err| XnatError::Netrc(format!("read {}: {err}", path.display())))?;
        let hosts = parse(&content);
        if hosts.is_empty() {
            return Err(XnatError::Netrc(format!(
                "Malformed netrc file ({}), please delete or pass '--no_netrc'",
                path.display()
            )));
        }
        debug!(path = %path.display(), hosts = hosts.len(), "loaded netrc");
        Ok(Self { path, hosts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.hosts.iter().map(|(host, _)| host.as_str()).collect()
    }

    pub fn get(&self, host: &str) -> Option<&Credential> {
        self.hosts
            .iter()
            .find(|(name, _)| name == host)
            .map(|(_, cred)| cred)
    }

    pub fn insert(&mut self, host: &str, credential: Credential) {
        match self.hosts.iter_mut().find(|(name, _)| name == host) {
            Some((_, existing)) => *existing = credential,
            None => self.hosts.push((host.to_string(), credential)),
        }
    }

    pub fn remove(&mut self, host: &str) -> Option<Credential> {
        let index = self.hosts.iter().position(|(name, _)| name == host)?;
        Some(self.hosts.remove(index).1)
    }

    /// Writes the store back, or deletes the file once no host is left.
    pub fn save(&self) -> Result<(), XnatError> {
        if self.hosts.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path).map_err(|err| {
                    XnatError::Netrc(format!("remove {}: {err}", self.path.display()))
                })?;
            }
            return Ok(());
        }
        let mut content = String::new();
        for (host, cred) in &self.hosts {
            content.push_str(&format!("machine {host}\n"));
            content.push_str(&format!("user {}\n", cred.login));
            content.push_str(&format!("password {}\n", cred.password));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| XnatError::Netrc(format!("{}: {err}", parent.display())))?;
            }
        }
        fs::write(&self.path, content)
            .map_err(|err| XnatError::Netrc(format!("write {}: {err}", self.path.display())))?;
        restrict_permissions(&self.path)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), XnatError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|err| XnatError::Netrc(format!("chmod {}: {err}", path.display())))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), XnatError> {
    Ok(())
}

fn parse(content: &str) -> Vec<(String, Credential)> {
    let mut hosts: Vec<(String, Credential)> = Vec::new();
    let mut current: Option<(String, Credential)> = None;
    let mut in_macdef = false;
    let mut pending: Option<String> = None;

    for line in content.lines() {
        if in_macdef {
            if line.trim().is_empty() {
                in_macdef = false;
            }
            continue;
        }
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if let Some(key) = pending.take() {
                if let Some((_, cred)) = current.as_mut() {
                    match key.as_str() {
                        "login" | "user" => cred.login = token.to_string(),
                        "password" => cred.password = token.to_string(),
                        _ => {}
                    }
                }
                continue;
            }
            match token {
                "machine" => {
                    if let Some(entry) = current.take() {
                        hosts.push(entry);
                    }
                    if let Some(host) = tokens.next() {
                        current = Some((
                            host.to_string(),
                            Credential {
                                login: String::new(),
                                password: String::new(),
                            },
                        ));
                    }
                }
                "default" => {
                    if let Some(entry) = current.take() {
                        hosts.push(entry);
                    }
                }
                "login" | "user" | "password" | "account" => pending = Some(token.to_string()),
                "macdef" => {
                    in_macdef = true;
                    break;
                }
                _ => {}
            }
        }
    }
    if let Some(entry) = current.take() {
        hosts.push(entry);
    }
    hosts
}
