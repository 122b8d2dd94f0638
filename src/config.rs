use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::XnatError;

pub const CONFIG_FILE: &str = "daris2xnat.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct MigrationConfig {
    pub store_root: Utf8PathBuf,
    #[serde(default)]
    pub project_ids: BTreeMap<String, ProjectEntry>,
    #[serde(default)]
    pub dicom_receiver: Option<ReceiverEntry>,
}

/// A DaRIS project given either as its bare number or as a full `1008.2.N` CID.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProjectEntry {
    Number(u32),
    Cid(String),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReceiverEntry {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub calling_aet: Option<String>,
    #[serde(default)]
    pub called_aet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomReceiver {
    pub host: String,
    pub port: u16,
    pub calling_aet: String,
    pub called_aet: String,
}

impl Default for DicomReceiver {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8104,
            calling_aet: "DARISIMPORT".to_string(),
            called_aet: "XNAT".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedMigrationConfig {
    pub store_root: Utf8PathBuf,
    pub project_ids: BTreeMap<String, u32>,
    pub receiver: DicomReceiver,
}

impl ResolvedMigrationConfig {
    pub fn daris_id(&self, project: &str) -> Result<u32, XnatError> {
        self.project_ids.get(project).copied().ok_or_else(|| {
            XnatError::Usage(format!(
                "No DaRIS project id configured for '{project}' in {CONFIG_FILE}"
            ))
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedMigrationConfig, XnatError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(XnatError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| XnatError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: MigrationConfig = serde_json::from_str(&content)
            .map_err(|err| XnatError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: MigrationConfig) -> Result<ResolvedMigrationConfig, XnatError> {
        let project_ids = config
            .project_ids
            .into_iter()
            .map(|(project, entry)| {
                let id = match entry {
                    ProjectEntry::Number(id) => id,
                    ProjectEntry::Cid(cid) => parse_project_cid(&cid)?,
                };
                Ok((project, id))
            })
            .collect::<Result<BTreeMap<_, _>, XnatError>>()?;

        let defaults = DicomReceiver::default();
        let receiver = match config.dicom_receiver {
            Some(entry) => DicomReceiver {
                host: entry.host.unwrap_or(defaults.host),
                port: entry.port.unwrap_or(defaults.port),
                calling_aet: entry.calling_aet.unwrap_or(defaults.calling_aet),
                called_aet: entry.called_aet.unwrap_or(defaults.called_aet),
            },
            None => defaults,
        };

        Ok(ResolvedMigrationConfig {
            store_root: config.store_root,
            project_ids,
            receiver,
        })
    }
}

fn parse_project_cid(value: &str) -> Result<u32, XnatError> {
    let number = value.strip_prefix("1008.2.").unwrap_or(value);
    number.parse().map_err(|_| {
        XnatError::ConfigParse(format!(
            "'{value}' is not a DaRIS project number or '1008.2.<number>' CID"
        ))
    })
}
