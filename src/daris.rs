use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedMigrationConfig;
use crate::convert::ToolRunner;
use crate::domain::Modality;
use crate::error::XnatError;
use crate::fs_util;
use crate::output::{ProgressEvent, ProgressSink};

const CID_ROOT: [u32; 2] = [1008, 2];
/// Method number of the raw scanner acquisitions in the legacy archive.
const PRIMARY_METHOD: u32 = 1;

/// Citeable id of a legacy dataset:
/// `1008.2.<project>.<subject>.<method>.<study>[.<dataset>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DarisCid(Vec<u32>);

impl DarisCid {
    pub fn project(&self) -> u32 {
        self.0[2]
    }

    pub fn subject(&self) -> u32 {
        self.0[3]
    }

    pub fn method(&self) -> u32 {
        self.0[4]
    }

    pub fn study(&self) -> u32 {
        self.0[5]
    }

    pub fn dataset(&self) -> Option<u32> {
        self.0.get(6).copied()
    }
}

impl FromStr for DarisCid {
    type Err = XnatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || XnatError::Usage(format!("'{value}' is not a DaRIS study/dataset CID"));
        let parts = value
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if !(6..=7).contains(&parts.len()) || parts[..2] != CID_ROOT {
            return Err(invalid());
        }
        Ok(Self(parts))
    }
}

impl Ord for DarisCid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for DarisCid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DarisCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(u32::to_string).collect::<Vec<_>>();
        write!(f, "{}", parts.join("."))
    }
}

/// Zipped dataset found in the archive store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DarisDataset {
    pub cid: DarisCid,
    pub zip_path: PathBuf,
}

/// XNAT labels a legacy study is imported under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportTarget {
    pub project: String,
    pub subject: String,
    pub session: String,
}

impl ImportTarget {
    pub fn new(project: &str, cid: &DarisCid) -> Self {
        let modality = if project.starts_with("MMH") {
            Modality::MrPt
        } else {
            Modality::Mr
        };
        let subject = format!("{project}_{:03}", cid.subject());
        let session = format!("{subject}_{}{:02}", modality.code(), cid.study());
        Self {
            project: project.to_string(),
            subject,
            session,
        }
    }

    /// Value written into the patient comments tag, read back by the receiver.
    pub fn annotation(&self) -> String {
        format!(
            "(0010,4000)=project: {}; subject: {}; session: {}",
            self.project, self.subject, self.session
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub project: String,
    pub imported: Vec<ImportTarget>,
}

/// Every `<cid>.zip` below `store_root` belonging to the given project number.
pub fn find_datasets(store_root: &Path, project_id: u32) -> Result<Vec<DarisDataset>, XnatError> {
    if !store_root.is_dir() {
        return Err(XnatError::Usage(format!(
            "DaRIS store '{}' is not a directory",
            store_root.display()
        )));
    }
    let mut datasets = Vec::new();
    let mut pending = vec![store_root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|err| XnatError::Filesystem(format!("{}: {err}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let Some(stem) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".zip"))
            else {
                continue;
            };
            match stem.parse::<DarisCid>() {
                Ok(cid) if cid.project() == project_id => datasets.push(DarisDataset {
                    cid,
                    zip_path: path.clone(),
                }),
                Ok(_) => {}
                Err(_) => debug!(path = %path.display(), "ignoring non-dataset archive"),
            }
        }
    }
    datasets.sort_by(|a, b| a.cid.cmp(&b.cid));
    Ok(datasets)
}

/// Re-sends the primary DICOM studies of a legacy project to the XNAT receiver.
pub struct DarisImport<'a, T: ToolRunner> {
    config: &'a ResolvedMigrationConfig,
    tools: &'a T,
}

impl<'a, T: ToolRunner> DarisImport<'a, T> {
    pub fn new(config: &'a ResolvedMigrationConfig, tools: &'a T) -> Self {
        Self { config, tools }
    }

    pub fn run(
        &self,
        project: &str,
        subjects: Option<&[u32]>,
        sink: &dyn ProgressSink,
    ) -> Result<ImportResult, XnatError> {
        let project_id = self.config.daris_id(project)?;
        let dcmodify = self.tools.require("dcmodify")?;
        let dcmsend = self.tools.require("dcmsend")?;
        debug!(tools = ?self.tools.tool_info(), "external tool versions");

        let datasets = find_datasets(self.config.store_root.as_std_path(), project_id)?
            .into_iter()
            .filter(|dataset| dataset.cid.method() == PRIMARY_METHOD)
            .filter(|dataset| subjects.is_none_or(|ids| ids.contains(&dataset.cid.subject())))
            .collect::<Vec<_>>();
        if datasets.is_empty() {
            warn!(project, project_id, "no datasets found in the DaRIS store");
        }

        let mut imported = Vec::new();
        for dataset in &datasets {
            let target = ImportTarget::new(project, &dataset.cid);
            sink.event(ProgressEvent::new(format!(
                "Importing {} as {}",
                dataset.cid, target.session
            )));
            if self.import_dataset(dataset, &target, &dcmodify, &dcmsend)? {
                imported.push(target);
            }
        }

        info!(project, datasets = imported.len(), "import finished");
        sink.event(ProgressEvent::new(format!("Successfully imported {project}")));
        Ok(ImportResult {
            project: project.to_string(),
            imported,
        })
    }

    fn import_dataset(
        &self,
        dataset: &DarisDataset,
        target: &ImportTarget,
        dcmodify: &Path,
        dcmsend: &Path,
    ) -> Result<bool, XnatError> {
        let staging = tempfile::Builder::new()
            .prefix(&format!("daris-{}-", dataset.cid))
            .tempdir()
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        fs_util::extract_zip(&dataset.zip_path, staging.path())?;

        let files = dicom_files(staging.path())?;
        if files.is_empty() {
            warn!(cid = %dataset.cid, "archive contains no DICOM files, skipping");
            return Ok(false);
        }
        let files = files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>();

        let mut modify_args = vec!["-nb".to_string(), "-i".to_string(), target.annotation()];
        modify_args.extend(files.iter().cloned());
        self.tools.run(dcmodify, &modify_args)?;

        let receiver = &self.config.receiver;
        let mut send_args = vec![
            "-aet".to_string(),
            receiver.calling_aet.clone(),
            "-aec".to_string(),
            receiver.called_aet.clone(),
            receiver.host.clone(),
            receiver.port.to_string(),
        ];
        send_args.extend(files);
        self.tools.run(dcmsend, &send_args)?;
        Ok(true)
    }
}

/// `.dcm` files anywhere below `root`, sorted.
fn dicom_files(root: &Path) -> Result<Vec<PathBuf>, XnatError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|err| XnatError::Filesystem(format!("{}: {err}", dir.display())))?;
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn cid_parts_and_numeric_order() {
        let cid: DarisCid = "1008.2.71.3.1.2".parse().unwrap();
        assert_eq!(cid.project(), 71);
        assert_eq!(cid.subject(), 3);
        assert_eq!(cid.method(), 1);
        assert_eq!(cid.study(), 2);
        assert_eq!(cid.dataset(), None);

        let mut cids = ["1008.2.71.10.1.1", "1008.2.71.9.1.1", "1008.2.71.9.1.1.4"]
            .iter()
            .map(|value| value.parse::<DarisCid>().unwrap())
            .collect::<Vec<_>>();
        cids.sort();
        let ordered = cids.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            ordered,
            vec!["1008.2.71.9.1.1", "1008.2.71.9.1.1.4", "1008.2.71.10.1.1"]
        );
    }

    #[test]
    fn malformed_cids_are_rejected() {
        assert_matches!("1008.2.71".parse::<DarisCid>(), Err(XnatError::Usage(_)));
        assert_matches!("1007.2.71.3.1.2".parse::<DarisCid>(), Err(XnatError::Usage(_)));
        assert_matches!("1008.2.71.x.1.2".parse::<DarisCid>(), Err(XnatError::Usage(_)));
    }

    #[test]
    fn import_target_labels() {
        let cid: DarisCid = "1008.2.71.3.1.2".parse().unwrap();
        let target = ImportTarget::new("MRH017", &cid);
        assert_eq!(target.subject, "MRH017_003");
        assert_eq!(target.session, "MRH017_003_MR02");
        assert_eq!(
            target.annotation(),
            "(0010,4000)=project: MRH017; subject: MRH017_003; session: MRH017_003_MR02"
        );
        let pet = ImportTarget::new("MMH000", &cid);
        assert_eq!(pet.session, "MMH000_003_MRPT02");
    }
}
