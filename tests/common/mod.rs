#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use md5::{Digest, Md5};
use zip::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use xnat_utils::convert::{ToolInfo, ToolRunner};
use xnat_utils::domain::Modality;
use xnat_utils::error::XnatError;
use xnat_utils::output::{ProgressEvent, ProgressSink};
use xnat_utils::xnat::{
    AccessToken, FieldOwner, Project, RemoteFile, Resource, ResourceRef, Scan, Session,
    SessionScope, Subject, XnatClient,
};

type ResourceKey = (String, Option<String>, String);

/// In-memory XNAT server.
#[derive(Debug, Default)]
pub struct MockXnat {
    pub projects: Vec<Project>,
    pub subjects: Mutex<Vec<Subject>>,
    pub sessions: Mutex<Vec<Session>>,
    pub scans: Mutex<BTreeMap<String, Vec<Scan>>>,
    /// File contents per (session id, scan id, resource label).
    pub files: Mutex<BTreeMap<ResourceKey, Vec<(String, Vec<u8>)>>>,
    pub fields: Mutex<BTreeMap<(String, String), String>>,
    pub calls: Mutex<Vec<String>>,
    pub corrupt_digests: bool,
}

fn key(resource: ResourceRef<'_>) -> ResourceKey {
    (
        resource.session_id.to_string(),
        resource.scan_id.map(str::to_string),
        resource.resource.to_string(),
    )
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl MockXnat {
    pub fn with_project(mut self, id: &str) -> Self {
        self.projects.push(Project { id: id.to_string() });
        self
    }

    pub fn with_subject(self, id: &str, label: &str, project: &str) -> Self {
        self.subjects.lock().unwrap().push(Subject {
            id: id.to_string(),
            label: label.to_string(),
            project: project.to_string(),
        });
        self
    }

    pub fn with_session(self, id: &str, label: &str, date: Option<&str>) -> Self {
        let parts = label.split('_').collect::<Vec<_>>();
        let project = parts[0].to_string();
        let subject_label = format!("{}_{}", parts[0], parts[1]);
        let subject_id = self
            .subjects
            .lock()
            .unwrap()
            .iter()
            .find(|subject| subject.label == subject_label)
            .map(|subject| subject.id.clone())
            .unwrap_or_else(|| format!("S_{subject_label}"));
        self.sessions.lock().unwrap().push(Session {
            id: id.to_string(),
            label: label.to_string(),
            project,
            subject_id,
            subject_label,
            date: date.map(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()),
            xsi_type: "xnat:mrSessionData".to_string(),
        });
        self
    }

    pub fn with_scan(self, session_id: &str, scan_id: &str, scan_type: Option<&str>) -> Self {
        self.scans
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(Scan {
                id: scan_id.to_string(),
                scan_type: scan_type.map(str::to_string),
            });
        self
    }

    pub fn with_files(
        self,
        session_id: &str,
        scan_id: Option<&str>,
        resource: &str,
        files: &[(&str, &[u8])],
    ) -> Self {
        self.files.lock().unwrap().insert(
            (
                session_id.to_string(),
                scan_id.map(str::to_string),
                resource.to_string(),
            ),
            files
                .iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect(),
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stored_files(&self, session_id: &str, scan_id: &str, resource: &str) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(
                session_id.to_string(),
                Some(scan_id.to_string()),
                resource.to_string(),
            ))
            .map(|files| files.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn session_by_id(&self, session_id: &str) -> Result<Session, XnatError> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|session| session.id == session_id)
            .cloned()
            .ok_or_else(|| XnatError::Lookup {
                path: format!("/data/experiments/{session_id}"),
            })
    }
}

impl XnatClient for MockXnat {
    fn server(&self) -> &str {
        "http://mock.xnat"
    }

    fn projects(&self) -> Result<Vec<Project>, XnatError> {
        Ok(self.projects.clone())
    }

    fn subjects(&self, project: Option<&str>) -> Result<Vec<Subject>, XnatError> {
        if let Some(project) = project {
            if !self.projects.iter().any(|p| p.id == project) {
                return Err(XnatError::Lookup {
                    path: format!("/data/projects/{project}/subjects"),
                });
            }
        }
        Ok(self
            .subjects
            .lock()
            .unwrap()
            .iter()
            .filter(|subject| project.is_none_or(|project| subject.project == project))
            .cloned()
            .collect())
    }

    fn sessions(&self, scope: SessionScope<'_>) -> Result<Vec<Session>, XnatError> {
        if let SessionScope::Project(project) | SessionScope::Subject { project, .. } = scope {
            if !self.projects.iter().any(|p| p.id == project) {
                return Err(XnatError::Lookup {
                    path: format!("/data/projects/{project}/experiments"),
                });
            }
        }
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|session| match scope {
                SessionScope::All => true,
                SessionScope::Project(project) => session.project == project,
                SessionScope::Subject { project, subject } => {
                    session.project == project && session.subject_id == subject
                }
            })
            .cloned()
            .collect())
    }

    fn scans(&self, session_id: &str) -> Result<Vec<Scan>, XnatError> {
        self.session_by_id(session_id)?;
        Ok(self
            .scans
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn resources(
        &self,
        session_id: &str,
        scan_id: Option<&str>,
    ) -> Result<Vec<Resource>, XnatError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|(session, scan, _)| session == session_id && scan.as_deref() == scan_id)
            .map(|(_, _, label)| Resource {
                id: label.clone(),
                label: label.clone(),
            })
            .collect())
    }

    fn files(&self, resource: ResourceRef<'_>) -> Result<Vec<RemoteFile>, XnatError> {
        let files = self.files.lock().unwrap();
        let stored = files.get(&key(resource)).ok_or_else(|| XnatError::Lookup {
            path: resource.resource.to_string(),
        })?;
        Ok(stored
            .iter()
            .map(|(name, data)| RemoteFile {
                name: name.replace(' ', "%20"),
                digest: Some(if self.corrupt_digests {
                    "00000000000000000000000000000000".to_string()
                } else {
                    md5_hex(data)
                }),
            })
            .collect())
    }

    fn download_resource(
        &self,
        resource: ResourceRef<'_>,
        destination: &Path,
    ) -> Result<(), XnatError> {
        self.record(format!("download {}", resource.resource));
        let session = self.session_by_id(resource.session_id)?;
        let files = self.files.lock().unwrap();
        let stored = files
            .get(&key(resource))
            .filter(|stored| !stored.is_empty())
            .ok_or_else(|| XnatError::Lookup {
                path: resource.resource.to_string(),
            })?;

        let prefix = match resource.scan_id {
            Some(scan) => format!(
                "{}/scans/{scan}/resources/{}/files",
                session.label, resource.resource
            ),
            None => format!("{}/resources/{}/files", session.label, resource.resource),
        };
        let out = fs::File::create(destination).unwrap();
        let mut writer = ZipWriter::new(out);
        for (name, data) in stored {
            writer
                .start_file(format!("{prefix}/{name}"), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        Ok(())
    }

    fn create_subject(&self, project: &str, label: &str) -> Result<(), XnatError> {
        self.record(format!("create_subject {project}/{label}"));
        self.subjects.lock().unwrap().push(Subject {
            id: format!("S_{label}"),
            label: label.to_string(),
            project: project.to_string(),
        });
        Ok(())
    }

    fn create_session(
        &self,
        project: &str,
        subject: &str,
        label: &str,
        modality: Modality,
    ) -> Result<(), XnatError> {
        self.record(format!("create_session {project}/{subject}/{label} {modality}"));
        self.sessions.lock().unwrap().push(Session {
            id: format!("E_{label}"),
            label: label.to_string(),
            project: project.to_string(),
            subject_id: format!("S_{subject}"),
            subject_label: subject.to_string(),
            date: None,
            xsi_type: modality.session_xsi_type().to_string(),
        });
        Ok(())
    }

    fn create_scan(
        &self,
        session_id: &str,
        scan_id: &str,
        scan_type: &str,
        _modality: Modality,
    ) -> Result<(), XnatError> {
        self.record(format!("create_scan {session_id}/{scan_id}"));
        let mut scans = self.scans.lock().unwrap();
        let entry = scans.entry(session_id.to_string()).or_default();
        if !entry.iter().any(|scan| scan.id == scan_id) {
            entry.push(Scan {
                id: scan_id.to_string(),
                scan_type: Some(scan_type.to_string()),
            });
        }
        Ok(())
    }

    fn create_resource(&self, resource: ResourceRef<'_>) -> Result<(), XnatError> {
        self.record(format!("create_resource {}", resource.resource));
        self.files.lock().unwrap().entry(key(resource)).or_default();
        Ok(())
    }

    fn delete_resource(&self, resource: ResourceRef<'_>) -> Result<(), XnatError> {
        self.record(format!("delete_resource {}", resource.resource));
        self.files.lock().unwrap().remove(&key(resource));
        Ok(())
    }

    fn upload_zip(&self, resource: ResourceRef<'_>, zip_path: &Path) -> Result<(), XnatError> {
        self.record(format!("upload {}", resource.resource));
        let mut archive = ZipArchive::new(fs::File::open(zip_path).unwrap()).unwrap();
        let mut uploaded = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            uploaded.push((entry.name().to_string(), data));
        }
        self.files
            .lock()
            .unwrap()
            .entry(key(resource))
            .or_default()
            .extend(uploaded);
        Ok(())
    }

    fn pull_headers(&self, session_id: &str) -> Result<(), XnatError> {
        self.record(format!("pull_headers {session_id}"));
        Ok(())
    }

    fn field(&self, owner: FieldOwner<'_>, name: &str) -> Result<Option<String>, XnatError> {
        let id = match owner {
            FieldOwner::Subject(subject) => subject.id.clone(),
            FieldOwner::Session(session) => session.id.clone(),
        };
        Ok(self.fields.lock().unwrap().get(&(id, name.to_string())).cloned())
    }

    fn set_field(&self, owner: FieldOwner<'_>, name: &str, value: &str) -> Result<(), XnatError> {
        let id = match owner {
            FieldOwner::Subject(subject) => subject.id.clone(),
            FieldOwner::Session(session) => session.id.clone(),
        };
        self.fields
            .lock()
            .unwrap()
            .insert((id, name.to_string()), value.to_string());
        Ok(())
    }

    fn rename_session(&self, session_id: &str, new_label: &str) -> Result<(), XnatError> {
        self.record(format!("rename {session_id} {new_label}"));
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.iter_mut().find(|session| session.id == session_id) {
            session.label = new_label.to_string();
        }
        Ok(())
    }

    fn issue_token(&self) -> Result<AccessToken, XnatError> {
        Ok(AccessToken {
            alias: "token-alias".to_string(),
            secret: "token-secret".to_string(),
        })
    }
}

/// Records tool invocations; fails every run when `fail` is set.
#[derive(Default)]
pub struct MockTools {
    pub available: Vec<&'static str>,
    pub fail: bool,
    pub runs: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockTools {
    pub fn with(available: &[&'static str]) -> Self {
        Self {
            available: available.to_vec(),
            ..Self::default()
        }
    }

    pub fn failing(available: &[&'static str]) -> Self {
        Self {
            available: available.to_vec(),
            fail: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<(String, Vec<String>)> {
        self.runs.lock().unwrap().clone()
    }
}

impl ToolRunner for MockTools {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.available
            .contains(&program)
            .then(|| PathBuf::from(format!("/usr/local/bin/{program}")))
    }

    fn run(&self, program: &Path, args: &[String]) -> Result<(), XnatError> {
        let name = program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.runs.lock().unwrap().push((name.clone(), args.to_vec()));
        if self.fail {
            return Err(XnatError::Conversion(format!("{name} exited with status 1")));
        }
        Ok(())
    }

    fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            dcm2niix: None,
            mrconvert: None,
            dcmodify: None,
            dcmsend: None,
        }
    }
}

/// Collects progress lines for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}
