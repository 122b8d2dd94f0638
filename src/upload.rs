use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};

use crate::app::App;
use crate::convert::ToolRunner;
use crate::domain::{
    Modality, SessionLabel, resource_name_for, validate_scan_name, validate_session_name,
};
use crate::error::XnatError;
use crate::fs_util;
use crate::matching::{find_project, find_session, find_subject};
use crate::output::{ProgressEvent, ProgressSink};
use crate::xnat::{ResourceRef, Session, SessionScope, XnatClient};

#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub session: String,
    pub scan: String,
    pub filenames: Vec<PathBuf>,
    pub overwrite: bool,
    pub create_session: bool,
    pub resource_name: Option<String>,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub scan_id: Option<String>,
    pub modality: Option<Modality>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PutResult {
    pub session: String,
    pub scan: String,
    pub resource: String,
    pub created_session: bool,
    /// Verified MD5 digest per uploaded file name.
    pub digests: BTreeMap<String, String>,
}

/// Expands a lone directory argument and rejects missing or clashing files.
pub fn resolve_upload_files(filenames: &[PathBuf]) -> Result<Vec<PathBuf>, XnatError> {
    if filenames.is_empty() {
        return Err(XnatError::Usage(
            "No filenames provided to upload".to_string(),
        ));
    }
    let files = if filenames.len() == 1 && filenames[0].is_dir() {
        let dir = &filenames[0];
        let mut files = fs::read_dir(dir)
            .map_err(|err| XnatError::Filesystem(format!("{}: {err}", dir.display())))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| !name.starts_with('.'))
            })
            .collect::<Vec<_>>();
        files.sort();
        if files.is_empty() {
            return Err(XnatError::Usage(format!(
                "Directory '{}' does not contain any files to upload",
                dir.display()
            )));
        }
        files
    } else {
        filenames.to_vec()
    };

    let mut seen = HashSet::new();
    for path in &files {
        if !path.is_file() {
            return Err(XnatError::Usage(format!(
                "The file to upload, '{}', does not exist",
                path.display()
            )));
        }
        let name = fs_util::basename(path)?;
        if !seen.insert(name.clone()) {
            return Err(XnatError::Usage(format!(
                "Cannot upload files with the same basename ('{name}')"
            )));
        }
    }
    Ok(files)
}

pub fn upload_resource_name(
    explicit: Option<&str>,
    files: &[PathBuf],
) -> Result<String, XnatError> {
    if let Some(name) = explicit {
        return Ok(name.to_uppercase());
    }
    match files {
        [single] => Ok(resource_name_for(&fs_util::basename(single)?)),
        _ => Err(XnatError::Usage(
            "'--resource_name' option needs to be provided when uploading multiple files"
                .to_string(),
        )),
    }
}

impl PutRequest {
    /// Local checks run before connecting; returns the files and resource name.
    pub fn precheck(&self) -> Result<(Vec<PathBuf>, String), XnatError> {
        validate_session_name(&self.session)?;
        validate_scan_name(&self.scan)?;
        let files = resolve_upload_files(&self.filenames)?;
        let resource_name = upload_resource_name(self.resource_name.as_deref(), &files)?;
        Ok((files, resource_name))
    }
}

impl<X: XnatClient, T: ToolRunner> App<X, T> {
    pub fn put(&self, request: PutRequest, sink: &dyn ProgressSink) -> Result<PutResult, XnatError> {
        let (files, resource_name) = request.precheck()?;
        let modality = request
            .modality
            .unwrap_or_else(|| Modality::from_session_label(&request.session));

        let (session, created_session) = self.find_or_create_session(&request, modality, sink)?;
        let scan_id = request.scan_id.clone().unwrap_or_else(|| request.scan.clone());
        self.client
            .create_scan(&session.id, &scan_id, &request.scan, modality)?;

        let resource = ResourceRef {
            session_id: &session.id,
            scan_id: Some(scan_id.as_str()),
            resource: &resource_name,
        };
        if request.overwrite {
            let exists = self
                .client
                .resources(&session.id, Some(scan_id.as_str()))?
                .iter()
                .any(|existing| existing.label == resource_name);
            if exists {
                self.client.delete_resource(resource)?;
                sink.event(ProgressEvent::new(format!(
                    "Deleted existing resource at {}:{}/{}",
                    request.session, request.scan, resource_name
                )));
            }
        }
        self.client.create_resource(resource)?;

        let staging = tempfile::Builder::new()
            .prefix("xnat-put-")
            .tempdir()
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let zip_path = staging.path().join("upload.zip");
        fs_util::zip_files(&files, &zip_path)?;
        self.client.upload_zip(resource, &zip_path)?;
        for path in &files {
            sink.event(ProgressEvent::new(format!(
                "{} uploaded to {}:{}",
                path.display(),
                request.session,
                request.scan
            )));
        }

        sink.event(ProgressEvent::new("Uploaded files, checking digests..."));
        let remote = self
            .client
            .files(resource)?
            .into_iter()
            .map(|file| (file.name, file.digest))
            .collect::<BTreeMap<_, _>>();
        let mut digests = BTreeMap::new();
        for path in &files {
            let name = fs_util::basename(path)?;
            let remote_name = name.replace(' ', "%20");
            let remote_digest = remote
                .get(&remote_name)
                .or_else(|| remote.get(&name))
                .cloned()
                .flatten()
                .ok_or_else(|| {
                    XnatError::DigestUnavailable(format!(
                        "Could not find a digest for '{name}' on the server, files may have been \
                         uploaded but cannot be checked"
                    ))
                })?;
            let local_digest = fs_util::md5_file(path).map_err(|_| {
                XnatError::DigestUnavailable(format!(
                    "Could not check digest of '{}'",
                    path.display()
                ))
            })?;
            if local_digest != remote_digest {
                return Err(XnatError::DigestMismatch {
                    file: path.display().to_string(),
                    remote: remote_digest,
                    local: local_digest,
                });
            }
            sink.event(ProgressEvent::new(format!(
                "Successfully checked digest for {}",
                path.display()
            )));
            digests.insert(name, local_digest);
        }

        if resource_name == "DICOM" {
            sink.event(ProgressEvent::new("pulling data from headers"));
            self.client.pull_headers(&session.id)?;
        }

        Ok(PutResult {
            session: session.label,
            scan: request.scan,
            resource: resource_name,
            created_session,
            digests,
        })
    }

    fn find_or_create_session(
        &self,
        request: &PutRequest,
        modality: Modality,
        sink: &dyn ProgressSink,
    ) -> Result<(Session, bool), XnatError> {
        let scope = match &request.project {
            Some(project) => SessionScope::Project(project),
            None => SessionScope::All,
        };
        match find_session(&self.client, scope, &request.session) {
            Ok(session) => return Ok((session, false)),
            Err(XnatError::NotFound { .. }) | Err(XnatError::Lookup { .. }) => {}
            Err(other) => return Err(other),
        }
        if !request.create_session {
            return Err(XnatError::NoMatchingSessions(format!(
                "'{}' session does not exist, to automatically create it please use \
                 '--create_session' option.",
                request.session
            )));
        }

        let (project, subject) = match (&request.project, &request.subject) {
            (Some(project), Some(subject)) => (project.clone(), subject.clone()),
            (Some(project), None) => (project.clone(), SessionLabel::subject_of(&request.session)),
            (None, Some(subject)) => (SessionLabel::project_of(&request.session), subject.clone()),
            (None, None) => {
                let parts = SessionLabel::split(&request.session)?;
                (parts.project, parts.subject)
            }
        };
        let project = match find_project(&self.client, &project) {
            Ok(project) => project,
            Err(XnatError::NotFound { .. }) => {
                return Err(XnatError::Usage(format!(
                    "Cannot create session '{}' as '{}' does not exist (or you don't have \
                     access to it)",
                    request.session, project
                )));
            }
            Err(other) => return Err(other),
        };
        let subject_label = match find_subject(&self.client, Some(project.id.as_str()), &subject) {
            Ok(existing) => existing.label,
            Err(XnatError::NotFound { .. }) => {
                debug!(subject = %subject, "creating subject");
                self.client.create_subject(&project.id, &subject)?;
                subject
            }
            Err(other) => return Err(other),
        };
        self.client
            .create_session(&project.id, &subject_label, &request.session, modality)?;
        info!(session = %request.session, modality = %modality, "created session");
        sink.event(ProgressEvent::new(format!(
            "{} session successfully created.",
            request.session
        )));
        let session = find_session(
            &self.client,
            SessionScope::Project(&project.id),
            &request.session,
        )?;
        Ok((session, true))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn directory_argument_expands_to_visible_files() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("b.dcm"), b"b").unwrap();
        fs::write(temp.path().join("a.dcm"), b"a").unwrap();
        fs::write(temp.path().join(".DS_Store"), b"x").unwrap();
        let files = resolve_upload_files(&[temp.path().to_path_buf()]).unwrap();
        let names = files
            .iter()
            .map(|path| fs_util::basename(path).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.dcm", "b.dcm"]);
    }

    #[test]
    fn clashing_basenames_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let one = temp.path().join("one");
        let two = temp.path().join("two");
        fs::create_dir_all(&one).unwrap();
        fs::create_dir_all(&two).unwrap();
        fs::write(one.join("t1.nii"), b"1").unwrap();
        fs::write(two.join("t1.nii"), b"2").unwrap();
        assert_matches!(
            resolve_upload_files(&[one.join("t1.nii"), two.join("t1.nii")]),
            Err(XnatError::Usage(_))
        );
        assert_matches!(
            resolve_upload_files(&[temp.path().join("missing.nii")]),
            Err(XnatError::Usage(_))
        );
        assert_matches!(resolve_upload_files(&[]), Err(XnatError::Usage(_)));
    }

    #[test]
    fn resource_name_inference() {
        let single = vec![PathBuf::from("dir/t1.nii.gz")];
        assert_eq!(upload_resource_name(None, &single).unwrap(), "NIFTI_GZ");
        assert_eq!(upload_resource_name(Some("dicom"), &single).unwrap(), "DICOM");
        let many = vec![PathBuf::from("a.nii"), PathBuf::from("b.nii")];
        assert_matches!(upload_resource_name(None, &many), Err(XnatError::Usage(_)));
    }
}
