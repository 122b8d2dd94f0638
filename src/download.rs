use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::catalog::read_catalog;
use crate::convert::{ToolRunner, conversion_args};
use crate::domain::{
    ConvertTarget, Converter, DateRange, PatternSet, SKIP_RESOURCES, extension_for,
    is_dicom_resource, is_regex, sanitize_label,
};
use crate::error::XnatError;
use crate::fs_util;
use crate::matching::{
    SessionQuery, find_subject, matching_scans, matching_sessions, resolve_label,
};
use crate::output::{ProgressEvent, ProgressSink};
use crate::xnat::{Resource, ResourceRef, Scan, Session, SessionScope, XnatClient};

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub ids: Vec<String>,
    pub download_dir: PathBuf,
    /// Scan type patterns; empty downloads every scan.
    pub scans: Vec<String>,
    pub resource_name: Option<String>,
    pub convert_to: Option<ConvertTarget>,
    pub converter: Option<Converter>,
    pub subject_dirs: bool,
    pub with_scans: Vec<String>,
    pub without_scans: Vec<String>,
    pub strip_name: bool,
    pub skip_downloaded: bool,
    pub before: Option<String>,
    pub after: Option<String>,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub match_scan_id: bool,
}

impl GetRequest {
    /// Local checks run before connecting; returns the labels to skip.
    pub fn precheck(&self) -> Result<Vec<String>, XnatError> {
        if !self.skip_downloaded {
            return Ok(Vec::new());
        }
        let skip = fs_util::list_subdirs(&self.download_dir)?;
        let all_present = !self.ids.is_empty()
            && self
                .ids
                .iter()
                .all(|id| !is_regex(&[id]) && skip.contains(id));
        if all_present {
            return Err(XnatError::SkippedAllSessions(format!(
                "'{}' sessions are already present in the download location and \
                 --skip_downloaded was provided",
                self.ids.join("', '")
            )));
        }
        Ok(skip)
    }
}

/// Options shared by scan and catalog downloads.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub download_dir: PathBuf,
    pub convert_to: Option<ConvertTarget>,
    pub converter: Option<Converter>,
    pub subject_dirs: bool,
    pub strip_name: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetResult {
    /// Downloaded resource URIs grouped by session label.
    pub downloaded: BTreeMap<String, Vec<String>>,
}

impl GetResult {
    pub fn resource_count(&self) -> usize {
        self.downloaded.values().map(Vec::len).sum()
    }
}

struct DownloadItem<'a> {
    session: &'a Session,
    scan: Option<&'a Scan>,
    resource: &'a Resource,
    suffix: bool,
}

impl DownloadItem<'_> {
    fn scan_label(&self) -> String {
        match self.scan {
            Some(scan) => match &scan.scan_type {
                Some(scan_type) => format!("{}-{}", scan.id, sanitize_label(scan_type)),
                None => scan.id.clone(),
            },
            None => "RESOURCES".to_string(),
        }
    }

    /// Base name of the downloaded item, without extension.
    fn stem(&self) -> String {
        let base = match self.scan {
            Some(_) => self.scan_label(),
            None => self.resource.label.clone(),
        };
        if self.suffix {
            format!("{base}-{}", self.resource.label)
        } else {
            base
        }
    }

    fn uri(&self) -> String {
        match self.scan {
            Some(scan) => format!(
                "/data/experiments/{}/scans/{}/resources/{}",
                self.session.id, scan.id, self.resource.label
            ),
            None => format!(
                "/data/experiments/{}/resources/{}",
                self.session.id, self.resource.label
            ),
        }
    }

    fn resource_ref(&self) -> ResourceRef<'_> {
        ResourceRef {
            session_id: &self.session.id,
            scan_id: self.scan.map(|scan| scan.id.as_str()),
            resource: &self.resource.label,
        }
    }
}

/// Instance number from `<...>-<num>-<...>` DICOM file names.
pub fn dicom_number(name: &str) -> Option<u32> {
    let parts = name.split('-').collect::<Vec<_>>();
    if parts.len() < 2 {
        return None;
    }
    parts[parts.len() - 2].parse().ok()
}

impl<X: XnatClient, T: ToolRunner> App<X, T> {
    pub fn get(&self, request: GetRequest, sink: &dyn ProgressSink) -> Result<GetResult, XnatError> {
        let skip = request.precheck()?;
        let query = SessionQuery {
            ids: request.ids.clone(),
            with_scans: PatternSet::parse(&request.with_scans)?,
            without_scans: PatternSet::parse(&request.without_scans)?,
            dates: DateRange::parse(request.before.as_deref(), request.after.as_deref())?,
            project: request.project.clone(),
            subject: request.subject.clone(),
            skip,
        };
        let scan_patterns = if request.scans.is_empty() {
            None
        } else {
            Some(PatternSet::parse(&request.scans)?)
        };
        let options = DownloadOptions {
            download_dir: request.download_dir.clone(),
            convert_to: request.convert_to,
            converter: request.converter,
            subject_dirs: request.subject_dirs,
            strip_name: request.strip_name,
        };

        let sessions = matching_sessions(&self.client, &query)?;
        let mut result = GetResult::default();
        for session in &sessions {
            let scans = matching_scans(
                &self.client,
                session,
                scan_patterns.as_ref(),
                request.match_scan_id,
            )?;
            for scan in &scans {
                let available = self.client.resources(&session.id, Some(scan.id.as_str()))?;
                let (selected, suffix) =
                    match select_resources(&available, request.resource_name.as_deref()) {
                        Ok(selected) => {
                            let suffix = request.resource_name.is_none() && selected.len() > 1;
                            (selected, suffix)
                        }
                        Err(reason) => {
                            warn!(
                                "{} for {}:{}-{}, skipping",
                                reason,
                                session.label,
                                scan.id,
                                scan.scan_type.as_deref().unwrap_or_default()
                            );
                            continue;
                        }
                    };
                for resource in selected {
                    let item = DownloadItem {
                        session,
                        scan: Some(scan),
                        resource,
                        suffix,
                    };
                    self.download_item(&item, &options, sink)?;
                    result
                        .downloaded
                        .entry(session.label.clone())
                        .or_default()
                        .push(item.uri());
                }
            }
        }

        if result.downloaded.is_empty() {
            warn!(
                "No scans matched pattern(s) '{}' in specified sessions ({})",
                request.scans.join("', '"),
                sessions
                    .iter()
                    .map(|session| session.label.as_str())
                    .collect::<Vec<_>>()
                    .join("', '")
            );
        } else {
            info!(
                "Successfully downloaded {} scans from {} session(s)",
                result.resource_count(),
                sessions.len()
            );
        }
        Ok(result)
    }

    /// Downloads every resource listed in a saved XNAT catalog file.
    pub fn get_from_catalog(
        &self,
        catalog: &Path,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<GetResult, XnatError> {
        let entries = read_catalog(catalog)?;
        let mut session_cache: BTreeMap<String, Vec<Session>> = BTreeMap::new();
        let mut result = GetResult::default();

        for entry in &entries {
            let scope_key = entry.project.clone().unwrap_or_default();
            if !session_cache.contains_key(&scope_key) {
                let scope = match &entry.project {
                    Some(project) => SessionScope::Project(project),
                    None => SessionScope::All,
                };
                session_cache.insert(scope_key.clone(), self.client.sessions(scope)?);
            }
            let sessions = session_cache
                .get(&scope_key)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let session = resolve_label("session", &entry.session, sessions)?;

            let scan = match &entry.scan {
                Some(scan_id) => Some(
                    self.client
                        .scans(&session.id)?
                        .into_iter()
                        .find(|scan| &scan.id == scan_id)
                        .ok_or_else(|| XnatError::NotFound {
                            kind: "scan".to_string(),
                            key: format!("{}:{}", session.label, scan_id),
                        })?,
                ),
                None => None,
            };
            let resource = self
                .client
                .resources(&session.id, entry.scan.as_deref())?
                .into_iter()
                .find(|resource| resource.label == entry.resource || resource.id == entry.resource)
                .ok_or_else(|| XnatError::NotFound {
                    kind: "resource".to_string(),
                    key: entry.uri.clone(),
                })?;

            let item = DownloadItem {
                session,
                scan: scan.as_ref(),
                resource: &resource,
                suffix: false,
            };
            self.download_item(&item, &options, sink)?;
            result
                .downloaded
                .entry(session.label.clone())
                .or_default()
                .push(item.uri());
        }
        info!("Successfully downloaded {} resources", result.resource_count());
        Ok(result)
    }

    fn target_dir(&self, session: &Session, subject_dirs: bool) -> Result<String, XnatError> {
        if !subject_dirs {
            return Ok(session.label.clone());
        }
        if !session.subject_label.is_empty() {
            return Ok(session.subject_label.clone());
        }
        let project = Some(session.project.as_str()).filter(|project| !project.is_empty());
        Ok(find_subject(&self.client, project, &session.subject_id)?.label)
    }

    /// A resource the server has no files for is logged and left out of the tree,
    /// but still counts as handled.
    fn download_item(
        &self,
        item: &DownloadItem<'_>,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(), XnatError> {
        let target_dir = options
            .download_dir
            .join(self.target_dir(item.session, options.subject_dirs)?);
        fs::create_dir_all(&target_dir)
            .map_err(|err| XnatError::Filesystem(format!("{}: {err}", target_dir.display())))?;
        let stem = item.stem();
        let target_ext = options
            .convert_to
            .map(|target| target.extension())
            .unwrap_or_default();
        let target_path = target_dir.join(format!("{stem}{target_ext}"));

        sink.event(ProgressEvent::new(format!(
            "Downloading {}: {}-{}",
            item.session.label,
            item.scan_label(),
            item.resource.label
        )));

        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&target_dir)
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let zip_path = staging.path().join("resource.zip");
        match self.client.download_resource(item.resource_ref(), &zip_path) {
            Ok(()) => {}
            Err(XnatError::Lookup { .. }) => {
                warn!(
                    "Did not find any files for resource '{}' in '{}' session",
                    item.resource.label, item.session.label
                );
                return Ok(());
            }
            Err(other) => return Err(other),
        }
        let extract_dir = staging.path().join("extract");
        fs_util::extract_zip(&zip_path, &extract_dir)?;
        let src_path = fs_util::find_files_dir(&extract_dir).unwrap_or(extract_dir);
        fs_util::remove_path(&target_path)?;

        let convert_to = options
            .convert_to
            .filter(|target| !target.resource_name().eq_ignore_ascii_case(&item.resource.label));
        let Some(convert_to) = convert_to else {
            if options.strip_name && is_dicom_resource(&item.resource.label) {
                move_numbered_dicoms(&src_path, &target_path)?;
            } else {
                fs_util::move_path(&src_path, &target_path)?;
            }
            return Ok(());
        };

        let converter = options
            .converter
            .unwrap_or_else(|| Converter::infer(convert_to, &item.resource.label));
        let program = self.tools.require(converter.program())?;
        let args = conversion_args(converter, convert_to, &src_path, &target_dir, &stem);
        debug!(converter = %converter, "converting {} to {}", item.resource.label, convert_to);
        if let Err(err) = self.tools.run(&program, &args) {
            let fallback = target_dir.join(format!(
                "{stem}{}",
                extension_for(&item.resource.label)
            ));
            fs_util::move_path(&src_path, &fallback)?;
            warn!(
                "Could not convert {}:{} to {} format ({})",
                item.session.label,
                item.scan_label(),
                convert_to,
                err
            );
        }
        Ok(())
    }
}

fn select_resources<'a>(
    available: &'a [Resource],
    requested: Option<&str>,
) -> Result<Vec<&'a Resource>, String> {
    if let Some(name) = requested {
        let upper = name.to_uppercase();
        return available
            .iter()
            .find(|resource| resource.label == name)
            .or_else(|| available.iter().find(|resource| resource.label == upper))
            .map(|resource| vec![resource])
            .ok_or_else(|| format!("Did not find '{name}' resource"));
    }
    let selected = available
        .iter()
        .filter(|resource| !SKIP_RESOURCES.contains(&resource.label.as_str()))
        .collect::<Vec<_>>();
    if selected.is_empty() {
        return Err(format!(
            "No valid scan formats (found '{}')",
            available
                .iter()
                .map(|resource| resource.label.as_str())
                .collect::<Vec<_>>()
                .join("', '")
        ));
    }
    Ok(selected)
}

fn move_numbered_dicoms(src: &Path, target: &Path) -> Result<(), XnatError> {
    let names = fs_util::list_file_names(src)?;
    fs::create_dir_all(target)
        .map_err(|err| XnatError::Filesystem(format!("{}: {err}", target.display())))?;
    for (position, name) in names.iter().enumerate() {
        let number = dicom_number(name).unwrap_or(position as u32 + 1);
        fs_util::move_path(&src.join(name), &target.join(format!("{number:04}.dcm")))?;
    }
    Ok(())
}
