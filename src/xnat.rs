use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Url;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::Modality;
use crate::error::{XnatError, clean_response_message};
use crate::fs_util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub id: String,
    pub label: String,
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub label: String,
    pub project: String,
    pub subject_id: String,
    pub subject_label: String,
    pub date: Option<NaiveDate>,
    pub xsi_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scan {
    pub id: String,
    pub scan_type: Option<String>,
}

impl Scan {
    /// Type if set, else the ID when `match_id`, else empty.
    pub fn label(&self, match_id: bool) -> String {
        match &self.scan_type {
            Some(scan_type) => scan_type.clone(),
            None if match_id => self.id.clone(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub name: String,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub alias: String,
    pub secret: String,
}

#[derive(Debug, Clone, Copy)]
pub enum SessionScope<'a> {
    All,
    Project(&'a str),
    Subject { project: &'a str, subject: &'a str },
}

/// Entity that carries custom fields.
#[derive(Debug, Clone, Copy)]
pub enum FieldOwner<'a> {
    Subject(&'a Subject),
    Session(&'a Session),
}

/// Location of a resource: a session, optionally narrowed to one scan.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRef<'a> {
    pub session_id: &'a str,
    pub scan_id: Option<&'a str>,
    pub resource: &'a str,
}

pub trait XnatClient {
    fn server(&self) -> &str;
    fn projects(&self) -> Result<Vec<Project>, XnatError>;
    fn subjects(&self, project: Option<&str>) -> Result<Vec<Subject>, XnatError>;
    fn sessions(&self, scope: SessionScope<'_>) -> Result<Vec<Session>, XnatError>;
    fn scans(&self, session_id: &str) -> Result<Vec<Scan>, XnatError>;
    fn resources(&self, session_id: &str, scan_id: Option<&str>)
    -> Result<Vec<Resource>, XnatError>;
    fn files(&self, resource: ResourceRef<'_>) -> Result<Vec<RemoteFile>, XnatError>;
    /// Writes the resource's files as one zip archive to `destination`.
    fn download_resource(
        &self,
        resource: ResourceRef<'_>,
        destination: &Path,
    ) -> Result<(), XnatError>;
    fn create_subject(&self, project: &str, label: &str) -> Result<(), XnatError>;
    fn create_session(
        &self,
        project: &str,
        subject: &str,
        label: &str,
        modality: Modality,
    ) -> Result<(), XnatError>;
    fn create_scan(
        &self,
        session_id: &str,
        scan_id: &str,
        scan_type: &str,
        modality: Modality,
    ) -> Result<(), XnatError>;
    fn create_resource(&self, resource: ResourceRef<'_>) -> Result<(), XnatError>;
    fn delete_resource(&self, resource: ResourceRef<'_>) -> Result<(), XnatError>;
    /// Uploads a zip archive which the server extracts into the resource.
    fn upload_zip(&self, resource: ResourceRef<'_>, zip_path: &Path) -> Result<(), XnatError>;
    fn pull_headers(&self, session_id: &str) -> Result<(), XnatError>;
    fn field(&self, owner: FieldOwner<'_>, name: &str) -> Result<Option<String>, XnatError>;
    fn set_field(&self, owner: FieldOwner<'_>, name: &str, value: &str)
    -> Result<(), XnatError>;
    fn rename_session(&self, session_id: &str, new_label: &str) -> Result<(), XnatError>;
    fn issue_token(&self) -> Result<AccessToken, XnatError>;
}

#[derive(Deserialize)]
struct ResultSetEnvelope<T> {
    #[serde(rename = "ResultSet")]
    result_set: ResultRows<T>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ResultRows<T> {
    #[serde(rename = "Result", default)]
    result: Vec<T>,
}

#[derive(Deserialize)]
struct ProjectRow {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct SubjectRow {
    #[serde(rename = "ID")]
    id: String,
    label: String,
    #[serde(default)]
    project: String,
}

#[derive(Deserialize)]
struct ExperimentRow {
    #[serde(rename = "ID")]
    id: String,
    label: String,
    #[serde(default)]
    project: String,
    #[serde(rename = "subject_ID", default)]
    subject_id: String,
    #[serde(default)]
    subject_label: String,
    #[serde(default)]
    date: String,
    #[serde(rename = "xsiType", default)]
    xsi_type: String,
}

#[derive(Deserialize)]
struct ScanRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "type", default)]
    scan_type: String,
}

#[derive(Deserialize)]
struct ResourceRow {
    #[serde(rename = "xnat_abstractresource_id", default)]
    id: Value,
    #[serde(default)]
    label: String,
}

#[derive(Deserialize)]
struct FileRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default)]
    digest: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    alias: String,
    secret: String,
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Clone)]
pub struct XnatHttpClient {
    client: Client,
    base_url: Url,
    server: String,
    user: String,
    password: String,
}

impl XnatHttpClient {
    pub fn new(server_url: &str, user: &str, password: &str) -> Result<Self, XnatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("xnat-utils/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| XnatError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| XnatError::Http(err.to_string()))?;
        let base_url = Url::parse(server_url.trim_end_matches('/'))
            .map_err(|err| XnatError::Usage(format!("Invalid server URL '{server_url}': {err}")))?;
        Ok(Self {
            client,
            base_url,
            server: server_url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Checks the credentials by opening a server-side session.
    pub fn login(&self) -> Result<(), XnatError> {
        let url = self.url(&["data", "JSESSION"])?;
        let response = self.send_with_retries(|| self.authed(self.client.post(url.clone())))?;
        let status = response.status().as_u16();
        match status {
            401 | 403 => Err(XnatError::LoginFailed(format!(
                "Login to {} as '{}' was rejected",
                self.server, self.user
            ))),
            _ => self.handle_status(response, &url).map(|_| ()),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, XnatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| XnatError::Usage(format!("Invalid server URL '{}'", self.server)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn resource_url(&self, resource: ResourceRef<'_>, tail: &[&str]) -> Result<Url, XnatError> {
        let mut segments = vec!["data", "experiments", resource.session_id];
        if let Some(scan_id) = resource.scan_id {
            segments.extend(["scans", scan_id]);
        }
        segments.extend(["resources", resource.resource]);
        segments.extend(tail);
        self.url(&segments)
    }

    /// Target of an in-body archive upload that the server unpacks into the resource.
    fn upload_url(&self, resource: ResourceRef<'_>, archive_name: &str) -> Result<Url, XnatError> {
        let mut url = self.resource_url(resource, &["files", archive_name])?;
        url.query_pairs_mut()
            .append_pair("inbody", "true")
            .append_pair("extract", "true");
        Ok(url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.user, Some(&self.password))
    }

    fn handle_status(&self, response: Response, url: &Url) -> Result<Response, XnatError> {
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }
        if status == 404 {
            return Err(XnatError::Lookup {
                path: url.path().trim_start_matches("/data/").to_string(),
            });
        }
        if status == 401 {
            return Err(XnatError::LoginFailed(format!(
                "Unauthorised request to {}",
                url.as_str()
            )));
        }
        let body = response.text().unwrap_or_default();
        Err(XnatError::Status {
            status,
            url: url.to_string(),
            message: clean_response_message(&body),
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, XnatError>
    where
        F: FnMut() -> RequestBuilder,
    {
        self.try_send_with_retries(|| Ok(make_req()))
    }

    /// Like `send_with_retries`, for requests whose body has to be reopened per attempt.
    fn try_send_with_retries<F>(&self, mut make_req: F) -> Result<Response, XnatError>
    where
        F: FnMut() -> Result<RequestBuilder, XnatError>,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req()?.send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, delay, "retrying XNAT request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(XnatError::Http(err.to_string()));
                }
            }
        }
    }

    fn get_rows<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, XnatError> {
        let response = self.send_with_retries(|| {
            self.authed(self.client.get(url.clone()))
                .query(&[("format", "json")])
                .query(query)
        })?;
        let response = self.handle_status(response, &url)?;
        let envelope: ResultSetEnvelope<T> = response
            .json()
            .map_err(|err| XnatError::Http(format!("invalid JSON from {url}: {err}")))?;
        Ok(envelope.result_set.result)
    }

    fn put(&self, url: Url, query: &[(&str, &str)]) -> Result<(), XnatError> {
        let response =
            self.send_with_retries(|| self.authed(self.client.put(url.clone())).query(query))?;
        self.handle_status(response, &url).map(|_| ())
    }

    fn owner_url(&self, owner: FieldOwner<'_>) -> Result<Url, XnatError> {
        match owner {
            FieldOwner::Subject(subject) => {
                self.url(&["data", "projects", &subject.project, "subjects", &subject.id])
            }
            FieldOwner::Session(session) => self.url(&["data", "experiments", &session.id]),
        }
    }
}

impl XnatClient for XnatHttpClient {
    fn server(&self) -> &str {
        &self.server
    }

    fn projects(&self) -> Result<Vec<Project>, XnatError> {
        let rows: Vec<ProjectRow> = self.get_rows(self.url(&["data", "projects"])?, &[])?;
        Ok(rows
            .into_iter()
            .map(|row| Project { id: row.id })
            .collect())
    }

    fn subjects(&self, project: Option<&str>) -> Result<Vec<Subject>, XnatError> {
        let url = match project {
            Some(project) => self.url(&["data", "projects", project, "subjects"])?,
            None => self.url(&["data", "subjects"])?,
        };
        let rows: Vec<SubjectRow> = self.get_rows(url, &[("columns", "ID,label,project")])?;
        Ok(rows
            .into_iter()
            .map(|row| Subject {
                project: if row.project.is_empty() {
                    project.unwrap_or_default().to_string()
                } else {
                    row.project
                },
                id: row.id,
                label: row.label,
            })
            .collect())
    }

    fn sessions(&self, scope: SessionScope<'_>) -> Result<Vec<Session>, XnatError> {
        let url = match scope {
            SessionScope::All => self.url(&["data", "experiments"])?,
            SessionScope::Project(project) => {
                self.url(&["data", "projects", project, "experiments"])?
            }
            SessionScope::Subject { project, subject } => self.url(&[
                "data",
                "projects",
                project,
                "subjects",
                subject,
                "experiments",
            ])?,
        };
        let rows: Vec<ExperimentRow> = self.get_rows(
            url,
            &[(
                "columns",
                "ID,label,project,subject_ID,subject_label,date,xsiType",
            )],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| Session {
                date: NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").ok(),
                id: row.id,
                label: row.label,
                project: row.project,
                subject_id: row.subject_id,
                subject_label: row.subject_label,
                xsi_type: row.xsi_type,
            })
            .collect())
    }

    fn scans(&self, session_id: &str) -> Result<Vec<Scan>, XnatError> {
        let rows: Vec<ScanRow> =
            self.get_rows(self.url(&["data", "experiments", session_id, "scans"])?, &[])?;
        Ok(rows
            .into_iter()
            .map(|row| Scan {
                id: row.id,
                scan_type: non_empty(row.scan_type),
            })
            .collect())
    }

    fn resources(
        &self,
        session_id: &str,
        scan_id: Option<&str>,
    ) -> Result<Vec<Resource>, XnatError> {
        let url = match scan_id {
            Some(scan_id) => {
                self.url(&["data", "experiments", session_id, "scans", scan_id, "resources"])?
            }
            None => self.url(&["data", "experiments", session_id, "resources"])?,
        };
        let rows: Vec<ResourceRow> = self.get_rows(url, &[])?;
        Ok(rows
            .into_iter()
            .map(|row| Resource {
                id: match row.id {
                    Value::String(value) => value,
                    Value::Null => String::new(),
                    other => other.to_string(),
                },
                label: row.label,
            })
            .collect())
    }

    fn files(&self, resource: ResourceRef<'_>) -> Result<Vec<RemoteFile>, XnatError> {
        let rows: Vec<FileRow> = self.get_rows(self.resource_url(resource, &["files"])?, &[])?;
        Ok(rows
            .into_iter()
            .map(|row| RemoteFile {
                name: row.name,
                digest: non_empty(row.digest),
            })
            .collect())
    }

    fn download_resource(
        &self,
        resource: ResourceRef<'_>,
        destination: &Path,
    ) -> Result<(), XnatError> {
        let url = self.resource_url(resource, &["files"])?;
        let response = self.send_with_retries(|| {
            self.authed(self.client.get(url.clone()))
                .query(&[("format", "zip")])
        })?;
        let mut response = self.handle_status(response, &url)?;
        let mut file =
            File::create(destination).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn create_subject(&self, project: &str, label: &str) -> Result<(), XnatError> {
        self.put(
            self.url(&["data", "projects", project, "subjects", label])?,
            &[],
        )
    }

    fn create_session(
        &self,
        project: &str,
        subject: &str,
        label: &str,
        modality: Modality,
    ) -> Result<(), XnatError> {
        self.put(
            self.url(&[
                "data",
                "projects",
                project,
                "subjects",
                subject,
                "experiments",
                label,
            ])?,
            &[("xsiType", modality.session_xsi_type())],
        )
    }

    fn create_scan(
        &self,
        session_id: &str,
        scan_id: &str,
        scan_type: &str,
        modality: Modality,
    ) -> Result<(), XnatError> {
        self.put(
            self.url(&["data", "experiments", session_id, "scans", scan_id])?,
            &[
                ("xsiType", modality.scan_xsi_type()),
                ("type", scan_type),
            ],
        )
    }

    fn create_resource(&self, resource: ResourceRef<'_>) -> Result<(), XnatError> {
        self.put(
            self.resource_url(resource, &[])?,
            &[("format", resource.resource)],
        )
    }

    fn delete_resource(&self, resource: ResourceRef<'_>) -> Result<(), XnatError> {
        let url = self.resource_url(resource, &[])?;
        let response = self.send_with_retries(|| {
            self.authed(self.client.delete(url.clone()))
                .query(&[("removeFiles", "true")])
        })?;
        self.handle_status(response, &url).map(|_| ())
    }

    fn upload_zip(&self, resource: ResourceRef<'_>, zip_path: &Path) -> Result<(), XnatError> {
        let archive_name = fs_util::basename(zip_path)?;
        let url = self.upload_url(resource, &archive_name)?;
        let response = self.try_send_with_retries(|| {
            let file = File::open(zip_path)
                .map_err(|err| XnatError::Filesystem(format!("{}: {err}", zip_path.display())))?;
            let length = file
                .metadata()
                .map_err(|err| XnatError::Filesystem(format!("{}: {err}", zip_path.display())))?
                .len();
            Ok(self
                .authed(self.client.put(url.clone()))
                .header(CONTENT_TYPE, "application/zip")
                .body(Body::sized(file, length)))
        })?;
        self.handle_status(response, &url).map(|_| ())
    }

    fn pull_headers(&self, session_id: &str) -> Result<(), XnatError> {
        self.put(
            self.url(&["data", "experiments", session_id])?,
            &[("pullDataFromHeaders", "true")],
        )
    }

    fn field(&self, owner: FieldOwner<'_>, name: &str) -> Result<Option<String>, XnatError> {
        let url = self.owner_url(owner)?;
        let response = self.send_with_retries(|| {
            self.authed(self.client.get(url.clone()))
                .query(&[("format", "json")])
        })?;
        let response = self.handle_status(response, &url)?;
        let document: Value = response
            .json()
            .map_err(|err| XnatError::Http(format!("invalid JSON from {url}: {err}")))?;
        Ok(find_custom_field(&document, name))
    }

    fn set_field(
        &self,
        owner: FieldOwner<'_>,
        name: &str,
        value: &str,
    ) -> Result<(), XnatError> {
        let xsi_type = match owner {
            FieldOwner::Subject(_) => "xnat:subjectData",
            FieldOwner::Session(session) if !session.xsi_type.is_empty() => {
                session.xsi_type.as_str()
            }
            FieldOwner::Session(_) => "xnat:experimentData",
        };
        let key = format!("{xsi_type}/fields/field[name={name}]/field");
        self.put(self.owner_url(owner)?, &[(key.as_str(), value)])
    }

    fn rename_session(&self, session_id: &str, new_label: &str) -> Result<(), XnatError> {
        self.put(
            self.url(&["data", "experiments", session_id])?,
            &[("label", new_label)],
        )
    }

    fn issue_token(&self) -> Result<AccessToken, XnatError> {
        let url = self.url(&["data", "services", "tokens", "issue"])?;
        let response = self.send_with_retries(|| self.authed(self.client.get(url.clone())))?;
        let response = self.handle_status(response, &url)?;
        let token: TokenResponse = response
            .json()
            .map_err(|err| XnatError::Http(format!("invalid token response: {err}")))?;
        Ok(AccessToken {
            alias: token.alias,
            secret: token.secret,
        })
    }
}

/// Looks up `fields/field[name=..]` in an entity's JSON export.
pub fn find_custom_field(document: &Value, name: &str) -> Option<String> {
    let items = document.get("items")?.as_array()?;
    for item in items {
        let Some(children) = item.get("children").and_then(Value::as_array) else {
            continue;
        };
        for child in children {
            let is_fields = child
                .get("field")
                .and_then(Value::as_str)
                .is_some_and(|field| field.starts_with("fields/field"));
            if !is_fields {
                continue;
            }
            let Some(entries) = child.get("items").and_then(Value::as_array) else {
                continue;
            };
            for entry in entries {
                let Some(data) = entry.get("data_fields") else {
                    continue;
                };
                let matches = data
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|field_name| field_name.eq_ignore_ascii_case(name));
                if matches {
                    return data
                        .get("field")
                        .and_then(Value::as_str)
                        .map(|value| value.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn custom_field_lookup() {
        let document = json!({
            "items": [{
                "data_fields": {"ID": "MRH017_S00001", "label": "MRH017_100"},
                "children": [{
                    "field": "fields/field",
                    "items": [
                        {"data_fields": {"name": "age", "field": "32"}},
                        {"data_fields": {"name": "handedness", "field": "left"}}
                    ]
                }]
            }]
        });
        assert_eq!(find_custom_field(&document, "Handedness").as_deref(), Some("left"));
        assert_eq!(find_custom_field(&document, "weight"), None);
    }

    #[test]
    fn result_set_rows_parse() {
        let body = r#"{"ResultSet":{"Result":[{"ID":"1","type":"t1_mprage"},{"ID":"2","type":""}]}}"#;
        let envelope: ResultSetEnvelope<ScanRow> = serde_json::from_str(body).unwrap();
        let rows = envelope.result_set.result;
        assert_eq!(rows.len(), 2);
        assert_eq!(non_empty(rows[1].scan_type.clone()), None);
    }

    #[test]
    fn resource_urls_include_scan_when_present() {
        let client = XnatHttpClient::new("https://xnat.example.org", "u", "p").unwrap();
        let url = client
            .resource_url(
                ResourceRef {
                    session_id: "MRH017_E00001",
                    scan_id: Some("3"),
                    resource: "DICOM",
                },
                &["files"],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://xnat.example.org/data/experiments/MRH017_E00001/scans/3/resources/DICOM/files"
        );
    }

    #[test]
    fn archive_uploads_go_in_body_under_the_archive_name() {
        let client = XnatHttpClient::new("https://xnat.example.org/", "u", "p").unwrap();
        let url = client
            .upload_url(
                ResourceRef {
                    session_id: "MRH017_E00001",
                    scan_id: Some("t1_mprage"),
                    resource: "NIFTI_GZ",
                },
                "upload.zip",
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://xnat.example.org/data/experiments/MRH017_E00001/scans/t1_mprage/resources/\
             NIFTI_GZ/files/upload.zip?inbody=true&extract=true"
        );
    }
}
