use std::collections::BTreeSet;

use clap::ValueEnum;
use serde::Serialize;
use tracing::warn;

use crate::convert::ToolRunner;
use crate::domain::{DataType, DateRange, PatternSet, is_regex};
use crate::error::XnatError;
use crate::matching::{
    SessionQuery, find_session, find_subject, matching_sessions, matching_subjects,
};
use crate::output::{ProgressEvent, ProgressSink};
use crate::xnat::{FieldOwner, Project, Scan, Session, SessionScope, Subject, XnatClient};

/// Orchestrates the tool commands over an XNAT client and the external tools.
pub struct App<X: XnatClient, T: ToolRunner> {
    pub(crate) client: X,
    pub(crate) tools: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReturnAttr {
    Id,
    Label,
    Type,
    Date,
    Project,
}

#[derive(Debug, Clone, Default)]
pub struct LsRequest {
    pub ids: Vec<String>,
    pub datatype: Option<DataType>,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub with_scans: Vec<String>,
    pub without_scans: Vec<String>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub return_attr: Option<ReturnAttr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LsResult {
    pub datatype: DataType,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VarResult {
    pub id: String,
    pub variable: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameResult {
    pub from: String,
    pub to: String,
}

impl<X: XnatClient, T: ToolRunner> App<X, T> {
    pub fn new(client: X, tools: T) -> Self {
        Self { client, tools }
    }

    pub fn client(&self) -> &X {
        &self.client
    }

    pub fn tools(&self) -> &T {
        &self.tools
    }

    pub fn ls(&self, request: LsRequest) -> Result<LsResult, XnatError> {
        let datatype = infer_datatype(&request)?;
        let session_only = [
            ("with_scans", !request.with_scans.is_empty()),
            ("without_scans", !request.without_scans.is_empty()),
            ("before", request.before.is_some()),
            ("after", request.after.is_some()),
        ];
        if datatype != DataType::Session {
            if let Some((option, _)) = session_only.iter().find(|(_, set)| *set) {
                return Err(XnatError::Usage(format!(
                    "'{option}' option is only applicable when datatype='session'"
                )));
            }
        }

        let items = match datatype {
            DataType::Project => {
                let attr = request.return_attr.unwrap_or(ReturnAttr::Id);
                let projects = self.client.projects()?;
                let patterns = PatternSet::parse(&request.ids)?;
                projects
                    .iter()
                    .filter(|project| patterns.is_empty() || patterns.matches_any(&project.id))
                    .filter_map(|project| project_attr(project, attr))
                    .collect::<Vec<_>>()
            }
            DataType::Subject => {
                let attr = request.return_attr.unwrap_or(ReturnAttr::Label);
                matching_subjects(&self.client, &request.ids, request.project.as_deref())?
                    .iter()
                    .filter_map(|subject| subject_attr(subject, attr))
                    .collect()
            }
            DataType::Session => {
                let attr = request.return_attr.unwrap_or(ReturnAttr::Label);
                let query = SessionQuery {
                    ids: request.ids.clone(),
                    with_scans: PatternSet::parse(&request.with_scans)?,
                    without_scans: PatternSet::parse(&request.without_scans)?,
                    dates: DateRange::parse(request.before.as_deref(), request.after.as_deref())?,
                    project: request.project.clone(),
                    subject: request.subject.clone(),
                    skip: Vec::new(),
                };
                matching_sessions(&self.client, &query)?
                    .iter()
                    .filter_map(|session| session_attr(session, attr))
                    .collect()
            }
            DataType::Scan => {
                let attr = request.return_attr.unwrap_or(ReturnAttr::Type);
                let query = SessionQuery {
                    project: request.project.clone(),
                    subject: request.subject.clone(),
                    ..SessionQuery::new(request.ids.clone())
                };
                let mut unique = BTreeSet::new();
                for session in matching_sessions(&self.client, &query)? {
                    for scan in self.client.scans(&session.id)? {
                        if let Some(value) = scan_attr(&scan, attr) {
                            unique.insert(value);
                        }
                    }
                }
                unique.into_iter().collect()
            }
        };
        let mut items = items;
        items.sort();
        Ok(LsResult { datatype, items })
    }

    pub fn varget(
        &self,
        id: &str,
        variable: &str,
        default: &str,
    ) -> Result<VarResult, XnatError> {
        let value = match self.field_owner(id)? {
            Owned::Subject(subject) => self.client.field(FieldOwner::Subject(&subject), variable)?,
            Owned::Session(session) => self.client.field(FieldOwner::Session(&session), variable)?,
        };
        Ok(VarResult {
            id: id.to_string(),
            variable: variable.to_string(),
            value: value.unwrap_or_else(|| default.to_string()),
        })
    }

    pub fn varput(&self, id: &str, variable: &str, value: &str) -> Result<VarResult, XnatError> {
        match self.field_owner(id)? {
            Owned::Subject(subject) => {
                self.client
                    .set_field(FieldOwner::Subject(&subject), variable, value)?
            }
            Owned::Session(session) => {
                self.client
                    .set_field(FieldOwner::Session(&session), variable, value)?
            }
        }
        Ok(VarResult {
            id: id.to_string(),
            variable: variable.to_string(),
            value: value.to_string(),
        })
    }

    pub fn rename(
        &self,
        session: &str,
        new_label: &str,
        sink: &dyn ProgressSink,
    ) -> Result<RenameResult, XnatError> {
        let found = match find_session(&self.client, SessionScope::All, session) {
            Ok(found) => found,
            Err(XnatError::NotFound { .. }) => {
                return Err(XnatError::Usage(format!("No session named '{session}'")));
            }
            Err(other) => return Err(other),
        };
        self.client.rename_session(&found.id, new_label)?;
        sink.event(ProgressEvent::new(format!(
            "Successfully renamed '{session}' to '{new_label}'"
        )));
        Ok(RenameResult {
            from: session.to_string(),
            to: new_label.to_string(),
        })
    }

    fn field_owner(&self, id: &str) -> Result<Owned, XnatError> {
        match id.matches('_').count() {
            1 => Ok(Owned::Subject(find_subject(&self.client, None, id)?)),
            n if n >= 2 => Ok(Owned::Session(find_session(
                &self.client,
                SessionScope::All,
                id,
            )?)),
            _ => Err(XnatError::Usage(format!(
                "Invalid ID '{id}' for subject or sessions (must contain one underscore for \
                 subjects and two underscores for sessions)"
            ))),
        }
    }
}

enum Owned {
    Subject(Subject),
    Session(Session),
}

fn infer_datatype(request: &LsRequest) -> Result<DataType, XnatError> {
    if let Some(datatype) = request.datatype {
        return Ok(datatype);
    }
    if is_regex(&request.ids) {
        return Err(XnatError::Usage(format!(
            "'--datatype' option must be provided if using regular expression id, '{}' \
             (i.e. one with non alphanumeric + '_' characters in it)",
            request.ids.join("', '")
        )));
    }
    if let Some(subject) = &request.subject {
        if request.project.is_none() {
            return Err(XnatError::Usage(format!(
                "--project must be provided if --subject is ('{subject}')"
            )));
        }
        return Ok(DataType::Session);
    }
    if request.project.is_some() {
        return Ok(DataType::Subject);
    }
    let Some(first) = request.ids.first() else {
        return Ok(DataType::Project);
    };
    warn!(
        "Guessing datatype by number of underscores in provided ids ({}). 0 - project, \
         1 - subject, >=2 - session. Pass --datatype to suppress this message",
        request.ids.join(", ")
    );
    let underscores = first.matches('_').count().min(2);
    if request
        .ids
        .iter()
        .any(|id| id.matches('_').count().min(2) != underscores)
    {
        return Err(XnatError::Usage(format!(
            "Mismatching IDs (i.e. mix of project, subject and/or session IDs) '{}'",
            request.ids.join("', '")
        )));
    }
    Ok(match underscores {
        0 => DataType::Subject,
        1 => DataType::Session,
        _ => DataType::Scan,
    })
}

fn project_attr(project: &Project, attr: ReturnAttr) -> Option<String> {
    match attr {
        ReturnAttr::Id | ReturnAttr::Label | ReturnAttr::Project => Some(project.id.clone()),
        ReturnAttr::Type | ReturnAttr::Date => None,
    }
}

fn subject_attr(subject: &Subject, attr: ReturnAttr) -> Option<String> {
    match attr {
        ReturnAttr::Id => Some(subject.id.clone()),
        ReturnAttr::Label => Some(subject.label.clone()),
        ReturnAttr::Project => Some(subject.project.clone()),
        ReturnAttr::Type | ReturnAttr::Date => None,
    }
}

fn session_attr(session: &Session, attr: ReturnAttr) -> Option<String> {
    match attr {
        ReturnAttr::Id => Some(session.id.clone()),
        ReturnAttr::Label => Some(session.label.clone()),
        ReturnAttr::Project => Some(session.project.clone()),
        ReturnAttr::Type => Some(session.xsi_type.clone()).filter(|value| !value.is_empty()),
        ReturnAttr::Date => session.date.map(|date| date.format("%Y-%m-%d").to_string()),
    }
}

fn scan_attr(scan: &Scan, attr: ReturnAttr) -> Option<String> {
    match attr {
        ReturnAttr::Id => Some(scan.id.clone()),
        ReturnAttr::Type | ReturnAttr::Label => scan.scan_type.clone(),
        ReturnAttr::Project | ReturnAttr::Date => None,
    }
}
