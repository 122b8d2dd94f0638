use std::collections::BTreeMap;

use tracing::debug;

use crate::domain::{DataType, DateRange, PatternSet, classify_id, is_regex};
use crate::error::XnatError;
use crate::xnat::{Project, Scan, Session, SessionScope, Subject, XnatClient};

/// Entities addressable by either their accession ID or their label.
pub trait Labelled {
    fn id(&self) -> &str;
    fn label(&self) -> &str;
}

impl Labelled for Project {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.id
    }
}

impl Labelled for Subject {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl Labelled for Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// An exact ID wins, otherwise the label has to be unique.
pub fn resolve_label<'a, T: Labelled>(
    kind: &str,
    key: &str,
    candidates: &'a [T],
) -> Result<&'a T, XnatError> {
    if let Some(found) = candidates.iter().find(|item| item.id() == key) {
        return Ok(found);
    }
    let matches = candidates
        .iter()
        .filter(|item| item.label() == key)
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [] => Err(XnatError::NotFound {
            kind: kind.to_string(),
            key: key.to_string(),
        }),
        [single] => Ok(*single),
        many => Err(XnatError::AmbiguousLabel {
            kind: kind.to_string(),
            label: key.to_string(),
            candidates: many.iter().map(|item| item.id().to_string()).collect(),
        }),
    }
}

fn not_found_as(kind: &str, key: &str) -> impl FnOnce(XnatError) -> XnatError {
    let kind = kind.to_string();
    let key = key.to_string();
    move |err| match err {
        XnatError::Lookup { .. } => XnatError::NotFound { kind, key },
        other => other,
    }
}

pub fn find_project<C: XnatClient + ?Sized>(client: &C, key: &str) -> Result<Project, XnatError> {
    let projects = client.projects()?;
    resolve_label("project", key, &projects).cloned()
}

pub fn find_subject<C: XnatClient + ?Sized>(
    client: &C,
    project: Option<&str>,
    key: &str,
) -> Result<Subject, XnatError> {
    let subjects = client
        .subjects(project)
        .map_err(not_found_as("project", project.unwrap_or_default()))?;
    resolve_label("subject", key, &subjects).cloned()
}

pub fn find_session<C: XnatClient + ?Sized>(
    client: &C,
    scope: SessionScope<'_>,
    key: &str,
) -> Result<Session, XnatError> {
    let sessions = client.sessions(scope)?;
    resolve_label("session", key, &sessions).cloned()
}

pub fn matching_subjects<C: XnatClient + ?Sized>(
    client: &C,
    ids: &[String],
    project: Option<&str>,
) -> Result<Vec<Subject>, XnatError> {
    if let Some(project) = project {
        find_project(client, project)?;
    }
    let mut subjects = if ids.is_empty() {
        let project = project.ok_or_else(|| {
            XnatError::Usage("--project must be provided to use an empty IDs list".to_string())
        })?;
        client.subjects(Some(project))?
    } else if is_regex(ids) {
        let patterns = PatternSet::parse(ids)?;
        client
            .subjects(project)?
            .into_iter()
            .filter(|subject| patterns.matches_any(&subject.label))
            .collect()
    } else {
        let mut by_id = BTreeMap::new();
        for id in ids {
            for subject in client
                .subjects(Some(id.as_str()))
                .map_err(not_found_as("project", id))?
            {
                by_id.insert(subject.id.clone(), subject);
            }
        }
        by_id.into_values().collect()
    };
    subjects.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(subjects)
}

#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub ids: Vec<String>,
    pub with_scans: PatternSet,
    pub without_scans: PatternSet,
    pub dates: DateRange,
    pub project: Option<String>,
    pub subject: Option<String>,
    /// Labels excluded from the result, typically sessions already downloaded.
    pub skip: Vec<String>,
}

impl SessionQuery {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    fn has_scan_filters(&self) -> bool {
        !self.with_scans.is_empty() || !self.without_scans.is_empty()
    }
}

pub fn matching_sessions<C: XnatClient + ?Sized>(
    client: &C,
    query: &SessionQuery,
) -> Result<Vec<Session>, XnatError> {
    let project = match (&query.project, &query.subject) {
        (None, Some(subject)) => {
            return Err(XnatError::Usage(format!(
                "Must provide --project if --subject is provided ('{subject}')"
            )));
        }
        (Some(project), _) => Some(find_project(client, project)?),
        (None, None) => None,
    };
    let subject = match (&project, &query.subject) {
        (Some(project), Some(subject)) => {
            Some(find_subject(client, Some(project.id.as_str()), subject)?)
        }
        _ => None,
    };
    let scope = match (&project, &subject) {
        (Some(project), Some(subject)) => SessionScope::Subject {
            project: &project.id,
            subject: &subject.id,
        },
        (Some(project), None) => SessionScope::Project(&project.id),
        _ => SessionScope::All,
    };

    let candidates = if query.ids.is_empty() {
        if project.is_none() {
            return Err(XnatError::Usage(
                "--project must be provided to use an empty IDs list".to_string(),
            ));
        }
        client.sessions(scope)?
    } else if is_regex(&query.ids) {
        let patterns = PatternSet::parse(&query.ids)?;
        client
            .sessions(scope)?
            .into_iter()
            .filter(|session| patterns.matches_any(&session.label))
            .collect()
    } else {
        sessions_for_ids(client, &query.ids, scope)?
    };

    let mut by_id = BTreeMap::new();
    for session in candidates {
        if !query.dates.contains(session.date) {
            continue;
        }
        if query.has_scan_filters() && !passes_scan_filters(client, &session, query)? {
            continue;
        }
        by_id.insert(session.id.clone(), session);
    }
    let mut filtered = by_id.into_values().collect::<Vec<_>>();
    if filtered.is_empty() {
        return Err(XnatError::NoMatchingSessions(format!(
            "No accessible sessions matched pattern(s) '{}'",
            query.ids.join("', '")
        )));
    }
    filtered.sort_by(|a, b| a.label.cmp(&b.label));

    if !query.skip.is_empty() {
        let kept = filtered
            .iter()
            .filter(|session| !query.skip.contains(&session.label))
            .cloned()
            .collect::<Vec<_>>();
        if kept.is_empty() {
            return Err(XnatError::SkippedAllSessions(format!(
                "All accessible sessions that matched pattern(s) '{}' were skipped:\n{}",
                query.ids.join("', '"),
                filtered
                    .iter()
                    .map(|session| session.label.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            )));
        }
        filtered = kept;
    }
    Ok(filtered)
}

fn sessions_for_ids<C: XnatClient + ?Sized>(
    client: &C,
    ids: &[String],
    scope: SessionScope<'_>,
) -> Result<Vec<Session>, XnatError> {
    let mut in_scope: Option<Vec<Session>> = None;
    let mut found = Vec::new();
    for id in ids {
        match classify_id(id) {
            DataType::Project => {
                debug!(project = %id, "expanding project to its sessions");
                found.extend(
                    client
                        .sessions(SessionScope::Project(id))
                        .map_err(not_found_as("project", id))?,
                );
            }
            DataType::Subject => {
                let subject = find_subject(client, None, id)?;
                found.extend(client.sessions(SessionScope::Subject {
                    project: &subject.project,
                    subject: &subject.id,
                })?);
            }
            _ => {
                if in_scope.is_none() {
                    in_scope = Some(client.sessions(scope)?);
                }
                let sessions = in_scope.as_deref().unwrap_or_default();
                found.push(resolve_label("session", id, sessions)?.clone());
            }
        }
    }
    Ok(found)
}

fn passes_scan_filters<C: XnatClient + ?Sized>(
    client: &C,
    session: &Session,
    query: &SessionQuery,
) -> Result<bool, XnatError> {
    let labels = client
        .scans(&session.id)?
        .iter()
        .map(|scan| scan.label(true))
        .collect::<Vec<_>>();
    let with_ok = query
        .with_scans
        .iter()
        .all(|pattern| labels.iter().any(|label| pattern.is_match(label)));
    let without_ok = !query
        .without_scans
        .iter()
        .any(|pattern| labels.iter().any(|label| pattern.is_match(label)));
    Ok(with_ok && without_ok)
}

/// Scans of a session whose label matches any pattern, sorted by label.
pub fn matching_scans<C: XnatClient + ?Sized>(
    client: &C,
    session: &Session,
    patterns: Option<&PatternSet>,
    match_id: bool,
) -> Result<Vec<Scan>, XnatError> {
    let mut scans = client
        .scans(&session.id)?
        .into_iter()
        .filter(|scan| patterns.is_none_or(|patterns| patterns.matches_any(&scan.label(match_id))))
        .collect::<Vec<_>>();
    scans.sort_by_key(|scan| scan.label(match_id));
    Ok(scans)
}
