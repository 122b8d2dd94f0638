use std::path::PathBuf;

use miette::Diagnostic;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum XnatError {
    #[error("{0}")]
    Usage(String),

    #[error(
        "Session '{0}' is not a valid session name (must only contain alpha-numeric characters and underscores)"
    )]
    InvalidSessionName(String),

    #[error("Scan name '{0}' contains illegal characters")]
    InvalidScanName(String),

    #[error("invalid date '{0}' (expected Y-m-d, e.g. 2018-02-27)")]
    InvalidDate(String),

    #[error("invalid regular expression '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error(
        "Selected converter '{0}' is not available, please make sure it is installed and on your path"
    )]
    MissingTool(String),

    #[error(
        "Could not find asset corresponding to '{path}' (please make sure you have access to it if it exists)"
    )]
    Lookup { path: String },

    #[error("No {kind} named '{key}' (that you have access to)")]
    NotFound { kind: String, key: String },

    #[error("More than one {kind} associated with name {label}: {}", candidates.join(","))]
    AmbiguousLabel {
        kind: String,
        label: String,
        candidates: Vec<String>,
    },

    #[error("{0}")]
    NoMatchingSessions(String),

    #[error("{0}")]
    SkippedAllSessions(String),

    #[error(
        "Remote digest does not match local ({remote} vs {local}) for {file}. Please upload your datasets again"
    )]
    DigestMismatch {
        file: String,
        remote: String,
        local: String,
    },

    #[error("{0}")]
    DigestUnavailable(String),

    #[error("{0}")]
    LoginFailed(String),

    #[error(
        "Three failed attempts, your account '{user}' is now blocked for 1 hour. Please contact your administrator to reset."
    )]
    LoginBlocked { user: String },

    #[error("netrc error: {0}")]
    Netrc(String),

    #[error("XNAT request failed: {0}")]
    Http(String),

    #[error("Response ({status}): {message} ({url})")]
    Status {
        status: u16,
        url: String,
        message: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("failed to parse download catalog: {0}")]
    CatalogParse(String),

    #[error("missing config file daris2xnat.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Usage,
    Lookup,
    Ambiguity,
    Info,
    Integrity,
    Credentials,
    Transport,
    Local,
}

impl XnatError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            XnatError::Usage(_)
            | XnatError::InvalidSessionName(_)
            | XnatError::InvalidScanName(_)
            | XnatError::InvalidDate(_)
            | XnatError::InvalidPattern { .. }
            | XnatError::MissingTool(_) => ErrorCategory::Usage,
            XnatError::Lookup { .. } | XnatError::NotFound { .. } => ErrorCategory::Lookup,
            XnatError::AmbiguousLabel { .. } => ErrorCategory::Ambiguity,
            XnatError::NoMatchingSessions(_) | XnatError::SkippedAllSessions(_) => {
                ErrorCategory::Info
            }
            XnatError::DigestMismatch { .. } | XnatError::DigestUnavailable(_) => {
                ErrorCategory::Integrity
            }
            XnatError::LoginFailed(_) | XnatError::LoginBlocked { .. } | XnatError::Netrc(_) => {
                ErrorCategory::Credentials
            }
            XnatError::Http(_) | XnatError::Status { .. } => ErrorCategory::Transport,
            XnatError::Filesystem(_)
            | XnatError::Conversion(_)
            | XnatError::CatalogParse(_)
            | XnatError::MissingConfig
            | XnatError::ConfigRead(_)
            | XnatError::ConfigParse(_) => ErrorCategory::Local,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Info => 0,
            ErrorCategory::Usage => 2,
            ErrorCategory::Lookup | ErrorCategory::Ambiguity => 3,
            ErrorCategory::Integrity => 4,
            ErrorCategory::Credentials => 5,
            ErrorCategory::Transport | ErrorCategory::Local => 1,
        }
    }
}

/// Reduces an HTML error page returned by the server to its `<h3>` headline.
pub fn clean_response_message(body: &str) -> String {
    let headline = Regex::new(r"(?s)<h3>(.*?)</h3>")
        .ok()
        .and_then(|re| re.captures(body))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string());
    if let Some(headline) = headline {
        return headline;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.starts_with('<') {
        "request failed".to_string()
    } else {
        trimmed.lines().next().unwrap_or(trimmed).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headline_is_extracted_from_html() {
        let body = "<html><body><h3>The requested resource is not available</h3></body></html>";
        assert_eq!(
            clean_response_message(body),
            "The requested resource is not available"
        );
    }

    #[test]
    fn plain_text_body_is_kept() {
        assert_eq!(clean_response_message("bad label\nmore"), "bad label");
        assert_eq!(clean_response_message("<html></html>"), "request failed");
    }

    #[test]
    fn ambiguity_has_its_own_category() {
        let err = XnatError::AmbiguousLabel {
            kind: "session".to_string(),
            label: "MR01".to_string(),
            candidates: vec!["XNAT_E001".to_string(), "XNAT_E002".to_string()],
        };
        assert_eq!(err.category(), ErrorCategory::Ambiguity);
        assert_eq!(
            err.to_string(),
            "More than one session associated with name MR01: XNAT_E001,XNAT_E002"
        );
    }
}
