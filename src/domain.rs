use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::XnatError;

/// Resources never downloaded unless asked for by name.
pub const SKIP_RESOURCES: &[&str] = &["SNAPSHOTS"];

/// Resource format name to file extension, in lookup order.
pub const RESOURCE_FORMATS: &[(&str, &str)] = &[
    ("NIFTI", ".nii"),
    ("NIFTI_GZ", ".nii.gz"),
    ("PDF", ".pdf"),
    ("MRTRIX", ".mif"),
    ("MRTRIX_GZ", ".mif.gz"),
    ("DICOM", ""),
    ("secondary", ""),
    ("TEXT_MATRIX", ".mat"),
    ("MRTRIX_GRAD", ".b"),
    ("FSL_BVECS", ".bvec"),
    ("FSL_BVALS", ".bval"),
    ("MATLAB", ".mat"),
    ("ANALYZE", ".img"),
    ("ZIP", ".zip"),
    ("RDATA", ".rdata"),
    ("DAT", ".dat"),
    ("RAW", ".rda"),
    ("JPG", ".JPG"),
    ("TEXT", ".txt"),
    ("TAR_GZ", ".tar.gz"),
    ("CSV", ".csv"),
    ("BINARY_FILE", ".bf"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Project,
    Subject,
    Session,
    Scan,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Project => write!(f, "project"),
            DataType::Subject => write!(f, "subject"),
            DataType::Session => write!(f, "session"),
            DataType::Scan => write!(f, "scan"),
        }
    }
}

/// Guesses what kind of entity an id names from its underscore count.
///
/// Labels carrying extra underscores are misclassified; callers that know
/// better pass an explicit [`DataType`].
pub fn classify_id(id: &str) -> DataType {
    match id.matches('_').count() {
        0 => DataType::Project,
        1 => DataType::Subject,
        _ => DataType::Session,
    }
}

fn is_word(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_alphanumeric() || ch == '_')
}

/// True when any of the ids contains a character outside `\w`.
pub fn is_regex<S: AsRef<str>>(ids: &[S]) -> bool {
    ids.iter().any(|id| !is_word(id.as_ref()))
}

/// A user supplied regular expression that must match a whole label.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl FromStr for Pattern {
    type Err = XnatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let regex =
            Regex::new(&format!("^(?:{value})$")).map_err(|err| XnatError::InvalidPattern {
                pattern: value.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            source: value.to_string(),
            regex,
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternSet(Vec<Pattern>);

impl PatternSet {
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, XnatError> {
        values
            .iter()
            .map(|value| value.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.0.iter()
    }

    pub fn matches_any(&self, value: &str) -> bool {
        self.0.iter().any(|pattern| pattern.is_match(value))
    }
}

/// Lower-cased extension including the dot; `.gz` pulls in the part before it.
pub fn extract_extension(filename: &str) -> String {
    let basename = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let parts = basename.split('.').collect::<Vec<_>>();
    if parts.len() == 1 {
        return String::new();
    }
    let take = if parts.last() == Some(&"gz") { 2 } else { 1 };
    let start = parts.len().saturating_sub(take).max(1);
    format!(".{}", parts[start..].join(".")).to_lowercase()
}

pub fn resource_name_for(filename: &str) -> String {
    let ext = extract_extension(filename);
    RESOURCE_FORMATS
        .iter()
        .find(|(_, format_ext)| *format_ext == ext)
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| ext.trim_start_matches('.').to_uppercase())
}

pub fn extension_for(resource_name: &str) -> &'static str {
    lookup_extension(resource_name)
        .or_else(|| lookup_extension(&resource_name.to_uppercase()))
        .unwrap_or("")
}

fn lookup_extension(name: &str) -> Option<&'static str> {
    RESOURCE_FORMATS
        .iter()
        .find(|(format_name, _)| *format_name == name)
        .map(|(_, ext)| *ext)
}

pub fn is_dicom_resource(name: &str) -> bool {
    name == "DICOM" || name == "secondary"
}

pub fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

pub fn validate_session_name(name: &str) -> Result<(), XnatError> {
    if is_word(name) {
        Ok(())
    } else {
        Err(XnatError::InvalidSessionName(name.to_string()))
    }
}

pub fn validate_scan_name(name: &str) -> Result<(), XnatError> {
    if name.contains('.') {
        Err(XnatError::InvalidScanName(name.to_string()))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Modality {
    #[value(name = "MR")]
    #[serde(rename = "MR")]
    Mr,
    #[value(name = "MRPT")]
    #[serde(rename = "MRPT")]
    MrPt,
    #[value(name = "EEG")]
    #[serde(rename = "EEG")]
    Eeg,
}

impl Modality {
    /// Reads the modality code embedded in `<project>_<subject>_<CODE><n>`.
    pub fn from_session_label(label: &str) -> Self {
        Regex::new(r"^\w+_\w+_([A-Z]+)\d+")
            .ok()
            .and_then(|re| re.captures(label))
            .and_then(|caps| caps.get(1))
            .and_then(|code| code.as_str().parse().ok())
            .unwrap_or(Modality::Mr)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Modality::Mr => "MR",
            Modality::MrPt => "MRPT",
            Modality::Eeg => "EEG",
        }
    }

    pub fn session_xsi_type(&self) -> &'static str {
        match self {
            Modality::Mr => "xnat:mrSessionData",
            Modality::MrPt => "xnat:petmrSessionData",
            Modality::Eeg => "xnat:eegSessionData",
        }
    }

    pub fn scan_xsi_type(&self) -> &'static str {
        match self {
            Modality::Mr | Modality::MrPt => "xnat:mrScanData",
            Modality::Eeg => "xnat:eegScanData",
        }
    }
}

impl FromStr for Modality {
    type Err = XnatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "MR" => Ok(Modality::Mr),
            "MRPT" => Ok(Modality::MrPt),
            "EEG" => Ok(Modality::Eeg),
            _ => Err(XnatError::Usage(format!("Unrecognised modality '{value}'"))),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConvertTarget {
    Nifti,
    #[value(name = "nifti_gz")]
    NiftiGz,
    Mrtrix,
    #[value(name = "mrtrix_gz")]
    MrtrixGz,
}

impl ConvertTarget {
    pub fn resource_name(&self) -> &'static str {
        match self {
            ConvertTarget::Nifti => "NIFTI",
            ConvertTarget::NiftiGz => "NIFTI_GZ",
            ConvertTarget::Mrtrix => "MRTRIX",
            ConvertTarget::MrtrixGz => "MRTRIX_GZ",
        }
    }

    pub fn extension(&self) -> &'static str {
        extension_for(self.resource_name())
    }

    pub fn is_nifti(&self) -> bool {
        matches!(self, ConvertTarget::Nifti | ConvertTarget::NiftiGz)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, ConvertTarget::NiftiGz | ConvertTarget::MrtrixGz)
    }
}

impl fmt::Display for ConvertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource_name().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Converter {
    Dcm2niix,
    Mrconvert,
}

impl Converter {
    pub fn program(&self) -> &'static str {
        match self {
            Converter::Dcm2niix => "dcm2niix",
            Converter::Mrconvert => "mrconvert",
        }
    }

    /// dcm2niix for DICOM to NIfTI, mrconvert for everything else.
    pub fn infer(target: ConvertTarget, resource_name: &str) -> Self {
        if target.is_nifti() && resource_name == "DICOM" {
            Converter::Dcm2niix
        } else {
            Converter::Mrconvert
        }
    }
}

impl fmt::Display for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program())
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, XnatError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| XnatError::InvalidDate(value.to_string()))
}

/// Inclusive session date window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub before: Option<NaiveDate>,
    pub after: Option<NaiveDate>,
}

impl DateRange {
    pub fn parse(before: Option<&str>, after: Option<&str>) -> Result<Self, XnatError> {
        Ok(Self {
            before: before.map(parse_date).transpose()?,
            after: after.map(parse_date).transpose()?,
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }

    /// Sessions without a date only pass an unbounded range.
    pub fn contains(&self, date: Option<NaiveDate>) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(date) = date else {
            return false;
        };
        if self.before.is_some_and(|before| date > before) {
            return false;
        }
        if self.after.is_some_and(|after| date < after) {
            return false;
        }
        true
    }
}

/// `<project>_<subject>_<visit>` split of a session label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLabel {
    pub project: String,
    pub subject: String,
    pub visit: String,
}

impl SessionLabel {
    pub fn split(label: &str) -> Result<Self, XnatError> {
        let parts = label.split('_').collect::<Vec<_>>();
        if parts.len() != 3 || parts.iter().any(|part| part.is_empty()) {
            return Err(XnatError::Usage(format!(
                "Session '{label}' does not follow the <project>_<subject>_<visit> convention, \
                 please provide the project and subject explicitly"
            )));
        }
        Ok(Self {
            project: Self::project_of(label),
            subject: Self::subject_of(label),
            visit: parts[2].to_string(),
        })
    }

    /// Text before the first underscore.
    pub fn project_of(label: &str) -> String {
        label.split('_').next().unwrap_or(label).to_string()
    }

    /// The first two underscore-separated parts, or the whole label when it has none.
    pub fn subject_of(label: &str) -> String {
        label.split('_').take(2).collect::<Vec<_>>().join("_")
    }
}
