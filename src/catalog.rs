use std::fs;
use std::path::Path;

use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use regex::Regex;

use crate::error::XnatError;

/// One resource referenced by a saved "download images" catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub uri: String,
    pub project: Option<String>,
    pub session: String,
    pub scan: Option<String>,
    pub resource: String,
}

pub fn read_catalog(path: &Path) -> Result<Vec<CatalogEntry>, XnatError> {
    let content = fs::read_to_string(path)
        .map_err(|err| XnatError::CatalogParse(format!("{}: {err}", path.display())))?;
    parse_catalog(&content)
}

/// Extracts the `entry/@URI` resources of a catalog, first occurrence only.
pub fn parse_catalog(xml: &str) -> Result<Vec<CatalogEntry>, XnatError> {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries: Vec<CatalogEntry> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() != b"entry" {
                    continue;
                }
                for attr in e.attributes() {
                    let attr = attr.map_err(|err| XnatError::CatalogParse(err.to_string()))?;
                    if attr.key.local_name().as_ref() != b"URI" {
                        continue;
                    }
                    let uri = String::from_utf8_lossy(attr.value.as_ref()).to_string();
                    let entry = parse_entry_uri(&uri)?;
                    let seen = entries.iter().any(|existing| {
                        existing.session == entry.session
                            && existing.scan == entry.scan
                            && existing.resource == entry.resource
                    });
                    if !seen {
                        entries.push(entry);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(XnatError::CatalogParse(err.to_string())),
        }
    }
    Ok(entries)
}

fn segment_after(uri: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"/{name}/([^/]+)")).ok()?;
    re.captures(uri)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn parse_entry_uri(uri: &str) -> Result<CatalogEntry, XnatError> {
    let normalized = format!("/{}", uri.trim_start_matches('/'));
    let session = segment_after(&normalized, "experiments").ok_or_else(|| {
        XnatError::CatalogParse(format!("entry '{uri}' does not reference a session"))
    })?;
    let resource = segment_after(&normalized, "resources").ok_or_else(|| {
        XnatError::CatalogParse(format!("entry '{uri}' does not reference a resource"))
    })?;
    Ok(CatalogEntry {
        uri: uri.to_string(),
        project: segment_after(&normalized, "projects"),
        scan: segment_after(&normalized, "scans"),
        session,
        resource,
    })
}
