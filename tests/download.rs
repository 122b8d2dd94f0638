mod common;

use std::fs;
use std::path::Path;

use assert_matches::assert_matches;

use common::{MockTools, MockXnat, RecordingSink};
use xnat_utils::app::App;
use xnat_utils::domain::ConvertTarget;
use xnat_utils::download::{DownloadOptions, GetRequest};
use xnat_utils::error::XnatError;

const FIRST: &[u8] = b"first slice";
const SECOND: &[u8] = b"second slice";

fn archive() -> MockXnat {
    MockXnat::default()
        .with_project("MRH017")
        .with_subject("XNAT_S01", "MRH017_100", "MRH017")
        .with_session("XNAT_E01", "MRH017_100_MR01", Some("2018-02-01"))
        .with_scan("XNAT_E01", "1", Some("t1_mprage"))
        .with_scan("XNAT_E01", "2", Some("ep2d diff"))
        .with_files(
            "XNAT_E01",
            Some("1"),
            "DICOM",
            &[
                ("1.3.12.2-0001-0002-a1.dcm", SECOND),
                ("1.3.12.2-0001-0001-b2.dcm", FIRST),
            ],
        )
        .with_files("XNAT_E01", Some("1"), "SNAPSHOTS", &[("thumb.gif", b"gif")])
        .with_files("XNAT_E01", Some("2"), "DICOM", &[])
}

fn request(download_dir: &Path) -> GetRequest {
    GetRequest {
        ids: vec!["MRH017_100_MR01".to_string()],
        download_dir: download_dir.to_path_buf(),
        match_scan_id: true,
        ..GetRequest::default()
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    names.sort();
    names
}

fn assert_no_staging(dir: &Path) {
    assert!(
        names(dir).iter().all(|name| !name.starts_with(".download-")),
        "staging directory left behind in {}",
        dir.display()
    );
}

#[test]
fn downloads_scan_into_session_directory() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(archive(), MockTools::default());
    let sink = RecordingSink::default();
    let mut req = request(temp.path());
    req.scans = vec!["t1_.*".to_string()];

    let result = app.get(req, &sink).unwrap();

    let session_dir = temp.path().join("MRH017_100_MR01");
    assert_eq!(names(&session_dir), vec!["1-t1_mprage"]);
    assert_eq!(
        names(&session_dir.join("1-t1_mprage")),
        vec!["1.3.12.2-0001-0001-b2.dcm", "1.3.12.2-0001-0002-a1.dcm"]
    );
    assert_eq!(
        fs::read(session_dir.join("1-t1_mprage/1.3.12.2-0001-0001-b2.dcm")).unwrap(),
        FIRST
    );
    assert_eq!(
        result.downloaded["MRH017_100_MR01"],
        vec!["/data/experiments/XNAT_E01/scans/1/resources/DICOM"]
    );
    assert_eq!(sink.messages(), vec!["Downloading MRH017_100_MR01: 1-t1_mprage-DICOM"]);
    assert_no_staging(&session_dir);
}

#[test]
fn empty_resource_is_listed_but_writes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(archive(), MockTools::default());
    let mut req = request(temp.path());
    req.scans = vec!["ep2d diff".to_string()];

    let result = app.get(req, &RecordingSink::default()).unwrap();

    assert_eq!(
        result.downloaded["MRH017_100_MR01"],
        vec!["/data/experiments/XNAT_E01/scans/2/resources/DICOM"]
    );
    let session_dir = temp.path().join("MRH017_100_MR01");
    assert!(!session_dir.join("2-ep2d_diff").exists());
    assert_no_staging(&session_dir);
}

#[test]
fn strip_name_numbers_dicom_files() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(archive(), MockTools::default());
    let mut req = request(temp.path());
    req.scans = vec!["t1_mprage".to_string()];
    req.strip_name = true;

    app.get(req, &RecordingSink::default()).unwrap();

    let scan_dir = temp.path().join("MRH017_100_MR01/1-t1_mprage");
    assert_eq!(names(&scan_dir), vec!["0001.dcm", "0002.dcm"]);
    assert_eq!(fs::read(scan_dir.join("0002.dcm")).unwrap(), SECOND);
}

#[test]
fn subject_dirs_group_by_subject_label() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(archive(), MockTools::default());
    let mut req = request(temp.path());
    req.scans = vec!["t1_mprage".to_string()];
    req.subject_dirs = true;

    app.get(req, &RecordingSink::default()).unwrap();

    assert!(temp.path().join("MRH017_100/1-t1_mprage").is_dir());
    assert!(!temp.path().join("MRH017_100_MR01").exists());
}

#[test]
fn several_resources_get_suffixed_targets() {
    let temp = tempfile::tempdir().unwrap();
    let client = archive().with_files(
        "XNAT_E01",
        Some("1"),
        "NIFTI_GZ",
        &[("t1.nii.gz", b"nifti")],
    );
    let app = App::new(client, MockTools::default());
    let mut req = request(temp.path());
    req.scans = vec!["t1_mprage".to_string()];

    let result = app.get(req, &RecordingSink::default()).unwrap();

    assert_eq!(result.resource_count(), 2);
    assert_eq!(
        names(&temp.path().join("MRH017_100_MR01")),
        vec!["1-t1_mprage-DICOM", "1-t1_mprage-NIFTI_GZ"]
    );
}

#[test]
fn failed_conversion_keeps_the_unconverted_data() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(archive(), MockTools::failing(&["dcm2niix", "mrconvert"]));
    let mut req = request(temp.path());
    req.scans = vec!["t1_mprage".to_string()];
    req.convert_to = Some(ConvertTarget::NiftiGz);

    let result = app.get(req, &RecordingSink::default()).unwrap();

    assert_eq!(result.resource_count(), 1);
    let session_dir = temp.path().join("MRH017_100_MR01");
    assert_eq!(names(&session_dir), vec!["1-t1_mprage"]);
    assert_eq!(names(&session_dir.join("1-t1_mprage")).len(), 2);

    let runs = app_runs(&app);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0, "dcm2niix");
    assert_eq!(&runs[0].1[..2], &["-z".to_string(), "y".to_string()]);
    assert!(runs[0].1.contains(&"1-t1_mprage".to_string()));
}

fn app_runs(app: &App<MockXnat, MockTools>) -> Vec<(String, Vec<String>)> {
    app.tools().runs()
}

#[test]
fn missing_converter_is_a_usage_error() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(archive(), MockTools::default());
    let mut req = request(temp.path());
    req.scans = vec!["t1_mprage".to_string()];
    req.convert_to = Some(ConvertTarget::Mrtrix);

    let err = app.get(req, &RecordingSink::default()).unwrap_err();

    assert_matches!(err, XnatError::MissingTool(ref tool) if tool == "mrconvert");
    assert_eq!(err.exit_code(), 2);
    assert_no_staging(&temp.path().join("MRH017_100_MR01"));
}

#[test]
fn already_downloaded_sessions_fail_before_any_request() {
    let temp = tempfile::tempdir().unwrap();
    fs::create_dir(temp.path().join("MRH017_100_MR01")).unwrap();
    let app = App::new(archive(), MockTools::default());
    let mut req = request(temp.path());
    req.skip_downloaded = true;

    assert_matches!(req.precheck(), Err(XnatError::SkippedAllSessions(_)));
    assert_matches!(
        app.get(req, &RecordingSink::default()),
        Err(XnatError::SkippedAllSessions(_))
    );
    assert!(app.client().calls().is_empty());
}

#[test]
fn catalog_entries_are_downloaded() {
    let temp = tempfile::tempdir().unwrap();
    let catalog = temp.path().join("selection.xml");
    fs::write(
        &catalog,
        r#"<?xml version="1.0" encoding="UTF-8"?>
<cat:Catalog xmlns:cat="http://nrg.wustl.edu/catalog">
  <cat:entries>
    <cat:entry URI="/archive/projects/MRH017/subjects/MRH017_100/experiments/MRH017_100_MR01/scans/1/resources/DICOM/files/1.3.12.2-0001-0001-b2.dcm"/>
    <cat:entry URI="/archive/projects/MRH017/subjects/MRH017_100/experiments/MRH017_100_MR01/scans/1/resources/DICOM/files/1.3.12.2-0001-0002-a1.dcm"/>
    <cat:entry URI="/archive/experiments/MRH017_100_MR01/resources/PDF/files/report.pdf"/>
  </cat:entries>
</cat:Catalog>"#,
    )
    .unwrap();
    let client = archive().with_files("XNAT_E01", None, "PDF", &[("report.pdf", b"%PDF")]);
    let app = App::new(client, MockTools::default());
    let download_dir = temp.path().join("out");
    let options = DownloadOptions {
        download_dir: download_dir.clone(),
        ..DownloadOptions::default()
    };

    let result = app
        .get_from_catalog(&catalog, options, &RecordingSink::default())
        .unwrap();

    assert_eq!(result.resource_count(), 2);
    assert_eq!(
        names(&download_dir.join("MRH017_100_MR01")),
        vec!["1-t1_mprage", "PDF"]
    );
    assert_eq!(
        fs::read(download_dir.join("MRH017_100_MR01/PDF/report.pdf")).unwrap(),
        b"%PDF"
    );
}
