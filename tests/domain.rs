use std::path::Path;

use assert_matches::assert_matches;
use clap::ValueEnum;

use xnat_utils::convert::conversion_args;
use xnat_utils::domain::{
    ConvertTarget, Converter, DataType, Modality, PatternSet, resource_name_for,
};
use xnat_utils::error::XnatError;

#[test]
fn cli_value_names() {
    assert_eq!(
        ConvertTarget::from_str("nifti_gz", false).unwrap(),
        ConvertTarget::NiftiGz
    );
    assert_eq!(Modality::from_str("MRPT", false).unwrap(), Modality::MrPt);
    assert_eq!(DataType::from_str("session", false).unwrap(), DataType::Session);
    assert!(Converter::from_str("dcm2nii", false).is_err());
}

#[test]
fn converter_inference() {
    assert_eq!(Converter::infer(ConvertTarget::NiftiGz, "DICOM"), Converter::Dcm2niix);
    assert_eq!(Converter::infer(ConvertTarget::Mrtrix, "DICOM"), Converter::Mrconvert);
    assert_eq!(Converter::infer(ConvertTarget::Nifti, "MRTRIX"), Converter::Mrconvert);
    assert_eq!(ConvertTarget::MrtrixGz.extension(), ".mif.gz");
    assert_eq!(ConvertTarget::NiftiGz.to_string(), "nifti_gz");
}

#[test]
fn dcm2niix_and_mrconvert_arguments() {
    let args = conversion_args(
        Converter::Dcm2niix,
        ConvertTarget::Nifti,
        Path::new("/tmp/stage/files"),
        Path::new("/data/MRH017_100_MR01"),
        "3-t1_mprage",
    );
    assert_eq!(
        args,
        vec!["-z", "n", "-o", "/data/MRH017_100_MR01", "-f", "3-t1_mprage", "/tmp/stage/files"]
    );

    let args = conversion_args(
        Converter::Mrconvert,
        ConvertTarget::MrtrixGz,
        Path::new("/tmp/stage/files"),
        Path::new("/data/MRH017_100_MR01"),
        "3-t1_mprage",
    );
    assert_eq!(
        args,
        vec!["/tmp/stage/files", "/data/MRH017_100_MR01/3-t1_mprage.mif.gz"]
    );
}

#[test]
fn pattern_sets_match_any() {
    let set = PatternSet::parse(&["t1_.*", "ep2d_diff"]).unwrap();
    assert!(set.matches_any("t1_mprage"));
    assert!(set.matches_any("ep2d_diff"));
    assert!(!set.matches_any("ep2d_diff_b1000"));
    assert_matches!(
        PatternSet::parse(&["t1_[", "ok"]),
        Err(XnatError::InvalidPattern { .. })
    );
}

#[test]
fn uploaded_file_resource_names() {
    assert_eq!(resource_name_for("brain.mif"), "MRTRIX");
    assert_eq!(resource_name_for("dwi.bvec"), "FSL_BVECS");
    assert_eq!(resource_name_for("report.PDF"), "PDF");
}
