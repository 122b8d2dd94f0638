use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::debug;

use crate::domain::{ConvertTarget, Converter};
use crate::error::XnatError;

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub dcm2niix: Option<String>,
    pub mrconvert: Option<String>,
    pub dcmodify: Option<String>,
    pub dcmsend: Option<String>,
}

/// External command seam: lookup and execution of the imaging tools.
pub trait ToolRunner {
    fn locate(&self, program: &str) -> Option<PathBuf>;
    fn run(&self, program: &Path, args: &[String]) -> Result<(), XnatError>;
    fn tool_info(&self) -> ToolInfo;

    fn require(&self, program: &str) -> Result<PathBuf, XnatError> {
        self.locate(program)
            .ok_or_else(|| XnatError::MissingTool(program.to_string()))
    }
}

#[derive(Clone, Default)]
pub struct SystemTools;

impl SystemTools {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for SystemTools {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        find_in_path(program)
    }

    fn run(&self, program: &Path, args: &[String]) -> Result<(), XnatError> {
        debug!(program = %program.display(), ?args, "running external tool");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| XnatError::Conversion(format!("{}: {err}", program.display())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", program.display())
        } else {
            stderr
        };
        Err(XnatError::Conversion(message))
    }

    fn tool_info(&self) -> ToolInfo {
        let version = |name: &str, args: &[&str]| {
            find_in_path(name).and_then(|path| tool_version(&path, args))
        };
        ToolInfo {
            dcm2niix: version("dcm2niix", &["--version"]),
            mrconvert: version("mrconvert", &["-version"]),
            dcmodify: version("dcmodify", &["--version"]),
            dcmsend: version("dcmsend", &["--version"]),
        }
    }
}

/// Arguments for converting `source` into `target_dir/<stem>`.
pub fn conversion_args(
    converter: Converter,
    target: ConvertTarget,
    source: &Path,
    target_dir: &Path,
    stem: &str,
) -> Vec<String> {
    match converter {
        Converter::Dcm2niix => vec![
            "-z".to_string(),
            if target.is_compressed() { "y" } else { "n" }.to_string(),
            "-o".to_string(),
            target_dir.to_string_lossy().to_string(),
            "-f".to_string(),
            stem.to_string(),
            source.to_string_lossy().to_string(),
        ],
        Converter::Mrconvert => vec![
            source.to_string_lossy().to_string(),
            target_dir
                .join(format!("{stem}{}", target.extension()))
                .to_string_lossy()
                .to_string(),
        ],
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    stdout.lines().next().map(|line| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dcm2niix_args_follow_compression() {
        let args = conversion_args(
            Converter::Dcm2niix,
            ConvertTarget::NiftiGz,
            Path::new("/tmp/stage/files"),
            Path::new("/data/MRH017_100_MR01"),
            "3-t1_mprage",
        );
        assert_eq!(
            args,
            vec![
                "-z",
                "y",
                "-o",
                "/data/MRH017_100_MR01",
                "-f",
                "3-t1_mprage",
                "/tmp/stage/files"
            ]
        );
    }

    #[test]
    fn mrconvert_writes_target_path() {
        let args = conversion_args(
            Converter::Mrconvert,
            ConvertTarget::Mrtrix,
            Path::new("src"),
            Path::new("out"),
            "4-dwi",
        );
        assert_eq!(args[1], Path::new("out").join("4-dwi.mif").to_string_lossy());
    }

    #[test]
    fn missing_tool_is_reported() {
        let tools = SystemTools::new();
        let err = tools.require("definitely-not-a-real-tool-xyz").unwrap_err();
        assert!(matches!(err, XnatError::MissingTool(_)));
    }
}
