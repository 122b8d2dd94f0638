use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use zip::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::XnatError;

const DIGEST_CHUNK: usize = 1024 * 1024;

fn fs_err(path: &Path, err: impl std::fmt::Display) -> XnatError {
    XnatError::Filesystem(format!("{}: {err}", path.display()))
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), XnatError> {
    let file = fs::File::open(zip_path).map_err(|err| fs_err(zip_path, err))?;
    let mut archive = ZipArchive::new(file).map_err(|err| fs_err(zip_path, err))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(XnatError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| fs_err(&entry_path, err))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| fs_err(parent, err))?;
        }
        let mut outfile = fs::File::create(&entry_path).map_err(|err| fs_err(&entry_path, err))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| fs_err(&entry_path, err))?;
    }
    Ok(())
}

/// Packs files flat (by basename) into a new archive at `zip_path`.
pub fn zip_files(files: &[PathBuf], zip_path: &Path) -> Result<(), XnatError> {
    let out = fs::File::create(zip_path).map_err(|err| fs_err(zip_path, err))?;
    let mut writer = ZipWriter::new(out);
    let options = SimpleFileOptions::default();
    for path in files {
        let name = basename(path)?;
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| fs_err(zip_path, err))?;
        let mut input = fs::File::open(path).map_err(|err| fs_err(path, err))?;
        io::copy(&mut input, &mut writer).map_err(|err| fs_err(path, err))?;
    }
    writer.finish().map_err(|err| fs_err(zip_path, err))?;
    Ok(())
}

/// Hex MD5 of a file, read in 1 MiB chunks.
pub fn md5_file(path: &Path) -> Result<String, XnatError> {
    let mut file = fs::File::open(path).map_err(|err| fs_err(path, err))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK];
    loop {
        let read = file.read(&mut buffer).map_err(|err| fs_err(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn basename(path: &Path) -> Result<String, XnatError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
        .ok_or_else(|| XnatError::Filesystem(format!("invalid file name {}", path.display())))
}

/// First directory named `files` below `root`, searched breadth first.
pub fn find_files_dir(root: &Path) -> Option<PathBuf> {
    let mut queue = std::collections::VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut children = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        children.sort();
        for child in children {
            if child.file_name().is_some_and(|name| name == "files") {
                return Some(child);
            }
            queue.push_back(child);
        }
    }
    None
}

/// Sorted names of the regular files directly inside `dir`.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>, XnatError> {
    let mut names = fs::read_dir(dir)
        .map_err(|err| fs_err(dir, err))?
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().to_str().map(|name| name.to_string()))
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

/// Names of the sub-directories of `dir`; a missing directory has none.
pub fn list_subdirs(dir: &Path) -> Result<Vec<String>, XnatError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = fs::read_dir(dir)
        .map_err(|err| fs_err(dir, err))?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(|name| name.to_string()))
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

pub fn remove_path(path: &Path) -> Result<(), XnatError> {
    if path.is_dir() {
        fs::remove_dir_all(path).map_err(|err| fs_err(path, err))
    } else if path.exists() {
        fs::remove_file(path).map_err(|err| fs_err(path, err))
    } else {
        Ok(())
    }
}

/// Moves a file or directory, replacing whatever is at `to`.
pub fn move_path(from: &Path, to: &Path) -> Result<(), XnatError> {
    remove_path(to)?;
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_recursive(from, to)?;
    remove_path(from)
}

fn copy_recursive(from: &Path, to: &Path) -> Result<(), XnatError> {
    if from.is_dir() {
        fs::create_dir_all(to).map_err(|err| fs_err(to, err))?;
        for entry in fs::read_dir(from).map_err(|err| fs_err(from, err))?.flatten() {
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(from, to).map_err(|err| fs_err(from, err)).map(|_| ())
    }
}
