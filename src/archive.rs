// src/archive.rs

//! Archive and tree utilities
//!
//! Package tarballs are `.tar.xz` files whose root holds `pkginfo.json`
//! and the package directories. This module creates and extracts them,
//! unpacks source archives for `url_extract` sources, and contains the
//! filesystem walkers the build and bootstrap steps share.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use tar::{Archive, Builder, HeaderMode};
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

/// xz preset used for package tarballs
const XZ_LEVEL: u32 = 6;

static SERVICES_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^dcos\.target\.wants(?:_.+)?$").unwrap());

/// Create `result_filename` as an xz compressed tarball of `change_folder`
///
/// Entries are stored relative to `change_folder` with root ownership and
/// normalized timestamps. Symlinks are stored as symlinks.
pub fn make_tar(result_filename: &Path, change_folder: &Path) -> Result<()> {
    let output = File::create(result_filename).map_err(|e| {
        Error::IoError(format!("Failed to create {}: {e}", result_filename.display()))
    })?;
    let encoder = XzEncoder::new(output, XZ_LEVEL);
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", change_folder).map_err(|e| {
        Error::IoError(format!("Failed to archive {}: {e}", change_folder.display()))
    })?;

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

fn unpack<R: Read>(reader: R, target: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(target)?;
    Ok(())
}

/// Extract a `.tar.xz` package tarball into `target`
///
/// On any failure the partially extracted `target` is removed.
pub fn extract_tarball(path: &Path, target: &Path) -> Result<()> {
    let attempt = (|| -> Result<()> {
        if !path.exists() {
            return Err(Error::IoError(format!(
                "Path doesn't exist but should: {}",
                path.display()
            )));
        }
        fs::create_dir_all(target)?;
        let file = File::open(path)?;
        unpack(XzDecoder::new(BufReader::new(file)), target)
    })();

    if let Err(e) = attempt {
        let _ = fs::remove_dir_all(target);
        return Err(Error::PackageError(format!(
            "Unable to extract {} to {}: {e}",
            path.display(),
            target.display()
        )));
    }
    Ok(())
}

/// Kind of source archive, decided by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarXz,
    Tar,
    Zip,
    Unknown,
}

impl ArchiveKind {
    pub fn from_filename(filename: &str) -> Self {
        let parts: Vec<&str> = filename.split('.').collect();
        if parts.len() < 2 {
            return ArchiveKind::Unknown;
        }
        let last = parts[parts.len() - 1];
        match last {
            "tgz" => return ArchiveKind::TarGz,
            "zip" => return ArchiveKind::Zip,
            "tar" => return ArchiveKind::Tar,
            _ => {}
        }
        if parts.len() >= 3 && parts[parts.len() - 2] == "tar" {
            return match last {
                "gz" => ArchiveKind::TarGz,
                "xz" => ArchiveKind::TarXz,
                _ => ArchiveKind::Unknown,
            };
        }
        ArchiveKind::Unknown
    }
}

/// Extract a source archive, dropping its single top level directory
pub fn extract_archive(archive: &Path, dst_dir: &Path) -> Result<()> {
    let filename = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match ArchiveKind::from_filename(&filename) {
        ArchiveKind::TarGz => unpack_stripped(GzDecoder::new(File::open(archive)?), dst_dir),
        ArchiveKind::TarXz => unpack_stripped(XzDecoder::new(File::open(archive)?), dst_dir),
        ArchiveKind::Tar => unpack_stripped(File::open(archive)?, dst_dir),
        ArchiveKind::Zip => {
            let output = Command::new("unzip")
                .arg("-x")
                .arg(archive)
                .arg("-d")
                .arg(dst_dir)
                .output()
                .map_err(|e| Error::CommandFailed(format!("Failed to run unzip: {e}")))?;
            if !output.status.success() {
                return Err(Error::CommandFailed(format!(
                    "unzip of {} failed: {}",
                    archive.display(),
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
            strip_first_path_component(dst_dir)
        }
        ArchiveKind::Unknown => Err(Error::ValidationError(format!(
            "Unsupported archive: {filename}"
        ))),
    }
}

/// Unpack a tar stream as `tar --strip-components=1` would
fn unpack_stripped<R: Read>(reader: R, dst_dir: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped: PathBuf = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .skip(1)
            .collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(Error::ValidationError(format!(
                "Archive entry escapes the extraction directory: {}",
                path.display()
            )));
        }
        let dest = dst_dir.join(&stripped);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

/// Move the contents of the single top level directory up one level
fn strip_first_path_component(path: &Path) -> Result<()> {
    let entries: Vec<PathBuf> = fs::read_dir(path)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    if entries.len() != 1 || !entries[0].is_dir() {
        return Err(Error::ValidationError(
            "Extracted archive has more than one top level component, unable to strip it."
                .to_string(),
        ));
    }
    let top_level_dir = &entries[0];
    for entry in fs::read_dir(top_level_dir)? {
        let entry = entry?;
        fs::rename(entry.path(), path.join(entry.file_name()))?;
    }
    fs::remove_dir(top_level_dir)?;
    Ok(())
}

/// Rewrite absolute symlinks under `root` from `old_prefix` to `new_prefix`
///
/// Links that don't start with `old_prefix` are left alone since packages
/// may contain arbitrary symlinks of their own.
pub fn rewrite_symlinks(root: &Path, old_prefix: &Path, new_prefix: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {e}", root.display())))?;
        if !entry.path_is_symlink() {
            continue;
        }
        let full_path = entry.path();
        let target = fs::read_link(full_path)?;
        if let Ok(rest) = target.strip_prefix(old_prefix) {
            let new_target = new_prefix.join(rest);
            debug!("Rewriting {} -> {}", full_path.display(), new_target.display());
            fs::remove_file(full_path)?;
            symlink(&new_target, full_path)?;
        }
    }
    Ok(())
}

/// Reject a package whose unit directories ship reserved unit names
pub fn check_forbidden_services(path: &Path, services: &[&str]) -> Result<()> {
    let mut found = BTreeSet::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        if !SERVICES_DIR_RE.is_match(&name.to_string_lossy()) || !entry.path().is_dir() {
            continue;
        }
        for unit in fs::read_dir(entry.path())? {
            let unit = unit?.file_name().to_string_lossy().into_owned();
            if services.contains(&unit.as_str()) {
                found.insert(unit);
            }
        }
    }

    if !found.is_empty() {
        let names: Vec<String> = found.into_iter().collect();
        return Err(Error::ValidationError(format!(
            "Reserved unit names found: {}",
            names.join(",")
        )));
    }
    Ok(())
}

/// Recursively copy a tree, keeping symlinks as symlinks and file modes
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, entry.metadata().map_err(|e| Error::IoError(e.to_string()))?.permissions())?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
