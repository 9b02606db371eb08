// src/install/systemd.rs

//! Systemd unit staging
//!
//! The wants directory (`dcos.target.wants`) lists every unit pkgpanda
//! manages. Unit files are copied out of the packages into the base systemd
//! directory (the wants directory's parent) so they're readable from the root
//! volume at boot. The wants symlinks are rewritten to point at those copies.
//!
//! New unit files are staged as `{unit}.unit.new` during activation and only
//! renamed into place when the new package set is committed.

use crate::config::RESERVED_UNIT_NAMES;
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Suffix for staged unit files. Distinct from `.new` so an install root
/// doubling as the systemd base dir doesn't lose unrelated `.new` entries.
pub const NEW_UNIT_SUFFIX: &str = ".unit.new";

/// Exit code systemctl uses for "unit not loaded"
const SYSTEMCTL_UNIT_NOT_FOUND: i32 = 5;

/// Control over the host's service manager
pub trait ServiceManager {
    /// Stop a unit. Stopping a unit systemd doesn't know is not an error.
    fn stop(&self, unit: &str, block: bool) -> Result<()>;

    fn daemon_reload(&self) -> Result<()>;

    fn enable(&self, unit: &str) -> Result<()>;

    fn start(&self, unit: &str, block: bool) -> Result<()>;
}

/// `systemctl` on the live host
#[derive(Debug, Default, Clone, Copy)]
pub struct Systemctl;

impl Systemctl {
    fn run(args: &[&str]) -> Result<i32> {
        let status = Command::new("systemctl")
            .args(args)
            .status()
            .map_err(|e| Error::CommandFailed(format!("Failed to run systemctl {}: {e}", args.join(" "))))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn check(args: &[&str]) -> Result<()> {
        match Self::run(args)? {
            0 => Ok(()),
            code => Err(Error::CommandFailed(format!(
                "systemctl {} exited with status {code}",
                args.join(" ")
            ))),
        }
    }
}

impl ServiceManager for Systemctl {
    fn stop(&self, unit: &str, block: bool) -> Result<()> {
        let mut args = vec!["stop", unit];
        if !block {
            args.push("--no-block");
        }
        match Self::run(&args)? {
            0 => Ok(()),
            // Happens right after a bootstrap tarball is extracted, before
            // anything was started.
            SYSTEMCTL_UNIT_NOT_FOUND => {
                debug!("Unit {} not loaded, nothing to stop", unit);
                Ok(())
            }
            code => Err(Error::CommandFailed(format!("systemctl stop {unit} exited with status {code}"))),
        }
    }

    fn daemon_reload(&self) -> Result<()> {
        Self::check(&["daemon-reload"])
    }

    fn enable(&self, unit: &str) -> Result<()> {
        Self::check(&["enable", unit])?;
        info!("Enabled systemd unit '{}'", unit);
        Ok(())
    }

    fn start(&self, unit: &str, block: bool) -> Result<()> {
        let mut args = vec!["start", unit];
        if !block {
            args.push("--no-block");
        }
        Self::check(&args)
    }
}

/// Unit files belonging to one wants directory
pub struct Systemd {
    unit_directory: PathBuf,
    base_systemd: PathBuf,
    /// Actually stop units; off for scratch roots and bootstrap builds
    active: bool,
    block: bool,
    manager: Box<dyn ServiceManager>,
}

impl Systemd {
    pub fn new(
        unit_directory: impl Into<PathBuf>,
        active: bool,
        block: bool,
        manager: Box<dyn ServiceManager>,
    ) -> Self {
        let unit_directory = unit_directory.into();
        let base_systemd = unit_directory
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            unit_directory,
            base_systemd,
            active,
            block,
            manager,
        }
    }

    pub fn unit_directory(&self) -> &Path {
        &self.unit_directory
    }

    pub fn base_systemd(&self) -> &Path {
        &self.base_systemd
    }

    pub fn manager(&self) -> &dyn ServiceManager {
        self.manager.as_ref()
    }

    /// Stop every unit in the live wants directory
    pub fn stop_all(&self) -> Result<()> {
        if !self.active || !self.unit_directory.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(&self.unit_directory)? {
            let entry = entry?;
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            self.manager.stop(&name, self.block)?;
        }
        Ok(())
    }

    /// Remove `*.unit.new` files left by an activation that never committed
    pub fn remove_staged_unit_files(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.base_systemd) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(NEW_UNIT_SUFFIX) {
                debug!("Removing stale staged unit {}", entry.path().display());
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Copy the units linked from `new_wants_dir` next to the base directory
    ///
    /// Each link is rewritten to point at `{base}/{unit}`, which only exists
    /// once [`Systemd::activate_new_unit_files`] has run.
    pub fn stage_new_units(&self, new_wants_dir: &Path) -> Result<()> {
        for unit_name in Self::unit_names(new_wants_dir)? {
            let wants_symlink_path = new_wants_dir.join(&unit_name);
            let package_file_path = fs::canonicalize(&wants_symlink_path)?;
            let systemd_file_path = self.base_systemd.join(&unit_name);
            let tmp_systemd_file_path = staged_path(&systemd_file_path);

            // fs::copy carries the permission bits over
            fs::copy(&package_file_path, &tmp_systemd_file_path)?;

            fs::remove_file(&wants_symlink_path)?;
            unix_fs::symlink(&systemd_file_path, &wants_symlink_path)?;
            debug!(
                "Staged {} from {}",
                tmp_systemd_file_path.display(),
                package_file_path.display()
            );
        }
        Ok(())
    }

    /// Remove the unit files of the live wants directory from the base dir
    pub fn remove_unit_files(&self) -> Result<()> {
        if !self.unit_directory.exists() {
            return Ok(());
        }

        for unit_name in Self::unit_names(&self.unit_directory)? {
            match fs::remove_file(self.base_systemd.join(&unit_name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Move staged unit files to their final names
    ///
    /// A unit with no staged file but a live one was already moved by an
    /// earlier, interrupted run and is left alone.
    pub fn activate_new_unit_files(&self) -> Result<()> {
        if !self.unit_directory.exists() {
            return Ok(());
        }

        for unit_name in Self::unit_names(&self.unit_directory)? {
            let systemd_file_path = self.base_systemd.join(&unit_name);
            let staged = staged_path(&systemd_file_path);
            if staged.exists() {
                fs::rename(&staged, &systemd_file_path)?;
            } else if systemd_file_path.exists() {
                debug!("Unit {} already in place", unit_name);
            } else {
                warn!("No unit file staged for {}", unit_name);
            }
        }
        Ok(())
    }

    /// Entries of a wants directory; a reserved unit name is an error
    pub fn unit_names(unit_dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(unit_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if RESERVED_UNIT_NAMES.contains(&name.as_str()) {
                return Err(Error::ValidationError(format!("Reserved name encountered - {name}.")));
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

fn staged_path(systemd_file_path: &Path) -> PathBuf {
    let mut name = systemd_file_path.as_os_str().to_owned();
    name.push(NEW_UNIT_SUFFIX);
    PathBuf::from(name)
}
