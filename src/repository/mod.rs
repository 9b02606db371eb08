// src/repository/mod.rs

//! Local content-addressed package repository
//!
//! A repository is a directory with one subdirectory per package id. The
//! directory name is the id, so whether a package is present is purely a
//! question of whether `{root}/{id}` exists. Packages arrive through a
//! fetcher callback that populates `{id}_tmp`, which is renamed into place
//! once complete; a half-extracted package never shows up under its id.

use crate::error::{Error, Result};
use crate::package::{Package, PackageId, PkgInfo};
use serde_json::Value;
use std::cell::OnceCell;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Suffix of the staging directory a package is fetched into before rename
const TMP_SUFFIX: &str = "_tmp";

/// Directory-backed package store
#[derive(Debug)]
pub struct Repository {
    path: PathBuf,
    /// Listing of the root, filled on first use
    packages: OnceCell<BTreeSet<String>>,
}

impl Repository {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        Ok(Self {
            path,
            packages: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_path(&self, id: &str) -> PathBuf {
        self.path.join(id)
    }

    /// Every id in the repository, scanned once per `Repository` value
    ///
    /// Entries that don't look like an id, and `{id}_tmp` staging directories
    /// left by an interrupted [`Repository::add`], are ignored. The result is cached
    /// and never invalidated, so `add`/`remove` on the same value aren't
    /// reflected here.
    pub fn list(&self) -> Result<&BTreeSet<String>> {
        if let Some(packages) = self.packages.get() {
            return Ok(packages);
        }

        let mut packages = BTreeSet::new();
        match fs::read_dir(&self.path) {
            Ok(entries) => {
                for entry in entries {
                    let name = entry?.file_name().to_string_lossy().into_owned();
                    if !name.ends_with(TMP_SUFFIX) && PackageId::is_id(&name) {
                        packages.insert(name);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Not cached; the root may be created later.
                static EMPTY: BTreeSet<String> = BTreeSet::new();
                debug!("Repository {} does not exist yet", self.path.display());
                return Ok(&EMPTY);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.packages.get_or_init(|| packages))
    }

    /// Ids of every package named `name`
    pub fn get_ids(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .iter()
            .filter(|id| id.parse::<PackageId>().is_ok_and(|pkg_id| pkg_id.name() == name))
            .cloned()
            .collect())
    }

    pub fn has_package(&self, id: &str) -> Result<bool> {
        Ok(self.list()?.contains(id))
    }

    /// Load a package and its `pkginfo.json`
    pub fn load(&self, id: &str) -> Result<Package> {
        let pkg_id: PackageId = id.parse()?;

        let path = self.package_path(id);
        if !path.exists() {
            return Err(Error::PackageNotFound(id.to_string()));
        }

        let filename = path.join("pkginfo.json");
        let contents = fs::read_to_string(&filename)
            .map_err(|e| Error::PackageError(format!("No / unreadable pkginfo.json in {id}: {e}")))?;
        let raw: Value = serde_json::from_str(&contents)
            .map_err(|e| Error::PackageError(format!("Invalid pkginfo.json in {id}: {e}")))?;

        if !raw.is_object() {
            return Err(Error::PackageError(format!(
                "Usage should be a dictionary, not a {}",
                json_type_name(&raw)
            )));
        }

        let pkginfo: PkgInfo = serde_json::from_value(raw)
            .map_err(|e| Error::PackageError(format!("Invalid pkginfo.json in {id}: {e}")))?;

        Ok(Package::new(path, pkg_id, pkginfo))
    }

    /// Load several packages, skipping repeated ids
    pub fn load_packages<I, S>(&self, ids: I) -> Result<Vec<Package>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut packages = Vec::new();
        for id in ids {
            let id = id.as_ref();
            if seen.insert(id.to_string()) {
                packages.push(self.load(id)?);
            }
        }
        Ok(packages)
    }

    /// Add a package using `fetcher` to populate its directory
    ///
    /// Returns `false` without calling the fetcher if the package is already
    /// present.
    pub fn add<F>(&self, fetcher: F, id: &str) -> Result<bool>
    where
        F: FnOnce(&PackageId, &Path) -> Result<()>,
    {
        let pkg_id: PackageId = id.parse()?;

        let pkg_path = self.package_path(id);
        if pkg_path.exists() {
            info!("Package {} already added", id);
            return Ok(false);
        }

        let tmp_path = self.package_path(&format!("{id}{TMP_SUFFIX}"));
        remove_dir_if_exists(&tmp_path)?;

        fetcher(&pkg_id, &tmp_path)?;
        fs::rename(&tmp_path, &pkg_path)?;
        debug!("Added {} to {}", id, self.path.display());
        Ok(true)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.package_path(id);
        if !path.exists() {
            return Err(Error::PackageNotFound(id.to_string()));
        }
        fs::remove_dir_all(&path)?;
        info!("Removed {}", id);
        Ok(())
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
