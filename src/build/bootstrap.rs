// src/build/bootstrap.rs

//! Bootstrap tarballs: a ready to run `/opt/mesosphere` with a set of
//! packages already activated

use super::store::PackageStore;
use crate::archive::{extract_tarball, make_tar, rewrite_symlinks};
use crate::config::{variant_name, variant_prefix, InstallOptions};
use crate::error::{Error, Result};
use crate::hash::hash_checkout;
use crate::install::Install;
use crate::repository::Repository;
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

const PACKAGE_EXTENSION: &str = ".tar.xz";

/// Package id of a `{id}.tar.xz` tarball path
pub(crate) fn package_id_from_path(path: &Path) -> Result<String> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    filename
        .strip_suffix(PACKAGE_EXTENSION)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::BuildError(format!(
                "Packages must be packaged / end with a .tar.xz. Got {filename}"
            ))
        })
}

/// Build (or reuse) the bootstrap tarball for a set of package tarballs
///
/// The bootstrap id is the hash of the sorted package ids, so the same set
/// of packages always maps to the same tarball. Outputs in the bootstrap
/// cache are `{id}.bootstrap.tar.xz`, `{id}.active.json`, and
/// `[variant.]bootstrap.latest` holding the id. The tarball and active list
/// are renamed into place (tarball first) and `latest` is written last, so a
/// bootstrap counts as built only once both files exist.
pub fn make_bootstrap_tarball(store: &PackageStore, package_paths: &[PathBuf], variant: Option<&str>) -> Result<String> {
    let mut packages = package_paths
        .iter()
        .map(|path| Ok((package_id_from_path(path)?, path.clone())))
        .collect::<Result<Vec<(String, PathBuf)>>>()?;
    packages.sort();
    let pkg_ids: Vec<String> = packages.iter().map(|(id, _)| id.clone()).collect();

    let bootstrap_cache_dir = store.get_bootstrap_cache_dir();
    let bootstrap_id = hash_checkout(&Value::from(pkg_ids.clone()))?;
    let latest_name = bootstrap_cache_dir.join(format!("{}bootstrap.latest", variant_prefix(variant)));
    let bootstrap_name = bootstrap_cache_dir.join(format!("{bootstrap_id}.bootstrap.tar.xz"));
    let active_name = bootstrap_cache_dir.join(format!("{bootstrap_id}.active.json"));

    let mark_latest = || -> Result<String> {
        fs::write(&latest_name, &bootstrap_id)?;
        info!("bootstrap: {}", bootstrap_name.display());
        info!("active: {}", active_name.display());
        info!("latest: {}", latest_name.display());
        Ok(bootstrap_id.clone())
    };

    if bootstrap_name.exists() && active_name.exists() {
        info!("Bootstrap already up to date, not recreating");
        return mark_latest();
    }

    fs::create_dir_all(&bootstrap_cache_dir)?;

    if store.try_fetch_bootstrap_and_active(&bootstrap_id)? {
        info!("Bootstrap already up to date, Not recreating. Downloaded from repository-url.");
        return mark_latest();
    }

    info!("Unable to download from cache. Building.");
    info!("Creating bootstrap tarball for variant {}", variant_name(variant));

    let work_dir = tempfile::Builder::new().prefix("mkpanda_bootstrap_tmp").tempdir()?;
    let pkgpanda_root = work_dir.path().join("opt/mesosphere");
    let repository_dir = pkgpanda_root.join("packages");
    fs::create_dir_all(&repository_dir)?;
    let repository = Repository::new(&repository_dir)?;

    for (pkg_id, pkg_path) in &packages {
        repository.add(|_, target| extract_tarball(pkg_path, target), pkg_id)?;
    }

    // No unit handling here; the host's setup activates units on first boot
    let install = Install::system(InstallOptions {
        fake_path: true,
        skip_systemd_dirs: true,
        ..InstallOptions::scratch(&pkgpanda_root)
    })?;
    install.activate(&repository.load_packages(&pkg_ids)?)?;

    // dcos-setup.service only fires on a root marked as a bootstrap
    File::create(pkgpanda_root.join("bootstrap"))?;

    rewrite_symlinks(work_dir.path(), work_dir.path(), Path::new("/"))?;

    let bootstrap_tmp = bootstrap_cache_dir.join(format!("{bootstrap_id}.bootstrap-tmp.tar.xz"));
    make_tar(&bootstrap_tmp, &pkgpanda_root)?;
    fs::rename(&bootstrap_tmp, &bootstrap_name)?;
    drop(install);
    work_dir.close()?;

    let active_tmp = bootstrap_cache_dir.join(format!("{bootstrap_id}.active.json.tmp"));
    fs::write(&active_tmp, serde_json::to_string(&pkg_ids)?)?;
    fs::rename(&active_tmp, &active_name)?;

    info!("Built bootstrap");
    mark_latest()
}
