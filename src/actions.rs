// src/actions.rs

//! Host operations behind the command line
//!
//! Each function here is one user-facing action against an [`Install`] and
//! its [`Repository`]: activating and swapping packages, moving packages in
//! and out of the repository, first-boot setup, uninstall, and running
//! package health checks.

use crate::archive::{copy_tree, extract_tarball};
use crate::config::DCOS_TARGET_CONTENTS;
use crate::download::repository_fetcher;
use crate::error::{Error, Result};
use crate::install::{remove_path, Install, INSTALL_PROGRESS_FILENAME};
use crate::package::PackageId;
use crate::repository::Repository;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

const DCOS_TARGET: &str = "dcos.target";
const PACKAGE_SUFFIX: &str = ".tar.xz";

/// Replace the active package set with `package_ids`
pub fn activate_packages<S: AsRef<str>>(
    install: &Install,
    repository: &Repository,
    package_ids: &[S],
    systemd: bool,
    block_systemd: bool,
) -> Result<()> {
    install.activate(&repository.load_packages(package_ids)?)?;
    if systemd {
        start_dcos_target(install, block_systemd)?;
    }
    Ok(())
}

/// Replace the active package named like `package_id` with `package_id`
pub fn swap_active_package(
    install: &Install,
    repository: &Repository,
    package_id: &str,
    systemd: bool,
    block_systemd: bool,
) -> Result<()> {
    let mut packages_by_name = BTreeMap::new();
    for id in install.get_active()? {
        let pkg_id: PackageId = id.parse()?;
        packages_by_name.insert(pkg_id.name().to_string(), pkg_id);
    }

    let new_id: PackageId = package_id.parse()?;
    if !packages_by_name.contains_key(new_id.name()) {
        return Err(Error::ValidationError(format!(
            "No package with name {} currently active to swap with.",
            new_id.name()
        )));
    }
    packages_by_name.insert(new_id.name().to_string(), new_id);

    let new_active: Vec<String> = packages_by_name.values().map(ToString::to_string).collect();
    activate_packages(install, repository, &new_active, systemd, block_systemd)
}

fn start_dcos_target(install: &Install, block_systemd: bool) -> Result<()> {
    let manager = install.systemd().manager();
    manager.daemon_reload()?;
    manager.enable(DCOS_TARGET)?;
    manager.start(DCOS_TARGET, block_systemd)
}

/// Fetch `package_id` from a remote repository into `repository`
///
/// `work_dir` resolves relative `file://` urls.
pub fn fetch_package(repository: &Repository, repository_url: &str, package_id: &str, work_dir: &Path) -> Result<()> {
    info!("Fetching: {}", package_id);
    repository
        .add(
            |id, target| repository_fetcher(repository_url, id, target, work_dir),
            package_id,
        )
        .map_err(|e| match e {
            Error::Fetch(e) => Error::PackageError(format!("Unable to fetch package {package_id}: {e}")),
            other => other,
        })?;
    info!("Fetched: {}", package_id);
    Ok(())
}

/// Add a `{id}.tar.xz` package tarball to `repository`
pub fn add_package_file(repository: &Repository, package_filename: &Path) -> Result<bool> {
    let name = package_filename
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(pkg_id) = name.strip_suffix(PACKAGE_SUFFIX) else {
        return Err(Error::ValidationError(format!(
            "Can only add package tarballs which have names like {{pkg-id}}{PACKAGE_SUFFIX}. Got {name}"
        )));
    };

    // Validate before touching the repository
    let _: PackageId = pkg_id.parse()?;

    repository.add(|_, target| extract_tarball(package_filename, target), pkg_id)
}

/// Remove a package from `repository`, refusing active packages
pub fn remove_package(install: &Install, repository: &Repository, package_id: &str) -> Result<()> {
    if install.get_active()?.contains(package_id) {
        return Err(Error::PackageConflict(format!(
            "Refusing to remove active package {package_id}"
        )));
    }

    info!("Removing: {}", package_id);
    package_id
        .parse::<PackageId>()
        .map_err(|_| Error::ValidationError(format!("Invalid package id {package_id}")))?;
    repository.remove(package_id)?;
    info!("Removed: {}", package_id);
    Ok(())
}

/// First boot setup of a host and recovery of interrupted swaps
///
/// A root carrying the `bootstrap` sentinel (as extracted from a bootstrap
/// tarball) gets its final package set activated and `dcos.target`
/// installed. Afterwards any swap interrupted by a crash is finished.
pub fn setup(install: &Install, repository: &Repository, block_systemd: bool) -> Result<()> {
    let bootstrap_path = install.root().join("bootstrap");
    if bootstrap_path.exists() {
        let dcos_target_dir = dcos_target_dir(install);
        fs::create_dir_all(&dcos_target_dir)?;
        fs::write(dcos_target_dir.join(DCOS_TARGET), DCOS_TARGET_CONTENTS)?;

        do_bootstrap(install, repository)?;

        // Only enable dcos.target once it's populated with the new set
        if install.manage_systemd() {
            start_dcos_target(install, block_systemd)?;
        }
        fs::remove_file(&bootstrap_path)?;
    }

    if install.root().join(INSTALL_PROGRESS_FILENAME).exists() {
        let (took_action, msg) = install.recover_swap_active()?;
        if !took_action {
            info!("No recovery performed: {}", msg);
        }
    }
    Ok(())
}

fn dcos_target_dir(install: &Install) -> PathBuf {
    install
        .systemd_dir()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| install.root().to_path_buf())
}

fn load_json_file(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::ParseError(format!("Unable to parse json in {}: {e}", path.display())))
}

fn id_list(value: Value, path: &Path) -> Result<Vec<String>> {
    let invalid = || {
        Error::ValidationError(format!(
            "{} should contain a JSON list of package ids",
            path.display()
        ))
    };
    let Value::Array(items) = value else {
        return Err(invalid());
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(id) => Ok(id),
            _ => Err(invalid()),
        })
        .collect()
}

fn do_bootstrap(install: &Install, repository: &Repository) -> Result<()> {
    let flag = |name: &str| install.get_config_filename(name).filter(|p| p.exists());

    // Written by whatever provisioned the host
    let repository_url = match flag("setup-flags/repository-url") {
        Some(path) => Some(fs::read_to_string(path)?.trim().to_string()),
        None => None,
    };
    let work_dir = std::env::current_dir()?;
    let remote_fetch = |id: &PackageId, target: &Path| -> Result<()> {
        let Some(url) = &repository_url else {
            return Err(Error::ValidationError(format!(
                "Non-local package {id} but no repository url given."
            )));
        };
        repository_fetcher(url, id, target, &work_dir)
    };

    // Host specific packages are copied in as-is, never merged with an
    // existing package of the same id.
    let mut setup_packages = Vec::new();
    if let Some(setup_pkg_dir) = flag("setup-packages") {
        let mut entries: Vec<String> = fs::read_dir(&setup_pkg_dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();

        for pkg_id_str in entries {
            info!("Installing setup package: {}", pkg_id_str);
            if !PackageId::is_id(&pkg_id_str) {
                return Err(Error::ValidationError(format!(
                    "Invalid package id in setup package: {pkg_id_str}"
                )));
            }
            let pkg_id: PackageId = pkg_id_str.parse()?;
            if pkg_id.version() != "setup" {
                return Err(Error::ValidationError(format!(
                    "Setup packages (those in `{}`) must have the version setup. Bad package: {pkg_id_str}",
                    setup_pkg_dir.display()
                )));
            }

            if repository.has_package(&pkg_id_str)? {
                warn!("Ignoring already installed package {}", pkg_id_str);
            }
            let src = setup_pkg_dir.join(&pkg_id_str);
            repository.add(|_, target| copy_tree(&src, target), &pkg_id_str)?;
            setup_packages.push(pkg_id_str);
        }
    }

    let mut to_activate: BTreeSet<String> = BTreeSet::new();
    if let Some(active_path) = flag("setup-flags/active.json") {
        info!("Loaded active packages from {}", active_path.display());
        let ids = id_list(load_json_file(&active_path)?, &active_path)?;
        info!("Ensuring all packages in active set {} are local", ids.join(","));
        for id in &ids {
            repository.add(remote_fetch, id)?;
        }
        to_activate.extend(ids);
    } else {
        info!("Calculated active packages from bootstrap tarball");
        to_activate.extend(install.get_active()?);

        match flag("setup-flags/cluster-packages.json") {
            Some(cluster_path) => {
                let ids = id_list(load_json_file(&cluster_path)?, &cluster_path)?;
                info!("Loading cluster-packages: {}", ids.join(","));
                for id in ids {
                    let _: PackageId = id.parse()?;
                    if !repository.has_package(&id)? {
                        repository.add(remote_fetch, &id)?;
                    }
                    setup_packages.push(id);
                }
            }
            None => info!("No cluster-packages specified"),
        }
    }
    to_activate.extend(setup_packages);

    info!("Activating packages");
    install.activate(&repository.load_packages(&to_activate)?)
}

/// Deactivate everything and delete the install root
pub fn uninstall(install: &Install) -> Result<()> {
    info!("Uninstalling DC/OS");

    let dcos_target = dcos_target_dir(install).join(DCOS_TARGET);
    info!("Removing {}", dcos_target.display());
    remove_path(&dcos_target)?;

    info!("Deactivating all packages");
    install.activate(&[])?;

    info!("Removing all runtime / activation directories");
    let active_names = install.get_active_names();
    let mut all_names = Vec::with_capacity(active_names.len() * 3);
    for name in &active_names {
        all_names.push(name.clone());
        all_names.push(crate::install::with_extension(name, ".new"));
        all_names.push(crate::install::with_extension(name, ".old"));
    }

    let root = Path::new("/");
    if all_names.iter().any(|n| n == root) || install.root() == root {
        let listed: Vec<String> = all_names
            .iter()
            .chain(std::iter::once(&install.root().to_path_buf()))
            .map(|p| p.display().to_string())
            .collect();
        return Err(Error::InstallError(format!(
            "Cowardly refusing to rm -rf '/' as part of uninstall. Uninstall directories: {}",
            listed.join(",")
        )));
    }

    for name in &all_names {
        remove_path(name)?;
    }
    remove_path(install.root())
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Executable checks of every active package, keyed by package id
///
/// Packages without checks are left out.
pub fn find_checks(install: &Install, repository: &Repository) -> Result<BTreeMap<String, Vec<String>>> {
    let mut checks = BTreeMap::new();
    for package_id in install.get_active()? {
        let check_dir = repository.load(&package_id)?.check_dir();
        if !check_dir.is_dir() {
            continue;
        }

        let mut names: Vec<String> = fs::read_dir(&check_dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();

        let mut package_checks = Vec::new();
        for name in names {
            if !is_executable(&check_dir.join(&name)) {
                warn!("`{}` is not executable", name);
                continue;
            }
            package_checks.push(name);
        }
        if !package_checks.is_empty() {
            checks.insert(package_id, package_checks);
        }
    }
    Ok(checks)
}

/// `check --list` output
pub fn format_checks(checks: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for (package_id, files) in checks {
        let _ = writeln!(out, "{package_id}");
        for file in files {
            let _ = writeln!(out, " - {file}");
        }
    }
    out
}

/// Run every check, returning the process exit code (1 if any failed)
pub fn run_checks(checks: &BTreeMap<String, Vec<String>>, repository: &Repository) -> Result<i32> {
    let mut exit_code = 0;
    for (package_id, files) in checks {
        let check_dir = repository.load(package_id)?.check_dir();
        for file in files {
            let passed = match Command::new(check_dir.join(file)).status() {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!("Unable to run {}: {}", file, e);
                    false
                }
            };
            if !passed {
                warn!("Check failed: {}", file);
                exit_code = 1;
            }
        }
    }
    Ok(exit_code)
}

/// `list` output: single versions as plain ids, multiple grouped by name
pub fn format_repo_list(packages: &BTreeSet<String>) -> Result<String> {
    let mut groups: Vec<(String, Vec<PackageId>)> = Vec::new();
    for id in packages {
        let pkg_id: PackageId = id.parse()?;
        match groups.last_mut() {
            Some((name, group)) if name == pkg_id.name() => group.push(pkg_id),
            _ => groups.push((pkg_id.name().to_string(), vec![pkg_id])),
        }
    }

    let mut out = String::new();
    for (name, group) in groups {
        if let [only] = group.as_slice() {
            let _ = writeln!(out, "{only}");
        } else {
            let _ = writeln!(out, "{name}:");
            for pkg_id in &group {
                let _ = writeln!(out, "  {}", pkg_id.version());
            }
        }
    }
    Ok(out)
}
