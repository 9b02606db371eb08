// src/install/mod.rs

//! Activation of package sets on an install root
//!
//! The live state of a host is a handful of well-known directories (`bin`,
//! `etc`, `include`, `lib`, the systemd wants dir) full of symlinks into
//! package directories, plus `environment`, `environment.export`, `active`
//! and `active.buildinfo.full.json`. Activating a new set builds all of
//! these under a `.new` suffix, then swaps them in:
//!
//! 1. stable
//! 2. staging: every `{name}.new` populated
//! 3. archiving: services stopped, live names renamed to `{name}.old`
//! 4. committing: `{name}.new` renamed to `{name}`
//! 5. stable
//!
//! Steps 3 and 4 are recorded in the `install_progress` breadcrumb so
//! [`Install::recover_swap_active`] can finish a swap cut short by a crash.

mod progress;
mod systemd;

pub use progress::{SwapProgress, SwapStage};
pub use systemd::{NEW_UNIT_SUFFIX, ServiceManager, Systemctl, Systemd};

#[cfg(test)]
pub(crate) use systemd::tests::FakeServices;

use crate::config::{
    DCOS_SERVICE_CONFIGURATION_FILE, INSTALL_ROOT, InstallOptions, SYSCTL_SETTING_KEY, SYSTEMD_WANTS_DIR,
    variant_name,
};
use crate::error::{Error, Result};
use crate::package::Package;
use crate::users::{SystemUsers, UserManagement, UserProvisioner};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const ENVIRONMENT_FILENAME: &str = "environment";
pub const ENVIRONMENT_EXPORT_FILENAME: &str = "environment.export";
pub const ACTIVE_DIR: &str = "active";
pub const ACTIVE_BUILDINFO_FILENAME: &str = "active.buildinfo.full.json";
pub const INSTALL_PROGRESS_FILENAME: &str = "install_progress";

/// Variables pkgpanda sets itself
pub const RESERVED_ENV_VARS: &[&str] = &["LD_LIBRARY_PATH", "PATH"];

const WELL_KNOWN_DIRS: &[&str] = &["bin", "etc", "include", "lib"];

fn env_header(root: &str) -> String {
    format!(
        "# Pkgpanda provided environment variables\n\
         LD_LIBRARY_PATH={root}/lib\n\
         PATH={root}/bin:/usr/bin:/bin:/sbin\n\n"
    )
}

fn env_export_header(root: &str) -> String {
    format!(
        "# Pkgpanda provided environment variables\n\
         export LD_LIBRARY_PATH={root}/lib\n\
         export PATH=\"{root}/bin:$PATH\"\n\n"
    )
}

/// `path` with `ext` appended to its final component
pub(crate) fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(ext);
    PathBuf::from(name)
}

/// Check that a set of packages can be activated together
pub fn validate_compatible(packages: &[Package]) -> Result<()> {
    let mut names = HashSet::new();
    for package in packages {
        if !names.insert(package.name()) {
            let ids: Vec<String> = packages.iter().map(|p| p.id().to_string()).collect();
            return Err(Error::ValidationError(format!(
                "Repeated name {} in set of packages {}",
                package.name(),
                ids.join(" ")
            )));
        }

        if package.username().is_none() && package.group().is_some() {
            return Err(Error::ValidationError(
                "`group` cannot be used without `username`".to_string(),
            ));
        }
    }

    // Requires are only checked by name. They exist to make it harder to
    // accidentally break a cluster, not to pin variants.
    let mut environment: HashMap<&str, &Package> = HashMap::new();
    let mut sysctl_map: HashMap<&str, &str> = HashMap::new();

    for package in packages {
        for requirement in package.requirements()? {
            if !names.contains(requirement.name()) {
                let ids: Vec<String> = packages.iter().map(|p| p.id().to_string()).collect();
                return Err(Error::ValidationError(format!(
                    "Package {} variant {} requires {} variant {} but that is not in the set of packages {}",
                    package.id(),
                    variant_name(package.variant()),
                    requirement.name(),
                    variant_name(requirement.variant()),
                    ids.join(", ")
                )));
            }
        }

        for key in package.environment().keys() {
            if RESERVED_ENV_VARS.contains(&key.as_str()) {
                return Err(Error::ValidationError(format!(
                    "{} are reserved environment vars and cannot be specified in packages. Present in package {}",
                    RESERVED_ENV_VARS.join(", "),
                    package.id()
                )));
            }
            if let Some(previous) = environment.insert(key, package) {
                return Err(Error::ValidationError(format!(
                    "Repeated environment variable {key}. In both packages {} and {}.",
                    previous.id(),
                    package.id()
                )));
            }
        }

        for (service, settings) in package.sysctl() {
            for (var, value) in settings {
                match sysctl_map.get(var.as_str()) {
                    Some(existing) if *existing != value.as_str() => {
                        return Err(Error::ValidationError(format!(
                            "Conflicting sysctl setting {var}={value} present in the service {service}"
                        )));
                    }
                    _ => {
                        sysctl_map.insert(var, value);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Mirror `src` into `dest` as a tree of real directories and symlinks
///
/// Directories are created (or merged into existing ones) and every file or
/// symlink inside becomes a symlink to the original. Directories are never
/// merged into a symlink, since that would edit inside another package.
pub fn symlink_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            match fs::symlink_metadata(&dest_path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(Error::ValidationError(format!(
                        "Can't merge a file `{}` and directory (or symlink) `{}` with the same name.",
                        src_path.display(),
                        dest_path.display()
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(&dest_path)?,
                Err(e) => return Err(e.into()),
            }
            symlink_tree(&src_path, &dest_path)?;
        } else {
            unix_fs::symlink(&src_path, &dest_path).map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::ConflictingFile {
                    src: src_path.clone(),
                    dest: dest_path.clone(),
                    reason: e.to_string(),
                },
                _ => Error::Io(e),
            })?;
        }
    }
    Ok(())
}

/// Stems of every `*.service` file inside a package
fn service_names(dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy();
            name.strip_suffix(".service").map(str::to_string)
        })
        .collect()
}

pub(crate) fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Recursively give `path` to `uid`; symlinks are left alone
fn chown_recursive(path: &Path, uid: u32) -> Result<()> {
    let owner = Some(nix::unistd::Uid::from_raw(uid));
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {e}", path.display())))?;
        if entry.path_is_symlink() {
            continue;
        }
        nix::unistd::chown(entry.path(), owner, None).map_err(|e| {
            Error::IoError(format!("Failed to chown {} to {uid}: {e}", entry.path().display()))
        })?;
    }
    Ok(())
}

/// An install root and how to activate packages into it
pub struct Install {
    root: PathBuf,
    config_dir: Option<PathBuf>,
    /// Absolute wants directory
    systemd_dir: PathBuf,
    manage_systemd: bool,
    roles: Vec<String>,
    /// Absolute paths of the well-known directories
    well_known_dirs: Vec<PathBuf>,
    fake_path: bool,
    skip_systemd_dirs: bool,
    manage_users: bool,
    add_users: bool,
    manage_state_dir: bool,
    state_dir_root: PathBuf,
    systemd: Systemd,
    users: Box<dyn UserProvisioner>,
}

impl Install {
    pub fn new(
        options: InstallOptions,
        services: Box<dyn ServiceManager>,
        users: Box<dyn UserProvisioner>,
    ) -> Result<Self> {
        let root = std::path::absolute(&options.root)?;
        let config_dir = options
            .config_dir
            .as_deref()
            .map(std::path::absolute)
            .transpose()?;

        let systemd_dir = if options.rooted_systemd {
            root.join("dcos.target.wants")
        } else {
            PathBuf::from(SYSTEMD_WANTS_DIR)
        };

        let mut roles = Vec::new();
        if let Some(config_dir) = &config_dir {
            match fs::read_dir(config_dir.join("roles")) {
                Ok(entries) => {
                    for entry in entries {
                        roles.push(entry?.file_name().to_string_lossy().into_owned());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        roles.sort();

        let mut well_known_dirs: Vec<PathBuf> = WELL_KNOWN_DIRS.iter().map(|d| root.join(d)).collect();
        if !options.skip_systemd_dirs {
            well_known_dirs.push(systemd_dir.clone());
        }

        let systemd = Systemd::new(
            systemd_dir.clone(),
            options.manage_systemd,
            options.block_systemd,
            services,
        );

        Ok(Self {
            root,
            config_dir,
            systemd_dir,
            manage_systemd: options.manage_systemd,
            roles,
            well_known_dirs,
            fake_path: options.fake_path,
            skip_systemd_dirs: options.skip_systemd_dirs,
            manage_users: options.manage_users,
            add_users: options.add_users,
            manage_state_dir: options.manage_state_dir,
            state_dir_root: options.state_dir_root,
            systemd,
            users,
        })
    }

    /// Install talking to the real systemd and user database
    pub fn system(options: InstallOptions) -> Result<Self> {
        Self::new(options, Box::new(Systemctl), Box::new(SystemUsers))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn systemd_dir(&self) -> &Path {
        &self.systemd_dir
    }

    pub fn manage_systemd(&self) -> bool {
        self.manage_systemd
    }

    pub fn systemd(&self) -> &Systemd {
        &self.systemd
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn get_active_dir(&self) -> PathBuf {
        self.root.join(ACTIVE_DIR)
    }

    /// Ids of the active packages, from the targets of `active/*`
    ///
    /// Ids aren't validated so a damaged active dir can still be inspected.
    pub fn get_active(&self) -> Result<BTreeSet<String>> {
        let active_dir = self.get_active_dir();

        if !active_dir.exists() {
            if with_extension(&active_dir, ".old").exists() || with_extension(&active_dir, ".new").exists() {
                return Err(Error::InstallError(format!(
                    "Broken past deploy. See {0}.new for what the (potentially incomplete) new state \
                     should be and optionally {0}.old if it exists for the complete previous state.",
                    active_dir.display()
                )));
            }
            return Err(Error::InstallError(format!(
                "Install directory {} has no active folder. Has it been bootstrapped?",
                self.root.display()
            )));
        }

        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&active_dir)? {
            let path = entry?.path();
            let target = match fs::canonicalize(&path) {
                Ok(target) => target,
                Err(_) => fs::read_link(&path).unwrap_or(path),
            };
            if let Some(name) = target.file_name() {
                ids.insert(name.to_string_lossy().into_owned());
            }
        }
        Ok(ids)
    }

    pub fn get_config_filename(&self, name: &str) -> Option<PathBuf> {
        self.config_dir.as_ref().map(|dir| dir.join(name))
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.get_config_filename(name).is_some_and(|p| p.exists())
    }

    /// Every live path owned by the active set
    pub fn get_active_names(&self) -> Vec<PathBuf> {
        let mut names = self.well_known_dirs.clone();
        for name in [
            ENVIRONMENT_FILENAME,
            ENVIRONMENT_EXPORT_FILENAME,
            ACTIVE_DIR,
            ACTIVE_BUILDINFO_FILENAME,
        ] {
            names.push(self.root.join(name));
        }
        names
    }

    fn progress_path(&self) -> PathBuf {
        self.root.join(INSTALL_PROGRESS_FILENAME)
    }

    /// Build the `.new` state for `packages` and swap it in
    pub fn activate(&self, packages: &[Package]) -> Result<()> {
        validate_compatible(packages)?;

        let active_names = self.get_active_names();
        let mut active_dirs = self.well_known_dirs.clone();
        active_dirs.push(self.get_active_dir());

        for name in &active_names {
            remove_path(&with_extension(name, ".new"))?;
            remove_path(&with_extension(name, ".old"))?;
        }

        if !self.skip_systemd_dirs {
            self.systemd.remove_staged_unit_files()?;
        }

        for dir in &active_dirs {
            fs::create_dir_all(with_extension(dir, ".new"))?;
        }

        let root_str = if self.fake_path {
            INSTALL_ROOT.to_string()
        } else {
            self.root.display().to_string()
        };
        let mut env_contents = env_header(&root_str);
        let mut env_export_contents = env_export_header(&root_str);

        let mut active_buildinfo_full = Map::new();
        let mut service_sysctl: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut sysusers = UserManagement::new(self.manage_users, self.add_users, self.users.as_ref());

        let active_new = with_extension(&self.get_active_dir(), ".new");

        for package in packages {
            for dir in &self.well_known_dirs {
                let new_dir = with_extension(dir, ".new");
                // The wants dir is a full path on the host, but always top level
                // inside a package.
                let dir_name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let mut sources = vec![package.path().join(&dir_name)];
                sources.extend(
                    self.roles
                        .iter()
                        .map(|role| package.path().join(format!("{dir_name}_{role}"))),
                );

                for src in sources.iter().filter(|s| s.is_dir()) {
                    symlink_tree(src, &new_dir).map_err(|e| match e {
                        Error::ConflictingFile { src, dest, .. } => Error::ValidationError(format!(
                            "Two packages are trying to install the same file {} or two roles in the set \
                             of roles {:?} are causing a package to try activating multiple versions of \
                             the same file. One of the package files is {}.",
                            dest.display(),
                            self.roles,
                            src.display()
                        )),
                        other => other,
                    })?;
                }
            }

            unix_fs::symlink(package.path(), active_new.join(package.name()))?;

            env_contents.push_str(&format!("# package: {}\n", package.id()));
            env_export_contents.push_str(&format!("# package: {}\n", package.id()));
            for (k, v) in package.environment() {
                env_contents.push_str(&format!("{k}={v}\n"));
                env_export_contents.push_str(&format!("export {k}={v}\n"));
            }
            env_contents.push('\n');
            env_export_contents.push('\n');

            // Setup packages don't ship a buildinfo.full.json
            let buildinfo = match fs::read_to_string(package.path().join("buildinfo.full.json")) {
                Ok(contents) => serde_json::from_str(&contents)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Value::Null,
                Err(e) => return Err(e.into()),
            };
            active_buildinfo_full.insert(package.name().to_string(), buildinfo);

            // The state dir, package name and username must agree, otherwise an
            // upgrade could chown files away from the service that owns them.
            if let Some(username) = package.username() {
                sysusers.add_user(username, package.group())?;
            }

            if self.manage_state_dir && package.state_directory() {
                let state_dir = self.state_dir_root.join(package.name());
                fs::create_dir_all(&state_dir)?;
                if let Some(username) = package.username() {
                    let uid = sysusers.get_uid(username)?;
                    chown_recursive(&state_dir, uid)?;
                }
            }

            if !package.sysctl().is_empty() {
                let services = service_names(package.path());
                if services.is_empty() {
                    return Err(Error::ValidationError(format!(
                        "service name required for sysctl could not be determined for {}",
                        package.id()
                    )));
                }
                for service in services {
                    if let Some(settings) = package.sysctl().get(&service) {
                        service_sysctl.insert(service, settings.clone());
                    }
                }
            }
        }

        if !self.skip_systemd_dirs {
            let new_wants_dir = with_extension(&self.systemd_dir, ".new");
            if new_wants_dir.exists() {
                self.systemd.stage_new_units(&new_wants_dir)?;
            }
        }

        let mut service_configuration = Map::new();
        service_configuration.insert(SYSCTL_SETTING_KEY.to_string(), serde_json::to_value(service_sysctl)?);
        fs::write(
            with_extension(&self.root.join("etc"), ".new").join(DCOS_SERVICE_CONFIGURATION_FILE),
            serde_json::to_string_pretty(&service_configuration)?,
        )?;

        fs::write(
            with_extension(&self.root.join(ENVIRONMENT_FILENAME), ".new"),
            env_contents,
        )?;
        fs::write(
            with_extension(&self.root.join(ENVIRONMENT_EXPORT_FILENAME), ".new"),
            env_export_contents,
        )?;
        fs::write(
            with_extension(&self.root.join(ACTIVE_BUILDINFO_FILENAME), ".new"),
            serde_json::to_string_pretty(&active_buildinfo_full)?,
        )?;

        info!("Activating {} packages in {}", packages.len(), self.root.display());
        self.swap_active(".new", true)
    }

    /// Finish a swap interrupted by a crash
    ///
    /// Returns `(false, reason)` when there was nothing to recover.
    pub fn recover_swap_active(&self) -> Result<(bool, String)> {
        let state_path = self.progress_path();
        let Some(progress) = SwapProgress::load(&state_path)? else {
            return Ok((false, format!("Path does not exist: {}", state_path.display())));
        };

        info!("Recovering swap at stage {:?}", progress.stage);
        match progress.stage {
            SwapStage::Archive => self.swap_active(&progress.extension, true)?,
            SwapStage::MoveNew => self.swap_active(&progress.extension, false)?,
        }
        Ok((true, String::new()))
    }

    /// Replace the live set with the `{name}{extension}` set
    ///
    /// With `archive` the live set is stopped and moved to `.old` first.
    /// Without it (resuming a commit) entries that were already moved are
    /// skipped.
    pub fn swap_active(&self, extension: &str, archive: bool) -> Result<()> {
        let active_names = self.get_active_names();
        let state_path = self.progress_path();

        for active in &active_names {
            let new_path = with_extension(active, extension);
            let resumed = !archive && active.exists();
            if !new_path.exists() && !resumed {
                return Err(Error::InstallError(format!(
                    "Unable to swap active packages. Needed file {} doesn't exist.",
                    new_path.display()
                )));
            }
        }

        if archive {
            SwapProgress::new(extension, SwapStage::Archive).record(&state_path)?;

            if !self.skip_systemd_dirs {
                self.systemd.stop_all()?;
                self.systemd.remove_unit_files()?;
            }

            for active in &active_names {
                if fs::symlink_metadata(active).is_ok() {
                    let old_path = with_extension(active, ".old");
                    remove_path(&old_path)?;
                    fs::rename(active, &old_path)?;
                }
            }
        }

        SwapProgress::new(extension, SwapStage::MoveNew).record(&state_path)?;

        for active in &active_names {
            let new_path = with_extension(active, extension);
            if !new_path.exists() {
                debug!("{} already moved into place", active.display());
                continue;
            }
            fs::rename(&new_path, active)?;
        }

        if !self.skip_systemd_dirs {
            self.systemd.activate_new_unit_files()?;
        }

        SwapProgress::clear(&state_path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Install {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Install")
            .field("root", &self.root)
            .field("config_dir", &self.config_dir)
            .field("systemd_dir", &self.systemd_dir)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageId, PkgInfo};
    use crate::users::tests::FakeUsers;
    use serde_json::json;
    use tempfile::TempDir;

    fn package(root: &Path, id: &str, pkginfo: Value) -> Package {
        let path = root.join(id);
        fs::create_dir_all(&path).unwrap();
        let info: PkgInfo = serde_json::from_value(pkginfo).unwrap();
        Package::new(path, id.parse::<PackageId>().unwrap(), info)
    }

    fn scratch_install(root: &Path) -> Install {
        Install::new(
            InstallOptions::scratch(root),
            Box::new(FakeServices::default()),
            Box::new(FakeUsers::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_validate_repeated_name() {
        let temp = TempDir::new().unwrap();
        let a = package(temp.path(), "a--1", json!({}));
        let a2 = package(temp.path(), "a--2", json!({}));
        let err = validate_compatible(&[a, a2]).unwrap_err();
        assert_eq!(err.to_string(), "Repeated name a in set of packages a--1 a--2");
    }

    #[test]
    fn test_validate_group_without_username() {
        let temp = TempDir::new().unwrap();
        let a = package(temp.path(), "a--1", json!({"group": "dcos_group"}));
        assert!(validate_compatible(&[a]).is_err());
    }

    #[test]
    fn test_validate_missing_requirement() {
        let temp = TempDir::new().unwrap();
        let a = package(temp.path(), "a--1", json!({"requires": ["b"]}));
        let err = validate_compatible(std::slice::from_ref(&a)).unwrap_err();
        assert!(err.to_string().contains("requires b variant <default>"));

        let b = package(temp.path(), "b--1", json!({}));
        validate_compatible(&[a, b]).unwrap();
    }

    #[test]
    fn test_validate_environment() {
        let temp = TempDir::new().unwrap();
        let reserved = package(temp.path(), "a--1", json!({"environment": {"PATH": "/x"}}));
        assert!(validate_compatible(&[reserved]).unwrap_err().to_string().contains("reserved"));

        let a = package(temp.path(), "a--2", json!({"environment": {"FOO": "1"}}));
        let b = package(temp.path(), "b--1", json!({"environment": {"FOO": "2"}}));
        let err = validate_compatible(&[a, b]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Repeated environment variable FOO. In both packages a--2 and b--1."
        );
    }

    #[test]
    fn test_validate_sysctl_conflict() {
        let temp = TempDir::new().unwrap();
        let a = package(
            temp.path(),
            "a--1",
            json!({"sysctl": {"a": {"vm.max_map_count": "262144"}}}),
        );
        let same = package(
            temp.path(),
            "b--1",
            json!({"sysctl": {"b": {"vm.max_map_count": "262144"}}}),
        );
        let different = package(
            temp.path(),
            "c--1",
            json!({"sysctl": {"c": {"vm.max_map_count": "1"}}}),
        );
        validate_compatible(&[a.clone(), same]).unwrap();
        let err = validate_compatible(&[a, different]).unwrap_err();
        assert!(err.to_string().starts_with("Conflicting sysctl setting vm.max_map_count=1"));
    }

    #[test]
    fn test_symlink_tree_merges_and_conflicts() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a/lib");
        let b = temp.path().join("b/lib");
        fs::create_dir_all(a.join("sub")).unwrap();
        fs::create_dir_all(b.join("sub")).unwrap();
        fs::write(a.join("sub/one.so"), "").unwrap();
        fs::write(b.join("sub/two.so"), "").unwrap();

        let dest = temp.path().join("lib.new");
        fs::create_dir(&dest).unwrap();
        symlink_tree(&a, &dest).unwrap();
        symlink_tree(&b, &dest).unwrap();

        assert!(fs::symlink_metadata(dest.join("sub")).unwrap().is_dir());
        assert_eq!(fs::read_link(dest.join("sub/one.so")).unwrap(), a.join("sub/one.so"));
        assert_eq!(fs::read_link(dest.join("sub/two.so")).unwrap(), b.join("sub/two.so"));

        let err = symlink_tree(&a, &dest).unwrap_err();
        assert!(matches!(err, Error::ConflictingFile { .. }));
    }

    #[test]
    fn test_symlink_tree_refuses_dir_over_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("thing")).unwrap();
        let dest = temp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("thing"), "").unwrap();

        assert!(matches!(symlink_tree(&src, &dest), Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_get_active_errors() {
        let temp = TempDir::new().unwrap();
        let install = scratch_install(temp.path());
        let err = install.get_active().unwrap_err();
        assert!(err.to_string().ends_with("Has it been bootstrapped?"));

        fs::create_dir(temp.path().join("active.new")).unwrap();
        let err = install.get_active().unwrap_err();
        assert!(err.to_string().starts_with("Broken past deploy."));
    }

    #[test]
    fn test_active_names() {
        let temp = TempDir::new().unwrap();
        let install = scratch_install(temp.path());
        let names: Vec<String> = install
            .get_active_names()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "bin",
                "etc",
                "include",
                "lib",
                "dcos.target.wants",
                "environment",
                "environment.export",
                "active",
                "active.buildinfo.full.json"
            ]
        );
        assert_eq!(install.systemd_dir(), temp.path().join("dcos.target.wants"));
        assert!(!install.has_flag("anything"));
    }

    #[test]
    fn test_activate_writes_environment() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("packages");
        let root = temp.path().join("install");
        let pkg = package(&repo, "mesos--0.22.0", json!({"environment": {"MESOS_IP": "0.0.0.0"}}));
        fs::create_dir_all(pkg.path().join("bin")).unwrap();
        fs::write(pkg.path().join("bin/mesos-master"), "").unwrap();

        let install = scratch_install(&root);
        install.activate(std::slice::from_ref(&pkg)).unwrap();

        let env = fs::read_to_string(root.join("environment")).unwrap();
        assert_eq!(
            env,
            format!(
                "# Pkgpanda provided environment variables\nLD_LIBRARY_PATH={0}/lib\n\
                 PATH={0}/bin:/usr/bin:/bin:/sbin\n\n# package: mesos--0.22.0\nMESOS_IP=0.0.0.0\n\n",
                root.display()
            )
        );
        let export = fs::read_to_string(root.join("environment.export")).unwrap();
        assert!(export.contains("export MESOS_IP=0.0.0.0\n"));
        assert!(export.contains(&format!("export PATH=\"{}/bin:$PATH\"", root.display())));

        assert_eq!(
            install.get_active().unwrap(),
            BTreeSet::from(["mesos--0.22.0".to_string()])
        );
        assert!(root.join("bin/mesos-master").exists());
        assert!(!root.join("install_progress").exists());

        let buildinfo: Value =
            serde_json::from_str(&fs::read_to_string(root.join("active.buildinfo.full.json")).unwrap()).unwrap();
        assert_eq!(buildinfo, json!({"mesos": null}));

        let service_config: Value = serde_json::from_str(
            &fs::read_to_string(root.join("etc/dcos-service-configuration.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(service_config, json!({"sysctl": {}}));
    }

    #[test]
    fn test_activate_collects_sysctl() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("install");
        let pkg = package(
            &temp.path().join("packages"),
            "es--1",
            json!({"sysctl": {"dcos-es": {"vm.max_map_count": "262144"}}}),
        );
        fs::create_dir_all(pkg.path().join("dcos.target.wants")).unwrap();
        fs::write(pkg.path().join("dcos.target.wants/dcos-es.service"), "[Unit]\n").unwrap();

        let install = scratch_install(&root);
        install.activate(std::slice::from_ref(&pkg)).unwrap();

        let service_config: Value = serde_json::from_str(
            &fs::read_to_string(root.join("etc/dcos-service-configuration.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            service_config,
            json!({"sysctl": {"dcos-es": {"vm.max_map_count": "262144"}}})
        );
        // Unit staged next to the wants dir then moved into place
        assert_eq!(fs::read_to_string(root.join("dcos-es.service")).unwrap(), "[Unit]\n");
        assert_eq!(
            fs::read_link(root.join("dcos.target.wants/dcos-es.service")).unwrap(),
            root.join("dcos-es.service")
        );
    }

    #[test]
    fn test_activate_sysctl_without_service() {
        let temp = TempDir::new().unwrap();
        let pkg = package(
            &temp.path().join("packages"),
            "es--1",
            json!({"sysctl": {"dcos-es": {"vm.max_map_count": "1"}}}),
        );
        let install = scratch_install(&temp.path().join("install"));
        let err = install.activate(&[pkg]).unwrap_err();
        assert!(err.to_string().contains("could not be determined for es--1"));
    }

    #[test]
    fn test_activate_file_conflict() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("packages");
        let a = package(&repo, "a--1", json!({}));
        let b = package(&repo, "b--1", json!({}));
        for pkg in [&a, &b] {
            fs::create_dir_all(pkg.path().join("bin")).unwrap();
            fs::write(pkg.path().join("bin/tool"), "").unwrap();
        }

        let install = scratch_install(&temp.path().join("install"));
        let err = install.activate(&[a, b]).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(err.to_string().starts_with("Two packages are trying to install the same file"));
    }

    #[test]
    fn test_fake_path() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("install");
        let options = InstallOptions {
            fake_path: true,
            ..InstallOptions::scratch(&root)
        };
        let install = Install::new(
            options,
            Box::new(FakeServices::default()),
            Box::new(FakeUsers::default()),
        )
        .unwrap();
        install.activate(&[]).unwrap();

        let env = fs::read_to_string(root.join("environment")).unwrap();
        assert!(env.contains("LD_LIBRARY_PATH=/opt/mesosphere/lib\n"));
    }

    #[test]
    fn test_swap_requires_all_new_entries() {
        let temp = TempDir::new().unwrap();
        let install = scratch_install(temp.path());
        fs::create_dir(temp.path().join("bin.new")).unwrap();

        let err = install.swap_active(".new", true).unwrap_err();
        assert!(matches!(err, Error::InstallError(_)));
        assert!(temp.path().join("bin.new").exists());
        assert!(!temp.path().join("install_progress").exists());
    }

    #[test]
    fn test_recover_without_breadcrumb() {
        let temp = TempDir::new().unwrap();
        let install = scratch_install(temp.path());
        let (acted, msg) = install.recover_swap_active().unwrap();
        assert!(!acted);
        assert!(msg.starts_with("Path does not exist:"));
    }
}
