// src/build/store.rs

//! Index of buildable packages
//!
//! A packages directory holds one folder per package, each with one
//! `[variant.]buildinfo.json` per variant, plus `[variant.]treeinfo.json`
//! files describing the trees to assemble. An optional `upstream.json`
//! names another packages tree (fetched like any package source) whose
//! definitions fill in whatever isn't defined locally.
//!
//! Build outputs live under `cache/`:
//!
//! - `cache/packages/{name}/{id}.tar.xz` built packages
//! - `cache/packages/{name}/[variant.]latest` id of the last build
//! - `cache/bootstrap/` bootstrap tarballs and their `active.json`
//! - `cache/upstream/` the upstream checkout and its fetch cache

use super::sources::get_src_fetcher;
use crate::config::{variant_name, variant_prefix};
use crate::download::download_atomic;
use crate::error::{Error, Result};
use crate::package::PackageId;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `(name, variant)`; `None` is the default variant
pub type PackageKey = (String, Option<String>);

/// Parsed `buildinfo.json`
pub type BuildInfo = Map<String, Value>;

/// Variants present in `directory` as `[variant.]{extension}` files
pub fn get_variants_from_filesystem(directory: &Path, extension: &str) -> Result<BTreeSet<Option<String>>> {
    let mut results = BTreeSet::new();
    for entry in fs::read_dir(directory)? {
        let filename = entry?.file_name().to_string_lossy().into_owned();
        let Some(variant) = filename.strip_suffix(extension) else {
            continue;
        };

        if variant == "." {
            return Err(Error::BuildError(format!(
                "Invalid filename {filename}. The \"default\" variant file should be just {extension}"
            )));
        }

        if variant.is_empty() {
            results.insert(None);
        } else {
            let Some(name) = variant.strip_suffix('.') else {
                return Err(Error::BuildError(format!(
                    "Invalid variant filename {filename}. Expected a '.' separating the variant name \
                     and extension '{extension}'."
                )));
            };
            results.insert(Some(name.to_string()));
        }
    }
    Ok(results)
}

/// Read JSON, treating an empty file as `{}`
pub fn load_optional_json(filename: &Path) -> Result<Value> {
    let text = match fs::read_to_string(filename) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::BuildError(format!(
                "Didn't find expected JSON file: {}",
                filename.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let text = text.trim();
    if text.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(text)
        .map_err(|e| Error::BuildError(format!("Unable to parse json in {}: {e}", filename.display())))
}

pub fn load_config_variant(directory: &Path, variant: Option<&str>, extension: &str) -> Result<Value> {
    load_optional_json(&directory.join(format!("{}{extension}", variant_prefix(variant))))
}

/// Load a buildinfo with its guaranteed members filled in
pub fn load_buildinfo(path: &Path, variant: Option<&str>) -> Result<BuildInfo> {
    let Value::Object(mut buildinfo) = load_config_variant(path, variant, "buildinfo.json")? else {
        return Err(Error::BuildError(format!(
            "{}buildinfo.json in {} must be a JSON object",
            variant_prefix(variant),
            path.display()
        )));
    };

    buildinfo
        .entry("build_script")
        .or_insert_with(|| Value::String("build".to_string()));
    buildinfo
        .entry("docker")
        .or_insert_with(|| Value::String("dcos-builder:latest".to_string()));
    buildinfo
        .entry("environment")
        .or_insert_with(|| Value::Object(Map::new()));
    buildinfo
        .entry("requires")
        .or_insert_with(|| Value::Array(Vec::new()));

    Ok(buildinfo)
}

/// The `requires` list of a buildinfo
pub fn buildinfo_requires(buildinfo: &BuildInfo) -> Result<&[Value]> {
    match buildinfo.get("requires") {
        Some(Value::Array(requires)) => Ok(requires),
        None => Ok(&[]),
        Some(_) => Err(Error::BuildError(
            "`requires` in buildinfo.json must be an array of dependencies.".to_string(),
        )),
    }
}

/// Every package definition reachable from a packages directory
#[derive(Debug)]
pub struct PackageStore {
    repository_url: Option<String>,
    packages_dir: PathBuf,
    packages: BTreeMap<PackageKey, BuildInfo>,
    packages_by_name: BTreeMap<String, BTreeMap<Option<String>, BuildInfo>>,
    package_folders: BTreeMap<String, PathBuf>,
}

impl PackageStore {
    pub fn new(packages_dir: impl AsRef<Path>, repository_url: Option<&str>) -> Result<Self> {
        let packages_dir = std::path::absolute(packages_dir.as_ref())?;
        let upstream_dir = packages_dir.join("cache/upstream/checkout");

        match fs::remove_dir_all(&upstream_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut package_dirs = vec![packages_dir.clone()];
        let upstream_config = packages_dir.join("upstream.json");
        if upstream_config.exists() {
            Self::fetch_upstream(&packages_dir, &upstream_config, &upstream_dir)
                .map_err(|e| Error::BuildError(format!("Error fetching upstream: {e}")))?;
            package_dirs.push(upstream_dir.join("packages"));
        }

        let mut store = Self {
            repository_url: repository_url.map(|u| u.trim_end_matches('/').to_string()),
            packages_dir,
            packages: BTreeMap::new(),
            packages_by_name: BTreeMap::new(),
            package_folders: BTreeMap::new(),
        };

        // Local definitions come first; upstream only fills the gaps.
        for directory in &package_dirs {
            store.scan(directory)?;
        }

        debug!(
            "Loaded {} package variants from {}",
            store.packages.len(),
            store.packages_dir.display()
        );
        Ok(store)
    }

    fn fetch_upstream(packages_dir: &Path, upstream_config: &Path, upstream_dir: &Path) -> Result<()> {
        let fetcher = get_src_fetcher(
            &load_optional_json(upstream_config)?,
            &packages_dir.join("cache/upstream"),
            packages_dir,
        )?;
        fs::create_dir_all(upstream_dir)?;
        fetcher.checkout_to(upstream_dir)?;

        if upstream_dir.join("packages/upstream.json").exists() {
            return Err(Error::BuildError(
                "Support for upstreams which have upstreams is not currently implemented".to_string(),
            ));
        }
        info!("Using upstream packages from {}", upstream_dir.display());
        Ok(())
    }

    fn scan(&mut self, directory: &Path) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(directory)?
            .map(|e| e.map(|e| e.path()))
            .collect::<io::Result<_>>()?;
        entries.sort();

        for package_folder in entries {
            if !package_folder.is_dir() {
                continue;
            }
            let Some(name) = package_folder.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            for variant in get_variants_from_filesystem(&package_folder, "buildinfo.json")? {
                let key = (name.clone(), variant.clone());
                if self.packages.contains_key(&key) {
                    continue;
                }

                let buildinfo = load_buildinfo(&package_folder, variant.as_deref())?;
                self.packages.insert(key, buildinfo.clone());
                self.packages_by_name
                    .entry(name.clone())
                    .or_default()
                    .insert(variant, buildinfo);
                self.package_folders
                    .entry(name.clone())
                    .or_insert_with(|| package_folder.clone());
            }
        }
        Ok(())
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    pub fn repository_url(&self) -> Option<&str> {
        self.repository_url.as_deref()
    }

    pub fn packages(&self) -> &BTreeMap<PackageKey, BuildInfo> {
        &self.packages
    }

    pub fn packages_by_name(&self) -> &BTreeMap<String, BTreeMap<Option<String>, BuildInfo>> {
        &self.packages_by_name
    }

    pub fn has_package(&self, name: &str, variant: Option<&str>) -> bool {
        self.packages
            .contains_key(&(name.to_string(), variant.map(str::to_string)))
    }

    pub fn get_buildinfo(&self, name: &str, variant: Option<&str>) -> Result<&BuildInfo> {
        self.packages
            .get(&(name.to_string(), variant.map(str::to_string)))
            .ok_or_else(|| {
                Error::BuildError(format!(
                    "No package {name} variant {} in {}",
                    variant_name(variant),
                    self.packages_dir.display()
                ))
            })
    }

    pub fn get_package_folder(&self, name: &str) -> Result<&Path> {
        self.package_folders
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::BuildError(format!("No package folder for {name}")))
    }

    /// `cache/packages/{name}`, created on demand
    pub fn get_package_cache_folder(&self, name: &str) -> Result<PathBuf> {
        let directory = self.packages_dir.join("cache/packages").join(name);
        fs::create_dir_all(&directory)?;
        Ok(directory)
    }

    pub fn get_last_build_filename(&self, name: &str, variant: Option<&str>) -> Result<PathBuf> {
        Ok(self
            .get_package_cache_folder(name)?
            .join(format!("{}latest", variant_prefix(variant))))
    }

    pub fn get_package_path(&self, pkg_id: &PackageId) -> Result<PathBuf> {
        Ok(self
            .get_package_cache_folder(pkg_id.name())?
            .join(format!("{pkg_id}.tar.xz")))
    }

    pub fn get_bootstrap_cache_dir(&self) -> PathBuf {
        self.packages_dir.join("cache/bootstrap")
    }

    pub fn get_treeinfo(&self, variant: Option<&str>) -> Result<Value> {
        load_config_variant(&self.packages_dir, variant, "treeinfo.json")
    }

    /// Tree variants, default first
    pub fn list_trees(&self) -> Result<BTreeSet<Option<String>>> {
        get_variants_from_filesystem(&self.packages_dir, "treeinfo.json")
    }

    /// Bootstrap id last built for each tree
    pub fn get_last_bootstrap_set(&self) -> Result<BTreeMap<Option<String>, String>> {
        let mut result = BTreeMap::new();
        for variant in self.list_trees()? {
            let bootstrap_latest = self
                .get_bootstrap_cache_dir()
                .join(format!("{}bootstrap.latest", variant_prefix(variant.as_deref())));
            let id = fs::read_to_string(&bootstrap_latest).map_err(|_| {
                Error::BuildError(format!(
                    "No last bootstrap found for variant {}. Expected to find {} to match {}treeinfo.json",
                    variant_name(variant.as_deref()),
                    bootstrap_latest.display(),
                    variant_prefix(variant.as_deref())
                ))
            })?;
            result.insert(variant, id.trim().to_string());
        }
        Ok(result)
    }

    /// Download a built package from the remote cache
    ///
    /// Returns the local tarball path, or `None` when there's no remote or
    /// the download failed.
    pub fn try_fetch_by_id(&self, pkg_id: &PackageId) -> Result<Option<PathBuf>> {
        let Some(repository_url) = &self.repository_url else {
            return Ok(None);
        };

        let directory = self.get_package_cache_folder(pkg_id.name())?;
        let pkg_path = directory.join(format!("{pkg_id}.tar.xz"));
        let url = format!("{repository_url}/packages/{}/{pkg_id}.tar.xz", pkg_id.name());

        info!("Attempting to download {} from {} to {}", pkg_id, url, directory.display());
        match download_atomic(&pkg_path, &url, &directory) {
            Ok(()) => Ok(Some(pkg_path)),
            Err(e) => {
                debug!("{}", e);
                Ok(None)
            }
        }
    }

    /// Download a bootstrap tarball and its `active.json` from the remote cache
    pub fn try_fetch_bootstrap_and_active(&self, bootstrap_id: &str) -> Result<bool> {
        let Some(repository_url) = &self.repository_url else {
            return Ok(false);
        };

        let dest_dir = self.get_bootstrap_cache_dir();
        fs::create_dir_all(&dest_dir)?;

        for name in [
            format!("{bootstrap_id}.bootstrap.tar.xz"),
            format!("{bootstrap_id}.active.json"),
        ] {
            let url = format!("{repository_url}/bootstrap/{name}");
            info!("Attempting to download {} from {}", name, url);
            if let Err(e) = download_atomic(&dest_dir.join(&name), &url, &self.packages_dir) {
                debug!("{}", e);
                return Ok(false);
            }
        }
        Ok(true)
    }
}
