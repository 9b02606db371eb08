// src/build/mod.rs

//! Building packages from their definitions
//!
//! A package's id is the hash of everything that goes into it: source
//! checkout ids, the build script, the build image, the environment and the
//! ids of its dependencies. Identical inputs always give the same id, so a
//! build whose tarball already exists (locally or in the remote cache) is
//! skipped entirely.
//!
//! The build itself runs the package's build script in a container through a
//! [`BuildExecutor`], with the checked out sources, the dependencies activated
//! into a scratch install root, and an empty `result/` directory that becomes
//! the package.

mod bootstrap;
mod executor;
mod sources;
mod store;
mod tree;

pub use bootstrap::make_bootstrap_tarball;
pub use executor::{resolve_image_id, BindMount, BuildExecutor, BuildSpec, DockerExecutor};
pub use sources::{get_src_fetcher, GitLocalSrcFetcher, GitSrcFetcher, SourceFetcher, UrlSrcFetcher};
pub use store::{
    buildinfo_requires, get_variants_from_filesystem, load_buildinfo, load_optional_json, BuildInfo, PackageKey,
    PackageStore,
};
pub use tree::{build_order, get_tree_package_tuples, PackageSet, TreeInfo};

use crate::archive::{check_forbidden_services, extract_tarball, make_tar, rewrite_symlinks};
use crate::config::{variant_name, variant_prefix, variant_str, InstallOptions, PKGPANDA_VERSION, RESERVED_UNIT_NAMES};
use crate::error::{Error, Result};
use crate::hash::{hash_checkout, hash_folder, sha1_file};
use crate::install::{with_extension, Install};
use crate::package::{expand_require, PackageId};
use crate::repository::Repository;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tree::key_display;

/// Image used to clear out root-owned build leftovers
const CLEAN_IMAGE: &str = "ubuntu:14.04.4";

/// Where packages live inside the build container
const CONTAINER_PACKAGES_DIR: &str = "/opt/mesosphere/packages";

/// Fields copied from buildinfo into the built package's pkginfo
const PKGINFO_PASSTHROUGH: &[&str] = &["username", "group", "state_directory", "sysctl"];

fn write_string(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    write_string(path, &text)
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `sources`, or `single_source` as a source named after the package
fn expand_single_source_alias(name: &str, buildinfo: &BuildInfo) -> Result<Map<String, Value>> {
    if let Some(sources) = buildinfo.get("sources") {
        return sources.as_object().cloned().ok_or_else(|| {
            Error::BuildError("Invalid buildinfo.json for package: sources must be an object".to_string())
        });
    }
    if let Some(source) = buildinfo.get("single_source") {
        let mut sources = Map::new();
        sources.insert(name.to_string(), source.clone());
        return Ok(sources);
    }
    info!("NOTICE: No sources specified");
    Ok(Map::new())
}

/// Build one variant of a package, returning the path of its tarball
///
/// With `recursive` set, dependencies that were never built are built first.
/// Otherwise every dependency must already have a `latest` build.
pub fn build(
    store: &PackageStore,
    name: &str,
    variant: Option<&str>,
    clean_after_build: bool,
    recursive: bool,
    executor: &dyn BuildExecutor,
) -> Result<PathBuf> {
    let builder = Builder {
        store,
        executor,
        clean_after_build,
        recursive,
    };
    builder.build(name, variant, &mut Vec::new())
}

/// Build every variant of one package
pub fn build_package_variants(
    store: &PackageStore,
    name: &str,
    clean_after_build: bool,
    executor: &dyn BuildExecutor,
) -> Result<BTreeMap<Option<String>, PathBuf>> {
    let variants = store
        .packages_by_name()
        .get(name)
        .ok_or_else(|| Error::BuildError(format!("No package named {name} in {}", store.packages_dir().display())))?;

    let mut results = BTreeMap::new();
    for variant in variants.keys() {
        let path = build(store, name, variant.as_deref(), clean_after_build, false, executor)?;
        results.insert(variant.clone(), path);
    }
    Ok(results)
}

/// Build every package of one or all trees
///
/// `tree_variant` of `None` means every tree the store defines. Returns the
/// bootstrap id per tree when `mkbootstrap` is set.
pub fn build_tree(
    store: &PackageStore,
    mkbootstrap: bool,
    tree_variant: Option<&str>,
    executor: &dyn BuildExecutor,
) -> Result<BTreeMap<Option<String>, Option<String>>> {
    let tree_variants: Vec<Option<String>> = match tree_variant {
        Some(variant) => vec![Some(variant.to_string())],
        None => store.list_trees()?.into_iter().collect(),
    };

    let trees = tree_variants
        .iter()
        .map(|variant| PackageSet::new(store, variant.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    let order = build_order(store, &trees)?;

    let mut built_packages: BTreeMap<PackageKey, PathBuf> = BTreeMap::new();
    for key in order {
        info!("Building: {} variant {}", key.0, variant_name(key.1.as_deref()));
        let path = build(store, &key.0, key.1.as_deref(), true, false, executor)?;
        built_packages.insert(key, path);
    }

    let mut results = BTreeMap::new();
    for tree in &trees {
        let bootstrap_id = if mkbootstrap {
            Some(make_tree_bootstrap(store, tree, &built_packages)?)
        } else {
            None
        };
        results.insert(tree.variant.clone(), bootstrap_id);
    }
    Ok(results)
}

fn make_tree_bootstrap(
    store: &PackageStore,
    tree: &PackageSet,
    built_packages: &BTreeMap<PackageKey, PathBuf>,
) -> Result<String> {
    let variant = tree.variant.as_deref();
    info!("Making bootstrap variant: {}", variant_name(variant));

    let path_of = |key: &PackageKey| {
        built_packages
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BuildError(format!("Package {} was not built", key_display(key))))
    };

    let mut bootstrap_paths = tree.bootstrap_packages.iter().map(path_of).collect::<Result<Vec<_>>>()?;
    bootstrap_paths.sort();
    let bootstrap_id = make_bootstrap_tarball(store, &bootstrap_paths, variant)?;

    let mut all_ids = Vec::new();
    for key in &tree.all_packages {
        all_ids.push(bootstrap::package_id_from_path(&path_of(key)?)?);
    }
    all_ids.sort();

    let complete = store.get_bootstrap_cache_dir().join(format!(
        "{}complete.latest.json",
        variant_prefix(variant)
    ));
    write_json(&complete, &json!({"bootstrap": bootstrap_id, "packages": all_ids}))?;
    info!("Wrote {}", complete.display());
    Ok(bootstrap_id)
}

struct Builder<'a> {
    store: &'a PackageStore,
    executor: &'a dyn BuildExecutor,
    clean_after_build: bool,
    recursive: bool,
}

/// Dependencies of a build, resolved to their last builds
struct ResolvedDeps {
    /// Ids of every transitive dependency
    ids: BTreeSet<String>,
}

impl Builder<'_> {
    fn build(&self, name: &str, variant: Option<&str>, in_progress: &mut Vec<PackageKey>) -> Result<PathBuf> {
        let key = (name.to_string(), variant.map(str::to_string));
        if in_progress.contains(&key) {
            let from = in_progress.last().map(key_display).unwrap_or_default();
            return Err(Error::BuildError(format!(
                "Circular dependency. Circular link {from} -> {}",
                key_display(&key)
            )));
        }

        in_progress.push(key);
        let result = self.build_package(name, variant, in_progress);
        in_progress.pop();
        result
    }

    fn build_package(&self, name: &str, variant: Option<&str>, in_progress: &mut Vec<PackageKey>) -> Result<PathBuf> {
        info!("Building package {} variant {}", name, variant_name(variant));
        let store = self.store;

        let mut buildinfo = store.get_buildinfo(name, variant)?.clone();
        if buildinfo.contains_key("name") {
            return Err(Error::BuildError(
                "'name' is not allowed in buildinfo.json, it is implicitly the name of the folder \
                 containing the buildinfo.json"
                    .to_string(),
            ));
        }

        let package_dir = store.get_package_folder(name)?.to_path_buf();
        let cache_dir = store.get_package_cache_folder(name)?;

        // Source fetchers and their checkout ids, in name order
        let mut sources = expand_single_source_alias(name, &buildinfo)?;
        let mut fetchers = Vec::new();
        let mut checkout_ids = Map::new();
        for (src_name, src_info) in &sources {
            let src_cache = cache_dir.join(src_name);
            fs::create_dir_all(&src_cache)?;
            let fetcher = get_src_fetcher(src_info, &src_cache, &package_dir)
                .map_err(|e| e.into_build_error("Validation error when fetching sources for package"))?;
            checkout_ids.insert(src_name.clone(), Value::Object(fetcher.get_id()));
            fetchers.push((src_name.clone(), fetcher));
        }

        for (src_name, checkout_id) in &checkout_ids {
            let Some(Value::Object(src_info)) = sources.get_mut(src_name) else {
                continue;
            };
            if let Value::Object(checkout_id) = checkout_id {
                if checkout_id.keys().any(|k| src_info.contains_key(k)) {
                    return Err(Error::BuildError(format!(
                        "Duplicate keys between {} and {}",
                        Value::Object(checkout_id.clone()),
                        Value::Object(src_info.clone())
                    )));
                }
                src_info.extend(checkout_id.clone());
            }
        }
        buildinfo.insert("sources".to_string(), Value::Object(sources));

        let build_script = buildinfo
            .get("build_script")
            .and_then(Value::as_str)
            .unwrap_or("build")
            .to_string();
        let build_script_path = package_dir.join(&build_script);

        let mut build_ids = Map::new();
        build_ids.insert("sources".to_string(), Value::Object(checkout_ids));
        build_ids.insert("build".to_string(), Value::String(sha1_file(&build_script_path)?));
        build_ids.insert("pkgpanda_version".to_string(), Value::String(PKGPANDA_VERSION.to_string()));
        build_ids.insert("variant".to_string(), Value::String(variant_str(variant).to_string()));

        let extra_dir = package_dir.join("extra");
        let has_extra = extra_dir.exists();
        if has_extra {
            let extra_id = Value::String(hash_folder(&extra_dir)?);
            build_ids.insert("extra_source".to_string(), extra_id.clone());
            buildinfo.insert("extra_source".to_string(), extra_id);
        }

        let docker_name = buildinfo
            .get("docker")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BuildError("buildinfo.json docker must be a string".to_string()))?
            .to_string();
        let docker_id = resolve_image_id(self.executor, &docker_name)?;
        build_ids.insert("docker".to_string(), Value::String(docker_id));

        let environment = buildinfo.get("environment").cloned().unwrap_or_else(|| json!({}));
        build_ids.insert("environment".to_string(), environment.clone());

        let requires = buildinfo_requires(&buildinfo)?.to_vec();
        let deps = self.resolve_dependencies(&requires, in_progress)?;
        build_ids.insert(
            "requires".to_string(),
            Value::Array(deps.ids.iter().cloned().map(Value::String).collect()),
        );

        let version_base = hash_checkout(&Value::Object(build_ids.clone()))?;
        let version = match buildinfo.get("version_extra") {
            Some(Value::String(extra)) => format!("{extra}-{version_base}"),
            Some(other) => {
                return Err(Error::BuildError(format!("version_extra must be a string, got {other}")));
            }
            None => version_base,
        };
        let pkg_id = PackageId::from_parts(name, &version).map_err(|e| e.into_build_error("Invalid package id"))?;

        buildinfo.insert("build_ids".to_string(), Value::Object(build_ids));
        buildinfo.insert("package_version".to_string(), Value::String(version.clone()));
        buildinfo.insert("name".to_string(), Value::String(name.to_string()));
        buildinfo.insert(
            "variant".to_string(),
            variant.map_or(Value::Null, |v| Value::String(v.to_string())),
        );

        let pkg_path = store.get_package_path(&pkg_id)?;
        let last_build = store.get_last_build_filename(name, variant)?;

        if pkg_path.exists() {
            info!("Package up to date. Not re-building.");
            write_string(&last_build, &pkg_id.to_string())?;
            return Ok(pkg_path);
        }

        if let Some(dl_path) = store.try_fetch_by_id(&pkg_id)? {
            info!("Package up to date. Not re-building. Downloaded from repository-url.");
            write_string(&last_build, &pkg_id.to_string())?;
            return Ok(dl_path);
        }

        info!("Unable to download from cache. Proceeding to build");
        debug!(
            "Building package {} with buildinfo: {}",
            pkg_id,
            serde_json::to_string_pretty(&buildinfo)?
        );

        self.clean(&cache_dir)?;

        let result_dir = cache_dir.join("result");
        if result_dir.exists() {
            return Err(Error::BuildError(format!(
                "result folder must not exist. It will be made when the package is built. {}",
                result_dir.display()
            )));
        }

        // Dependencies go into a scratch repository and get activated into a
        // scratch install root that is mounted as /opt/mesosphere.
        let repo_dir = tempfile::Builder::new().prefix("pkgpanda_repo").tempdir()?;
        let repository = Repository::new(repo_dir.path())?;
        let install_dir = tempfile::Builder::new().prefix("pkgpanda-").tempdir()?;

        let mut active_packages = Vec::new();
        for dep in &deps.ids {
            info!("Auto-adding dependency: {}", dep);
            let dep_id: PackageId = dep.parse()?;
            let tarball = store.get_package_path(&dep_id)?;
            repository
                .add(|_, target| extract_tarball(&tarball, target), dep)
                .map_err(|e| e.into_build_error(&format!("loading package needed as dependency {dep}")))?;
            active_packages.push(
                repository
                    .load(dep)
                    .map_err(|e| e.into_build_error(&format!("loading package needed as dependency {dep}")))?,
            );
            fs::create_dir_all(install_dir.path().join("packages").join(dep))?;
        }

        let src_dir = cache_dir.join("src");
        if src_dir.exists() {
            return Err(Error::BuildError(format!(
                "Validation error when fetching sources for package: 'src' directory already exists, did \
                 you have a previous build? Currently all builds must be from scratch. src={}",
                src_dir.display()
            )));
        }
        fs::create_dir(&src_dir)?;
        for (src_name, fetcher) in &fetchers {
            let root = src_dir.join(src_name);
            fs::create_dir(&root)?;
            fetcher
                .checkout_to(&root)
                .map_err(|e| e.into_build_error("Validation error when fetching sources for package"))?;
        }

        let install = Install::system(InstallOptions {
            fake_path: true,
            ..InstallOptions::scratch(install_dir.path())
        })?;
        install
            .activate(&active_packages)
            .map_err(|e| e.into_build_error("activating build dependencies"))?;
        rewrite_symlinks(
            install_dir.path(),
            repository.path(),
            Path::new(&format!("{CONTAINER_PACKAGES_DIR}/")),
        )?;

        fs::create_dir(&result_dir)?;
        let buildinfo = Value::Object(buildinfo);
        write_json(&src_dir.join("buildinfo.full.json"), &buildinfo)?;
        write_json(&result_dir.join("buildinfo.full.json"), &buildinfo)?;

        let mut pkginfo = Map::new();
        pkginfo.insert("requires".to_string(), Value::Array(requires));
        pkginfo.insert("environment".to_string(), environment);
        for field in PKGINFO_PASSTHROUGH {
            if let Some(value) = buildinfo.get(*field) {
                pkginfo.insert(field.to_string(), value.clone());
            }
        }
        write_json(&result_dir.join("pkginfo.json"), &Value::Object(pkginfo))?;

        fs::create_dir_all(install_dir.path().join("packages").join(pkg_id.to_string()))?;

        let pkg_container_path = format!("{CONTAINER_PACKAGES_DIR}/{pkg_id}");
        let num_cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let mut spec = BuildSpec::new(docker_name)
            .mount(BindMount::writable(&src_dir, "/pkg/src"))
            .mount(BindMount::readonly(&build_script_path, "/pkg/build"))
            .mount(BindMount::writable(&result_dir, &pkg_container_path))
            .mount(BindMount::readonly(install_dir.path(), "/opt/mesosphere"))
            .env("PKG_VERSION", version.as_str())
            .env("PKG_NAME", name)
            .env("PKG_ID", pkg_id.to_string())
            .env("PKG_PATH", pkg_container_path.as_str())
            .env("PKG_VARIANT", variant_name(variant))
            .env("NUM_CORES", num_cores.to_string())
            .cmd(["/bin/bash", "-o", "nounset", "-o", "pipefail", "-o", "errexit", "/pkg/build"]);
        if has_extra {
            spec = spec.mount(BindMount::readonly(&extra_dir, "/pkg/extra"));
        }
        for dep in &deps.ids {
            spec = spec.mount(BindMount::readonly(
                repository.package_path(dep),
                format!("{CONTAINER_PACKAGES_DIR}/{dep}"),
            ));
        }

        info!("Building package in docker");
        let code = self.executor.run(&spec)?;
        if code != 0 {
            return Err(Error::BuildError(format!(
                "docker exited non-zero: {code}\nCommand: {}",
                spec.cmd.join(" ")
            )));
        }
        drop(install);
        if let Err(e) = install_dir.close() {
            warn!("Unable to remove build install root: {}", e);
        }

        info!("Building package tarball");
        check_forbidden_services(&result_dir, RESERVED_UNIT_NAMES)
            .map_err(|e| Error::BuildError(format!("Package validation failed: {e}")))?;

        write_string(&last_build, &pkg_id.to_string())?;

        let tmp_name = with_extension(&pkg_path, "-tmp.tar.xz");
        make_tar(&tmp_name, &result_dir)?;
        fs::rename(&tmp_name, &pkg_path)?;
        info!("Package built.");

        if self.clean_after_build {
            self.clean(&cache_dir)?;
        }
        Ok(pkg_path)
    }

    /// Walk `requires` breadth first, resolving each dependency to its last build
    fn resolve_dependencies(&self, requires: &[Value], in_progress: &mut Vec<PackageKey>) -> Result<ResolvedDeps> {
        let store = self.store;
        let mut to_check: VecDeque<Value> = requires.iter().cloned().collect();
        let mut variants: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut ids = BTreeSet::new();

        while let Some(require) = to_check.pop_front() {
            let requirement = expand_require(&require)
                .map_err(|e| e.into_build_error("validating package needed as dependency"))?;
            let (requires_name, requires_variant) = requirement.to_tuple();

            if let Some(existing) = variants.get(&requires_name) {
                if *existing != requires_variant {
                    return Err(Error::BuildError(format!(
                        "Dependency on multiple variants of the same package {requires_name}. variants: {} {}",
                        variant_name(requires_variant.as_deref()),
                        variant_name(existing.as_deref())
                    )));
                }
                continue;
            }
            variants.insert(requires_name.clone(), requires_variant.clone());

            let last_build = store.get_last_build_filename(&requires_name, requires_variant.as_deref())?;
            if !last_build.exists() {
                if !self.recursive {
                    return Err(Error::BuildError(format!(
                        "No last build file found for dependency {requires_name} variant {}. Rebuild the dependency",
                        variant_name(requires_variant.as_deref())
                    )));
                }
                self.build(&requires_name, requires_variant.as_deref(), in_progress)?;
            }

            let pkg_id_str = fs::read_to_string(&last_build)?.trim().to_string();
            let pkg_id: PackageId = pkg_id_str.parse().map_err(|e: Error| {
                e.into_build_error(&format!("loading package needed as dependency {requires_name}"))
            })?;
            if !store.get_package_path(&pkg_id)?.exists() {
                return Err(Error::BuildError(format!(
                    "The build tarball {pkg_id}.tar.xz refered to by the last_build file of the dependency \
                     {requires_name} variant {} doesn't exist. Rebuild the dependency.",
                    variant_name(requires_variant.as_deref())
                )));
            }
            ids.insert(pkg_id_str);

            let dep_buildinfo = store.get_buildinfo(&requires_name, requires_variant.as_deref())?;
            to_check.extend(buildinfo_requires(dep_buildinfo)?.iter().cloned());
        }

        Ok(ResolvedDeps { ids })
    }

    /// Remove `src/` and `result/` from a package's cache folder
    ///
    /// Builds leave root-owned files behind, so the removal runs in a
    /// container first.
    fn clean(&self, cache_dir: &Path) -> Result<()> {
        let spec = BuildSpec::new(CLEAN_IMAGE)
            .mount(BindMount::writable(cache_dir, "/pkg/"))
            .cmd(["rm", "-rf", "/pkg/src", "/pkg/result"]);
        match self.executor.run(&spec) {
            Ok(0) => {}
            Ok(code) => warn!("Cleaning {} in a container exited {}", cache_dir.display(), code),
            Err(e) => warn!("Cleaning {} in a container failed: {}", cache_dir.display(), e),
        }
        remove_dir_if_exists(&cache_dir.join("src"))?;
        remove_dir_if_exists(&cache_dir.join("result"))
    }
}
