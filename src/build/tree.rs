// src/build/tree.rs

//! Trees: named sets of packages built and shipped together
//!
//! A `[variant.]treeinfo.json` picks which packages of the store make up a
//! tree, pins package variants, and names the subset that goes into the
//! bootstrap tarball. [`PackageSet`] is the resolved form: every
//! `(name, variant)` in the tree with its dependencies closed over.

use super::store::{buildinfo_requires, PackageKey, PackageStore};
use crate::config::variant_name;
use crate::error::{Error, Result};
use crate::package::expand_require;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

const ALLOWED_TREEINFO_KEYS: &[&str] = &["exclude", "variants", "core_package_list", "bootstrap_package_list"];

/// Parsed `treeinfo.json`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeInfo {
    pub exclude: BTreeSet<String>,
    /// Package name to the variant the tree must contain
    pub variants: BTreeMap<String, Option<String>>,
    /// When set, only these packages (plus their dependencies) are in the tree
    pub core_package_list: Option<Vec<String>>,
    /// When set, only these packages (plus their dependencies) are bootstrapped
    pub bootstrap_package_list: Option<Vec<String>>,
}

fn string_list(value: &Value, what: &str) -> Result<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(Error::BuildError(format!(
            "{what} must either be null or a list of package names"
        )));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                Error::BuildError(format!(
                    "{what} should be a list of package name strings, found the value: {item}"
                ))
            })
        })
        .collect()
}

fn optional_list(value: Option<&Value>, what: &str) -> Result<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => string_list(value, what).map(Some),
    }
}

impl TreeInfo {
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::BuildError("treeinfo must be a JSON object".to_string()));
        };

        let unknown: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| !ALLOWED_TREEINFO_KEYS.contains(k))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::BuildError(format!(
                "treeinfo can only include the keys {}. Found {}",
                ALLOWED_TREEINFO_KEYS.join(", "),
                unknown.join(", ")
            )));
        }

        let exclude = match map.get("exclude") {
            None => BTreeSet::new(),
            Some(value) => string_list(value, "treeinfo exclude")?.into_iter().collect(),
        };

        let core_package_list = optional_list(map.get("core_package_list"), "core_package_list")?;
        if let Some(core) = &core_package_list {
            if let Some(name) = core.iter().find(|name| exclude.contains(*name)) {
                return Err(Error::BuildError(format!(
                    "Package found in both exclude and core_package_list: {name}"
                )));
            }
        }

        let bootstrap_package_list = optional_list(map.get("bootstrap_package_list"), "bootstrap_package_list")?;

        let mut variants = BTreeMap::new();
        match map.get("variants") {
            None => {}
            Some(Value::Object(pins)) => {
                for (name, variant) in pins {
                    let variant = match variant {
                        Value::Null => None,
                        Value::String(v) => Some(v.clone()),
                        other => {
                            return Err(Error::BuildError(format!(
                                "treeinfo variant for {name} must be a string or null, got {other}"
                            )));
                        }
                    };
                    variants.insert(name.clone(), variant);
                }
            }
            Some(_) => {
                return Err(Error::BuildError(
                    "treeinfo variants must be a dictionary of package name to variant name".to_string(),
                ));
            }
        }

        Ok(Self {
            exclude,
            variants,
            core_package_list,
            bootstrap_package_list,
        })
    }

    pub fn load(store: &PackageStore, tree_variant: Option<&str>) -> Result<Self> {
        Self::from_value(&store.get_treeinfo(tree_variant)?)
    }
}

/// The resolved contents of one tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSet {
    pub variant: Option<String>,
    pub all_packages: BTreeSet<PackageKey>,
    pub bootstrap_packages: BTreeSet<PackageKey>,
}

impl PackageSet {
    pub fn new(store: &PackageStore, tree_variant: Option<&str>) -> Result<Self> {
        let treeinfo = TreeInfo::load(store, tree_variant)?;
        Self::from_treeinfo(store, &treeinfo, tree_variant)
    }

    pub fn from_treeinfo(store: &PackageStore, treeinfo: &TreeInfo, tree_variant: Option<&str>) -> Result<Self> {
        let all_packages = get_tree_package_tuples(store, treeinfo, tree_variant)?;

        let bootstrap_packages = match &treeinfo.bootstrap_package_list {
            None => all_packages.clone(),
            Some(names) => {
                let bootstrap = package_tuples_with_dependencies(store, treeinfo, names, true, tree_variant)?;
                if let Some((name, variant)) = bootstrap.difference(&all_packages).next() {
                    return Err(Error::BuildError(format!(
                        "bootstrap package {name} variant {} is not part of tree {}",
                        variant_name(variant.as_deref()),
                        variant_name(tree_variant)
                    )));
                }
                bootstrap
            }
        };

        Ok(Self {
            variant: tree_variant.map(str::to_string),
            all_packages,
            bootstrap_packages,
        })
    }
}

/// Every `(name, variant)` in a tree
pub fn get_tree_package_tuples(
    store: &PackageStore,
    treeinfo: &TreeInfo,
    tree_variant: Option<&str>,
) -> Result<BTreeSet<PackageKey>> {
    let (names, resolve_requires): (Vec<String>, bool) = match &treeinfo.core_package_list {
        Some(core) => (core.clone(), true),
        None => (store.packages_by_name().keys().cloned().collect(), false),
    };

    let tuples = package_tuples_with_dependencies(store, treeinfo, &names, resolve_requires, tree_variant)?;

    for (name, variant) in &treeinfo.variants {
        if !tuples.contains(&(name.clone(), variant.clone())) {
            return Err(Error::BuildError(format!(
                "package {name} is supposed to have variant {} included in the tree according to \
                 the treeinfo.json, but the no such package (let alone variant) was found",
                variant_name(variant.as_deref())
            )));
        }
    }
    Ok(tuples)
}

/// Breadth-first closure of `names` over their `requires`
///
/// With `resolve_requires` unset every requirement must already be among the
/// starting packages.
fn package_tuples_with_dependencies(
    store: &PackageStore,
    treeinfo: &TreeInfo,
    names: &[String],
    resolve_requires: bool,
    tree_variant: Option<&str>,
) -> Result<BTreeSet<PackageKey>> {
    let mut tuples = BTreeSet::new();

    let include = |tuples: &mut BTreeSet<PackageKey>, key: PackageKey| -> Result<()> {
        let (name, variant) = &key;
        if treeinfo.exclude.contains(name) {
            return Err(Error::BuildError(format!(
                "package {name} is in excludes but was needed as a dependency of an included package"
            )));
        }
        if let Some(pinned) = treeinfo.variants.get(name) {
            if pinned != variant {
                return Err(Error::BuildError(format!(
                    "package {name} variant {} is needed but the tree pins variant {}",
                    variant_name(variant.as_deref()),
                    variant_name(pinned.as_deref())
                )));
            }
        }
        if !store.packages().contains_key(&key) {
            return Err(Error::BuildError(format!(
                "package {name} variant {} is needed but is not in the set of built packages \
                 (explicitly requested or as a requires)",
                variant_name(variant.as_deref())
            )));
        }
        tuples.insert(key);
        Ok(())
    };

    for name in names {
        if treeinfo.exclude.contains(name) {
            continue;
        }
        let variant = treeinfo.variants.get(name).cloned().flatten();
        include(&mut tuples, (name.clone(), variant))?;
    }

    let mut to_visit: VecDeque<PackageKey> = tuples.iter().cloned().collect();
    while let Some((name, variant)) = to_visit.pop_front() {
        let buildinfo = store.get_buildinfo(&name, variant.as_deref())?;
        for require in buildinfo_requires(buildinfo)? {
            let require_tuple = expand_require(require)
                .map_err(|e| e.into_build_error(&format!("Invalid requires of package {name}")))?
                .to_tuple();
            if tuples.contains(&require_tuple) {
                continue;
            }
            if !resolve_requires {
                return Err(Error::BuildError(format!(
                    "Package {name} requires {} variant {} but that is not in the set of packages \
                     listed for the tree {}",
                    require_tuple.0,
                    variant_name(require_tuple.1.as_deref()),
                    variant_name(tree_variant)
                )));
            }
            include(&mut tuples, require_tuple.clone())?;
            to_visit.push_back(require_tuple);
        }
    }

    Ok(tuples)
}

/// Order to build every package of the given trees in
///
/// Dependencies always come before their dependents. Fails on cycles or
/// dependencies the store can't build, before anything is built.
pub fn build_order(store: &PackageStore, trees: &[PackageSet]) -> Result<Vec<PackageKey>> {
    let mut order = Vec::new();
    let mut visited = BTreeSet::new();
    let mut built = BTreeSet::new();

    for tree in trees {
        // BTreeSet order: by name, then the default variant before named ones
        for pkg_tuple in &tree.all_packages {
            if visited.contains(pkg_tuple) {
                continue;
            }
            visit(store, pkg_tuple, &mut visited, &mut built, &mut order)?;
        }
    }
    Ok(order)
}

fn visit(
    store: &PackageStore,
    pkg_tuple: &PackageKey,
    visited: &mut BTreeSet<PackageKey>,
    built: &mut BTreeSet<PackageKey>,
    order: &mut Vec<PackageKey>,
) -> Result<()> {
    visited.insert(pkg_tuple.clone());

    let buildinfo = store.get_buildinfo(&pkg_tuple.0, pkg_tuple.1.as_deref())?;
    let mut requires = Vec::new();
    for require in buildinfo_requires(buildinfo)? {
        let requirement = expand_require(require).map_err(|e| {
            Error::BuildError(format!(
                "Depending on a specific package id is not supported. Package {} depends on {require}: {e}",
                pkg_tuple.0
            ))
        })?;
        requires.push(requirement);
    }
    requires.sort();

    for requirement in requires {
        let require_tuple = requirement.to_tuple();
        if built.contains(&require_tuple) {
            continue;
        }
        if visited.contains(&require_tuple) {
            return Err(Error::BuildError(format!(
                "Circular dependency. Circular link {} -> {}",
                key_display(pkg_tuple),
                key_display(&require_tuple)
            )));
        }
        if !store.packages().contains_key(&require_tuple) {
            return Err(Error::BuildError(format!(
                "Package {} require {} not buildable from tree.",
                key_display(pkg_tuple),
                key_display(&require_tuple)
            )));
        }
        visit(store, &require_tuple, visited, built, order)?;
    }

    order.push(pkg_tuple.clone());
    built.insert(pkg_tuple.clone());
    Ok(())
}

pub(crate) fn key_display((name, variant): &PackageKey) -> String {
    format!("{name} (variant {})", variant_name(variant.as_deref()))
}
