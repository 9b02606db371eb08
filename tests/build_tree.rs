// tests/build_tree.rs

//! Integration tests for building a package tree and its bootstrap tarball.

mod common;

use common::FakeDocker;
use pkgpanda::archive::extract_tarball;
use pkgpanda::build::{self, PackageStore};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn package(root: &Path, name: &str, buildinfo: Value) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("buildinfo.json"), buildinfo.to_string()).unwrap();
    fs::write(dir.join("build"), "make install\n").unwrap();
}

/// `a` needs `b`; only `a` and `b` go into the bootstrap tarball
fn packages_dir() -> TempDir {
    let temp = TempDir::new().unwrap();
    package(temp.path(), "a", json!({"requires": ["b"]}));
    package(temp.path(), "b", json!({}));
    package(temp.path(), "c", json!({}));
    fs::write(
        temp.path().join("treeinfo.json"),
        json!({
            "core_package_list": ["a", "b", "c"],
            "bootstrap_package_list": ["a", "b"],
        })
        .to_string(),
    )
    .unwrap();
    temp
}

#[test]
fn test_build_tree_with_bootstrap() {
    let temp = packages_dir();
    let store = PackageStore::new(temp.path(), None).unwrap();
    let docker = FakeDocker::default();

    let results = build::build_tree(&store, true, None, &docker).unwrap();
    let bootstrap_id = results[&None].clone().expect("bootstrap id");

    // Dependencies build before their dependents
    let built: Vec<String> = docker.builds().iter().map(|s| s.env["PKG_NAME"].clone()).collect();
    assert_eq!(built.len(), 3);
    let position = |name: &str| built.iter().position(|n| n == name).unwrap();
    assert!(position("b") < position("a"));

    let cache = store.get_bootstrap_cache_dir();
    assert_eq!(fs::read_to_string(cache.join("bootstrap.latest")).unwrap(), bootstrap_id);

    let complete: Value =
        serde_json::from_str(&fs::read_to_string(cache.join("complete.latest.json")).unwrap()).unwrap();
    assert_eq!(complete["bootstrap"], bootstrap_id.as_str());
    let all: Vec<&str> = complete["packages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|id| id.starts_with("c--")));

    let active: Vec<String> =
        serde_json::from_str(&fs::read_to_string(cache.join(format!("{bootstrap_id}.active.json"))).unwrap())
            .unwrap();
    assert_eq!(active.len(), 2);
    assert!(active[0].starts_with("a--"));
    assert!(active[1].starts_with("b--"));

    // The tarball is an install root ready to be extracted at /opt/mesosphere
    let extracted = temp.path().join("extracted");
    extract_tarball(&cache.join(format!("{bootstrap_id}.bootstrap.tar.xz")), &extracted).unwrap();
    assert!(extracted.join("bootstrap").exists());
    assert_eq!(common::list_dir(&extracted.join("active")), vec!["a", "b"]);
    assert_eq!(
        fs::read_link(extracted.join("active/a")).unwrap(),
        Path::new("/opt/mesosphere/packages").join(&active[0])
    );
    assert_eq!(
        fs::read_link(extracted.join("bin/a")).unwrap(),
        Path::new("/opt/mesosphere/packages").join(&active[0]).join("bin/a")
    );
    assert!(extracted.join(format!("packages/{}/pkginfo.json", active[1])).exists());
    let environment = fs::read_to_string(extracted.join("environment")).unwrap();
    assert!(environment.contains("PATH=/opt/mesosphere/bin"));

    // Packages outside the bootstrap list are left for the host to fetch
    let c_id = all.iter().find(|id| id.starts_with("c--")).unwrap();
    assert!(!extracted.join("packages").join(c_id).exists());
}

#[test]
fn test_build_tree_is_incremental() {
    let temp = packages_dir();
    let store = PackageStore::new(temp.path(), None).unwrap();
    let docker = FakeDocker::default();

    let first = build::build_tree(&store, true, None, &docker).unwrap();
    let second = build::build_tree(&store, true, None, &docker).unwrap();
    assert_eq!(first, second);
    assert_eq!(docker.builds().len(), 3);
}

#[test]
fn test_build_tree_without_bootstrap() {
    let temp = packages_dir();
    let store = PackageStore::new(temp.path(), None).unwrap();
    let docker = FakeDocker::default();

    let results = build::build_tree(&store, false, None, &docker).unwrap();
    assert_eq!(results.get(&None), Some(&None));
    assert!(!store.get_bootstrap_cache_dir().join("bootstrap.latest").exists());
    for name in ["a", "b", "c"] {
        assert!(store.get_last_build_filename(name, None).unwrap().exists());
    }
}

#[test]
fn test_tree_variants() {
    let temp = packages_dir();
    fs::write(temp.path().join("c/ee.buildinfo.json"), json!({}).to_string()).unwrap();
    fs::write(
        temp.path().join("ee.treeinfo.json"),
        json!({
            "core_package_list": ["c"],
            "variants": {"c": "ee"},
        })
        .to_string(),
    )
    .unwrap();
    let store = PackageStore::new(temp.path(), None).unwrap();
    let docker = FakeDocker::default();

    let results = build::build_tree(&store, false, Some("ee"), &docker).unwrap();
    assert_eq!(results.keys().collect::<Vec<_>>(), vec![&Some("ee".to_string())]);
    let builds = docker.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].env["PKG_VARIANT"], "ee");
}

#[test]
fn test_bootstrap_outputs_renamed_into_place() {
    let temp = packages_dir();
    let store = PackageStore::new(temp.path(), None).unwrap();
    let docker = FakeDocker::default();

    build::build_tree(&store, true, None, &docker).unwrap();
    let leftovers: Vec<String> = common::list_dir(&store.get_bootstrap_cache_dir())
        .into_iter()
        .filter(|name| name.contains("tmp"))
        .collect();
    assert!(leftovers.is_empty(), "staging files left behind: {leftovers:?}");
}

#[test]
fn test_partial_bootstrap_is_rebuilt() {
    let temp = packages_dir();
    let store = PackageStore::new(temp.path(), None).unwrap();
    let docker = FakeDocker::default();

    let bootstrap_id = build::build_tree(&store, true, None, &docker).unwrap()[&None].clone().unwrap();
    let cache = store.get_bootstrap_cache_dir();
    let tarball = cache.join(format!("{bootstrap_id}.bootstrap.tar.xz"));
    let active = cache.join(format!("{bootstrap_id}.active.json"));

    // Interrupted before the active list landed
    fs::write(&tarball, b"truncated").unwrap();
    fs::remove_file(&active).unwrap();

    let rebuilt = build::build_tree(&store, true, None, &docker).unwrap()[&None].clone().unwrap();
    assert_eq!(rebuilt, bootstrap_id);
    assert!(active.exists());
    let extracted = temp.path().join("extracted");
    extract_tarball(&tarball, &extracted).unwrap();
    assert!(extracted.join("bootstrap").exists());
    // Packages themselves were not rebuilt
    assert_eq!(docker.builds().len(), 3);
}
