// tests/setup.rs

//! Integration tests for first boot setup of a bootstrapped host.

mod common;

use common::{write_tree, TestHost};
use pkgpanda::actions;
use pkgpanda::archive::make_tar;
use pkgpanda::install::INSTALL_PROGRESS_FILENAME;
use pkgpanda::Error;
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const CONFIG_ID: &str = "mesos-config--ffddcfb53168d42f92e4771c6f8a8a9a818fd6b8";

/// A host as extracted from a bootstrap tarball: mesos active, sentinel set
fn bootstrapped_host() -> TestHost {
    let host = TestHost::new();
    host.add_package(
        "mesos--0.22.0",
        json!({"requires": ["mesos-config"]}),
        &[
            ("bin/mesos-master", "0.22.0"),
            ("dcos.target.wants/mesos-master.service", "[Unit]\n"),
        ],
    );
    host.add_package(CONFIG_ID, json!({}), &[("etc/mesos-master", "")]);

    let install = host.install();
    let repository = host.repository();
    actions::activate_packages(&install, &repository, &["mesos--0.22.0", CONFIG_ID], false, false).unwrap();
    fs::write(host.root().join("bootstrap"), "").unwrap();
    host
}

/// A remote repository holding one built package
fn remote_repository(dir: &Path, id: &str, name: &str) {
    let contents = dir.join("contents");
    write_tree(&contents, &[("pkginfo.json", "{}"), ("bin/marathon", "marathon")]);
    let package_dir = dir.join("packages").join(name);
    fs::create_dir_all(&package_dir).unwrap();
    make_tar(&package_dir.join(format!("{id}.tar.xz")), &contents).unwrap();
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_setup_fetches_cluster_packages() {
    let host = bootstrapped_host();
    let remote = host.temp.path().join("remote");
    remote_repository(&remote, "marathon--0.8.0", "marathon");

    let flags = host.config_dir().join("setup-flags");
    fs::create_dir_all(&flags).unwrap();
    fs::write(flags.join("repository-url"), format!("file://{}\n", remote.display())).unwrap();
    fs::write(flags.join("cluster-packages.json"), json!(["marathon--0.8.0"]).to_string()).unwrap();

    let install = host.install();
    let repository = host.repository();
    actions::setup(&install, &repository, false).unwrap();

    assert_eq!(
        install.get_active().unwrap(),
        ids(&["marathon--0.8.0", "mesos--0.22.0", CONFIG_ID])
    );
    assert_eq!(fs::read_to_string(host.root().join("bin/marathon")).unwrap(), "marathon");
    assert!(host.repository_dir().join("marathon--0.8.0/pkginfo.json").exists());

    // dcos.target lands beside the wants dir and the sentinel is consumed
    assert!(fs::read_to_string(host.root().join("dcos.target")).unwrap().contains("WantedBy=multi-user.target"));
    assert!(!host.root().join("bootstrap").exists());
    assert_eq!(
        host.services.calls().last().map(String::as_str),
        Some("start dcos.target")
    );
}

#[test]
fn test_setup_without_repository_url() {
    let host = bootstrapped_host();
    let flags = host.config_dir().join("setup-flags");
    fs::create_dir_all(&flags).unwrap();
    fs::write(flags.join("cluster-packages.json"), json!(["marathon--0.8.0"]).to_string()).unwrap();

    let install = host.install();
    let err = actions::setup(&install, &host.repository(), false).unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)));
    assert_eq!(
        err.to_string(),
        "Non-local package marathon--0.8.0 but no repository url given."
    );
    // Nothing was activated, the host can be set up again
    assert!(host.root().join("bootstrap").exists());
    assert_eq!(install.get_active().unwrap(), ids(&["mesos--0.22.0", CONFIG_ID]));
}

#[test]
fn test_setup_packages_and_active_json() {
    let host = bootstrapped_host();
    let setup_packages = host.config_dir().join("setup-packages");
    write_tree(
        &setup_packages.join("dcos-config--setup"),
        &[("pkginfo.json", "{}"), ("etc/dcos.conf", "cluster=test\n")],
    );
    let flags = host.config_dir().join("setup-flags");
    fs::create_dir_all(&flags).unwrap();
    fs::write(flags.join("active.json"), json!(["mesos--0.22.0", CONFIG_ID]).to_string()).unwrap();

    let install = host.install();
    actions::setup(&install, &host.repository(), false).unwrap();

    assert_eq!(
        install.get_active().unwrap(),
        ids(&["dcos-config--setup", "mesos--0.22.0", CONFIG_ID])
    );
    assert_eq!(
        fs::read_to_string(host.root().join("etc/dcos.conf")).unwrap(),
        "cluster=test\n"
    );
}

#[test]
fn test_setup_package_must_have_setup_version() {
    let host = bootstrapped_host();
    write_tree(
        &host.config_dir().join("setup-packages/dcos-config--1"),
        &[("pkginfo.json", "{}")],
    );

    let err = actions::setup(&host.install(), &host.repository(), false).unwrap_err();
    assert!(err.to_string().starts_with("Setup packages (those in `"));
    assert!(err.to_string().ends_with("Bad package: dcos-config--1"));
}

#[test]
fn test_setup_finishes_interrupted_swap() {
    let host = bootstrapped_host();
    fs::remove_file(host.root().join("bootstrap")).unwrap();

    let install = host.install();
    for name in install.get_active_names() {
        let mut new_name = name.as_os_str().to_owned();
        new_name.push(".new");
        fs::rename(&name, new_name).unwrap();
    }
    fs::write(
        host.root().join(INSTALL_PROGRESS_FILENAME),
        json!({"extension": ".new", "stage": "move_new"}).to_string(),
    )
    .unwrap();

    actions::setup(&install, &host.repository(), false).unwrap();
    assert_eq!(install.get_active().unwrap(), ids(&["mesos--0.22.0", CONFIG_ID]));
    assert!(!host.root().join(INSTALL_PROGRESS_FILENAME).exists());
}
