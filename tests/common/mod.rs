// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use pkgpanda::build::{BuildExecutor, BuildSpec};
use pkgpanda::users::{GroupEntry, UserEntry};
use pkgpanda::{Install, InstallOptions, Repository, Result, ServiceManager, UserProvisioner};
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

/// Records service manager calls instead of talking to systemd
#[derive(Clone, Default)]
pub struct RecordingServices {
    pub calls: Rc<RefCell<Vec<String>>>,
}

impl RecordingServices {
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl ServiceManager for RecordingServices {
    fn stop(&self, unit: &str, _block: bool) -> Result<()> {
        self.calls.borrow_mut().push(format!("stop {unit}"));
        Ok(())
    }

    fn daemon_reload(&self) -> Result<()> {
        self.calls.borrow_mut().push("daemon-reload".to_string());
        Ok(())
    }

    fn enable(&self, unit: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("enable {unit}"));
        Ok(())
    }

    fn start(&self, unit: &str, _block: bool) -> Result<()> {
        self.calls.borrow_mut().push(format!("start {unit}"));
        Ok(())
    }
}

/// A user database with nobody in it
#[derive(Default)]
pub struct NoUsers;

impl UserProvisioner for NoUsers {
    fn lookup_user(&self, _name: &str) -> Result<Option<UserEntry>> {
        Ok(None)
    }

    fn lookup_group(&self, _name: &str) -> Result<Option<GroupEntry>> {
        Ok(None)
    }

    fn create_user(&self, _username: &str, _group: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Pretends to be docker: every build drops `bin/{name}` into the result dir
#[derive(Default)]
pub struct FakeDocker {
    pub runs: RefCell<Vec<BuildSpec>>,
}

impl FakeDocker {
    /// Runs that executed a build script
    pub fn builds(&self) -> Vec<BuildSpec> {
        self.runs
            .borrow()
            .iter()
            .filter(|s| s.cmd.first().map(String::as_str) == Some("/bin/bash"))
            .cloned()
            .collect()
    }
}

impl BuildExecutor for FakeDocker {
    fn image_id(&self, image: &str) -> Result<Option<String>> {
        Ok(Some(format!("sha256:{image}")))
    }

    fn pull(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    fn run(&self, spec: &BuildSpec) -> Result<i32> {
        self.runs.borrow_mut().push(spec.clone());
        if spec.cmd.first().map(String::as_str) != Some("/bin/bash") {
            return Ok(0);
        }
        let result = spec
            .mounts
            .iter()
            .find(|m| m.writable && m.target.starts_with("/opt/mesosphere/packages"))
            .expect("result mount");
        fs::create_dir_all(result.source.join("bin"))?;
        fs::write(
            result.source.join("bin").join(&spec.env["PKG_NAME"]),
            &spec.env["PKG_ID"],
        )?;
        Ok(0)
    }
}

/// A scratch host: install root, repository and config dir under one tempdir
pub struct TestHost {
    pub temp: TempDir,
    pub services: RecordingServices,
}

impl TestHost {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("install")).unwrap();
        fs::create_dir_all(temp.path().join("repository")).unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        Self {
            temp,
            services: RecordingServices::default(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.temp.path().join("install")
    }

    pub fn repository_dir(&self) -> PathBuf {
        self.temp.path().join("repository")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.temp.path().join("etc")
    }

    pub fn options(&self) -> InstallOptions {
        InstallOptions {
            root: self.root(),
            config_dir: Some(self.config_dir()),
            rooted_systemd: true,
            manage_systemd: true,
            block_systemd: false,
            ..InstallOptions::default()
        }
    }

    /// A fresh `Install`; reopening simulates a new process after a crash
    pub fn install(&self) -> Install {
        Install::new(self.options(), Box::new(self.services.clone()), Box::new(NoUsers)).unwrap()
    }

    pub fn repository(&self) -> Repository {
        Repository::new(self.repository_dir()).unwrap()
    }

    /// Lay out an unpacked package directly in the repository
    pub fn add_package(&self, id: &str, pkginfo: Value, files: &[(&str, &str)]) -> PathBuf {
        let path = self.repository_dir().join(id);
        write_tree(&path, files);
        fs::write(path.join("pkginfo.json"), pkginfo.to_string()).unwrap();
        path
    }
}

/// Write `files` (relative path, contents) under `root`
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(root).unwrap();
    for (rel, contents) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
}

/// Sorted entry names of a directory
pub fn list_dir(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
