// src/build/executor.rs

//! Running build scripts in a container
//!
//! Package builds run in a throwaway container with the sources, the build
//! script and the already built dependencies bind-mounted in. The
//! [`BuildExecutor`] trait is the seam: [`DockerExecutor`] drives the docker
//! CLI, tests substitute an executor that runs the "build" in-process.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// A host path mounted into the build container (read-only by default)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Source path on host
    pub source: PathBuf,
    /// Target path in container
    pub target: PathBuf,
    pub writable: bool,
}

impl BindMount {
    pub fn readonly(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: false,
        }
    }

    pub fn writable(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: true,
        }
    }

    /// `host:container:mode` as passed to `docker run -v`
    pub fn volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source.display(),
            self.target.display(),
            if self.writable { "rw" } else { "ro" }
        )
    }
}

/// One container invocation
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    pub image: String,
    pub mounts: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub cmd: Vec<String>,
}

impl BuildSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }
}

/// Something that can run build containers
pub trait BuildExecutor {
    /// Id of a locally present image, `None` when it isn't present
    fn image_id(&self, image: &str) -> Result<Option<String>>;

    fn pull(&self, image: &str) -> Result<()>;

    /// Run the container to completion, returning its exit code
    fn run(&self, spec: &BuildSpec) -> Result<i32>;
}

/// Image id, pulling the image first if it isn't present
pub fn resolve_image_id(executor: &dyn BuildExecutor, image: &str) -> Result<String> {
    if let Some(id) = executor.image_id(image)? {
        return Ok(id);
    }
    info!("Pulling build image {}", image);
    executor.pull(image)?;
    executor
        .image_id(image)?
        .ok_or_else(|| Error::BuildError(format!("Docker image {image} not present after pull")))
}

/// Build containers through the docker CLI
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    docker: PathBuf,
}

impl DockerExecutor {
    pub fn new() -> Result<Self> {
        let docker = which::which("docker")
            .map_err(|e| Error::BuildError(format!("docker is required to build packages: {e}")))?;
        Ok(Self { docker })
    }

    /// Full `docker run` argument list for a spec
    pub fn run_args(spec: &BuildSpec) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }
        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

impl BuildExecutor for DockerExecutor {
    fn image_id(&self, image: &str) -> Result<Option<String>> {
        let output = Command::new(&self.docker)
            .args(["inspect", "-f", "{{ .Id }}", image])
            .output()
            .map_err(|e| Error::CommandFailed(format!("Failed to run docker inspect: {e}")))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    fn pull(&self, image: &str) -> Result<()> {
        let status = Command::new(&self.docker)
            .args(["pull", image])
            .status()
            .map_err(|e| Error::CommandFailed(format!("Failed to run docker pull: {e}")))?;
        if !status.success() {
            return Err(Error::BuildError(format!("docker pull {image} failed")));
        }
        Ok(())
    }

    fn run(&self, spec: &BuildSpec) -> Result<i32> {
        let args = Self::run_args(spec);
        debug!("docker {}", args.join(" "));
        let status = Command::new(&self.docker)
            .args(&args)
            .status()
            .map_err(|e| Error::CommandFailed(format!("Failed to run docker: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }
}
