// src/error.rs

//! Error types for pkgpanda
//!
//! Every fallible operation in the library returns [`Result`]. The variants
//! mirror the failure classes callers need to tell apart: bad input
//! (`ValidationError`), repository lookups (`PackageNotFound`,
//! `PackageError`), activation state problems (`InstallError`), build
//! failures (`BuildError`) and remote fetches (`Fetch`).

use crate::download::FetchError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using pkgpanda's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed ids, names, usernames, collisions between packages
    #[error("{0}")]
    ValidationError(String),

    /// Two sources tried to occupy the same path inside a merged tree
    #[error("Conflicting file {} from {}: {reason}", dest.display(), src.display())]
    ConflictingFile {
        src: PathBuf,
        dest: PathBuf,
        reason: String,
    },

    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("{0}")]
    PackageError(String),

    /// Operation would disturb an active package
    #[error("{0}")]
    PackageConflict(String),

    /// The install root is in a state the requested operation can't handle
    #[error("{0}")]
    InstallError(String),

    #[error("{0}")]
    BuildError(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// An external command (systemctl, git, docker, useradd) failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Re-label any error as a build failure, keeping its message
    ///
    /// The build pipeline reports everything that goes wrong underneath it
    /// (validation, fetch, activation of build dependencies) as a
    /// `BuildError` with the original text as context.
    pub fn into_build_error(self, context: &str) -> Error {
        match self {
            Error::BuildError(msg) => Error::BuildError(msg),
            other => Error::BuildError(format!("{context}: {other}")),
        }
    }
}
