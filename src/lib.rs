// src/lib.rs

//! pkgpanda: content-addressed packages and atomic activation
//!
//! Packages are immutable directories identified by `name--version`, where
//! the version of a built package is the hash of everything that went into
//! it. A host keeps them in a [`Repository`] and an [`Install`] switches the
//! host's active set of packages atomically, with crash recovery.
//!
//! # Architecture
//!
//! - Filesystem as database: every durable change is staged under a
//!   temporary name and made visible with one `rename`
//! - Capability traits ([`UserProvisioner`], [`ServiceManager`],
//!   [`build::BuildExecutor`]) at every point that touches the host
//! - Deterministic builds: identical inputs give an identical package id,
//!   so existing builds are never redone

pub mod actions;
pub mod archive;
pub mod build;
pub mod config;
pub mod download;
mod error;
pub mod hash;
pub mod install;
pub mod package;
pub mod repository;
pub mod users;

pub use config::InstallOptions;
pub use download::FetchError;
pub use error::{Error, Result};
pub use install::{Install, ServiceManager, Systemctl};
pub use package::{expand_require, Package, PackageId, PkgInfo, Requirement};
pub use repository::Repository;
pub use users::{SystemUsers, UserManagement, UserProvisioner};
