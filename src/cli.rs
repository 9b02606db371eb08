// src/cli.rs
//! CLI definitions for pkgpanda
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pkgpanda")]
#[command(version)]
#[command(about = "Content-addressed package management with atomic activation", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub host: HostArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the host's packages live and how to drive systemd
#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    /// Install root (testing only: changing it breaks running packages)
    #[arg(long, global = true, default_value = "/opt/mesosphere")]
    pub root: PathBuf,

    /// Machine configuration directory (roles, setup flags)
    #[arg(long, global = true, default_value = "/etc/mesosphere")]
    pub config_dir: PathBuf,

    /// Local package repository (testing only)
    #[arg(long, global = true, default_value = "/opt/mesosphere/packages")]
    pub repository: PathBuf,

    /// Use $ROOT/dcos.target.wants rather than /etc/systemd/system/dcos.target.wants
    #[arg(long, global = true)]
    pub rooted_systemd: bool,

    /// Don't start or stop systemd services
    #[arg(long, global = true)]
    pub no_systemd: bool,

    /// Don't wait for systemd services to come up
    #[arg(long, global = true)]
    pub no_block_systemd: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    // =========================================================================
    // Host Commands
    // =========================================================================
    /// Replace the active package set
    Activate {
        /// Package ids to activate
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Replace the active package of the same name
    Swap {
        /// Package id to swap in
        package_id: String,
    },

    /// List active packages
    Active,

    /// Fetch packages from a remote repository
    Fetch {
        /// Base url of the remote repository
        #[arg(long)]
        repository_url: String,

        /// Package ids to fetch
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Add a {pkg-id}.tar.xz package tarball to the repository
    Add {
        /// Path to the package tarball
        package_tarball: PathBuf,
    },

    /// List packages in the repository
    List,

    /// Remove packages from the repository
    Remove {
        /// Package ids to remove
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Set up a freshly bootstrapped host, recover interrupted swaps
    Setup,

    /// Deactivate everything and remove the install root
    Uninstall,

    /// Run the health checks of active packages
    Check {
        /// Only list the checks
        #[arg(long)]
        list: bool,
    },

    // =========================================================================
    // Builder Commands
    // =========================================================================
    /// Build every variant of the package in the current directory
    Build {
        /// Remote cache of built packages
        #[arg(long)]
        repository_url: Option<String>,

        /// Keep src/ and result/ after building
        #[arg(long)]
        dont_clean_after_build: bool,

        /// Build dependencies that were never built
        #[arg(long)]
        recursive: bool,
    },

    /// Build every package of the trees in the current packages directory
    Tree {
        /// Also assemble the bootstrap tarball of each tree
        #[arg(long)]
        mkbootstrap: bool,

        /// Remote cache of built packages
        #[arg(long)]
        repository_url: Option<String>,

        /// Only build this tree variant
        variant: Option<String>,
    },
}
