// src/config.rs

//! Well-known paths, constants and install options
//!
//! Production defaults live here so the CLI, the activation engine and the
//! bootstrap builder agree on where things are. Tests construct
//! [`InstallOptions`] pointing at temporary directories instead.

use std::path::PathBuf;

/// Root every package is activated under on a real host
pub const INSTALL_ROOT: &str = "/opt/mesosphere";

/// Machine configuration (roles, setup flags, setup packages)
pub const CONFIG_DIR: &str = "/etc/mesosphere";

/// Default local package repository
pub const REPOSITORY_BASE: &str = "/opt/mesosphere/packages";

/// Parent of per-package state directories
pub const STATE_DIR_ROOT: &str = "/var/lib/dcos";

/// Systemd wants directory used when systemd isn't rooted under the install
pub const SYSTEMD_WANTS_DIR: &str = "/etc/systemd/system/dcos.target.wants";

/// Unit names a package may never ship
pub const RESERVED_UNIT_NAMES: &[&str] = &["dcos.target", "dcos-download.service", "dcos-setup.service"];

/// Per-service configuration generated during activation, placed in `etc/`
pub const DCOS_SERVICE_CONFIGURATION_FILE: &str = "dcos-service-configuration.json";

/// Key under which sysctl settings are collected in the service configuration
pub const SYSCTL_SETTING_KEY: &str = "sysctl";

/// Contents of the target unit written by `setup`
pub const DCOS_TARGET_CONTENTS: &str = "[Install]\nWantedBy=multi-user.target\n";

/// Version folded into every package hash. Bumping it rebuilds everything.
pub const PKGPANDA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Options controlling how an [`crate::Install`] behaves
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Root of the install tree
    pub root: PathBuf,
    /// Machine configuration directory; `None` disables roles and setup flags
    pub config_dir: Option<PathBuf>,
    /// Use `{root}/dcos.target.wants` instead of the system wants directory
    pub rooted_systemd: bool,
    /// Stop/start units through the service manager
    pub manage_systemd: bool,
    /// Wait for units to stop/start
    pub block_systemd: bool,
    /// Write `/opt/mesosphere` into environment files instead of the real root
    pub fake_path: bool,
    /// Don't treat the wants directory as a well-known directory
    pub skip_systemd_dirs: bool,
    /// Provision package users at all
    pub manage_users: bool,
    /// Create package users that don't exist yet
    pub add_users: bool,
    /// Create and chown per-package state directories
    pub manage_state_dir: bool,
    /// Parent of state directories, without a trailing slash
    pub state_dir_root: PathBuf,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(INSTALL_ROOT),
            config_dir: Some(PathBuf::from(CONFIG_DIR)),
            rooted_systemd: false,
            manage_systemd: true,
            block_systemd: true,
            fake_path: false,
            skip_systemd_dirs: false,
            manage_users: false,
            add_users: false,
            manage_state_dir: false,
            state_dir_root: PathBuf::from(STATE_DIR_ROOT),
        }
    }
}

impl InstallOptions {
    /// Options for a scratch root: systemd rooted and unmanaged, no users
    pub fn scratch(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_dir: None,
            rooted_systemd: true,
            manage_systemd: false,
            block_systemd: true,
            ..Self::default()
        }
    }
}

/// Filename prefix for a variant: `""` or `"{variant}."`
pub fn variant_prefix(variant: Option<&str>) -> String {
    match variant {
        Some(v) => format!("{v}."),
        None => String::new(),
    }
}

/// Human readable variant name
pub fn variant_name(variant: Option<&str>) -> &str {
    variant.unwrap_or("<default>")
}

/// Variant as stored in build ids: the default variant is the empty string
pub fn variant_str(variant: Option<&str>) -> &str {
    variant.unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_helpers() {
        assert_eq!(variant_prefix(None), "");
        assert_eq!(variant_prefix(Some("ee")), "ee.");
        assert_eq!(variant_name(None), "<default>");
        assert_eq!(variant_str(Some("ee")), "ee");
    }

    #[test]
    fn test_scratch_options() {
        let opts = InstallOptions::scratch("/tmp/root");
        assert!(opts.rooted_systemd);
        assert!(!opts.manage_systemd);
        assert!(opts.config_dir.is_none());
        assert_eq!(opts.state_dir_root, PathBuf::from(STATE_DIR_ROOT));
    }
}
