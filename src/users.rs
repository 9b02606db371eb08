// src/users.rs

//! System user provisioning for activated packages
//!
//! Packages may ask to run as a dedicated system user (and optionally a
//! group). During one activation every requested user is registered with a
//! [`UserManagement`] session, which either validates that the user already
//! exists with the right group or creates it. Only users registered in the
//! session can be resolved to a uid, so state directories are never chowned
//! to a user nobody checked.
//!
//! Talking to the OS goes through the [`UserProvisioner`] trait.
//! [`SystemUsers`] is the real implementation (nix lookups plus `useradd`).

use crate::config::INSTALL_ROOT;
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::process::Command;
use std::sync::LazyLock;
use tracing::{debug, info};

pub const USERNAME_REGEX: &str = r"^dcos_[a-z0-9_]+$";
pub const GROUP_REGEX: &str = r"^[a-z_][a-z0-9_-]*$";

static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(USERNAME_REGEX).unwrap());
static GROUP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(GROUP_REGEX).unwrap());

/// A user account as seen by the provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
}

/// A group as seen by the provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    /// Supplementary members
    pub members: Vec<String>,
}

/// Access to the host's user database
pub trait UserProvisioner {
    fn lookup_user(&self, name: &str) -> Result<Option<UserEntry>>;

    fn lookup_group(&self, name: &str) -> Result<Option<GroupEntry>>;

    /// Create a system user, with `group` as primary group when given
    fn create_user(&self, username: &str, group: Option<&str>) -> Result<()>;
}

/// Provisioner backed by the live system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUsers;

impl UserProvisioner for SystemUsers {
    fn lookup_user(&self, name: &str) -> Result<Option<UserEntry>> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| Error::IoError(format!("Failed to look up user {name}: {e}")))?;
        Ok(user.map(|u| UserEntry {
            name: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        }))
    }

    fn lookup_group(&self, name: &str) -> Result<Option<GroupEntry>> {
        let group = nix::unistd::Group::from_name(name)
            .map_err(|e| Error::IoError(format!("Failed to look up group {name}: {e}")))?;
        Ok(group.map(|g| GroupEntry {
            name: g.name,
            gid: g.gid.as_raw(),
            members: g.mem,
        }))
    }

    fn create_user(&self, username: &str, group: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("useradd");
        cmd.args(["--system", "--home-dir", INSTALL_ROOT, "--shell", "/sbin/nologin"]);
        cmd.args(["-c", "DCOS System User"]);
        if let Some(g) = group {
            cmd.args(["-g", g]);
        }
        cmd.arg(username);

        let output = cmd
            .output()
            .map_err(|e| Error::CommandFailed(format!("Failed to run useradd: {e}")))?;
        if !output.status.success() {
            return Err(Error::CommandFailed(format!(
                "useradd exited with {:?}: {}{}",
                output.status.code(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        info!("Created system user '{}'", username);
        Ok(())
    }
}

/// Users requested during one activation
pub struct UserManagement<'a> {
    manage_users: bool,
    add_users: bool,
    users: BTreeSet<String>,
    provisioner: &'a dyn UserProvisioner,
}

impl<'a> UserManagement<'a> {
    pub fn new(manage_users: bool, add_users: bool, provisioner: &'a dyn UserProvisioner) -> Self {
        Self {
            manage_users,
            add_users,
            users: BTreeSet::new(),
            provisioner,
        }
    }

    pub fn validate_username(username: &str) -> Result<()> {
        if !USERNAME_RE.is_match(username) {
            return Err(Error::ValidationError(format!(
                "Username {username} must begin with `dcos_` and only have a-z and underscore after that"
            )));
        }
        Ok(())
    }

    pub fn validate_group_name(group: &str) -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }
        if !GROUP_RE.is_match(group) {
            return Err(Error::ValidationError(format!(
                "Group {group} has invalid name, must match the following regex: {GROUP_REGEX}"
            )));
        }
        Ok(())
    }

    /// Check the group name and that the group exists
    pub fn validate_group(&self, group: &str) -> Result<GroupEntry> {
        Self::validate_group_name(group)?;
        self.provisioner
            .lookup_group(group)?
            .ok_or_else(|| Error::ValidationError(format!("Group {group} does not exist on the system")))
    }

    /// An existing user must have `group` as primary group or be a member of it
    fn validate_user_group(&self, user: &UserEntry, group_name: &str) -> Result<()> {
        let group = self.validate_group(group_name)?;
        if user.gid == group.gid || group.members.iter().any(|m| m == &user.name) {
            return Ok(());
        }
        Err(Error::ValidationError(format!(
            "User {} exists with current GID {}, however it should be assigned to group {} \
             with GID {}, please check `buildinfo.json`",
            user.name, user.gid, group_name, group.gid
        )))
    }

    /// Make sure `username` exists (creating it if allowed) and record it
    pub fn add_user(&mut self, username: &str, group: Option<&str>) -> Result<()> {
        Self::validate_username(username)?;

        if !self.manage_users {
            return Ok(());
        }

        let group = group.filter(|g| !g.is_empty());

        if let Some(user) = self.provisioner.lookup_user(username)? {
            if let Some(group_name) = group {
                self.validate_user_group(&user, group_name)?;
            }
            debug!("User {} already exists", username);
            self.users.insert(username.to_string());
            return Ok(());
        }

        if !self.add_users {
            return Err(Error::ValidationError(format!(
                "User {username} doesn't exist but is required by a DC/OS Component, and \
                 automatic user addition is disabled"
            )));
        }

        // useradd creates a group matching the username; any other group
        // has to exist beforehand.
        let primary_group = match group {
            Some(g) if g != username => {
                self.validate_group(g)?;
                Some(g)
            }
            _ => None,
        };

        self.provisioner
            .create_user(username, primary_group)
            .map_err(|e| {
                Error::ValidationError(format!(
                    "User {username} doesn't exist and couldn't be created because of: {e}"
                ))
            })?;
        self.users.insert(username.to_string());
        Ok(())
    }

    /// uid of a user registered earlier in this session
    pub fn get_uid(&self, username: &str) -> Result<u32> {
        if !self.users.contains(username) {
            return Err(Error::InstallError(format!(
                "User {username} was not added before its uid was requested"
            )));
        }
        self.provisioner
            .lookup_user(username)?
            .map(|u| u.uid)
            .ok_or_else(|| Error::InstallError(format!("User {username} disappeared during activation")))
    }

    pub fn users(&self) -> &BTreeSet<String> {
        &self.users
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// In-memory user database
    #[derive(Default)]
    pub struct FakeUsers {
        pub users: RefCell<BTreeMap<String, UserEntry>>,
        pub groups: RefCell<BTreeMap<String, GroupEntry>>,
        pub created: RefCell<Vec<(String, Option<String>)>>,
    }

    impl FakeUsers {
        pub fn with_group(self, name: &str, gid: u32, members: &[&str]) -> Self {
            self.groups.borrow_mut().insert(
                name.to_string(),
                GroupEntry {
                    name: name.to_string(),
                    gid,
                    members: members.iter().map(|m| m.to_string()).collect(),
                },
            );
            self
        }

        pub fn with_user(self, name: &str, uid: u32, gid: u32) -> Self {
            self.users.borrow_mut().insert(
                name.to_string(),
                UserEntry {
                    name: name.to_string(),
                    uid,
                    gid,
                },
            );
            self
        }
    }

    impl UserProvisioner for FakeUsers {
        fn lookup_user(&self, name: &str) -> Result<Option<UserEntry>> {
            Ok(self.users.borrow().get(name).cloned())
        }

        fn lookup_group(&self, name: &str) -> Result<Option<GroupEntry>> {
            Ok(self.groups.borrow().get(name).cloned())
        }

        fn create_user(&self, username: &str, group: Option<&str>) -> Result<()> {
            let uid = 1000 + self.users.borrow().len() as u32;
            self.users.borrow_mut().insert(
                username.to_string(),
                UserEntry {
                    name: username.to_string(),
                    uid,
                    gid: uid,
                },
            );
            self.created
                .borrow_mut()
                .push((username.to_string(), group.map(str::to_string)));
            Ok(())
        }
    }

    #[test]
    fn test_username_validation() {
        assert!(UserManagement::validate_username("dcos_mesos").is_ok());
        assert!(UserManagement::validate_username("dcos_").is_err());
        assert!(UserManagement::validate_username("mesos").is_err());
        assert!(UserManagement::validate_username("dcos_Mesos").is_err());
    }

    #[test]
    fn test_group_name_validation() {
        assert!(UserManagement::validate_group_name("").is_ok());
        assert!(UserManagement::validate_group_name("dcos-group_1").is_ok());
        assert!(UserManagement::validate_group_name("1group").is_err());
    }

    #[test]
    fn test_unmanaged_users_is_noop() {
        let fake = FakeUsers::default();
        let mut users = UserManagement::new(false, false, &fake);
        users.add_user("dcos_adminrouter", None).unwrap();
        assert!(users.users().is_empty());
        assert!(users.add_user("root", None).is_err());
        assert!(users.get_uid("dcos_adminrouter").is_err());
    }

    #[test]
    fn test_existing_user_recorded() {
        let fake = FakeUsers::default().with_user("dcos_mesos", 500, 500);
        let mut users = UserManagement::new(true, false, &fake);
        users.add_user("dcos_mesos", None).unwrap();
        assert_eq!(users.get_uid("dcos_mesos").unwrap(), 500);
        assert!(fake.created.borrow().is_empty());
    }

    #[test]
    fn test_missing_user_without_add_users_fails() {
        let fake = FakeUsers::default();
        let mut users = UserManagement::new(true, false, &fake);
        let err = users.add_user("dcos_mesos", None).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[test]
    fn test_creates_user_with_group() {
        let fake = FakeUsers::default().with_group("dcos_group", 300, &[]);
        let mut users = UserManagement::new(true, true, &fake);
        users.add_user("dcos_mesos", Some("dcos_group")).unwrap();
        assert_eq!(
            fake.created.borrow().as_slice(),
            &[("dcos_mesos".to_string(), Some("dcos_group".to_string()))]
        );
        assert!(users.get_uid("dcos_mesos").is_ok());
    }

    #[test]
    fn test_group_matching_username_not_passed() {
        let fake = FakeUsers::default();
        let mut users = UserManagement::new(true, true, &fake);
        users.add_user("dcos_mesos", Some("dcos_mesos")).unwrap();
        assert_eq!(fake.created.borrow()[0].1, None);
    }

    #[test]
    fn test_missing_group_rejected() {
        let fake = FakeUsers::default();
        let mut users = UserManagement::new(true, true, &fake);
        let err = users.add_user("dcos_mesos", Some("nogroup")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_existing_user_group_mismatch() {
        let fake = FakeUsers::default()
            .with_user("dcos_mesos", 500, 500)
            .with_group("dcos_group", 300, &[]);
        let mut users = UserManagement::new(true, true, &fake);
        let err = users.add_user("dcos_mesos", Some("dcos_group")).unwrap_err();
        assert!(err.to_string().contains("dcos_group"));

        fake.groups
            .borrow_mut()
            .get_mut("dcos_group")
            .unwrap()
            .members
            .push("dcos_mesos".to_string());
        users.add_user("dcos_mesos", Some("dcos_group")).unwrap();
    }
}
