// src/package.rs

//! Package identity and metadata
//!
//! A package is identified by `name--version`. The version half is normally
//! the build hash, so ids are unique per set of build inputs. Each extracted
//! package carries a `pkginfo.json` describing what it needs from the host
//! when activated: environment variables, dependencies, a system user, a
//! state directory and sysctl settings.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

pub const NAME_REGEX: &str = r"^[a-zA-Z0-9@_+][a-zA-Z0-9@._+\-]*$";
pub const VERSION_REGEX: &str = r"^[a-zA-Z0-9@_+:.]+$";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(NAME_REGEX).unwrap());
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(VERSION_REGEX).unwrap());

/// Separator between name and version
const ID_SEPARATOR: &str = "--";

/// A validated `name--version` package identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId {
    name: String,
    version: String,
}

impl PackageId {
    /// Split and validate an id string
    pub fn parse(id: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = id.split(ID_SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(Error::ValidationError(format!(
                "Invalid package id {id}. Package ids may only contain one '--' \
                 which separates the name and version"
            )));
        }

        Self::validate_name(parts[0])?;
        Self::validate_version(parts[1])?;

        Ok((parts[0].to_string(), parts[1].to_string()))
    }

    pub fn from_parts(name: &str, version: &str) -> Result<Self> {
        Self::validate_name(name)?;
        Self::validate_version(version)?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Names may contain `[a-zA-Z0-9@._+-]` but not start with `.` or `-`
    pub fn validate_name(name: &str) -> Result<()> {
        if !NAME_RE.is_match(name) {
            return Err(Error::ValidationError(format!(
                "Invalid package name {name}. Must match the regex {NAME_REGEX}"
            )));
        }
        Ok(())
    }

    /// Versions may contain `[a-zA-Z0-9@._+:]` and never a `-`
    pub fn validate_version(version: &str) -> Result<()> {
        if !VERSION_RE.is_match(version) {
            return Err(Error::ValidationError(format!(
                "Invalid package version {version}. Must match the regex {VERSION_REGEX}"
            )));
        }
        Ok(())
    }

    /// Whether a string looks like an id (exactly one `--`)
    ///
    /// This doesn't validate the halves; it's used to tell ids apart from
    /// bare package names.
    pub fn is_id(s: &str) -> bool {
        s.matches(ID_SEPARATOR).count() == 1
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for PackageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = Self::parse(s)?;
        Ok(Self { name, version })
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, ID_SEPARATOR, self.version)
    }
}

impl Serialize for PackageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PackageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A dependency on another package
///
/// Dependencies are never pinned to an exact id. They resolve to whatever
/// build of the named package (and variant) is current.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Requirement {
    /// Any version of the default variant
    ByName(String),
    /// Any version of a specific variant
    ByNameAndVariant(String, String),
}

impl Requirement {
    pub fn name(&self) -> &str {
        match self {
            Requirement::ByName(name) | Requirement::ByNameAndVariant(name, _) => name,
        }
    }

    pub fn variant(&self) -> Option<&str> {
        match self {
            Requirement::ByName(_) => None,
            Requirement::ByNameAndVariant(_, variant) => Some(variant),
        }
    }

    /// `(name, variant)` form used to index build definitions
    pub fn to_tuple(&self) -> (String, Option<String>) {
        (self.name().to_string(), self.variant().map(str::to_string))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::ByName(name) => write!(f, "{name}"),
            Requirement::ByNameAndVariant(name, variant) => write!(f, "{name} (variant {variant})"),
        }
    }
}

/// Normalize a `requires` entry
///
/// Entries are either a bare package name or an object with both `name` and
/// `variant` keys (a `null` variant means the default variant). Depending on
/// an exact package id is rejected.
pub fn expand_require(require: &Value) -> Result<Requirement> {
    let requirement = match require {
        Value::String(name) => Requirement::ByName(name.clone()),
        Value::Object(map) => {
            let (Some(name), Some(variant)) = (map.get("name"), map.get("variant")) else {
                return Err(Error::ValidationError(
                    "When specifying a dependency in requires by dictionary to depend on a \
                     variant both the name of the package and the variant name must always \
                     be specified"
                        .to_string(),
                ));
            };
            let name = name.as_str().ok_or_else(|| {
                Error::ValidationError(format!("Dependency name must be a string, got {name}"))
            })?;
            match variant {
                Value::Null => Requirement::ByName(name.to_string()),
                Value::String(v) => Requirement::ByNameAndVariant(name.to_string(), v.clone()),
                other => {
                    return Err(Error::ValidationError(format!(
                        "Dependency variant must be a string or null, got {other}"
                    )));
                }
            }
        }
        other => {
            return Err(Error::ValidationError(format!(
                "Dependencies must be a package name or a {{name, variant}} object, got {other}"
            )));
        }
    };

    if PackageId::is_id(requirement.name()) {
        return Err(Error::ValidationError(format!(
            "Specifying a dependency on '{}', an exact package id, isn't allowed. \
             Dependencies may be specified by package name alone or package name + \
             variant (to change the package variant).",
            requirement.name()
        )));
    }

    Ok(requirement)
}

/// Expand every entry of a `requires` list
pub fn expand_requires(requires: &[Value]) -> Result<Vec<Requirement>> {
    requires.iter().map(expand_require).collect()
}

/// Contents of a package's `pkginfo.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkgInfo {
    pub environment: BTreeMap<String, String>,
    pub requires: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub state_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// service name -> sysctl key -> value
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, BTreeMap<String, String>>,
}

/// An extracted package loaded from a repository
#[derive(Debug, Clone)]
pub struct Package {
    id: PackageId,
    path: PathBuf,
    pkginfo: PkgInfo,
}

impl Package {
    pub fn new(path: impl Into<PathBuf>, id: PackageId, pkginfo: PkgInfo) -> Self {
        Self {
            id,
            path: path.into(),
            pkginfo,
        }
    }

    pub fn id(&self) -> &PackageId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn version(&self) -> &str {
        self.id.version()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pkginfo(&self) -> &PkgInfo {
        &self.pkginfo
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.pkginfo.environment
    }

    pub fn sysctl(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.pkginfo.sysctl
    }

    pub fn variant(&self) -> Option<&str> {
        self.pkginfo.variant.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.pkginfo.username.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.pkginfo.group.as_deref()
    }

    pub fn state_directory(&self) -> bool {
        self.pkginfo.state_directory
    }

    /// Directory of executable health checks shipped by the package
    pub fn check_dir(&self) -> PathBuf {
        self.path.join("check")
    }

    /// Deduplicated, expanded requirements
    pub fn requirements(&self) -> Result<BTreeSet<Requirement>> {
        self.pkginfo.requires.iter().map(expand_require).collect()
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_round_trip() {
        let id: PackageId = "mesos--0.22.0".parse().unwrap();
        assert_eq!(id.name(), "mesos");
        assert_eq!(id.version(), "0.22.0");
        assert_eq!(id.to_string(), "mesos--0.22.0");

        let built = PackageId::from_parts("mesos-config", "ffddcfb5").unwrap();
        assert_eq!(built.to_string().parse::<PackageId>().unwrap(), built);
    }

    #[test]
    fn test_parse_separator_count() {
        assert!("mesos".parse::<PackageId>().is_err());
        assert!("a--b--c".parse::<PackageId>().is_err());
        assert!(matches!(
            PackageId::parse("a--b--c"),
            Err(Error::ValidationError(_))
        ));
    }

    #[test]
    fn test_name_and_version_rules() {
        assert!(PackageId::validate_name("dcos-image_2@x+y.z").is_ok());
        assert!(PackageId::validate_name("-leading").is_err());
        assert!(PackageId::validate_name(".leading").is_err());
        assert!(PackageId::validate_name("").is_err());
        assert!(PackageId::validate_version("1.2:3+4@5_6").is_ok());
        assert!(PackageId::validate_version("1-2").is_err());
        assert!("name---version".parse::<PackageId>().is_err());
    }

    #[test]
    fn test_is_id() {
        assert!(PackageId::is_id("a--b"));
        assert!(!PackageId::is_id("a-b"));
        assert!(!PackageId::is_id("a--b--c"));
    }

    #[test]
    fn test_expand_require() {
        assert_eq!(
            expand_require(&json!("mesos")).unwrap(),
            Requirement::ByName("mesos".into())
        );
        assert_eq!(
            expand_require(&json!({"name": "mesos", "variant": "ee"})).unwrap(),
            Requirement::ByNameAndVariant("mesos".into(), "ee".into())
        );
        assert_eq!(
            expand_require(&json!({"name": "mesos", "variant": null})).unwrap(),
            Requirement::ByName("mesos".into())
        );
    }

    #[test]
    fn test_expand_require_rejects_bad_entries() {
        assert!(expand_require(&json!({"name": "mesos"})).is_err());
        assert!(expand_require(&json!({"variant": "ee"})).is_err());
        assert!(expand_require(&json!("mesos--0.22.0")).is_err());
        assert!(expand_require(&json!({"name": "mesos--1", "variant": null})).is_err());
        assert!(expand_require(&json!(3)).is_err());
    }

    #[test]
    fn test_pkginfo_defaults() {
        let info: PkgInfo = serde_json::from_str("{}").unwrap();
        assert!(info.environment.is_empty());
        assert!(info.requires.is_empty());
        assert!(!info.state_directory);
        assert!(info.username.is_none());
    }

    #[test]
    fn test_requirements_deduplicated() {
        let info: PkgInfo =
            serde_json::from_value(json!({"requires": ["a", "a", {"name": "b", "variant": "x"}]}))
                .unwrap();
        let pkg = Package::new("/tmp/x--1", "x--1".parse().unwrap(), info);
        let reqs = pkg.requirements().unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(pkg.check_dir(), PathBuf::from("/tmp/x--1/check"));
    }
}
