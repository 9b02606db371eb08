// src/build/sources.rs

//! Source fetchers for package builds
//!
//! Each entry in a buildinfo's `sources` names a `kind` and the keys that
//! kind needs. A fetcher reports a checkout id (the git commit or the sha1 of
//! the downloaded artifact) that goes into the package hash, and can check
//! the source out into a directory.

use crate::archive::extract_archive;
use crate::download::download_atomic;
use crate::error::{Error, Result};
use crate::hash::sha1_file;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// A source that can be identified and checked out
pub trait SourceFetcher {
    /// Unique id of this version of the source
    fn get_id(&self) -> Map<String, Value>;

    /// Make the source appear in `directory`
    fn checkout_to(&self, directory: &Path) -> Result<()>;
}

/// Build the fetcher for one `sources` entry
///
/// `cache_dir` holds downloads and git mirrors between builds.
/// `working_directory` (the package folder) resolves `git_local` paths and
/// relative `file://` urls.
pub fn get_src_fetcher(
    src_info: &Value,
    cache_dir: &Path,
    working_directory: &Path,
) -> Result<Box<dyn SourceFetcher>> {
    let info = src_info
        .as_object()
        .ok_or_else(|| Error::ValidationError(format!("Source must be an object, got {src_info}")))?;
    let kind = str_field(info, "kind")?;

    match kind {
        "git" => Ok(Box::new(GitSrcFetcher::new(info, cache_dir)?)),
        "git_local" => Ok(Box::new(GitLocalSrcFetcher::new(info, working_directory)?)),
        "url" | "url_extract" => Ok(Box::new(UrlSrcFetcher::new(info, cache_dir, working_directory)?)),
        other => Err(Error::ValidationError(format!(
            "No known way to catch src with kind '{other}'. Known kinds: git, git_local, url, url_extract"
        ))),
    }
}

fn str_field<'a>(info: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    info.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ValidationError(format!("Source field '{key}' must be a string")))
}

fn key_set(info: &Map<String, Value>) -> BTreeSet<&str> {
    info.keys().map(String::as_str).collect()
}

/// A 40 character hex string
pub fn is_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn run_git(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .map_err(|e| Error::CommandFailed(format!("Failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(Error::CommandFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Resolve `git_ref` to a commit sha in the repository at `git_dir`
fn get_git_sha1(git_dir: &Path, git_ref: &str) -> Result<String> {
    let git_dir_str = git_dir.to_string_lossy();
    let commit_ref = format!("{git_ref}^{{commit}}");
    run_git(&["--git-dir", &git_dir_str, "rev-parse", &commit_ref])
        .map(|out| out.trim().to_string())
        .map_err(|e| {
            Error::ValidationError(format!(
                "Unable to find ref '{git_ref}' in '{}': {e}",
                git_dir.display()
            ))
        })
}

/// Clone or update a mirror of `git_uri` at `bare_folder`
fn fetch_git(bare_folder: &Path, git_uri: &str) -> Result<()> {
    let bare = bare_folder.to_string_lossy();
    if !bare_folder.exists() {
        run_git(&["clone", "--mirror", "--progress", git_uri, &bare])?;
    } else {
        run_git(&["--git-dir", &bare, "remote", "set-url", "origin", git_uri])?;
        run_git(&["--git-dir", &bare, "remote", "update", "origin"])?;
    }
    Ok(())
}

fn clone_and_checkout(repo: &Path, directory: &Path, commit: &str) -> Result<()> {
    let repo = repo.to_string_lossy();
    let dir = directory.to_string_lossy();
    run_git(&["clone", "-q", &repo, &dir])?;

    let git_dir = directory.join(".git");
    let git_dir = git_dir.to_string_lossy();
    run_git(&["--git-dir", &git_dir, "--work-tree", &dir, "checkout", "-f", "-q", commit])?;
    Ok(())
}

/// A commit of a remote git repository, mirrored in the cache
pub struct GitSrcFetcher {
    url: String,
    git_ref: String,
    ref_origin: String,
    bare_folder: PathBuf,
}

impl GitSrcFetcher {
    pub fn new(info: &Map<String, Value>, cache_dir: &Path) -> Result<Self> {
        if key_set(info) != BTreeSet::from(["kind", "git", "ref", "ref_origin"]) {
            return Err(Error::ValidationError(
                "git source must have keys 'git' (the repo to fetch), 'ref' (the sha-1 to checkout), \
                 and 'ref_origin' (the branch/tag ref was derived from)"
                    .to_string(),
            ));
        }

        let git_ref = str_field(info, "ref")?;
        if !is_sha(git_ref) {
            return Err(Error::ValidationError(format!("ref must be a sha1. Got: {git_ref}")));
        }

        Ok(Self {
            url: str_field(info, "git")?.to_string(),
            git_ref: git_ref.to_string(),
            ref_origin: str_field(info, "ref_origin")?.to_string(),
            bare_folder: cache_dir.join("cache.git"),
        })
    }
}

impl SourceFetcher for GitSrcFetcher {
    fn get_id(&self) -> Map<String, Value> {
        let mut id = Map::new();
        id.insert("commit".to_string(), Value::String(self.git_ref.clone()));
        id
    }

    fn checkout_to(&self, directory: &Path) -> Result<()> {
        fetch_git(&self.bare_folder, &self.url)?;

        let origin_commit = get_git_sha1(&self.bare_folder, &self.ref_origin).map_err(|e| {
            Error::ValidationError(format!("Unable to find sha1 of ref_origin {}: {e}", self.ref_origin))
        })?;
        if origin_commit != self.git_ref {
            warn!(
                "Current ref doesn't match the ref origin. Package ref should probably be updated \
                 to pick up new changes to the code: Current: {}, Origin: {}",
                self.git_ref, origin_commit
            );
        }

        clone_and_checkout(&self.bare_folder, directory, &self.git_ref)
    }
}

/// The committed HEAD of a git checkout next to the package
pub struct GitLocalSrcFetcher {
    src_repo_path: PathBuf,
    commit: String,
}

impl GitLocalSrcFetcher {
    pub fn new(info: &Map<String, Value>, working_directory: &Path) -> Result<Self> {
        if !key_set(info).is_subset(&BTreeSet::from(["kind", "rel_path"])) {
            return Err(Error::ValidationError(
                "Only kind, rel_path can be specified for git_local".to_string(),
            ));
        }

        let rel_path = Path::new(str_field(info, "rel_path")?);
        if rel_path.is_absolute() {
            return Err(Error::ValidationError(
                "rel_path must be a relative path to the current directory when used with git_local. \
                 Using a relative path means others that clone the repository will have things just \
                 work rather than a path."
                    .to_string(),
            ));
        }
        let src_repo_path = normalize(&working_directory.join(rel_path));
        let repo = src_repo_path.to_string_lossy();

        // Local changes can't be cloned, so they'd silently be left out.
        let status = run_git(&["-C", &repo, "status", "--porcelain", "-uno", "-z"]).map_err(|_| {
            Error::ValidationError(format!(
                "Unable to check status of git_local_work checkout {}. Is the rel_path correct?",
                rel_path.display()
            ))
        })?;
        if !status.is_empty() {
            return Err(Error::ValidationError(format!(
                "No local changes are allowed in the git_local_work base repository. Use `git -C {repo} \
                 status` to see local changes. All local changes must be committed or stashed before \
                 the package can be built.\n\nFound changes: {status}"
            )));
        }

        let commit = get_git_sha1(&src_repo_path.join(".git"), "HEAD")?;
        Ok(Self { src_repo_path, commit })
    }
}

impl SourceFetcher for GitLocalSrcFetcher {
    fn get_id(&self) -> Map<String, Value> {
        let mut id = Map::new();
        id.insert("commit".to_string(), Value::String(self.commit.clone()));
        id
    }

    fn checkout_to(&self, directory: &Path) -> Result<()> {
        clone_and_checkout(&self.src_repo_path, directory, &self.commit)?;
        let head = get_git_sha1(&directory.join(".git"), "HEAD")?;
        if head != self.commit {
            return Err(Error::ValidationError(format!(
                "Checked out {head} but expected {}",
                self.commit
            )));
        }
        Ok(())
    }
}

/// A downloaded artifact pinned by sha1, optionally extracted
pub struct UrlSrcFetcher {
    url: String,
    sha: String,
    extract: bool,
    cache_filename: PathBuf,
    working_directory: PathBuf,
}

impl UrlSrcFetcher {
    pub fn new(info: &Map<String, Value>, cache_dir: &Path, working_directory: &Path) -> Result<Self> {
        if key_set(info) != BTreeSet::from(["kind", "sha1", "url"]) {
            return Err(Error::ValidationError(
                "url and url_extract sources must have exactly 'sha1' (sha1 of the artifact which will \
                 be downloaded), and 'url' (url to download artifact) as options"
                    .to_string(),
            ));
        }

        let url = str_field(info, "url")?.to_string();
        let cache_filename = cache_dir.join(Self::url_filename(&url)?);
        Ok(Self {
            sha: str_field(info, "sha1")?.to_string(),
            extract: str_field(info, "kind")? == "url_extract",
            url,
            cache_filename,
            working_directory: working_directory.to_path_buf(),
        })
    }

    /// Last path component of the part after the scheme
    fn url_filename(url: &str) -> Result<String> {
        let (_, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::ValidationError(format!("Scheme separator not found in url {url}")))?;
        let rest = rest.trim_end_matches('/');
        Ok(rest.rsplit('/').next().unwrap_or(rest).to_string())
    }
}

impl SourceFetcher for UrlSrcFetcher {
    fn get_id(&self) -> Map<String, Value> {
        let mut id = Map::new();
        id.insert("downloaded_sha1".to_string(), Value::String(self.sha.clone()));
        id
    }

    fn checkout_to(&self, directory: &Path) -> Result<()> {
        if !self.cache_filename.exists() {
            info!("Downloading source tarball {}", self.url);
            download_atomic(&self.cache_filename, &self.url, &self.working_directory)?;
        }

        let file_sha = sha1_file(&self.cache_filename)?;
        if file_sha != self.sha {
            let mut corrupt = self.cache_filename.as_os_str().to_owned();
            corrupt.push(".corrupt");
            let corrupt = PathBuf::from(corrupt);
            fs::rename(&self.cache_filename, &corrupt)?;
            return Err(Error::ValidationError(format!(
                "Provided sha1 didn't match sha1 of downloaded file, corrupt download saved as {}. \
                 Provided: {}, Download file's sha1: {}, Url: {}",
                corrupt.display(),
                self.sha,
                file_sha,
                self.url
            )));
        }

        if self.extract {
            extract_archive(&self.cache_filename, directory)
        } else {
            let filename = Self::url_filename(&self.url)?;
            fs::copy(&self.cache_filename, directory.join(filename))?;
            Ok(())
        }
    }
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_str;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_is_sha() {
        assert!(is_sha("a9993e364706816aba3e25717850c26c9cd0d89d"));
        assert!(!is_sha("a9993e36"));
        assert!(!is_sha("z9993e364706816aba3e25717850c26c9cd0d89d"));
    }

    #[test]
    fn test_unknown_kind() {
        let temp = TempDir::new().unwrap();
        let err = get_src_fetcher(&json!({"kind": "svn"}), temp.path(), temp.path())
            .err()
            .unwrap();
        assert!(err.to_string().contains("kind 'svn'"));
    }

    #[test]
    fn test_git_source_validation() {
        let temp = TempDir::new().unwrap();
        let sha = "a9993e364706816aba3e25717850c26c9cd0d89d";
        let good = json!({"kind": "git", "git": "https://example.com/r.git", "ref": sha, "ref_origin": "master"});
        let fetcher = get_src_fetcher(&good, temp.path(), temp.path()).unwrap();
        assert_eq!(Value::Object(fetcher.get_id()), json!({"commit": sha}));

        let missing = json!({"kind": "git", "git": "https://example.com/r.git", "ref": sha});
        assert!(get_src_fetcher(&missing, temp.path(), temp.path()).is_err());

        let branch = json!({"kind": "git", "git": "x", "ref": "master", "ref_origin": "master"});
        let err = get_src_fetcher(&branch, temp.path(), temp.path()).err().unwrap();
        assert!(err.to_string().starts_with("ref must be a sha1"));
    }

    #[test]
    fn test_git_local_rejects_absolute_path() {
        let temp = TempDir::new().unwrap();
        let src = json!({"kind": "git_local", "rel_path": "/abs"});
        assert!(get_src_fetcher(&src, temp.path(), temp.path()).is_err());
        let extra = json!({"kind": "git_local", "rel_path": "x", "ref": "y"});
        assert!(get_src_fetcher(&extra, temp.path(), temp.path()).is_err());
    }

    #[test]
    fn test_url_source_download_and_copy() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("pkg");
        let cache = temp.path().join("cache");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::create_dir_all(&cache).unwrap();
        fs::write(pkg_dir.join("payload.txt"), "abc").unwrap();

        let src = json!({"kind": "url", "url": "file://payload.txt", "sha1": hash_str("abc")});
        let fetcher = get_src_fetcher(&src, &cache, &pkg_dir).unwrap();
        assert_eq!(
            Value::Object(fetcher.get_id()),
            json!({"downloaded_sha1": hash_str("abc")})
        );

        let out = temp.path().join("src");
        fs::create_dir(&out).unwrap();
        fetcher.checkout_to(&out).unwrap();
        assert_eq!(fs::read_to_string(out.join("payload.txt")).unwrap(), "abc");
        assert!(cache.join("payload.txt").exists());
    }

    #[test]
    fn test_url_source_sha_mismatch() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("payload.txt"), "abc").unwrap();
        let cache = temp.path().join("cache");
        fs::create_dir(&cache).unwrap();

        let src = json!({"kind": "url", "url": "file://payload.txt", "sha1": hash_str("other")});
        let fetcher = get_src_fetcher(&src, &cache, temp.path()).unwrap();
        let err = fetcher.checkout_to(temp.path()).unwrap_err();
        assert!(err.to_string().starts_with("Provided sha1 didn't match"));
        assert!(cache.join("payload.txt.corrupt").exists());
        assert!(!cache.join("payload.txt").exists());
    }

    #[test]
    fn test_url_requires_exact_keys() {
        let temp = TempDir::new().unwrap();
        let src = json!({"kind": "url", "url": "file://x"});
        assert!(get_src_fetcher(&src, temp.path(), temp.path()).is_err());
        let src = json!({"kind": "url", "url": "no-scheme", "sha1": "x"});
        assert!(get_src_fetcher(&src, temp.path(), temp.path()).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    }
}
