// src/download.rs

//! Fetching packages and sources
//!
//! Downloads go through a blocking reqwest client with retry support.
//! `file://` URLs are copied directly, resolving relative paths against a
//! caller supplied working directory. A failed download always tries to
//! remove the partially written file and reports if that cleanup failed too.

use crate::archive::extract_tarball;
use crate::error::Result;
use crate::package::PackageId;
use reqwest::blocking::Client;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// A failed download of `url` into `out_filename`
#[derive(Debug)]
pub struct FetchError {
    pub url: String,
    pub out_filename: PathBuf,
    pub reason: String,
    /// The partial download couldn't be removed
    pub rm_failed: bool,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Problem fetching {} to {} because of {}.",
            self.url,
            self.out_filename.display(),
            self.reason
        )?;
        if self.rm_failed {
            write!(
                f,
                " Unable to remove partial download. Future builds may have problems because of it."
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for FetchError {}

/// Whether a failed request is worth retrying
enum Attempt {
    Retry(String),
    Fatal(String),
}

fn http_get_to_file(url: &str, out_filename: &Path) -> std::result::Result<(), String> {
    let client = Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match client.get(url).send() {
            Ok(mut response) => {
                let status = response.status();
                if status.is_success() {
                    let mut file = File::create(out_filename)
                        .map_err(|e| format!("Failed to create {}: {e}", out_filename.display()))?;
                    io::copy(&mut response, &mut file)
                        .map_err(|e| format!("Failed to write downloaded data: {e}"))?;
                    file.sync_all()
                        .map_err(|e| format!("Failed to sync {}: {e}", out_filename.display()))?;
                    return Ok(());
                } else if status.is_server_error() {
                    Attempt::Retry(format!("HTTP {status}"))
                } else {
                    Attempt::Fatal(format!("HTTP {status}"))
                }
            }
            Err(e) => Attempt::Retry(e.to_string()),
        };

        match outcome {
            Attempt::Fatal(reason) => return Err(reason),
            Attempt::Retry(reason) if attempt >= MAX_RETRIES => {
                return Err(format!("{reason} (after {attempt} attempts)"));
            }
            Attempt::Retry(reason) => {
                warn!("Download attempt {} of {} failed: {}, retrying...", attempt, url, reason);
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
            }
        }
    }
}

/// Download `url` to `out_filename`
///
/// `work_dir` resolves relative `file://` paths. With `rm_on_error` a
/// failure removes whatever was written to `out_filename`.
pub fn download(
    out_filename: &Path,
    url: &str,
    work_dir: &Path,
    rm_on_error: bool,
) -> std::result::Result<(), FetchError> {
    let url = url.trim();

    let result = if let Some(src) = url.strip_prefix("file://") {
        let src = Path::new(src);
        let src_filename = if src.is_absolute() {
            src.to_path_buf()
        } else {
            work_dir.join(src)
        };
        debug!("Copying {} to {}", src_filename.display(), out_filename.display());
        fs::copy(&src_filename, out_filename)
            .map(|_| ())
            .map_err(|e| format!("{}: {e}", src_filename.display()))
    } else {
        http_get_to_file(url, out_filename)
    };

    result.map_err(|reason| {
        let rm_failed = rm_on_error && remove_partial(out_filename);
        FetchError {
            url: url.to_string(),
            out_filename: out_filename.to_path_buf(),
            reason,
            rm_failed,
        }
    })
}

/// Download to `{out_filename}.tmp` and rename into place on success
pub fn download_atomic(
    out_filename: &Path,
    url: &str,
    work_dir: &Path,
) -> std::result::Result<(), FetchError> {
    let mut tmp_name = out_filename.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_filename = PathBuf::from(tmp_name);

    download(&tmp_filename, url, work_dir, true)?;
    fs::rename(&tmp_filename, out_filename).map_err(|e| FetchError {
        url: url.to_string(),
        out_filename: out_filename.to_path_buf(),
        reason: format!("rename failed: {e}"),
        rm_failed: remove_partial(&tmp_filename),
    })
}

/// Remove a partially written file, true if it couldn't be removed
fn remove_partial(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => false,
        Err(e) => e.kind() != io::ErrorKind::NotFound,
    }
}

/// URL of a package tarball inside a remote repository
pub fn package_url(base_url: &str, id: &PackageId) -> String {
    format!(
        "{}/packages/{}/{}.tar.xz",
        base_url.trim_end_matches('/'),
        id.name(),
        id
    )
}

/// Fetch a package from a remote repository and extract it into `target`
///
/// Used as the fetcher callback for [`crate::Repository::add`].
pub fn repository_fetcher(base_url: &str, id: &PackageId, target: &Path, work_dir: &Path) -> Result<()> {
    let url = package_url(base_url, id);
    let tarball = tempfile::Builder::new()
        .prefix("pkgpanda-fetch")
        .suffix(".tar.xz")
        .tempfile()?;

    info!("Fetching {} from {}", id, url);
    download(tarball.path(), &url, work_dir, false)?;
    extract_tarball(tarball.path(), target)
}
