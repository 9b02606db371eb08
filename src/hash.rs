// src/hash.rs

//! Content hashing for package ids
//!
//! Package versions are derived from a canonical hash of everything that went
//! into a build. [`hash_checkout`] reduces a JSON value to a single SHA-1 hex
//! digest with these rules:
//!
//! | Value | Hash |
//! |-------|------|
//! | string | `sha1(s)` |
//! | integer | `sha1(decimal string)` |
//! | bool | `sha1("True" / "False")` |
//! | object | `sha1(",".join("{k}={hash(v)}" for k in sorted keys))` |
//! | array of strings | `sha1(",".join(hash(s) for s in sorted items))` |
//!
//! Objects and arrays are hashed independent of their input order, so the
//! same build inputs always yield the same id.

use crate::error::{Error, Result};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use walkdir::WalkDir;

/// Buffer size for streaming file hashes
const HASH_BUFFER_SIZE: usize = 8192;

/// SHA-1 hex digest of a string
pub fn hash_str(s: &str) -> String {
    hex::encode(Sha1::digest(s.as_bytes()))
}

/// Canonical recursive hash of a JSON value
pub fn hash_checkout(item: &Value) -> Result<String> {
    match item {
        Value::String(s) => Ok(hash_str(s)),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(hash_str(&n.to_string())),
        Value::Bool(b) => Ok(hash_str(if *b { "True" } else { "False" })),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut item_hashes = Vec::with_capacity(keys.len());
            for key in keys {
                item_hashes.push(format!("{}={}", key, hash_checkout(&map[key])?));
            }
            Ok(hash_str(&item_hashes.join(",")))
        }
        Value::Array(items) => {
            let mut strings = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => strings.push(s.as_str()),
                    other => {
                        return Err(Error::ParseError(format!(
                            "Lists may only contain strings to be hashed, found {other}"
                        )));
                    }
                }
            }
            strings.sort_unstable();
            let item_hashes: Vec<String> = strings.into_iter().map(hash_str).collect();
            Ok(hash_str(&item_hashes.join(",")))
        }
        other => Err(Error::ParseError(format!("Unable to hash {other}"))),
    }
}

/// Hash a list of strings (e.g. the package ids in a bootstrap)
pub fn hash_strings<S: AsRef<str>>(items: &[S]) -> String {
    let mut sorted: Vec<&str> = items.iter().map(|s| s.as_ref()).collect();
    sorted.sort_unstable();
    let item_hashes: Vec<String> = sorted.into_iter().map(hash_str).collect();
    hash_str(&item_hashes.join(","))
}

/// SHA-1 hex digest of a file's contents
pub fn sha1_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        Error::IoError(format!("Failed to open {} for hashing: {e}", path.display()))
    })?;
    sha1_reader(&mut file)
}

/// SHA-1 hex digest of everything a reader yields
pub fn sha1_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash every file under a directory
///
/// Builds a map of `path -> sha1(contents)` for all non-directory entries
/// (symlinks to files included, symlinked directories not descended) and
/// hashes that map with [`hash_checkout`]. The map is keyed by the full path
/// as walked from `directory`.
pub fn hash_folder(directory: &Path) -> Result<String> {
    let mut file_hashes = BTreeMap::new();
    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {e}", directory.display())))?;
        let path = entry.path();
        if entry.file_type().is_dir() || path.is_dir() {
            continue;
        }
        file_hashes.insert(
            path.to_string_lossy().into_owned(),
            Value::String(sha1_file(path)?),
        );
    }
    hash_checkout(&Value::Object(file_hashes.into_iter().collect()))
}
