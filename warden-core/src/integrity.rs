//! Binary integrity checks against the digests recorded in a signed policy.

use crate::crypto;
use crate::error::{Error, Result};
use crate::options::{ActiveBypasses, Gate};
use crate::policy::{resolve_under, BinaryEntry, Policy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Content digest and metadata of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub sha256: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Stream `path` through SHA-256.
pub fn hash_file(path: &Path) -> Result<FileDigest> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let metadata = file.metadata().map_err(|e| Error::io(path, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileDigest {
        sha256: hex::encode(hasher.finalize()),
        size,
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// Outcome of checking one file against one expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCheck {
    pub valid: bool,
    pub actual_digest: String,
}

/// Hash `path` and compare against `expected_digest` (case-insensitive).
pub fn verify_one(path: &Path, expected_digest: &str) -> Result<DigestCheck> {
    let actual = hash_file(path)?.sha256;
    Ok(DigestCheck {
        valid: !expected_digest.is_empty() && crypto::digests_match(expected_digest, &actual),
        actual_digest: actual,
    })
}

/// Per-binary result inside an [`IntegrityReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryResult {
    pub name: String,
    pub path: PathBuf,
    pub expected: String,
    /// `None` when the file could not be hashed
    pub actual: Option<String>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub all_valid: bool,
    pub results: Vec<BinaryResult>,
    /// The development integrity bypass was in force
    pub bypassed: bool,
}

impl IntegrityReport {
    pub fn failures(&self) -> impl Iterator<Item = &BinaryResult> {
        self.results.iter().filter(|r| !r.valid)
    }

    /// Turn the first failure into [`Error::BinaryTampered`].
    pub fn into_result(self) -> Result<Self> {
        if self.all_valid {
            return Ok(self);
        }
        let first = self.failures().next().cloned();
        match first {
            Some(failure) => Err(Error::BinaryTampered {
                name: failure.name,
                expected: failure.expected,
                actual: failure.actual.or(failure.error).unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

/// Verifies every binary named in a policy.
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    root: PathBuf,
    bypass: bool,
}

impl IntegrityChecker {
    /// `bypasses` decides whether mismatches are tolerated; it only carries
    /// the integrity gate when resolved in development mode.
    pub fn new(root: impl Into<PathBuf>, bypasses: &ActiveBypasses) -> Self {
        Self {
            root: root.into(),
            bypass: bypasses.is_bypassed(Gate::Integrity),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn verify_all(&self, policy: &Policy) -> IntegrityReport {
        let results: Vec<BinaryResult> = policy
            .binaries
            .iter()
            .map(|(name, entry)| self.check_entry(name, entry))
            .collect();

        let mismatches = results.iter().filter(|r| !r.valid).count();
        for failure in results.iter().filter(|r| !r.valid) {
            if self.bypass {
                warn!(
                    binary = %failure.name,
                    expected = %failure.expected,
                    actual = ?failure.actual,
                    "DEVELOPMENT BYPASS: integrity mismatch tolerated"
                );
            } else {
                error!(
                    binary = %failure.name,
                    expected = %failure.expected,
                    actual = ?failure.actual,
                    error = ?failure.error,
                    "binary integrity check failed"
                );
            }
        }
        debug!(
            checked = results.len(),
            mismatches,
            bypassed = self.bypass,
            "integrity check complete"
        );

        IntegrityReport {
            all_valid: mismatches == 0 || self.bypass,
            results,
            bypassed: self.bypass,
        }
    }

    fn check_entry(&self, name: &str, entry: &BinaryEntry) -> BinaryResult {
        let mut result = BinaryResult {
            name: name.to_string(),
            path: PathBuf::from(&entry.path),
            expected: entry.sha256.to_ascii_lowercase(),
            actual: None,
            valid: false,
            error: None,
        };

        if entry.sha256.is_empty() {
            result.error = Some("no digest recorded in the signed policy".into());
            return result;
        }

        let path = match resolve_under(&self.root, &entry.path) {
            Ok(p) => p,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.path = path.clone();

        match verify_one(&path, &entry.sha256) {
            Ok(check) => {
                result.valid = check.valid;
                result.actual = Some(check.actual_digest);
            }
            Err(e) => result.error = Some(e.to_string()),
        }
        result
    }
}

/// Recompute digest, size and timestamp for every binary in `policy`.
///
/// Returns how many entries changed.
pub fn refresh_binary_entries(policy: &mut Policy, root: &Path) -> Result<usize> {
    let mut changed = 0;
    for (name, entry) in policy.binaries.iter_mut() {
        let path = resolve_under(root, &entry.path)?;
        let digest = hash_file(&path).map_err(|e| {
            Error::PolicyInvalid(format!("cannot hash binary '{}': {}", name, e))
        })?;
        if !crypto::digests_match(&entry.sha256, &digest.sha256) {
            changed += 1;
        }
        entry.sha256 = digest.sha256;
        entry.size = digest.size;
        entry.modified = digest.modified;
    }
    Ok(changed)
}
