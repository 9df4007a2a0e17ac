//! Detached policy signatures.
//!
//! The policy document is hashed over its canonical form (compact JSON with
//! object keys sorted at every level), so formatting changes are irrelevant but any change to a value, key or array
//! element (including fields this crate does not interpret) breaks the hash.
//! The signature itself covers a domain-separated signing input that binds
//! the hash to the signer thumbprint and the signing time:
//!
//! ```text
//! warden-policy-v1\n<config_hash>\n<signer_thumbprint>\n<signed_at>
//! ```
//!
//! The signature record lives in a sidecar file next to the policy.

use crate::crypto;
use crate::custodian::KeyCustodian;
use crate::error::{Error, Result};
use crate::integrity;
use crate::policy::Policy;
use crate::settings::Settings;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Signature algorithm identifier recorded in the sidecar.
pub const SIGNATURE_ALGORITHM: &str = "rsassa-pkcs1v15-sha256";

/// Domain separator for the signing input.
pub const SIGNING_CONTEXT: &str = "warden-policy-v1";

/// The sidecar record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySignature {
    pub algorithm: String,
    /// Lowercase hex SHA-256 of the canonical policy body
    pub config_hash: String,
    #[serde(with = "crypto::b64")]
    pub signature: Vec<u8>,
    pub signer_thumbprint: String,
    pub signed_at: DateTime<Utc>,
}

impl PolicySignature {
    /// Bytes the signature is computed over.
    pub fn signing_input(&self) -> Vec<u8> {
        signing_input(&self.config_hash, &self.signer_thumbprint, &self.signed_at)
    }
}

fn signing_input(config_hash: &str, thumbprint: &str, signed_at: &DateTime<Utc>) -> Vec<u8> {
    format!(
        "{}\n{}\n{}\n{}",
        SIGNING_CONTEXT,
        config_hash.to_ascii_lowercase(),
        thumbprint.to_ascii_lowercase(),
        signed_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
    .into_bytes()
}

/// Canonical hash of a policy body.
///
/// `serde_json::Value` keeps objects in a sorted map, so serializing the
/// parsed value compactly yields the same bytes for any key order or
/// whitespace.
pub fn canonical_hash(body: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_vec(body)?;
    Ok(crypto::sha256_hex(&canonical))
}

/// A policy whose signature checked out.
#[derive(Debug, Clone)]
pub struct VerifiedPolicy {
    pub policy: Policy,
    pub signature: PolicySignature,
}

impl VerifiedPolicy {
    pub fn thumbprint(&self) -> &str {
        &self.signature.signer_thumbprint
    }
}

/// Signs and verifies the policy document.
#[derive(Debug, Clone)]
pub struct ConfigSigner {
    policy_path: PathBuf,
    signature_path: PathBuf,
    binaries_root: PathBuf,
    custodian: KeyCustodian,
}

impl ConfigSigner {
    pub fn new(
        policy_path: impl Into<PathBuf>,
        signature_path: impl Into<PathBuf>,
        binaries_root: impl Into<PathBuf>,
        custodian: KeyCustodian,
    ) -> Self {
        Self {
            policy_path: policy_path.into(),
            signature_path: signature_path.into(),
            binaries_root: binaries_root.into(),
            custodian,
        }
    }

    pub fn from_settings(settings: &Settings, custodian: KeyCustodian) -> Self {
        Self::new(
            settings.paths.policy.clone(),
            settings.paths.signature_path(),
            settings.paths.binaries_root.clone(),
            custodian,
        )
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    pub fn signature_path(&self) -> &Path {
        &self.signature_path
    }

    /// Sign the policy on disk.
    ///
    /// With `update_binary_hashes`, every entry in `binaries` is re-hashed
    /// from the binaries root and the rewritten body is what gets signed.
    /// Nothing is written until the signature exists, so a wrong password
    /// or an unreadable binary leaves the previous policy and sidecar in
    /// place.
    pub fn sign_config(
        &self,
        private_password: &SecretString,
        update_binary_hashes: bool,
    ) -> Result<PolicySignature> {
        let mut body = self.read_body()?;
        let mut policy = Policy::from_value(body.clone())?;
        let signer = self.custodian.load_private(private_password)?;

        if update_binary_hashes {
            let changed = integrity::refresh_binary_entries(&mut policy, &self.binaries_root)?;
            info!(
                binaries = policy.binaries.len(),
                changed, "binary digests refreshed"
            );
            body = serde_json::to_value(&policy)?;
        }

        let unsigned_binaries: Vec<_> = policy
            .binaries
            .iter()
            .filter(|(_, b)| b.sha256.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        if !unsigned_binaries.is_empty() {
            warn!(
                binaries = ?unsigned_binaries,
                "signing a policy with binaries that have no recorded digest"
            );
        }

        let config_hash = canonical_hash(&body)?;
        let signed_at = Utc::now().trunc_subsecs(3);
        let input = signing_input(&config_hash, signer.thumbprint(), &signed_at);

        let record = PolicySignature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            config_hash,
            signature: signer.sign(&input),
            signer_thumbprint: signer.thumbprint().to_string(),
            signed_at,
        };
        drop(signer);

        let mut json = serde_json::to_string_pretty(&record)?;
        json.push('\n');

        if update_binary_hashes {
            let mut text = serde_json::to_string_pretty(&body)?;
            text.push('\n');
            crate::fsutil::write_atomic(&self.policy_path, text.as_bytes(), false)?;
        }
        crate::fsutil::write_atomic(&self.signature_path, json.as_bytes(), false)?;

        info!(
            policy = %self.policy_path.display(),
            hash = %record.config_hash,
            thumbprint = %record.signer_thumbprint,
            "policy signed"
        );
        Ok(record)
    }

    /// Verify the policy on disk against its sidecar.
    ///
    /// Failures are reported in a fixed order: missing sidecar, unparsable
    /// sidecar, signer identity that will not unlock, hash mismatch, bad
    /// signature.
    pub fn verify_config(&self, public_password: &SecretString) -> Result<VerifiedPolicy> {
        if !self.policy_path.exists() {
            return Err(Error::PolicyNotFound(self.policy_path.display().to_string()));
        }

        let record = self.read_signature()?;

        let signer = self
            .custodian
            .load_public(public_password)
            .map_err(|e| match e {
                Error::Authentication => Error::SignerAuthFailed,
                other => other,
            })?;

        let body = self.read_body()?;
        let actual = canonical_hash(&body)?;
        if !crypto::digests_match(&record.config_hash, &actual) {
            return Err(Error::ConfigHashMismatch {
                expected: record.config_hash.to_ascii_lowercase(),
                actual,
            });
        }

        if !crypto::digests_match(&record.signer_thumbprint, signer.thumbprint()) {
            return Err(Error::SignatureInvalid(format!(
                "signed by {} but the installed identity is {}",
                record.signer_thumbprint,
                signer.thumbprint()
            )));
        }

        crypto::rsa_verify(signer.public_key(), &record.signing_input(), &record.signature)?;

        let policy = Policy::from_value(body)?;
        debug!(hash = %actual, "policy signature verified");
        Ok(VerifiedPolicy {
            policy,
            signature: record,
        })
    }

    /// Whether a sidecar exists.
    pub fn is_signed(&self) -> bool {
        self.signature_path.exists()
    }

    fn read_body(&self) -> Result<serde_json::Value> {
        let bytes = match std::fs::read(&self.policy_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PolicyNotFound(self.policy_path.display().to_string()));
            }
            Err(e) => return Err(Error::io(&self.policy_path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::PolicyInvalid(format!("{}: {}", self.policy_path.display(), e))
        })
    }

    fn read_signature(&self) -> Result<PolicySignature> {
        let bytes = match std::fs::read(&self.signature_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SignatureFileMissing(
                    self.signature_path.display().to_string(),
                ));
            }
            Err(e) => return Err(Error::io(&self.signature_path, e)),
        };
        let record: PolicySignature = serde_json::from_slice(&bytes)
            .map_err(|e| Error::SignatureCorrupt(e.to_string()))?;
        if record.algorithm != SIGNATURE_ALGORITHM {
            return Err(Error::SignatureCorrupt(format!(
                "unsupported algorithm '{}'",
                record.algorithm
            )));
        }
        Ok(record)
    }
}
