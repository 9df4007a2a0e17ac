//! Settings file parser.
//!
//! # Settings File Format
//!
//! ```yaml
//! version: "1"
//!
//! paths:
//!   policy: "policy.json"
//!   key_dir: "keys"
//!   state_dir: "state"
//!   binaries_root: "."
//!
//! kdf:
//!   public_iterations: 210000
//!   private_iterations: 600000
//!
//! identity:
//!   key_bits: 4096
//!   common_name: "Warden Policy Signer"
//!   validity_days: 3650
//!
//! session:
//!   production_expiry_secs: 30
//!   development_expiry_secs: 300
//!   clock_skew_secs: 5
//!   max_nonces: 10000
//!
//! helper:
//!   path: "bin/helper"
//! ```
//!
//! Every section is optional. Relative paths are resolved against the
//! directory containing the settings file.

use crate::error::{Error, Result};
use crate::options::SecurityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest modulus accepted for a signing identity at all.
pub const MIN_KEY_BITS: usize = 2048;

/// Smallest modulus accepted when initialising a production identity.
pub const MIN_PRODUCTION_KEY_BITS: usize = 4096;

/// Warden settings parsed from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub kdf: KdfSettings,
    #[serde(default)]
    pub identity: IdentitySettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub helper: HelperSettings,
}

fn default_version() -> String {
    "1".into()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            paths: PathSettings::default(),
            kdf: KdfSettings::default(),
            identity: IdentitySettings::default(),
            session: SessionSettings::default(),
            helper: HelperSettings::default(),
        }
    }
}

/// Locations of on-disk artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_policy_path")]
    pub policy: PathBuf,
    /// Signature sidecar (default: `<policy>.sig`)
    #[serde(default)]
    pub signature: Option<PathBuf>,
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory that binary paths in the policy are relative to
    #[serde(default = "default_binaries_root")]
    pub binaries_root: PathBuf,
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("policy.json")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_binaries_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            policy: default_policy_path(),
            signature: None,
            key_dir: default_key_dir(),
            state_dir: default_state_dir(),
            binaries_root: default_binaries_root(),
        }
    }
}

impl PathSettings {
    /// Sidecar path, defaulting to the policy path with `.sig` appended.
    pub fn signature_path(&self) -> PathBuf {
        match &self.signature {
            Some(p) => p.clone(),
            None => {
                let mut name = self.policy.clone().into_os_string();
                name.push(".sig");
                PathBuf::from(name)
            }
        }
    }
}

/// PBKDF2 work factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfSettings {
    #[serde(default = "default_public_iterations")]
    pub public_iterations: u32,
    #[serde(default = "default_private_iterations")]
    pub private_iterations: u32,
}

fn default_public_iterations() -> u32 {
    210_000
}

fn default_private_iterations() -> u32 {
    600_000
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            public_iterations: default_public_iterations(),
            private_iterations: default_private_iterations(),
        }
    }
}

/// Parameters for a freshly generated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySettings {
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_key_bits() -> usize {
    MIN_PRODUCTION_KEY_BITS
}

fn default_common_name() -> String {
    "Warden Policy Signer".into()
}

fn default_validity_days() -> u32 {
    3650
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            key_bits: default_key_bits(),
            common_name: default_common_name(),
            validity_days: default_validity_days(),
        }
    }
}

/// Session token window and replay store bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_production_expiry")]
    pub production_expiry_secs: u64,
    #[serde(default = "default_development_expiry")]
    pub development_expiry_secs: u64,
    /// Tolerated clock difference for tokens stamped in the future
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
    #[serde(default = "default_max_nonces")]
    pub max_nonces: usize,
}

fn default_production_expiry() -> u64 {
    30
}

fn default_development_expiry() -> u64 {
    300
}

fn default_clock_skew() -> u64 {
    5
}

fn default_max_nonces() -> usize {
    10_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            production_expiry_secs: default_production_expiry(),
            development_expiry_secs: default_development_expiry(),
            clock_skew_secs: default_clock_skew(),
            max_nonces: default_max_nonces(),
        }
    }
}

impl SessionSettings {
    /// Token lifetime for the given mode.
    pub fn window(&self, mode: SecurityMode) -> Duration {
        Duration::from_secs(match mode {
            SecurityMode::Production => self.production_expiry_secs,
            SecurityMode::Development => self.development_expiry_secs,
        })
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

/// Native helper executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Arguments placed before `--command` (e.g. a script for an interpreter)
    #[serde(default)]
    pub args: Vec<String>,
}

impl Settings {
    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load settings from a file, resolving relative paths against its
    /// directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut settings = Self::from_yaml(&content)?;
        if let Some(base) = path.parent() {
            settings.resolve_relative_to(base);
        }
        Ok(settings)
    }

    /// Rebase every relative path onto `base`.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.paths.policy);
        rebase(&mut self.paths.key_dir);
        rebase(&mut self.paths.state_dir);
        rebase(&mut self.paths.binaries_root);
        if let Some(sig) = self.paths.signature.as_mut() {
            rebase(sig);
        }
        if let Some(helper) = self.helper.path.as_mut() {
            rebase(helper);
        }
    }

    /// Validate the settings, collecting every problem.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.version != "1" {
            errors.push(ValidationError::new(
                "version",
                format!("unsupported settings version '{}'", self.version),
            ));
        }

        if self.kdf.public_iterations == 0 {
            errors.push(ValidationError::new(
                "kdf.public_iterations",
                "must be greater than zero",
            ));
        }
        if self.kdf.private_iterations <= self.kdf.public_iterations {
            errors.push(ValidationError::new(
                "kdf.private_iterations",
                format!(
                    "must be strictly greater than kdf.public_iterations ({})",
                    self.kdf.public_iterations
                ),
            ));
        }

        if self.identity.key_bits < MIN_KEY_BITS {
            errors.push(ValidationError::new(
                "identity.key_bits",
                format!("must be at least {}", MIN_KEY_BITS),
            ));
        }
        if self.identity.common_name.trim().is_empty() {
            errors.push(ValidationError::new(
                "identity.common_name",
                "must not be empty",
            ));
        }
        if self.identity.validity_days == 0 {
            errors.push(ValidationError::new(
                "identity.validity_days",
                "must be greater than zero",
            ));
        }

        if self.session.production_expiry_secs == 0 {
            errors.push(ValidationError::new(
                "session.production_expiry_secs",
                "must be greater than zero",
            ));
        }
        if self.session.development_expiry_secs < self.session.production_expiry_secs {
            errors.push(ValidationError::new(
                "session.development_expiry_secs",
                "must not be shorter than the production window",
            ));
        }
        if self.session.max_nonces == 0 {
            errors.push(ValidationError::new(
                "session.max_nonces",
                "must be greater than zero",
            ));
        }

        if self.paths.signature_path() == self.paths.policy {
            errors.push(ValidationError::new(
                "paths.signature",
                "must differ from paths.policy",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A single settings problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Location in the settings (e.g., "kdf.private_iterations")
    pub location: String,
    pub message: String,
}

impl ValidationError {
    fn new(location: &str, message: impl Into<String>) -> Self {
        Self {
            location: location.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}
