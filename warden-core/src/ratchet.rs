//! Per-installation security ratchet.
//!
//! Records whether a signed policy has ever been verified here, which gates
//! production policies required, and whether any verified policy ran in
//! production. None of it is ever cleared: a later policy that drops a gate
//! does not make that gate optional again for bypass purposes, and an
//! installation that once verified a production policy never again accepts
//! development mode from an unverified document.

use crate::error::{Error, Result};
use crate::options::{Gate, SecurityMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name inside the state directory.
pub const STATE_FILE: &str = "install-state.json";

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    pub version: u32,
    pub signed_policy_seen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_thumbprint: Option<String>,
    #[serde(default)]
    pub required_gates: BTreeSet<Gate>,
    #[serde(default)]
    pub production_locked: bool,
}

impl Default for InstallState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            signed_policy_seen: false,
            first_verified_at: None,
            last_verified_at: None,
            last_thumbprint: None,
            required_gates: BTreeSet::new(),
            production_locked: false,
        }
    }
}

impl InstallState {
    /// Whether starting without a policy is still acceptable.
    pub fn allows_insecure_bootstrap(&self) -> bool {
        !self.signed_policy_seen
    }

    /// Lowest mode an unverified policy may claim.
    pub fn mode_floor(&self) -> Option<SecurityMode> {
        self.production_locked.then_some(SecurityMode::Production)
    }

    /// Fold a successful verification into the state.
    ///
    /// Gates are only ratcheted for production policies.
    pub fn record_verified(
        &mut self,
        thumbprint: &str,
        gates: &BTreeSet<Gate>,
        mode: SecurityMode,
        at: DateTime<Utc>,
    ) {
        self.signed_policy_seen = true;
        self.first_verified_at.get_or_insert(at);
        self.last_verified_at = Some(at);
        self.last_thumbprint = Some(thumbprint.to_string());
        if mode.is_production() {
            self.production_locked = true;
            self.required_gates.extend(gates.iter().copied());
        }
    }
}

/// Reads and writes [`InstallState`] under a state directory.
#[derive(Debug, Clone)]
pub struct RatchetStore {
    path: PathBuf,
}

impl RatchetStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing file is a fresh installation; an unreadable
    /// or unparsable file is an error (callers treat it as blocking).
    pub fn load(&self) -> Result<InstallState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no install state; fresh installation");
                return Ok(InstallState::default());
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        let state: InstallState = serde_json::from_str(&content).map_err(|e| {
            Error::Configuration(format!(
                "install state {} is corrupt: {}",
                self.path.display(),
                e
            ))
        })?;
        if state.version != STATE_VERSION {
            return Err(Error::Configuration(format!(
                "install state {} has unsupported version {}",
                self.path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    pub fn save(&self, state: &InstallState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        crate::fsutil::write_atomic(&self.path, &json, false)?;
        info!(
            path = %self.path.display(),
            gates = state.required_gates.len(),
            "install state updated"
        );
        Ok(())
    }

    /// Load, record a verification, save.
    pub fn record_verified(
        &self,
        thumbprint: &str,
        gates: &BTreeSet<Gate>,
        mode: SecurityMode,
    ) -> Result<InstallState> {
        let mut state = self.load()?;
        state.record_verified(thumbprint, gates, mode, Utc::now());
        self.save(&state)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_install_allows_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let store = RatchetStore::new(dir.path());
        let state = store.load().unwrap();
        assert!(state.allows_insecure_bootstrap());
        assert!(state.required_gates.is_empty());
    }

    #[test]
    fn test_gates_only_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = RatchetStore::new(dir.path());

        let first: BTreeSet<_> = [Gate::Signature, Gate::Integrity].into_iter().collect();
        store
            .record_verified("aa", &first, SecurityMode::Production)
            .unwrap();

        let second: BTreeSet<_> = [Gate::SessionAuth].into_iter().collect();
        let state = store
            .record_verified("bb", &second, SecurityMode::Production)
            .unwrap();

        assert!(!state.allows_insecure_bootstrap());
        assert_eq!(state.required_gates.len(), 3);
        assert_eq!(state.last_thumbprint.as_deref(), Some("bb"));
        assert!(state.first_verified_at <= state.last_verified_at);
        assert_eq!(state.mode_floor(), Some(SecurityMode::Production));
    }

    #[test]
    fn test_development_policies_do_not_ratchet_gates() {
        let dir = tempfile::tempdir().unwrap();
        let store = RatchetStore::new(dir.path());
        let gates: BTreeSet<_> = Gate::ALL.into_iter().collect();
        let state = store
            .record_verified("aa", &gates, SecurityMode::Development)
            .unwrap();
        assert!(state.signed_policy_seen);
        assert!(state.required_gates.is_empty());
        assert_eq!(state.mode_floor(), None);
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();
        let err = RatchetStore::new(dir.path()).load().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
