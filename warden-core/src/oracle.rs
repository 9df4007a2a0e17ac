//! Boundary to the platform code-signing oracle.
//!
//! The oracle answers one question about an executable: does the platform
//! trust its signature, and who signed it. Platform integrations implement
//! [`SignatureOracle`]; this crate ships a fallback that trusts nothing and a
//! fixed-answer implementation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleVerdict {
    pub trusted: bool,
    /// Signer identity as reported by the platform
    pub signer: Option<String>,
    pub detail: String,
}

impl OracleVerdict {
    pub fn trusted(signer: impl Into<String>) -> Self {
        Self {
            trusted: true,
            signer: Some(signer.into()),
            detail: "signature trusted by platform".into(),
        }
    }

    pub fn untrusted(detail: impl Into<String>) -> Self {
        Self {
            trusted: false,
            signer: None,
            detail: detail.into(),
        }
    }
}

pub trait SignatureOracle: Send + Sync + Debug {
    fn query(&self, path: &Path) -> OracleVerdict;
}

/// Used when no platform integration is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOracle;

impl SignatureOracle for UnavailableOracle {
    fn query(&self, _path: &Path) -> OracleVerdict {
        OracleVerdict::untrusted("no platform signature oracle available")
    }
}

/// Answers from a fixed table. Unknown paths are untrusted.
#[derive(Debug, Default, Clone)]
pub struct StaticOracle {
    verdicts: HashMap<PathBuf, OracleVerdict>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trusted(mut self, path: impl Into<PathBuf>, signer: impl Into<String>) -> Self {
        self.verdicts
            .insert(path.into(), OracleVerdict::trusted(signer));
        self
    }

    pub fn with_untrusted(mut self, path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        self.verdicts
            .insert(path.into(), OracleVerdict::untrusted(detail));
        self
    }
}

impl SignatureOracle for StaticOracle {
    fn query(&self, path: &Path) -> OracleVerdict {
        self.verdicts
            .get(path)
            .cloned()
            .unwrap_or_else(|| OracleVerdict::untrusted("not signed"))
    }
}
