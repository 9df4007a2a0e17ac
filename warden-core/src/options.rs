//! Security mode and development bypass flags.
//!
//! [`SecurityOptions`] is captured once at process start and handed to every
//! gate. Nothing re-reads the environment afterwards.
//!
//! | Variable                        | Meaning                               |
//! |---------------------------------|---------------------------------------|
//! | `WARDEN_ENV`                    | `production` (default) or `development` |
//! | `WARDEN_BYPASS_SIGNATURE`       | skip policy signature verification    |
//! | `WARDEN_BYPASS_INTEGRITY`       | record but tolerate binary mismatches |
//! | `WARDEN_BYPASS_SESSION_AUTH`    | accept rejected session tokens        |
//! | `WARDEN_BYPASS_OS_ENFORCEMENT`  | tolerate untrusted platform signatures |

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

pub const ENV_MODE: &str = "WARDEN_ENV";
pub const ENV_BYPASS_SIGNATURE: &str = "WARDEN_BYPASS_SIGNATURE";
pub const ENV_BYPASS_INTEGRITY: &str = "WARDEN_BYPASS_INTEGRITY";
pub const ENV_BYPASS_SESSION_AUTH: &str = "WARDEN_BYPASS_SESSION_AUTH";
pub const ENV_BYPASS_OS_ENFORCEMENT: &str = "WARDEN_BYPASS_OS_ENFORCEMENT";

/// Deployment mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Production,
    Development,
}

impl SecurityMode {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    /// Parse a mode string. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            _ => None,
        }
    }

    /// Combine the environment's mode with a policy's mode.
    ///
    /// Development requires both sides to agree; either one can force
    /// production.
    pub fn effective(env: SecurityMode, policy: Option<SecurityMode>) -> SecurityMode {
        match (env, policy) {
            (Self::Development, None) | (Self::Development, Some(Self::Development)) => {
                Self::Development
            }
            _ => Self::Production,
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Development => "development",
        })
    }
}

/// A security gate that can be bypassed in development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Signature,
    Integrity,
    SessionAuth,
    OsEnforcement,
}

impl Gate {
    pub const ALL: [Gate; 4] = [
        Gate::Signature,
        Gate::Integrity,
        Gate::SessionAuth,
        Gate::OsEnforcement,
    ];

    /// Environment variable that requests a bypass for this gate.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Signature => ENV_BYPASS_SIGNATURE,
            Self::Integrity => ENV_BYPASS_INTEGRITY,
            Self::SessionAuth => ENV_BYPASS_SESSION_AUTH,
            Self::OsEnforcement => ENV_BYPASS_OS_ENFORCEMENT,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signature => "signature",
            Self::Integrity => "integrity",
            Self::SessionAuth => "session-auth",
            Self::OsEnforcement => "os-enforcement",
        })
    }
}

/// Mode and bypass requests captured at process start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityOptions {
    mode: SecurityMode,
    requested_bypasses: BTreeSet<Gate>,
}

impl SecurityOptions {
    /// Production mode with no bypasses.
    pub fn production() -> Self {
        Self::default()
    }

    /// Development mode with no bypasses.
    pub fn development() -> Self {
        Self {
            mode: SecurityMode::Development,
            requested_bypasses: BTreeSet::new(),
        }
    }

    /// Request a bypass for `gate`.
    pub fn with_bypass(mut self, gate: Gate) -> Self {
        self.requested_bypasses.insert(gate);
        self
    }

    /// Capture options from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Capture options through an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = match lookup(ENV_MODE) {
            None => SecurityMode::Production,
            Some(raw) => SecurityMode::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unrecognised {}; falling back to production", ENV_MODE);
                SecurityMode::Production
            }),
        };

        let requested_bypasses = Gate::ALL
            .into_iter()
            .filter(|gate| lookup(gate.env_var()).is_some_and(|v| is_truthy(&v)))
            .collect();

        Self {
            mode,
            requested_bypasses,
        }
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn requested_bypasses(&self) -> &BTreeSet<Gate> {
        &self.requested_bypasses
    }

    /// Decide which requested bypasses are honoured.
    ///
    /// In production, requesting a bypass for a gate in `required` is a
    /// configuration error; requesting one for any other gate is ignored.
    /// In development every request is honoured and logged.
    pub fn resolve_bypasses(
        &self,
        effective_mode: SecurityMode,
        required: &BTreeSet<Gate>,
    ) -> Result<ActiveBypasses> {
        let mut active = BTreeSet::new();

        for gate in &self.requested_bypasses {
            match effective_mode {
                SecurityMode::Production if required.contains(gate) => {
                    return Err(Error::BypassRejected {
                        gate: gate.to_string(),
                        reason: format!(
                            "{} is set but the policy requires this gate in production",
                            gate.env_var()
                        ),
                    });
                }
                SecurityMode::Production => {
                    warn!(gate = %gate, "bypass requested in production mode; ignoring it");
                }
                SecurityMode::Development => {
                    warn!(
                        gate = %gate,
                        "DEVELOPMENT BYPASS ACTIVE: the {} gate will not block", gate
                    );
                    active.insert(*gate);
                }
            }
        }

        Ok(ActiveBypasses {
            mode: effective_mode,
            gates: active,
        })
    }
}

/// Bypasses in force after resolving requests against the effective mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveBypasses {
    mode: SecurityMode,
    gates: BTreeSet<Gate>,
}

impl ActiveBypasses {
    /// No bypasses, production mode.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn is_bypassed(&self, gate: Gate) -> bool {
        self.gates.contains(&gate)
    }

    pub fn gates(&self) -> impl Iterator<Item = Gate> + '_ {
        self.gates.iter().copied()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_to_production() {
        let opts = SecurityOptions::from_lookup(lookup(&[]));
        assert_eq!(opts.mode(), SecurityMode::Production);
        assert!(opts.requested_bypasses().is_empty());
    }

    #[test]
    fn test_unknown_mode_is_production() {
        let opts = SecurityOptions::from_lookup(lookup(&[(ENV_MODE, "staging")]));
        assert_eq!(opts.mode(), SecurityMode::Production);
    }

    #[test]
    fn test_bypass_flags_parsed() {
        let opts = SecurityOptions::from_lookup(lookup(&[
            (ENV_MODE, "dev"),
            (ENV_BYPASS_SIGNATURE, "true"),
            (ENV_BYPASS_INTEGRITY, "0"),
            (ENV_BYPASS_SESSION_AUTH, "YES"),
        ]));
        assert_eq!(opts.mode(), SecurityMode::Development);
        assert!(opts.requested_bypasses().contains(&Gate::Signature));
        assert!(!opts.requested_bypasses().contains(&Gate::Integrity));
        assert!(opts.requested_bypasses().contains(&Gate::SessionAuth));
    }

    #[test]
    fn test_effective_mode_needs_both_sides() {
        use SecurityMode::*;
        assert_eq!(SecurityMode::effective(Development, None), Development);
        assert_eq!(SecurityMode::effective(Development, Some(Development)), Development);
        assert_eq!(SecurityMode::effective(Development, Some(Production)), Production);
        assert_eq!(SecurityMode::effective(Production, Some(Development)), Production);
    }

    #[test]
    fn test_production_rejects_bypass_of_required_gate() {
        let opts = SecurityOptions::production().with_bypass(Gate::Signature);
        let required: BTreeSet<_> = [Gate::Signature].into_iter().collect();
        let err = opts
            .resolve_bypasses(SecurityMode::Production, &required)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BypassRejected);
    }

    #[test]
    fn test_production_ignores_bypass_of_optional_gate() {
        let opts = SecurityOptions::production().with_bypass(Gate::OsEnforcement);
        let active = opts
            .resolve_bypasses(SecurityMode::Production, &BTreeSet::new())
            .unwrap();
        assert!(!active.is_bypassed(Gate::OsEnforcement));
    }

    #[test]
    fn test_development_honours_bypass() {
        let opts = SecurityOptions::development().with_bypass(Gate::Integrity);
        let required: BTreeSet<_> = Gate::ALL.into_iter().collect();
        let active = opts
            .resolve_bypasses(SecurityMode::Development, &required)
            .unwrap();
        assert!(active.is_bypassed(Gate::Integrity));
        assert!(!active.is_bypassed(Gate::Signature));
    }
}
