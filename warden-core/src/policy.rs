//! Security policy document and the authorization questions it answers.
//!
//! # Document Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "mode": "production",
//!   "processes": {
//!     "default": "deny",
//!     "whitelist": [{ "name": "notepad.exe", "paths": ["C:/Windows/System32"] }],
//!     "blacklist": ["regedit.exe"],
//!     "require_signature": ["notepad.exe"]
//!   },
//!   "enforcement": {
//!     "signature": true,
//!     "integrity": true,
//!     "session_auth": true,
//!     "os_enforcement": false
//!   },
//!   "binaries": {
//!     "helper": { "path": "bin/helper", "sha256": "…", "size": 1024, "modified": "…" }
//!   }
//! }
//! ```
//!
//! Fields this module does not know about are kept verbatim so that rewriting
//! the document (e.g. to refresh digests) never drops operator content.

use crate::audit::{AuditEvent, AuditEventType, SharedAuditLogger};
use crate::error::{Error, Result};
use crate::options::{Gate, SecurityMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Current policy document version.
pub const POLICY_VERSION: u32 = 1;

/// What to do with a process that is on neither list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultRule {
    #[default]
    Deny,
    Allow,
}

/// A whitelisted process, optionally pinned to directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub name: String,
    /// Allowed install directories (empty = any location)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRules {
    #[serde(default)]
    pub default: DefaultRule,
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Processes that must carry a trusted platform signature
    #[serde(default)]
    pub require_signature: Vec<String>,
}

/// Which gates the policy demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enforcement {
    #[serde(default = "default_true")]
    pub signature: bool,
    #[serde(default = "default_true")]
    pub integrity: bool,
    #[serde(default = "default_true")]
    pub session_auth: bool,
    #[serde(default)]
    pub os_enforcement: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Enforcement {
    fn default() -> Self {
        Self {
            signature: true,
            integrity: true,
            session_auth: true,
            os_enforcement: false,
        }
    }
}

/// Expected state of a binary the tool will execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryEntry {
    /// Path relative to the binaries root
    pub path: String,
    /// Lowercase hex SHA-256 (empty until the policy is first signed)
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Checks that development mode may relax.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevelopmentRelaxations {
    #[serde(default)]
    pub relax_paths: bool,
    #[serde(default)]
    pub relax_whitelist: bool,
}

/// The operator-authored security policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub mode: SecurityMode,
    #[serde(default)]
    pub processes: ProcessRules,
    #[serde(default)]
    pub enforcement: Enforcement,
    #[serde(default)]
    pub binaries: BTreeMap<String, BinaryEntry>,
    #[serde(default)]
    pub development: DevelopmentRelaxations,
    /// Unknown fields, preserved on rewrite
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> u32 {
    POLICY_VERSION
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
            mode: SecurityMode::Production,
            processes: ProcessRules::default(),
            enforcement: Enforcement::default(),
            binaries: BTreeMap::new(),
            development: DevelopmentRelaxations::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Policy {
    /// Parse a policy from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let policy: Policy =
            serde_json::from_str(json).map_err(|e| Error::PolicyInvalid(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse a policy from an already-decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let policy: Policy =
            serde_json::from_value(value).map_err(|e| Error::PolicyInvalid(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::PolicyNotFound(path.display().to_string()),
            _ => Error::io(path, e),
        })?;
        Self::from_json(&content)
    }

    /// Serialize as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural checks.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.version != POLICY_VERSION {
            problems.push(format!(
                "unsupported policy version {} (expected {})",
                self.version, POLICY_VERSION
            ));
        }

        for entry in &self.processes.whitelist {
            if entry.name.trim().is_empty() {
                problems.push("whitelist entry with empty name".to_string());
            }
            for p in &entry.paths {
                if has_traversal(p) {
                    problems.push(format!("whitelist path '{}' contains '..'", p));
                }
            }
        }

        for (name, bin) in &self.binaries {
            if name.trim().is_empty() {
                problems.push("binary with empty name".to_string());
            }
            if bin.path.trim().is_empty() {
                problems.push(format!("binary '{}' has an empty path", name));
            } else if has_traversal(&bin.path) {
                problems.push(format!("binary '{}' path '{}' contains '..'", name, bin.path));
            } else if is_absolute_like(&bin.path) {
                problems.push(format!(
                    "binary '{}' path '{}' must be relative to the binaries root",
                    name, bin.path
                ));
            }
            if !bin.sha256.is_empty()
                && (bin.sha256.len() != 64 || !bin.sha256.chars().all(|c| c.is_ascii_hexdigit()))
            {
                problems.push(format!("binary '{}' digest is not SHA-256 hex", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::PolicyInvalid(problems.join("; ")))
        }
    }

    /// Names that appear on both lists. The blacklist wins; this is only
    /// reported so an operator can clean the document up.
    pub fn list_conflicts(&self) -> Vec<String> {
        self.processes
            .whitelist
            .iter()
            .filter(|w| self.is_blacklisted(&w.name))
            .map(|w| w.name.clone())
            .collect()
    }

    /// Gates this policy requires.
    pub fn required_gates(&self) -> BTreeSet<Gate> {
        let e = &self.enforcement;
        [
            (Gate::Signature, e.signature),
            (Gate::Integrity, e.integrity),
            (Gate::SessionAuth, e.session_auth),
            (Gate::OsEnforcement, e.os_enforcement),
        ]
        .into_iter()
        .filter_map(|(gate, on)| on.then_some(gate))
        .collect()
    }

    fn is_blacklisted(&self, name: &str) -> bool {
        self.processes
            .blacklist
            .iter()
            .any(|b| b.eq_ignore_ascii_case(name))
    }

    fn whitelist_entries(&self, name: &str) -> Vec<&WhitelistEntry> {
        self.processes
            .whitelist
            .iter()
            .filter(|w| w.name.eq_ignore_ascii_case(name))
            .collect()
    }

    fn requires_signature(&self, name: &str) -> bool {
        self.processes
            .require_signature
            .iter()
            .any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// Authorization verdict for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    /// Allowed only if the platform reports a trusted signature
    RequireSignature,
}

/// A check that development mode relaxed while reaching a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxedCheck {
    Path,
    Whitelist,
}

/// Result of [`PolicyStore::authorize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub decision: Decision,
    pub reason: String,
    /// Checks skipped because of development relaxations (for audit)
    pub relaxed: Vec<RelaxedCheck>,
}

impl Authorization {
    fn new(decision: Decision, reason: impl Into<String>, relaxed: Vec<RelaxedCheck>) -> Self {
        Self {
            decision,
            reason: reason.into(),
            relaxed,
        }
    }
}

/// Holds a loaded policy and answers authorization questions against it.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    policy: Policy,
    mode: SecurityMode,
    audit: SharedAuditLogger,
}

impl PolicyStore {
    /// Load the policy at `path`.
    ///
    /// `env_mode` is combined with the document's own mode; relaxations only
    /// apply when both say development.
    pub fn load(path: impl AsRef<Path>, env_mode: SecurityMode) -> Result<Self> {
        let policy = Policy::from_file(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "policy loaded");
        Ok(Self::from_policy(policy, env_mode))
    }

    /// Wrap an already-loaded (typically verified) policy.
    pub fn from_policy(policy: Policy, env_mode: SecurityMode) -> Self {
        for name in policy.list_conflicts() {
            warn!(process = %name, "process is both whitelisted and blacklisted; blacklist wins");
        }
        let mode = SecurityMode::effective(env_mode, Some(policy.mode));
        Self {
            policy,
            mode,
            audit: crate::audit::noop(),
        }
    }

    /// Record every decision as a `process_authorized` / `process_denied`
    /// audit event.
    pub fn with_audit(mut self, audit: SharedAuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Effective mode used for relaxations.
    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Decide whether `process_name` at `process_path` may be driven.
    pub fn authorize(&self, process_name: &str, process_path: &str) -> Authorization {
        let auth = self.decide(process_name, process_path);
        let event_type = match auth.decision {
            Decision::Deny => AuditEventType::ProcessDenied,
            Decision::Allow | Decision::RequireSignature => AuditEventType::ProcessAuthorized,
        };
        let mut details = format!(
            "{} at {}: {:?} ({})",
            process_name, process_path, auth.decision, auth.reason
        );
        if !auth.relaxed.is_empty() {
            details.push_str(&format!(", relaxed {:?}", auth.relaxed));
        }
        self.audit
            .log(AuditEvent::new(event_type, "policy").with_details(details));
        auth
    }

    fn decide(&self, process_name: &str, process_path: &str) -> Authorization {
        if has_traversal(process_path) {
            return Authorization::new(
                Decision::Deny,
                format!("path '{}' contains traversal segments", process_path),
                Vec::new(),
            );
        }

        let name = process_name.trim();
        if self.policy.is_blacklisted(name) {
            return Authorization::new(Decision::Deny, "process is blacklisted", Vec::new());
        }

        let dev = self.mode == SecurityMode::Development;
        let relax = self.policy.development;
        let mut relaxed = Vec::new();

        let entries = self.policy.whitelist_entries(name);
        if entries.is_empty() {
            match self.policy.processes.default {
                DefaultRule::Allow => {}
                DefaultRule::Deny if dev && relax.relax_whitelist => {
                    relaxed.push(RelaxedCheck::Whitelist);
                }
                DefaultRule::Deny => {
                    return Authorization::new(
                        Decision::Deny,
                        "process is not whitelisted",
                        relaxed,
                    );
                }
            }
        } else {
            // Duplicate entries for one name pool their locations; any entry
            // without paths leaves the name unpinned.
            let pinned = entries.iter().all(|e| !e.paths.is_empty());
            if pinned
                && !entries
                    .iter()
                    .flat_map(|e| e.paths.iter())
                    .any(|root| path_within(process_path, root))
            {
                if dev && relax.relax_paths {
                    relaxed.push(RelaxedCheck::Path);
                } else {
                    return Authorization::new(
                        Decision::Deny,
                        format!("'{}' is not in an allowed location", process_path),
                        relaxed,
                    );
                }
            }
        }

        if !relaxed.is_empty() {
            warn!(process = %name, relaxed = ?relaxed, "authorization relaxed by development mode");
        }

        if self.policy.requires_signature(name) {
            Authorization::new(
                Decision::RequireSignature,
                "process requires a trusted platform signature",
                relaxed,
            )
        } else {
            Authorization::new(Decision::Allow, "process allowed by policy", relaxed)
        }
    }
}

/// True if any segment of `path` is `..`, for either separator style.
pub fn has_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|seg| seg == "..")
}

/// Reject traversal, then join `relative` under `root`.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf> {
    if has_traversal(relative) {
        return Err(Error::PathTraversal(relative.to_string()));
    }
    if is_absolute_like(relative) {
        return Err(Error::PolicyInvalid(format!(
            "'{}' must be relative to the binaries root",
            relative
        )));
    }
    Ok(root.join(relative.replace('\\', "/")))
}

fn is_absolute_like(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    Path::new(&normalized).has_root()
        || normalized.as_bytes().get(1) == Some(&b':')
        || normalized.starts_with("//")
}

/// Component-wise, case-insensitive containment check.
fn path_within(path: &str, root: &str) -> bool {
    let split = |p: &str| -> Vec<String> {
        let normalized = p.replace('\\', "/");
        Path::new(&normalized)
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().to_ascii_lowercase())
            .collect()
    };
    let path = split(path);
    let root = split(root);
    !root.is_empty() && path.len() > root.len() && path[..root.len()] == root[..]
}
