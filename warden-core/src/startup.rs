//! Startup gate sequencing.
//!
//! ```text
//! Unverified ──► ConfigChecking ──► IntegrityChecking ──► Ready
//!     │                 │                    │
//!     │                 └──────► Blocked ◄───┘
//!     └──► InsecureMode   (no policy, and none ever verified here)
//! ```
//!
//! The orchestrator runs once, before anything is served. `Blocked` is
//! terminal: callers must not open a listener unless
//! [`StartupOutcome::may_serve`] is true.

use crate::audit::{AuditEvent, AuditEventType, SharedAuditLogger};
use crate::error::{Error, Result};
use crate::integrity::{IntegrityChecker, IntegrityReport};
use crate::options::{ActiveBypasses, Gate, SecurityMode, SecurityOptions};
use crate::oracle::{SignatureOracle, UnavailableOracle};
use crate::policy::{resolve_under, Policy};
use crate::ratchet::RatchetStore;
use crate::settings::Settings;
use crate::signer::{ConfigSigner, PolicySignature};
use secrecy::SecretString;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    Unverified,
    ConfigChecking,
    IntegrityChecking,
    Ready,
    Blocked,
    InsecureMode,
}

impl StartupState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Blocked | Self::InsecureMode)
    }
}

impl fmt::Display for StartupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unverified => "unverified",
            Self::ConfigChecking => "config-checking",
            Self::IntegrityChecking => "integrity-checking",
            Self::Ready => "ready",
            Self::Blocked => "blocked",
            Self::InsecureMode => "insecure-mode",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    /// Failed, but the gate is not required by the policy
    Advisory,
    Bypassed,
    /// Not evaluated at startup
    Deferred,
}

/// What one gate did during startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub gate: Gate,
    pub outcome: GateOutcome,
    pub bypassed: bool,
    pub detail: String,
}

/// Everything the orchestrator decided.
#[derive(Debug, Clone)]
pub struct StartupOutcome {
    pub state: StartupState,
    /// States visited, in order
    pub transitions: Vec<StartupState>,
    pub gates: Vec<GateReport>,
    pub mode: SecurityMode,
    pub bypasses: ActiveBypasses,
    pub policy: Option<Policy>,
    /// `None` when the signature gate was bypassed or no policy exists
    pub signature: Option<PolicySignature>,
    pub integrity: Option<IntegrityReport>,
    pub failure: Option<Error>,
    pub failed_gate: Option<Gate>,
    policy_path: PathBuf,
}

impl StartupOutcome {
    /// Whether the process may go on to serve requests.
    pub fn may_serve(&self) -> bool {
        matches!(self.state, StartupState::Ready | StartupState::InsecureMode)
    }

    /// One human-readable line describing the outcome.
    pub fn diagnostic(&self) -> String {
        match (&self.state, &self.failure) {
            (StartupState::Blocked, Some(err)) => match (self.failed_gate, err.kind().is_gate_failure()) {
                (Some(gate), true) => format!(
                    "startup blocked at the {} gate: {} [{}]",
                    gate,
                    err,
                    err.name()
                ),
                _ => format!("startup blocked by configuration: {} [{}]", err, err.name()),
            },
            (StartupState::InsecureMode, _) => format!(
                "running in INSECURE MODE: no signed policy at {} (sign one to enable protection)",
                self.policy_path.display()
            ),
            (StartupState::Ready, _) => {
                let bypassed: Vec<String> = self.bypasses.gates().map(|g| g.to_string()).collect();
                let signer = self
                    .signature
                    .as_ref()
                    .map(|s| format!("signed by {}", short(&s.signer_thumbprint)))
                    .unwrap_or_else(|| "signature NOT verified".into());
                let binaries = self
                    .integrity
                    .as_ref()
                    .map(|r| r.results.len())
                    .unwrap_or(0);
                if bypassed.is_empty() {
                    format!(
                        "startup ready ({}): policy {}, {} binaries checked",
                        self.mode, signer, binaries
                    )
                } else {
                    format!(
                        "startup ready ({}): policy {}, {} binaries checked, BYPASSED: {}",
                        self.mode,
                        signer,
                        binaries,
                        bypassed.join(", ")
                    )
                }
            }
            (state, _) => format!("startup stopped in state {}", state),
        }
    }

    /// The non-fatal condition the process is serving under, if any.
    pub fn warning(&self) -> Option<Error> {
        match self.state {
            StartupState::InsecureMode => Some(Error::InsecureMode(
                self.policy_path.display().to_string(),
            )),
            _ => None,
        }
    }

    /// `Err` with the blocking error unless the process may serve.
    pub fn into_result(self) -> Result<Self> {
        if self.may_serve() {
            return Ok(self);
        }
        Err(self
            .failure
            .clone()
            .unwrap_or_else(|| Error::Configuration(self.diagnostic())))
    }
}

fn short(hex: &str) -> &str {
    hex.get(..16).unwrap_or(hex)
}

/// Result of the gate sequence when it did not block.
enum Completion {
    Insecure,
    Ready,
}

/// Runs the startup gates once.
#[derive(Debug)]
pub struct Orchestrator {
    options: SecurityOptions,
    signer: ConfigSigner,
    ratchet: RatchetStore,
    binaries_root: PathBuf,
    oracle: Arc<dyn SignatureOracle>,
    audit: SharedAuditLogger,

    state: StartupState,
    transitions: Vec<StartupState>,
    gates: Vec<GateReport>,
    current_gate: Option<Gate>,
    mode: SecurityMode,
    bypasses: ActiveBypasses,
    policy: Option<Policy>,
    signature: Option<PolicySignature>,
    integrity: Option<IntegrityReport>,
}

impl Orchestrator {
    pub fn new(settings: &Settings, options: SecurityOptions, signer: ConfigSigner) -> Self {
        let mode = options.mode();
        Self {
            options,
            signer,
            ratchet: RatchetStore::new(&settings.paths.state_dir),
            binaries_root: settings.paths.binaries_root.clone(),
            oracle: Arc::new(UnavailableOracle),
            audit: crate::audit::noop(),
            state: StartupState::Unverified,
            transitions: vec![StartupState::Unverified],
            gates: Vec::new(),
            current_gate: None,
            mode,
            bypasses: ActiveBypasses::none(),
            policy: None,
            signature: None,
            integrity: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn SignatureOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_audit(mut self, audit: SharedAuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Run every gate and return the outcome.
    ///
    /// `public_password` unlocks the signer's public identity; it may be
    /// `None` only if the signature gate ends up bypassed.
    pub fn run(mut self, public_password: Option<&SecretString>) -> StartupOutcome {
        info!(
            policy = %self.signer.policy_path().display(),
            env_mode = %self.options.mode(),
            "startup verification begins"
        );

        let (state, failure) = match self.execute(public_password) {
            Ok(Completion::Ready) => {
                self.audit
                    .log(AuditEvent::new(AuditEventType::StartupReady, "startup"));
                (StartupState::Ready, None)
            }
            Ok(Completion::Insecure) => {
                self.audit.log(
                    AuditEvent::new(AuditEventType::InsecureMode, "startup").with_details(
                        self.signer.policy_path().display().to_string(),
                    ),
                );
                (StartupState::InsecureMode, None)
            }
            Err(err) => {
                error!(
                    gate = ?self.current_gate,
                    error = %err,
                    kind = err.name(),
                    "startup blocked"
                );
                let mut event = AuditEvent::new(AuditEventType::StartupBlocked, "startup")
                    .with_details(err.to_string());
                if let Some(gate) = self.current_gate {
                    event = event.with_gate(gate);
                }
                self.audit.log(event);
                (StartupState::Blocked, Some(err))
            }
        };
        self.transition(state);

        let failed_gate = failure.as_ref().and(self.current_gate);
        StartupOutcome {
            state,
            transitions: self.transitions,
            gates: self.gates,
            mode: self.mode,
            bypasses: self.bypasses,
            policy: self.policy,
            signature: self.signature,
            integrity: self.integrity,
            failure,
            failed_gate,
            policy_path: self.signer.policy_path().to_path_buf(),
        }
    }

    fn execute(&mut self, public_password: Option<&SecretString>) -> Result<Completion> {
        let install = self.ratchet.load()?;

        if !self.signer.policy_path().exists() {
            if install.allows_insecure_bootstrap() {
                warn!(
                    policy = %self.signer.policy_path().display(),
                    "no policy found and none ever verified; entering INSECURE MODE for bootstrap"
                );
                self.bypasses = self
                    .options
                    .resolve_bypasses(self.options.mode(), &BTreeSet::new())?;
                return Ok(Completion::Insecure);
            }
            return Err(Error::PolicyNotFound(format!(
                "{} (a signed policy was previously verified on this installation)",
                self.signer.policy_path().display()
            )));
        }

        // ConfigChecking
        self.transition(StartupState::ConfigChecking);
        self.current_gate = Some(Gate::Signature);

        let on_disk = Policy::from_file(self.signer.policy_path())?;
        let mut required = on_disk.required_gates();
        required.extend(install.required_gates.iter().copied());

        self.mode = match install.mode_floor() {
            Some(floor) => floor,
            None => SecurityMode::effective(self.options.mode(), Some(on_disk.mode)),
        };
        if self.mode.is_production() && self.options.mode() == SecurityMode::Development {
            warn!("development requested but this policy or installation is production; using production");
        }

        self.bypasses = match self.options.resolve_bypasses(self.mode, &required) {
            Ok(bypasses) => bypasses,
            Err(err) => {
                self.audit.log(
                    AuditEvent::new(AuditEventType::BypassRejected, "startup")
                        .with_details(err.to_string()),
                );
                return Err(err);
            }
        };
        for gate in self.bypasses.gates() {
            self.audit.log(
                AuditEvent::new(AuditEventType::GateBypassed, "startup")
                    .with_gate(gate)
                    .with_details(gate.env_var()),
            );
        }

        let policy = if self.bypasses.is_bypassed(Gate::Signature) {
            warn!("DEVELOPMENT BYPASS: policy signature NOT verified");
            self.report(Gate::Signature, GateOutcome::Bypassed, "signature verification skipped");
            on_disk
        } else {
            let password = public_password.ok_or(Error::SignerAuthFailed)?;
            let verified = self.signer.verify_config(password)?;
            self.report(
                Gate::Signature,
                GateOutcome::Passed,
                format!(
                    "policy hash {} signed by {}",
                    short(&verified.signature.config_hash),
                    short(verified.thumbprint())
                ),
            );
            self.ratchet.record_verified(
                verified.thumbprint(),
                &verified.policy.required_gates(),
                self.mode,
            )?;
            self.signature = Some(verified.signature);
            verified.policy
        };
        self.policy = Some(policy.clone());

        // IntegrityChecking
        self.transition(StartupState::IntegrityChecking);
        self.current_gate = Some(Gate::Integrity);
        self.integrity_gate(&policy)?;

        self.current_gate = Some(Gate::OsEnforcement);
        self.os_enforcement_gate(&policy, required.contains(&Gate::OsEnforcement))?;

        let session_outcome = if self.bypasses.is_bypassed(Gate::SessionAuth) {
            (GateOutcome::Bypassed, "session tokens will not be enforced")
        } else {
            (GateOutcome::Deferred, "enforced on every helper call")
        };
        self.report(Gate::SessionAuth, session_outcome.0, session_outcome.1);

        self.current_gate = None;
        Ok(Completion::Ready)
    }

    /// Binary mismatches block startup unless the development bypass is
    /// in force. `enforcement.integrity` only decides whether a production
    /// bypass request for this gate is a configuration error.
    fn integrity_gate(&mut self, policy: &Policy) -> Result<()> {
        let report = IntegrityChecker::new(&self.binaries_root, &self.bypasses).verify_all(policy);
        let failures = report.failures().count();

        let result = if report.bypassed {
            self.report(
                Gate::Integrity,
                GateOutcome::Bypassed,
                format!("{} of {} binaries mismatched (tolerated)", failures, report.results.len()),
            );
            Ok(())
        } else if report.all_valid {
            self.report(
                Gate::Integrity,
                GateOutcome::Passed,
                format!("{} binaries verified", report.results.len()),
            );
            Ok(())
        } else {
            self.report(
                Gate::Integrity,
                GateOutcome::Failed,
                format!("{} binaries mismatched", failures),
            );
            report.clone().into_result().map(|_| ())
        };

        self.integrity = Some(report);
        result
    }

    fn os_enforcement_gate(&mut self, policy: &Policy, required: bool) -> Result<()> {
        let bypassed = self.bypasses.is_bypassed(Gate::OsEnforcement);
        let mut untrusted = Vec::new();

        for (name, entry) in &policy.binaries {
            let Ok(path) = resolve_under(&self.binaries_root, &entry.path) else {
                continue;
            };
            let verdict = self.oracle.query(&path);
            if verdict.trusted {
                info!(binary = %name, signer = ?verdict.signer, "platform signature trusted");
            } else {
                warn!(binary = %name, detail = %verdict.detail, "platform does not trust binary");
                untrusted.push((name.clone(), verdict.detail));
            }
        }

        if untrusted.is_empty() {
            self.report(
                Gate::OsEnforcement,
                GateOutcome::Passed,
                format!("{} binaries trusted by platform", policy.binaries.len()),
            );
            return Ok(());
        }

        let detail = format!("{} binaries not trusted by platform", untrusted.len());
        if bypassed {
            self.report(Gate::OsEnforcement, GateOutcome::Bypassed, detail);
            Ok(())
        } else if required {
            self.report(Gate::OsEnforcement, GateOutcome::Failed, detail);
            let (name, detail) = untrusted.swap_remove(0);
            Err(Error::UntrustedBinary { name, detail })
        } else {
            self.report(Gate::OsEnforcement, GateOutcome::Advisory, detail);
            Ok(())
        }
    }

    fn transition(&mut self, next: StartupState) {
        info!(from = %self.state, to = %next, "startup state change");
        self.state = next;
        if self.transitions.last() != Some(&next) {
            self.transitions.push(next);
        }
    }

    fn report(&mut self, gate: Gate, outcome: GateOutcome, detail: impl Into<String>) {
        let detail = detail.into();
        let bypassed = self.bypasses.is_bypassed(gate);
        match outcome {
            GateOutcome::Failed => {
                error!(gate = %gate, bypassed, outcome = ?outcome, detail = %detail, "gate evaluated")
            }
            GateOutcome::Advisory | GateOutcome::Bypassed => {
                warn!(gate = %gate, bypassed, outcome = ?outcome, detail = %detail, "gate evaluated")
            }
            _ => info!(gate = %gate, bypassed, outcome = ?outcome, detail = %detail, "gate evaluated"),
        }

        let event_type = match outcome {
            GateOutcome::Passed | GateOutcome::Deferred => AuditEventType::GatePassed,
            GateOutcome::Failed | GateOutcome::Advisory => AuditEventType::GateFailed,
            GateOutcome::Bypassed => AuditEventType::GateBypassed,
        };
        self.audit.log(
            AuditEvent::new(event_type, "startup")
                .with_gate(gate)
                .with_details(detail.clone()),
        );

        self.gates.push(GateReport {
            gate,
            outcome,
            bypassed,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(StartupState::Ready.is_terminal());
        assert!(StartupState::Blocked.is_terminal());
        assert!(StartupState::InsecureMode.is_terminal());
        assert!(!StartupState::ConfigChecking.is_terminal());
    }

    #[test]
    fn test_fresh_install_without_policy_is_insecure_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.resolve_relative_to(dir.path());
        let custodian = crate::custodian::KeyCustodian::new(
            &settings.paths.key_dir,
            settings.kdf,
            settings.identity.clone(),
        );
        let signer = ConfigSigner::from_settings(&settings, custodian);

        let outcome = Orchestrator::new(&settings, SecurityOptions::production(), signer).run(None);
        assert_eq!(outcome.state, StartupState::InsecureMode);
        assert!(outcome.may_serve());
        assert!(outcome.diagnostic().contains("INSECURE MODE"));
        assert_eq!(
            outcome.transitions,
            vec![StartupState::Unverified, StartupState::InsecureMode]
        );
    }
}
