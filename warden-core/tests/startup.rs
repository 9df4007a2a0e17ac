//! Startup gate scenarios.
//!
//! Each test builds a throwaway installation (identity, policy, binaries,
//! state directory) and runs the orchestrator against it.

use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use warden::{
    AuditEventType, ConfigSigner, ErrorKind, Gate, GateOutcome, KeyCustodian, MemoryLogger,
    Orchestrator, RatchetStore, SecurityMode, SecurityOptions, Settings, StartupOutcome,
    StartupState, StaticOracle,
};

fn pw(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

struct Install {
    dir: TempDir,
    settings: Settings,
}

impl Install {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.kdf.public_iterations = 10;
        settings.kdf.private_iterations = 20;
        settings.identity.key_bits = 2048;
        settings.resolve_relative_to(dir.path());
        let install = Self { dir, settings };
        install
            .custodian()
            .initialize(&pw("pub"), &pw("priv"), false)
            .unwrap();
        install
    }

    fn custodian(&self) -> KeyCustodian {
        KeyCustodian::new(
            &self.settings.paths.key_dir,
            self.settings.kdf,
            self.settings.identity.clone(),
        )
        .with_mode(SecurityMode::Development)
    }

    fn signer(&self) -> ConfigSigner {
        ConfigSigner::from_settings(&self.settings, self.custodian())
    }

    fn write_binary(&self, content: &[u8]) {
        let path = self.dir.path().join("bin").join("helper");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Write `policy` with a helper binary entry and sign it, recording
    /// the helper's current digest.
    fn sign_policy(&self, mut policy: serde_json::Value) {
        self.write_binary(b"helper v1");
        policy["binaries"] = json!({ "helper": { "path": "bin/helper" } });
        self.write_unsigned(&policy);
        self.signer().sign_config(&pw("priv"), true).unwrap();
    }

    fn write_unsigned(&self, policy: &serde_json::Value) {
        std::fs::write(
            &self.settings.paths.policy,
            serde_json::to_string_pretty(policy).unwrap(),
        )
        .unwrap();
    }

    fn run(&self, options: SecurityOptions) -> StartupOutcome {
        Orchestrator::new(&self.settings, options, self.signer()).run(Some(&pw("pub")))
    }

    fn orchestrator(&self, options: SecurityOptions) -> Orchestrator {
        Orchestrator::new(&self.settings, options, self.signer())
    }
}

fn production_policy() -> serde_json::Value {
    json!({ "version": 1, "mode": "production" })
}

fn development_policy() -> serde_json::Value {
    json!({ "version": 1, "mode": "development" })
}

fn gate_outcome(outcome: &StartupOutcome, gate: Gate) -> GateOutcome {
    outcome
        .gates
        .iter()
        .find(|r| r.gate == gate)
        .map(|r| r.outcome)
        .unwrap_or_else(|| panic!("no report for {}", gate))
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_signed_production_policy_is_ready() {
    let install = Install::new();
    install.sign_policy(production_policy());

    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Ready, "{}", outcome.diagnostic());
    assert!(outcome.may_serve());
    assert_eq!(
        outcome.transitions,
        vec![
            StartupState::Unverified,
            StartupState::ConfigChecking,
            StartupState::IntegrityChecking,
            StartupState::Ready,
        ]
    );
    assert_eq!(gate_outcome(&outcome, Gate::Signature), GateOutcome::Passed);
    assert_eq!(gate_outcome(&outcome, Gate::Integrity), GateOutcome::Passed);
    assert_eq!(gate_outcome(&outcome, Gate::SessionAuth), GateOutcome::Deferred);
    assert!(outcome.signature.is_some());
    assert!(outcome.diagnostic().starts_with("startup ready (production)"));
    assert!(outcome.warning().is_none());

    let state = RatchetStore::new(&install.settings.paths.state_dir).load().unwrap();
    assert!(state.signed_policy_seen);
    assert!(state.production_locked);
    assert!(state.required_gates.contains(&Gate::Integrity));
}

#[test]
fn test_fresh_install_without_policy_is_insecure_mode() {
    let install = Install::new();
    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::InsecureMode);
    assert!(outcome.may_serve());
    assert!(outcome.diagnostic().contains("INSECURE MODE"));
    assert_eq!(
        outcome.warning().map(|w| w.kind()),
        Some(ErrorKind::InsecureMode)
    );
}

#[test]
fn test_audit_trail_records_outcome() {
    let install = Install::new();
    install.sign_policy(production_policy());
    let audit = Arc::new(MemoryLogger::new());

    let outcome = install
        .orchestrator(SecurityOptions::production())
        .with_audit(audit.clone())
        .run(Some(&pw("pub")));
    assert!(outcome.may_serve());
    assert_eq!(audit.of_type(AuditEventType::StartupReady).len(), 1);
    assert!(audit.of_type(AuditEventType::GatePassed).len() >= 2);
    assert!(audit.of_type(AuditEventType::StartupBlocked).is_empty());
}

// ============================================================================
// Blocking
// ============================================================================

#[test]
fn test_tampered_binary_blocks_production() {
    let install = Install::new();
    install.sign_policy(production_policy());
    install.write_binary(b"helper v2 (patched)");

    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Blocked);
    assert!(!outcome.may_serve());
    assert_eq!(outcome.failed_gate, Some(Gate::Integrity));
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::BinaryTampered)
    );
    let diagnostic = outcome.diagnostic();
    assert!(diagnostic.contains("integrity gate"), "{}", diagnostic);
    assert!(diagnostic.contains("binary-tampered"), "{}", diagnostic);
    assert_eq!(gate_outcome(&outcome, Gate::Integrity), GateOutcome::Failed);
}

#[test]
fn test_edited_policy_blocks_at_signature_gate() {
    let install = Install::new();
    install.sign_policy(production_policy());

    let mut body: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&install.settings.paths.policy).unwrap()).unwrap();
    body["processes"] = json!({ "default": "allow" });
    install.write_unsigned(&body);

    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Blocked);
    assert_eq!(outcome.failed_gate, Some(Gate::Signature));
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::ConfigHashMismatch)
    );
    assert!(outcome.integrity.is_none());
}

#[test]
fn test_missing_password_blocks_at_signature_gate() {
    let install = Install::new();
    install.sign_policy(production_policy());
    let outcome = install.orchestrator(SecurityOptions::production()).run(None);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::SignerAuthFailed)
    );
}

#[test]
fn test_into_result_surfaces_failure() {
    let install = Install::new();
    install.write_unsigned(&production_policy());
    let err = install
        .run(SecurityOptions::production())
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SignatureFileMissing);
}

#[test]
fn test_integrity_mismatch_blocks_even_when_policy_relaxes_it() {
    let install = Install::new();
    let mut policy = production_policy();
    policy["enforcement"] = json!({ "integrity": false });
    install.sign_policy(policy);
    install.write_binary(b"patched");

    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Blocked);
    assert_eq!(outcome.failed_gate, Some(Gate::Integrity));
    assert_eq!(gate_outcome(&outcome, Gate::Integrity), GateOutcome::Failed);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::BinaryTampered)
    );
}

#[test]
fn test_signed_then_restored_binary_is_ready_again() {
    let install = Install::new();
    install.sign_policy(production_policy());

    install.write_binary(b"patched");
    assert_eq!(install.run(SecurityOptions::production()).state, StartupState::Blocked);

    install.write_binary(b"helper v1");
    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Ready, "{}", outcome.diagnostic());
    assert!(outcome.integrity.unwrap().all_valid);
}

// ============================================================================
// Platform signature gate
// ============================================================================

#[test]
fn test_os_enforcement_required_without_trust_blocks() {
    let install = Install::new();
    let mut policy = production_policy();
    policy["enforcement"] = json!({ "os_enforcement": true });
    install.sign_policy(policy);

    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Blocked);
    assert_eq!(outcome.failed_gate, Some(Gate::OsEnforcement));
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::UntrustedBinary)
    );
}

#[test]
fn test_os_enforcement_with_trusted_binary_passes() {
    let install = Install::new();
    let mut policy = production_policy();
    policy["enforcement"] = json!({ "os_enforcement": true });
    install.sign_policy(policy);

    let oracle = StaticOracle::new().with_trusted(
        install.settings.paths.binaries_root.join("bin/helper"),
        "CN=Example Publisher",
    );
    let outcome = install
        .orchestrator(SecurityOptions::production())
        .with_oracle(Arc::new(oracle))
        .run(Some(&pw("pub")));
    assert_eq!(outcome.state, StartupState::Ready, "{}", outcome.diagnostic());
    assert_eq!(gate_outcome(&outcome, Gate::OsEnforcement), GateOutcome::Passed);
}

#[test]
fn test_os_enforcement_not_required_is_advisory() {
    let install = Install::new();
    install.sign_policy(production_policy());
    let outcome = install.run(SecurityOptions::production());
    assert_eq!(gate_outcome(&outcome, Gate::OsEnforcement), GateOutcome::Advisory);
}

// ============================================================================
// Bypasses
// ============================================================================

#[test]
fn test_production_rejects_bypass_of_required_gate() {
    let install = Install::new();
    install.sign_policy(production_policy());

    let outcome = install.run(SecurityOptions::production().with_bypass(Gate::Signature));
    assert_eq!(outcome.state, StartupState::Blocked);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::BypassRejected)
    );
    assert!(outcome.diagnostic().contains("configuration"));
    assert!(outcome.signature.is_none());
}

#[test]
fn test_development_env_cannot_relax_production_policy() {
    let install = Install::new();
    install.sign_policy(production_policy());
    install.write_binary(b"patched");

    let outcome = install.run(SecurityOptions::development().with_bypass(Gate::Integrity));
    assert_eq!(outcome.mode, SecurityMode::Production);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::BypassRejected)
    );
}

#[test]
fn test_development_bypass_tolerates_tampering() {
    let install = Install::new();
    install.sign_policy(development_policy());
    install.write_binary(b"local rebuild");

    let outcome = install.run(SecurityOptions::development().with_bypass(Gate::Integrity));
    assert_eq!(outcome.state, StartupState::Ready, "{}", outcome.diagnostic());
    assert_eq!(outcome.mode, SecurityMode::Development);
    assert_eq!(gate_outcome(&outcome, Gate::Integrity), GateOutcome::Bypassed);
    assert!(outcome.diagnostic().contains("BYPASSED: integrity"));
}

#[test]
fn test_development_signature_bypass_skips_verification() {
    let install = Install::new();
    install.write_unsigned(&development_policy());

    let audit = Arc::new(MemoryLogger::new());
    let outcome = install
        .orchestrator(SecurityOptions::development().with_bypass(Gate::Signature))
        .with_audit(audit.clone())
        .run(None);
    assert_eq!(outcome.state, StartupState::Ready, "{}", outcome.diagnostic());
    assert_eq!(gate_outcome(&outcome, Gate::Signature), GateOutcome::Bypassed);
    assert!(outcome.signature.is_none());
    assert!(outcome.diagnostic().contains("signature NOT verified"));
    assert!(!audit.of_type(AuditEventType::GateBypassed).is_empty());

    // An unverified policy never advances the ratchet.
    let state = RatchetStore::new(&install.settings.paths.state_dir).load().unwrap();
    assert!(!state.signed_policy_seen);
}

#[test]
fn test_production_ignores_bypass_of_unrequired_gate() {
    let install = Install::new();
    let mut policy = production_policy();
    policy["enforcement"] = json!({ "integrity": false });
    install.sign_policy(policy);

    let outcome = install.run(SecurityOptions::production().with_bypass(Gate::Integrity));
    assert_eq!(outcome.state, StartupState::Ready, "{}", outcome.diagnostic());
    assert_eq!(outcome.bypasses.gates().count(), 0);
}

// ============================================================================
// Ratchet
// ============================================================================

#[test]
fn test_policy_removal_after_verification_blocks() {
    let install = Install::new();
    install.sign_policy(production_policy());
    assert!(install.run(SecurityOptions::production()).may_serve());

    std::fs::remove_file(&install.settings.paths.policy).unwrap();
    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Blocked);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::PolicyNotFound)
    );
}

#[test]
fn test_unsigned_downgrade_to_development_is_rejected() {
    let install = Install::new();
    install.sign_policy(production_policy());
    assert!(install.run(SecurityOptions::production()).may_serve());

    // Replace the policy with an unsigned development one and ask to skip
    // the signature gate.
    install.write_unsigned(&development_policy());
    let outcome = install.run(SecurityOptions::development().with_bypass(Gate::Signature));
    assert_eq!(outcome.mode, SecurityMode::Production);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::BypassRejected)
    );
}

#[test]
fn test_ratcheted_gate_stays_required() {
    let install = Install::new();
    install.sign_policy(production_policy());
    assert!(install.run(SecurityOptions::production()).may_serve());

    // A newly signed policy drops the integrity requirement...
    let mut relaxed = production_policy();
    relaxed["enforcement"] = json!({ "integrity": false });
    install.sign_policy(relaxed);

    // ...but the installation remembers it was required, so a bypass
    // request is a configuration error rather than being ignored.
    let audit = Arc::new(MemoryLogger::new());
    let outcome = install
        .orchestrator(SecurityOptions::production().with_bypass(Gate::Integrity))
        .with_audit(audit.clone())
        .run(Some(&pw("pub")));
    assert_eq!(outcome.state, StartupState::Blocked);
    assert_eq!(
        outcome.failure.as_ref().map(|e| e.kind()),
        Some(ErrorKind::BypassRejected)
    );
    assert_eq!(audit.of_type(AuditEventType::BypassRejected).len(), 1);
    assert!(outcome.diagnostic().contains("configuration"));
}

#[test]
fn test_corrupt_install_state_blocks() {
    let install = Install::new();
    install.sign_policy(production_policy());
    let store = RatchetStore::new(&install.settings.paths.state_dir);
    std::fs::create_dir_all(&install.settings.paths.state_dir).unwrap();
    std::fs::write(store.path(), b"garbage").unwrap();

    let outcome = install.run(SecurityOptions::production());
    assert_eq!(outcome.state, StartupState::Blocked);
    assert!(outcome.diagnostic().contains("configuration"));
}
