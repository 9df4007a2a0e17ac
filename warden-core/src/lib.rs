//! # Warden
//!
//! Startup gate and call authorization for a privileged automation tool.
//!
//! Warden proves three things before and while the tool runs:
//!
//! - the running policy is the one an operator signed ([`ConfigSigner`])
//! - the binaries it will execute are unchanged since signing ([`IntegrityChecker`])
//! - every call into the privileged native helper carries a fresh, single-use
//!   authorization ([`SessionTokenAuthority`])
//!
//! ## Key Concepts
//!
//! - **Identity**: an RSA key pair and self-signed certificate, stored as two
//!   password-sealed files by the [`KeyCustodian`]
//! - **Signed policy**: the JSON policy plus a detached signature sidecar
//! - **Development bypass**: a loudly logged per-gate override, honoured only
//!   when both the environment and the policy say development
//! - **Ratchet**: per-installation memory of which gates production policies
//!   required, so they cannot be bypassed later
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden::{ConfigSigner, KeyCustodian, Orchestrator, SecurityOptions, Settings};
//!
//! let settings = Settings::from_file("warden.yaml")?;
//! let custodian = KeyCustodian::new(&settings.paths.key_dir, settings.kdf, settings.identity.clone());
//! let signer = ConfigSigner::from_settings(&settings, custodian);
//!
//! let outcome = Orchestrator::new(&settings, SecurityOptions::from_env(), signer)
//!     .run(Some(&public_password));
//! if !outcome.may_serve() {
//!     eprintln!("{}", outcome.diagnostic());
//!     std::process::exit(1);
//! }
//! ```

pub mod audit;
pub mod crypto;
pub mod custodian;
pub mod error;
mod fsutil;
pub mod helper;
pub mod integrity;
pub mod options;
pub mod oracle;
pub mod policy;
pub mod ratchet;
pub mod settings;
pub mod signer;
pub mod startup;
pub mod token;

pub use audit::{AuditEvent, AuditEventType, AuditLogger, MemoryLogger, NoOpLogger, StdoutLogger};
pub use custodian::{Identity, KeyCustodian, PublicIdentity, SigningIdentity};
pub use error::{Error, ErrorKind, Result, SessionFailure};
pub use helper::{HelperInvoker, HelperResult};
pub use integrity::{BinaryResult, IntegrityChecker, IntegrityReport};
pub use options::{ActiveBypasses, Gate, SecurityMode, SecurityOptions};
pub use oracle::{OracleVerdict, SignatureOracle, StaticOracle, UnavailableOracle};
pub use policy::{Authorization, Decision, Policy, PolicyStore, RelaxedCheck};
pub use ratchet::{InstallState, RatchetStore};
pub use settings::Settings;
pub use signer::{ConfigSigner, PolicySignature, VerifiedPolicy};
pub use startup::{GateOutcome, GateReport, Orchestrator, StartupOutcome, StartupState};
pub use token::{SessionTokenAuthority, TokenConfig, TokenVerifier, VerifiedToken};
