//! Error types for Warden.
//!
//! Every failure maps to a closed [`ErrorKind`] so callers can branch on the
//! kind of failure instead of matching message text. The messages themselves
//! are meant to be shown to an operator as-is.

use std::fmt;
use thiserror::Error;

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure kinds.
///
/// Code ranges:
/// - 1000-1099: Key custody errors
/// - 1100-1199: Policy signature errors
/// - 1200-1299: Binary integrity errors
/// - 1300-1399: Session token errors
/// - 1400-1499: Policy and startup errors
/// - 1500-1599: Configuration errors
/// - 1900-1999: Infrastructure errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    // Key custody errors (1000-1099)
    AuthenticationError = 1000,
    KeysAlreadyExist = 1001,
    KeysNotFound = 1002,

    // Policy signature errors (1100-1199)
    SignatureFileMissing = 1100,
    SignatureCorrupt = 1101,
    SignerAuthFailed = 1102,
    ConfigHashMismatch = 1103,
    SignatureInvalid = 1104,

    // Binary integrity errors (1200-1299)
    BinaryTampered = 1200,
    UntrustedBinary = 1201,

    // Session token errors (1300-1399)
    SessionAuthFailed = 1300,

    // Policy and startup errors (1400-1499)
    InsecureMode = 1400,
    PolicyNotFound = 1401,
    PolicyInvalid = 1402,
    PathTraversal = 1403,

    // Configuration errors (1500-1599)
    BypassRejected = 1500,
    Configuration = 1501,

    // Infrastructure errors (1900-1999)
    Io = 1900,
    Serialization = 1901,
    Crypto = 1902,
    HelperFailed = 1903,
}

impl ErrorKind {
    /// Get the numeric code value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Machine-readable name (kebab-case).
    pub fn name(self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication-error",
            Self::KeysAlreadyExist => "keys-already-exist",
            Self::KeysNotFound => "keys-not-found",

            Self::SignatureFileMissing => "signature-file-missing",
            Self::SignatureCorrupt => "signature-corrupt",
            Self::SignerAuthFailed => "signer-auth-failed",
            Self::ConfigHashMismatch => "config-hash-mismatch",
            Self::SignatureInvalid => "signature-invalid",

            Self::BinaryTampered => "binary-tampered",
            Self::UntrustedBinary => "untrusted-binary",

            Self::SessionAuthFailed => "session-auth-failed",

            Self::InsecureMode => "insecure-mode",
            Self::PolicyNotFound => "policy-not-found",
            Self::PolicyInvalid => "policy-invalid",
            Self::PathTraversal => "path-traversal",

            Self::BypassRejected => "bypass-rejected",
            Self::Configuration => "configuration",

            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Crypto => "crypto",
            Self::HelperFailed => "helper-failed",
        }
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::AuthenticationError => "Decryption failed: wrong password or damaged key file",
            Self::KeysAlreadyExist => "Signing identity already exists",
            Self::KeysNotFound => "Signing identity has not been initialized",

            Self::SignatureFileMissing => "Policy signature file is missing",
            Self::SignatureCorrupt => "Policy signature file cannot be parsed",
            Self::SignerAuthFailed => "Could not unlock the signer's public identity",
            Self::ConfigHashMismatch => "Policy document changed since it was signed",
            Self::SignatureInvalid => "Policy signature verification failed",

            Self::BinaryTampered => "Binary does not match its signed digest",
            Self::UntrustedBinary => "Platform does not trust the binary's code signature",

            Self::SessionAuthFailed => "Session token rejected",

            Self::InsecureMode => "No signed policy present; running unprotected",
            Self::PolicyNotFound => "Policy document not found",
            Self::PolicyInvalid => "Policy document is invalid",
            Self::PathTraversal => "Path contains traversal segments",

            Self::BypassRejected => "Development bypass not permitted in production",
            Self::Configuration => "Invalid configuration",

            Self::Io => "I/O failure",
            Self::Serialization => "Serialization failure",
            Self::Crypto => "Cryptographic operation failed",
            Self::HelperFailed => "Native helper invocation failed",
        }
    }

    /// Whether this kind is a gate failure (as opposed to a setup problem).
    pub fn is_gate_failure(self) -> bool {
        matches!(
            self,
            Self::SignatureFileMissing
                | Self::SignatureCorrupt
                | Self::SignerAuthFailed
                | Self::ConfigHashMismatch
                | Self::SignatureInvalid
                | Self::BinaryTampered
                | Self::UntrustedBinary
                | Self::SessionAuthFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a session token was rejected.
///
/// The distinction is for diagnostics only: callers reject the call the same
/// way whatever the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionFailure {
    /// Malformed token or MAC mismatch.
    BadSignature,
    /// Issued outside the accepted window.
    Expired,
    /// Nonce already accepted by this verifier.
    Replayed,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadSignature => "bad signature",
            Self::Expired => "expired",
            Self::Replayed => "replayed",
        })
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Key Custody Errors
    // =========================================================================
    /// Deliberately carries no detail: wrong password and damaged ciphertext
    /// must look identical to the caller.
    #[error("authentication failed: unable to decrypt key material")]
    Authentication,

    #[error("signing identity already exists at {0} (use overwrite to replace it)")]
    KeysAlreadyExist(String),

    #[error("signing identity not found at {0}")]
    KeysNotFound(String),

    // =========================================================================
    // Policy Signature Errors
    // =========================================================================
    #[error("signature file missing: {0}")]
    SignatureFileMissing(String),

    #[error("signature file corrupt: {0}")]
    SignatureCorrupt(String),

    #[error("signer authentication failed: the public identity could not be unlocked")]
    SignerAuthFailed,

    #[error("policy hash mismatch: signed {expected}, current {actual}")]
    ConfigHashMismatch { expected: String, actual: String },

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    #[error("binary '{name}' tampered: expected {expected}, found {actual}")]
    BinaryTampered {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("binary '{name}' is not trusted by the platform: {detail}")]
    UntrustedBinary { name: String, detail: String },

    // =========================================================================
    // Session Token Errors
    // =========================================================================
    #[error("session authentication failed: {0}")]
    SessionAuthFailed(SessionFailure),

    // =========================================================================
    // Policy and Startup Errors
    // =========================================================================
    #[error("no signed policy present at {0}; running in insecure mode")]
    InsecureMode(String),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("invalid policy: {0}")]
    PolicyInvalid(String),

    #[error("path traversal rejected: '{0}'")]
    PathTraversal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("bypass of the {gate} gate rejected: {reason}")]
    BypassRejected { gate: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("native helper failed: {0}")]
    HelperFailed(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication => ErrorKind::AuthenticationError,
            Self::KeysAlreadyExist(_) => ErrorKind::KeysAlreadyExist,
            Self::KeysNotFound(_) => ErrorKind::KeysNotFound,

            Self::SignatureFileMissing(_) => ErrorKind::SignatureFileMissing,
            Self::SignatureCorrupt(_) => ErrorKind::SignatureCorrupt,
            Self::SignerAuthFailed => ErrorKind::SignerAuthFailed,
            Self::ConfigHashMismatch { .. } => ErrorKind::ConfigHashMismatch,
            Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,

            Self::BinaryTampered { .. } => ErrorKind::BinaryTampered,
            Self::UntrustedBinary { .. } => ErrorKind::UntrustedBinary,

            Self::SessionAuthFailed(_) => ErrorKind::SessionAuthFailed,

            Self::InsecureMode(_) => ErrorKind::InsecureMode,
            Self::PolicyNotFound(_) => ErrorKind::PolicyNotFound,
            Self::PolicyInvalid(_) => ErrorKind::PolicyInvalid,
            Self::PathTraversal(_) => ErrorKind::PathTraversal,

            Self::BypassRejected { .. } => ErrorKind::BypassRejected,
            Self::Configuration(_) => ErrorKind::Configuration,

            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::HelperFailed(_) => ErrorKind::HelperFailed,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn description(&self) -> &'static str {
        self.kind().description()
    }

    /// The session failure reason, if this is a token rejection.
    pub fn session_failure(&self) -> Option<SessionFailure> {
        match self {
            Self::SessionAuthFailed(reason) => Some(*reason),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}
