//! Single-use session tokens for calls into the native helper.
//!
//! # Token Format
//!
//! ```text
//! <issued_at_ms>:<nonce>:<tag>
//! ```
//!
//! - `issued_at_ms`: Unix time in milliseconds, decimal
//! - `nonce`: 16 random bytes, lowercase hex
//! - `tag`: HMAC-SHA256 over `<issued_at_ms>:<nonce>` keyed with the session
//!   secret, lowercase hex
//!
//! # Verification
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. malformed token or tag mismatch: [`SessionFailure::BadSignature`]
//! 2. older than the window, or stamped further in the future than the
//!    clock-skew tolerance: [`SessionFailure::Expired`]
//! 3. nonce already accepted by this verifier: [`SessionFailure::Replayed`]
//!
//! Replay protection lives in the verifier that holds the [`NonceStore`]. A
//! verifier created in a short-lived process only protects that process's
//! lifetime; long-lived verifiers (the server itself, or a helper daemon built
//! with [`TokenVerifier::from_exported_secret`]) protect across calls.

use crate::error::{Error, Result, SessionFailure};
use crate::options::{ActiveBypasses, Gate, SecurityMode};
use crate::settings::SessionSettings;
use chrono::Utc;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret, SecretString};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Token validation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    pub window: Duration,
    pub clock_skew: Duration,
    pub max_nonces: usize,
}

impl TokenConfig {
    pub fn from_settings(settings: &SessionSettings, mode: SecurityMode) -> Self {
        Self {
            window: settings.window(mode),
            clock_skew: settings.clock_skew(),
            max_nonces: settings.max_nonces,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default(), SecurityMode::Production)
    }
}

/// Random key shared between the issuer and the verifier. Never persisted.
pub struct SessionSecret(Secret<[u8; SECRET_LEN]>);

impl SessionSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(Secret::new(bytes))
    }

    /// Parse a secret exported with [`SessionSecret::export`].
    pub fn from_exported(exported: &SecretString) -> Result<Self> {
        let raw = exported.expose_secret().trim();
        let mut bytes = [0u8; SECRET_LEN];
        hex::decode_to_slice(raw, &mut bytes)
            .map_err(|_| Error::Configuration("session secret must be 64 hex characters".into()))?;
        Ok(Self(Secret::new(bytes)))
    }

    /// Hex form for handing to the verifying process.
    pub fn export(&self) -> SecretString {
        SecretString::new(hex::encode(self.0.expose_secret()))
    }

    fn mac(&self) -> std::result::Result<HmacSha256, InvalidLength> {
        <HmacSha256 as Mac>::new_from_slice(self.0.expose_secret())
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret([REDACTED])")
    }
}

/// Nonces accepted within the current window.
///
/// Check-and-insert is a single critical section, so two concurrent
/// verifications of the same token cannot both succeed.
#[derive(Debug)]
pub struct NonceStore {
    seen: Mutex<HashMap<[u8; NONCE_LEN], u64>>,
    capacity: usize,
}

impl NonceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Record `nonce` as used, or report it as a replay.
    ///
    /// Entries whose `issued_at_ms + retain_ms` lies before `now_ms` are
    /// dropped first. A store that is still full afterwards refuses the
    /// nonce.
    pub fn check_and_insert(
        &self,
        nonce: [u8; NONCE_LEN],
        issued_at_ms: u64,
        now_ms: u64,
        retain_ms: u64,
    ) -> std::result::Result<(), SessionFailure> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        if seen.contains_key(&nonce) {
            return Err(SessionFailure::Replayed);
        }

        seen.retain(|_, issued| issued.saturating_add(retain_ms) >= now_ms);

        if seen.len() >= self.capacity {
            warn!(
                capacity = self.capacity,
                "nonce store full; rejecting token until entries expire"
            );
            return Err(SessionFailure::Replayed);
        }

        seen.insert(nonce, issued_at_ms);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A token that passed verification (or was let through by a bypass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub issued_at_ms: u64,
    /// First eight hex characters of the nonce, for logs
    pub nonce_prefix: String,
    /// Set when the session-auth bypass let a failing token through
    pub bypassed: Option<SessionFailure>,
}

struct ParsedToken<'a> {
    issued_at_ms: u64,
    signed_part: &'a str,
    nonce: [u8; NONCE_LEN],
    nonce_hex: &'a str,
    tag: [u8; TAG_LEN],
}

fn parse(token: &str) -> Option<ParsedToken<'_>> {
    let mut parts = token.split(':');
    let (issued, nonce_hex, tag_hex) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || issued.is_empty() || !issued.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let issued_at_ms = issued.parse().ok()?;

    let mut nonce = [0u8; NONCE_LEN];
    hex::decode_to_slice(nonce_hex, &mut nonce).ok()?;
    let mut tag = [0u8; TAG_LEN];
    hex::decode_to_slice(tag_hex, &mut tag).ok()?;

    Some(ParsedToken {
        issued_at_ms,
        signed_part: &token[..issued.len() + 1 + nonce_hex.len()],
        nonce,
        nonce_hex,
        tag,
    })
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Verifies tokens and owns the replay store.
#[derive(Debug)]
pub struct TokenVerifier {
    secret: SessionSecret,
    config: TokenConfig,
    nonces: NonceStore,
    bypass: bool,
}

impl TokenVerifier {
    pub fn new(secret: SessionSecret, config: TokenConfig) -> Self {
        Self {
            secret,
            nonces: NonceStore::new(config.max_nonces),
            config,
            bypass: false,
        }
    }

    /// Build a verifier from a secret handed over by the issuing process.
    pub fn from_exported_secret(exported: &SecretString, config: TokenConfig) -> Result<Self> {
        Ok(Self::new(SessionSecret::from_exported(exported)?, config))
    }

    /// Apply the session-auth bypass, if it is active.
    pub fn with_bypasses(mut self, bypasses: &ActiveBypasses) -> Self {
        self.bypass = bypasses.is_bypassed(Gate::SessionAuth);
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedToken> {
        self.verify_at(token, now_ms())
    }

    /// Verify against an explicit clock.
    pub fn verify_at(&self, token: &str, now_ms: u64) -> Result<VerifiedToken> {
        match self.check(token, now_ms) {
            Ok(verified) => {
                debug!(nonce = %verified.nonce_prefix, "session token accepted");
                Ok(verified)
            }
            Err(reason) if self.bypass => {
                let parsed = parse(token);
                warn!(
                    reason = %reason,
                    "DEVELOPMENT BYPASS: session token rejected but call allowed"
                );
                Ok(VerifiedToken {
                    issued_at_ms: parsed.as_ref().map(|p| p.issued_at_ms).unwrap_or(0),
                    nonce_prefix: parsed
                        .map(|p| nonce_prefix(p.nonce_hex))
                        .unwrap_or_default(),
                    bypassed: Some(reason),
                })
            }
            Err(reason) => {
                warn!(reason = %reason, "session token rejected");
                Err(Error::SessionAuthFailed(reason))
            }
        }
    }

    fn check(&self, token: &str, now_ms: u64) -> std::result::Result<VerifiedToken, SessionFailure> {
        let parsed = parse(token).ok_or(SessionFailure::BadSignature)?;

        let mut mac = self.secret.mac().map_err(|_| SessionFailure::BadSignature)?;
        mac.update(parsed.signed_part.as_bytes());
        mac.verify_slice(&parsed.tag)
            .map_err(|_| SessionFailure::BadSignature)?;

        let window = millis(self.config.window);
        let skew = millis(self.config.clock_skew);
        if parsed.issued_at_ms > now_ms {
            if parsed.issued_at_ms - now_ms > skew {
                return Err(SessionFailure::Expired);
            }
        } else if now_ms - parsed.issued_at_ms > window {
            return Err(SessionFailure::Expired);
        }

        self.nonces.check_and_insert(
            parsed.nonce,
            parsed.issued_at_ms,
            now_ms,
            window.saturating_add(skew),
        )?;

        Ok(VerifiedToken {
            issued_at_ms: parsed.issued_at_ms,
            nonce_prefix: nonce_prefix(parsed.nonce_hex),
            bypassed: None,
        })
    }

    /// Number of nonces currently remembered.
    pub fn tracked_nonces(&self) -> usize {
        self.nonces.len()
    }
}

fn nonce_prefix(nonce_hex: &str) -> String {
    nonce_hex.chars().take(8).collect()
}

/// Mints tokens for outgoing helper calls and verifies them in-process.
#[derive(Debug)]
pub struct SessionTokenAuthority {
    verifier: TokenVerifier,
}

impl SessionTokenAuthority {
    /// New authority with a freshly generated secret.
    pub fn new(config: TokenConfig) -> Self {
        Self {
            verifier: TokenVerifier::new(SessionSecret::generate(), config),
        }
    }

    pub fn with_secret(secret: SessionSecret, config: TokenConfig) -> Self {
        Self {
            verifier: TokenVerifier::new(secret, config),
        }
    }

    pub fn with_bypasses(mut self, bypasses: &ActiveBypasses) -> Self {
        self.verifier = self.verifier.with_bypasses(bypasses);
        self
    }

    pub fn config(&self) -> &TokenConfig {
        self.verifier.config()
    }

    pub fn generate_token(&self) -> String {
        self.generate_token_at(now_ms())
    }

    /// Mint a token stamped with `issued_at_ms`.
    pub fn generate_token_at(&self, issued_at_ms: u64) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let nonce_hex = hex::encode(nonce);
        let signed_part = format!("{}:{}", issued_at_ms, nonce_hex);

        let mut mac = match self.verifier.secret.mac() {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        };
        mac.update(signed_part.as_bytes());
        let tag = hex::encode(mac.finalize().into_bytes());

        debug!(nonce = %nonce_prefix(&nonce_hex), "session token minted");
        format!("{}:{}", signed_part, tag)
    }

    pub fn verify_token(&self, token: &str) -> Result<VerifiedToken> {
        self.verifier.verify(token)
    }

    pub fn verify_token_at(&self, token: &str, now_ms: u64) -> Result<VerifiedToken> {
        self.verifier.verify_at(token, now_ms)
    }

    /// The shared secret, for the helper's environment only.
    pub fn export_secret(&self) -> SecretString {
        self.verifier.secret.export()
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SecurityOptions;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn config() -> TokenConfig {
        TokenConfig {
            window: Duration::from_secs(30),
            clock_skew: Duration::from_secs(5),
            max_nonces: 100,
        }
    }

    #[test]
    fn test_token_shape() {
        let authority = SessionTokenAuthority::new(config());
        let token = authority.generate_token_at(1_700_000_000_000);
        let parts: Vec<_> = token.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "1700000000000");
        assert_eq!(parts[1].len(), NONCE_LEN * 2);
        assert_eq!(parts[2].len(), TAG_LEN * 2);
    }

    #[test]
    fn test_tag_is_standard_hmac_sha256_over_raw_secret() {
        use sha2::Digest;

        let authority = SessionTokenAuthority::new(config());
        let key = hex::decode(authority.export_secret().expose_secret()).unwrap();
        let token = authority.generate_token_at(1_700_000_000_000);
        let (signed_part, tag) = token.rsplit_once(':').unwrap();

        // HMAC by hand: H((K ^ opad) || H((K ^ ipad) || m)), key zero-padded to 64 bytes.
        let mut block = [0u8; 64];
        block[..key.len()].copy_from_slice(&key);
        let ipad: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
        let opad: Vec<u8> = block.iter().map(|b| b ^ 0x5c).collect();
        let inner = Sha256::new()
            .chain_update(&ipad)
            .chain_update(signed_part.as_bytes())
            .finalize();
        let outer = Sha256::new().chain_update(&opad).chain_update(inner).finalize();

        assert_eq!(tag, hex::encode(outer));
    }

    #[test]
    fn test_single_use() {
        let authority = SessionTokenAuthority::new(config());
        let token = authority.generate_token();
        assert!(authority.verify_token(&token).is_ok());
        let err = authority.verify_token(&token).unwrap_err();
        assert_eq!(err.session_failure(), Some(SessionFailure::Replayed));
    }

    #[test]
    fn test_expired() {
        let authority = SessionTokenAuthority::new(config());
        let now = 1_700_000_000_000;
        let token = authority.generate_token_at(now - 30_001);
        let err = authority.verify_token_at(&token, now).unwrap_err();
        assert_eq!(err.session_failure(), Some(SessionFailure::Expired));

        let edge = authority.generate_token_at(now - 30_000);
        assert!(authority.verify_token_at(&edge, now).is_ok());
    }

    #[test]
    fn test_future_tokens_within_skew() {
        let authority = SessionTokenAuthority::new(config());
        let now = 1_700_000_000_000;
        assert!(authority
            .verify_token_at(&authority.generate_token_at(now + 4_000), now)
            .is_ok());
        let err = authority
            .verify_token_at(&authority.generate_token_at(now + 6_000), now)
            .unwrap_err();
        assert_eq!(err.session_failure(), Some(SessionFailure::Expired));
    }

    #[test]
    fn test_bad_signature_before_expiry() {
        let issuer = SessionTokenAuthority::new(config());
        let other = SessionTokenAuthority::new(config());
        let now = 1_700_000_000_000;
        // Expired *and* foreign: the signature check wins.
        let token = issuer.generate_token_at(now - 60_000);
        let err = other.verify_token_at(&token, now).unwrap_err();
        assert_eq!(err.session_failure(), Some(SessionFailure::BadSignature));
    }

    #[test]
    fn test_malformed_tokens() {
        let authority = SessionTokenAuthority::new(config());
        for token in ["", "abc", "1:2:3", "1:2:3:4", "-1:00:00", "x:y:z"] {
            let err = authority.verify_token(token).unwrap_err();
            assert_eq!(err.session_failure(), Some(SessionFailure::BadSignature));
        }
    }

    #[test]
    fn test_exported_secret_verifies() {
        let authority = SessionTokenAuthority::new(config());
        let helper = TokenVerifier::from_exported_secret(&authority.export_secret(), config()).unwrap();
        let token = authority.generate_token();
        assert!(helper.verify(&token).is_ok());
        assert!(helper.verify(&token).is_err());
    }

    #[test]
    fn test_nonce_store_prunes_expired_entries() {
        let store = NonceStore::new(2);
        assert!(store.check_and_insert([1; NONCE_LEN], 0, 0, 100).is_ok());
        assert!(store.check_and_insert([2; NONCE_LEN], 0, 0, 100).is_ok());
        // Full, nothing expired yet.
        assert_eq!(
            store.check_and_insert([3; NONCE_LEN], 50, 50, 100),
            Err(SessionFailure::Replayed)
        );
        // Later, the first two have aged out.
        assert!(store.check_and_insert([3; NONCE_LEN], 200, 200, 100).is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_verification_accepts_once() {
        let authority = Arc::new(SessionTokenAuthority::new(config()));
        let token = Arc::new(authority.generate_token());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let authority = Arc::clone(&authority);
                let token = Arc::clone(&token);
                std::thread::spawn(move || authority.verify_token(&token).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_development_bypass_lets_call_through() {
        let bypasses = SecurityOptions::development()
            .with_bypass(Gate::SessionAuth)
            .resolve_bypasses(SecurityMode::Development, &BTreeSet::new())
            .unwrap();
        let authority = SessionTokenAuthority::new(config()).with_bypasses(&bypasses);
        let verified = authority.verify_token("garbage").unwrap();
        assert_eq!(verified.bypassed, Some(SessionFailure::BadSignature));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SessionSecret::generate();
        let exported = secret.export();
        assert!(!format!("{:?}", secret).contains(exported.expose_secret().as_str()));
    }
}
