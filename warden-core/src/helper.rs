//! Calls into the privileged native helper.
//!
//! Each call mints a fresh session token and hands it, together with the
//! shared secret, to the helper through its environment. The helper verifies
//! the token before acting and answers with one JSON object on stdout:
//!
//! ```json
//! { "success": true, "message": "clicked", "data": { "x": 10 } }
//! ```
//!
//! A call is bounded by the token window; the child is killed if it runs
//! longer. Retries never resend a token: every attempt mints a new one.

use crate::audit::{AuditEvent, AuditEventType, SharedAuditLogger};
use crate::error::{Error, Result};
use crate::options::Gate;
use crate::settings::HelperSettings;
use crate::token::{SessionTokenAuthority, TokenConfig, TokenVerifier, VerifiedToken};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable carrying the session token to the helper.
pub const ENV_SESSION_TOKEN: &str = "WARDEN_SESSION_TOKEN";

/// Environment variable carrying the shared secret to the helper.
pub const ENV_SESSION_SECRET: &str = "WARDEN_SESSION_SECRET";

/// Structured answer from the helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct HelperInvoker {
    program: PathBuf,
    args: Vec<String>,
    authority: Arc<SessionTokenAuthority>,
    audit: SharedAuditLogger,
}

impl HelperInvoker {
    pub fn new(
        program: impl Into<PathBuf>,
        authority: Arc<SessionTokenAuthority>,
        audit: SharedAuditLogger,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            authority,
            audit,
        }
    }

    pub fn from_settings(
        settings: &HelperSettings,
        authority: Arc<SessionTokenAuthority>,
        audit: SharedAuditLogger,
    ) -> Result<Self> {
        let program = settings
            .path
            .clone()
            .ok_or_else(|| Error::Configuration("helper.path is not set".into()))?;
        Ok(Self::new(program, authority, audit).with_args(settings.args.clone()))
    }

    /// Arguments passed before `--command`.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Run `command` against `target_id` once.
    pub async fn invoke(&self, command: &str, target_id: &str) -> Result<HelperResult> {
        let token = self.authority.generate_token();
        let secret = self.authority.export_secret();
        let window = self.authority.config().window;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--command")
            .arg(command)
            .arg("--target")
            .arg(target_id)
            .env(ENV_SESSION_TOKEN, &token)
            .env(ENV_SESSION_SECRET, secret.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command, target = target_id, "invoking native helper");

        let output = match tokio::time::timeout(window, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(self.rejected(
                    command,
                    format!("failed to start {}: {}", self.program.display(), e),
                ));
            }
            Err(_) => {
                return Err(self.rejected(
                    command,
                    format!("timed out after {:?}; helper killed", window),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: HelperResult = match serde_json::from_str(stdout.trim()) {
            Ok(r) => r,
            Err(e) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = if output.status.success() {
                    format!("unparsable helper output: {}", e)
                } else {
                    format!(
                        "helper exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )
                };
                return Err(self.rejected(command, detail));
            }
        };

        if result.success {
            info!(command, target = target_id, "native helper call succeeded");
            self.audit.log(
                AuditEvent::new(AuditEventType::HelperInvoked, "helper")
                    .with_gate(Gate::SessionAuth)
                    .with_details(format!("{} {}", command, target_id)),
            );
        } else {
            warn!(command, target = target_id, message = %result.message, "native helper reported failure");
            self.audit.log(
                AuditEvent::new(AuditEventType::HelperRejected, "helper")
                    .with_gate(Gate::SessionAuth)
                    .with_details(format!("{} {}: {}", command, target_id, result.message)),
            );
        }
        Ok(result)
    }

    /// Run with up to `attempts` tries. Each try gets its own token.
    pub async fn invoke_with_retry(
        &self,
        command: &str,
        target_id: &str,
        attempts: usize,
    ) -> Result<HelperResult> {
        let mut last = Error::HelperFailed("no attempts made".into());
        for attempt in 1..=attempts.max(1) {
            match self.invoke(command, target_id).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(attempt, error = %e, "native helper attempt failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn rejected(&self, command: &str, detail: String) -> Error {
        warn!(command, detail = %detail, "native helper call failed");
        self.audit.log(
            AuditEvent::new(AuditEventType::HelperRejected, "helper")
                .with_gate(Gate::SessionAuth)
                .with_details(format!("{}: {}", command, detail)),
        );
        Error::HelperFailed(detail)
    }
}

/// Helper-side check of the incoming environment.
///
/// Builds a one-shot verifier from the exported secret. That verifier's
/// nonce store lives only as long as the helper process, so replay across
/// helper processes is caught only by a long-lived verifier.
pub fn verify_helper_environment<F>(lookup: F, config: TokenConfig) -> Result<VerifiedToken>
where
    F: Fn(&str) -> Option<String>,
{
    let token = lookup(ENV_SESSION_TOKEN)
        .ok_or_else(|| Error::Configuration(format!("{} is not set", ENV_SESSION_TOKEN)))?;
    let secret = lookup(ENV_SESSION_SECRET)
        .map(SecretString::new)
        .ok_or_else(|| Error::Configuration(format!("{} is not set", ENV_SESSION_SECRET)))?;
    TokenVerifier::from_exported_secret(&secret, config)?.verify(&token)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audit::MemoryLogger;
    use std::time::Duration;

    fn authority(window: Duration) -> Arc<SessionTokenAuthority> {
        Arc::new(SessionTokenAuthority::new(TokenConfig {
            window,
            clock_skew: Duration::from_secs(1),
            max_nonces: 100,
        }))
    }

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("helper.sh");
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_helper_receives_fresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(
            &dir,
            r#"printf '{"success": true, "message": "%s %s", "data": {"token": "%s"}}' "$2" "$4" "$WARDEN_SESSION_TOKEN""#,
        );
        let authority = authority(Duration::from_secs(10));
        let audit = Arc::new(MemoryLogger::new());
        let invoker = HelperInvoker::new("/bin/sh", Arc::clone(&authority), audit.clone())
            .with_args(vec![helper]);

        let first = invoker.invoke("click", "button-1").await.unwrap();
        assert!(first.success);
        assert_eq!(first.message, "click button-1");

        let second = invoker.invoke("click", "button-1").await.unwrap();
        let token_of = |r: &HelperResult| r.data.as_ref().unwrap()["token"].as_str().unwrap().to_string();
        assert_ne!(token_of(&first), token_of(&second));

        // The token the helper saw is valid for the issuing authority, once.
        assert!(authority.verify_token(&token_of(&first)).is_ok());
        assert!(authority.verify_token(&token_of(&first)).is_err());

        assert_eq!(audit.of_type(AuditEventType::HelperInvoked).len(), 2);
    }

    #[tokio::test]
    async fn test_helper_failure_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(&dir, r#"echo '{"success": false, "message": "target not found"}'"#);
        let invoker = HelperInvoker::new("/bin/sh", authority(Duration::from_secs(10)), crate::audit::noop())
            .with_args(vec![helper]);
        let result = invoker.invoke("click", "missing").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "target not found");
    }

    #[tokio::test]
    async fn test_helper_timeout_is_bounded_by_window() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(&dir, "sleep 5\n");
        let invoker = HelperInvoker::new("/bin/sh", authority(Duration::from_millis(200)), crate::audit::noop())
            .with_args(vec![helper]);
        let started = std::time::Instant::now();
        let err = invoker.invoke("click", "slow").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::HelperFailed);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_garbage_output_is_helper_failure() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(&dir, "echo not-json\n");
        let invoker = HelperInvoker::new("/bin/sh", authority(Duration::from_secs(10)), crate::audit::noop())
            .with_args(vec![helper]);
        assert!(invoker.invoke_with_retry("click", "x", 2).await.is_err());
    }

    #[test]
    fn test_verify_helper_environment() {
        let authority = authority(Duration::from_secs(10));
        let token = authority.generate_token();
        let secret = authority.export_secret().expose_secret().clone();
        let lookup = move |key: &str| match key {
            ENV_SESSION_TOKEN => Some(token.clone()),
            ENV_SESSION_SECRET => Some(secret.clone()),
            _ => None,
        };
        assert!(verify_helper_environment(&lookup, *authority.config()).is_ok());
        assert!(verify_helper_environment(|_| None, *authority.config()).is_err());
    }

    #[test]
    fn test_from_settings_requires_helper_path() {
        let err = HelperInvoker::from_settings(
            &HelperSettings::default(),
            authority(Duration::from_secs(10)),
            crate::audit::noop(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_from_settings_passes_configured_args() {
        let dir = tempfile::tempdir().unwrap();
        let helper = script(
            &dir,
            r#"printf '{"success": true, "message": "%s"}' "$2""#,
        );
        let settings = HelperSettings {
            path: Some("/bin/sh".into()),
            args: vec![helper],
        };
        let audit = Arc::new(MemoryLogger::new());
        let invoker =
            HelperInvoker::from_settings(&settings, authority(Duration::from_secs(10)), audit.clone())
                .unwrap();
        let result = invoker.invoke("focus", "window-7").await.unwrap();
        assert!(result.success);
        assert_eq!(result.message, "focus");
        assert_eq!(audit.of_type(AuditEventType::HelperInvoked).len(), 1);
    }
}
