//! Warden CLI - identity setup, policy signing, verification and the startup gate.
//!
//! Passwords are read from `WARDEN_PUBLIC_PASSWORD` / `WARDEN_PRIVATE_PASSWORD`
//! (or the matching flags). Diagnostics go to stderr; results go to stdout.

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use warden::helper::{verify_helper_environment, ENV_SESSION_SECRET, ENV_SESSION_TOKEN};
use warden::policy::Decision;
use warden::{
    ActiveBypasses, AuditLogger, ConfigSigner, HelperInvoker, IntegrityChecker, KeyCustodian,
    NoOpLogger, Orchestrator, Policy, PolicyStore, SecurityOptions, SessionTokenAuthority,
    Settings, SignatureOracle, StdoutLogger, TokenConfig, UnavailableOracle,
};

const DEFAULT_SETTINGS: &str = "warden.yaml";

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Signed-policy startup gate and helper call authorization", long_about = None)]
struct Cli {
    /// Settings file (default: ./warden.yaml if present, else built-in defaults)
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Password protecting the public identity
    #[arg(long, global = true, env = "WARDEN_PUBLIC_PASSWORD", hide_env_values = true)]
    public_password: Option<String>,

    /// Password protecting the private identity
    #[arg(long, global = true, env = "WARDEN_PRIVATE_PASSWORD", hide_env_values = true)]
    private_password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and store a new signing identity
    InitKeys {
        /// Replace an existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Sign the policy document
    Sign {
        /// Re-hash every binary listed in the policy before signing
        #[arg(long)]
        update_hashes: bool,
    },

    /// Verify the policy signature
    Verify,

    /// Check binaries against the digests in the policy
    Integrity {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the startup gate (exit 0 if the process may serve, 1 if blocked)
    Gate {
        /// Emit audit events as JSON lines on stdout
        #[arg(long)]
        audit: bool,
    },

    /// Ask the policy whether a process may be driven
    Authorize {
        /// Process name (e.g. notepad.exe)
        name: String,
        /// Full path of the executable
        path: String,
        /// Emit the decision as a JSON audit line on stdout
        #[arg(long)]
        audit: bool,
    },

    /// Run one command through the native helper configured in settings
    Call {
        /// Helper command (e.g. click)
        command: String,
        /// Target identifier passed to the helper
        target: String,
        /// Attempts before giving up; each attempt mints a new token
        #[arg(long, default_value_t = 1)]
        attempts: usize,
        /// Emit audit events as JSON lines on stdout
        #[arg(long)]
        audit: bool,
    },

    /// Session token tooling
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Mint a token and print it as an environment assignment
    Mint {
        /// Also print the shared secret (keep it out of captured output)
        #[arg(long)]
        export_secret: bool,
    },
    /// Verify WARDEN_SESSION_TOKEN with WARDEN_SESSION_SECRET from the environment
    Verify,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    if let Err(errors) = settings.validate() {
        for e in &errors {
            eprintln!("settings error: {}", e);
        }
        std::process::exit(2);
    }

    let options = SecurityOptions::from_env();
    let custodian = KeyCustodian::new(
        &settings.paths.key_dir,
        settings.kdf,
        settings.identity.clone(),
    )
    .with_mode(options.mode());

    let public_password = cli.public_password.map(SecretString::new);
    let private_password = cli.private_password.map(SecretString::new);

    match cli.command {
        Commands::InitKeys { force } => {
            let public = require(public_password, "WARDEN_PUBLIC_PASSWORD");
            let private = require(private_password, "WARDEN_PRIVATE_PASSWORD");
            let identity = custodian.initialize(&public, &private, force)?;
            println!("identity created");
            println!("  thumbprint: {}", identity.thumbprint());
            println!("  key dir:    {}", custodian.key_dir().display());
        }
        Commands::Sign { update_hashes } => {
            let private = require(private_password, "WARDEN_PRIVATE_PASSWORD");
            let signer = ConfigSigner::from_settings(&settings, custodian);
            let record = signer.sign_config(&private, update_hashes)?;
            println!("policy signed");
            println!("  hash:       {}", record.config_hash);
            println!("  thumbprint: {}", record.signer_thumbprint);
            println!("  sidecar:    {}", signer.signature_path().display());
        }
        Commands::Verify => {
            let public = require(public_password, "WARDEN_PUBLIC_PASSWORD");
            let signer = ConfigSigner::from_settings(&settings, custodian);
            match signer.verify_config(&public) {
                Ok(verified) => {
                    println!("valid");
                    println!("  hash:       {}", verified.signature.config_hash);
                    println!("  thumbprint: {}", verified.thumbprint());
                    println!("  signed at:  {}", verified.signature.signed_at);
                }
                Err(e) => {
                    println!("invalid: {} [{}]", e, e.name());
                    std::process::exit(1);
                }
            }
        }
        Commands::Integrity { json } => {
            let policy = Policy::from_file(&settings.paths.policy)?;
            let report = IntegrityChecker::new(&settings.paths.binaries_root, &ActiveBypasses::none())
                .verify_all(&policy);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for r in &report.results {
                    let status = if r.valid { "ok" } else { "FAIL" };
                    println!("{:<4} {} ({})", status, r.name, r.path.display());
                    if !r.valid {
                        println!("     expected: {}", r.expected);
                        match (&r.actual, &r.error) {
                            (Some(actual), _) => println!("     actual:   {}", actual),
                            (None, Some(err)) => println!("     error:    {}", err),
                            (None, None) => {}
                        }
                    }
                }
            }
            if !report.all_valid {
                std::process::exit(1);
            }
        }
        Commands::Gate { audit } => {
            let signer = ConfigSigner::from_settings(&settings, custodian);
            let outcome = Orchestrator::new(&settings, options, signer)
                .with_audit(audit_logger(audit))
                .run(public_password.as_ref());
            eprintln!("{}", outcome.diagnostic());
            if let Some(warning) = outcome.warning() {
                eprintln!("warning: {} [{}]", warning, warning.name());
            }
            if !outcome.may_serve() {
                std::process::exit(1);
            }
        }
        Commands::Authorize { name, path, audit } => {
            let store = PolicyStore::load(&settings.paths.policy, options.mode())?
                .with_audit(audit_logger(audit));
            let auth = store.authorize(&name, &path);
            let allowed = match auth.decision {
                Decision::Allow => true,
                Decision::Deny => false,
                Decision::RequireSignature => {
                    let verdict = UnavailableOracle.query(Path::new(&path));
                    info!(trusted = verdict.trusted, detail = %verdict.detail, "platform signature query");
                    verdict.trusted
                }
            };
            println!(
                "{}: {:?} ({})",
                if allowed { "allow" } else { "deny" },
                auth.decision,
                auth.reason
            );
            for relaxed in &auth.relaxed {
                println!("  relaxed by development mode: {:?}", relaxed);
            }
            if !allowed {
                std::process::exit(1);
            }
        }
        Commands::Call {
            command,
            target,
            attempts,
            audit,
        } => {
            let config = TokenConfig::from_settings(&settings.session, options.mode());
            let authority = Arc::new(SessionTokenAuthority::new(config));
            let invoker =
                HelperInvoker::from_settings(&settings.helper, authority, audit_logger(audit))?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            match runtime.block_on(invoker.invoke_with_retry(&command, &target, attempts)) {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    if !result.success {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("helper call failed: {} [{}]", e, e.name());
                    std::process::exit(1);
                }
            }
        }
        Commands::Token { action } => {
            let config = TokenConfig::from_settings(&settings.session, options.mode());
            match action {
                TokenAction::Mint { export_secret } => {
                    let authority = SessionTokenAuthority::new(config);
                    for line in mint_lines(&authority, export_secret) {
                        println!("{}", line);
                    }
                    if !export_secret {
                        eprintln!(
                            "secret not shown; pass --export-secret to print {}",
                            ENV_SESSION_SECRET
                        );
                    }
                }
                TokenAction::Verify => {
                    match verify_helper_environment(|k| std::env::var(k).ok(), config) {
                        Ok(verified) => println!("valid (nonce {}…)", verified.nonce_prefix),
                        Err(e) => {
                            println!("rejected: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn load_settings(explicit: Option<&Path>) -> warden::Result<Settings> {
    match explicit {
        Some(path) => Settings::from_file(path),
        None if Path::new(DEFAULT_SETTINGS).exists() => Settings::from_file(DEFAULT_SETTINGS),
        None => Ok(Settings::default()),
    }
}

/// Environment assignments for a freshly minted token. The secret is
/// included only on request.
fn mint_lines(authority: &SessionTokenAuthority, export_secret: bool) -> Vec<String> {
    let mut lines = vec![format!("{}={}", ENV_SESSION_TOKEN, authority.generate_token())];
    if export_secret {
        lines.push(format!(
            "{}={}",
            ENV_SESSION_SECRET,
            authority.export_secret().expose_secret()
        ));
    }
    lines
}

fn audit_logger(enabled: bool) -> Arc<dyn AuditLogger> {
    if enabled {
        Arc::new(StdoutLogger::new())
    } else {
        Arc::new(NoOpLogger)
    }
}

fn require(password: Option<SecretString>, var: &str) -> SecretString {
    match password {
        Some(p) => p,
        None => {
            eprintln!("Error: {} is not set", var);
            std::process::exit(2);
        }
    }
}
