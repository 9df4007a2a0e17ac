//! Key custody: the password-protected signing identity.
//!
//! An identity is an RSA key pair plus a self-signed certificate. It is kept
//! on disk as two independently sealed files:
//!
//! - `identity.pub.enc`: public key and certificate, unlocked with the
//!   public password and needed to verify a signed policy
//! - `identity.key.enc`: private key, unlocked with the private password
//!   (at a higher KDF cost) and needed only to sign
//!
//! Each file's associated data names its role and the thumbprint, so the
//! files cannot be swapped and the recorded thumbprint cannot be edited.
//! Decrypted key material lives only as long as the returned value.

use crate::crypto::{self, EncryptedSecret, KDF_ALGORITHM};
use crate::error::{Error, Result};
use crate::options::SecurityMode;
use crate::settings::{IdentitySettings, KdfSettings, MIN_KEY_BITS, MIN_PRODUCTION_KEY_BITS};
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PUBLIC_FILE: &str = "identity.pub.enc";
pub const PRIVATE_FILE: &str = "identity.key.enc";

const FILE_VERSION: u32 = 1;
const AAD_CONTEXT: &str = "warden-identity-v1";

/// Which half of the identity a sealed file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    Public,
    Private,
}

impl KeyRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdfDescriptor {
    algorithm: String,
    iterations: u32,
}

/// On-disk layout of one sealed identity half.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    role: KeyRole,
    kdf: KdfDescriptor,
    #[serde(with = "crypto::b64")]
    salt: Vec<u8>,
    #[serde(with = "crypto::b64")]
    iv: Vec<u8>,
    #[serde(with = "crypto::b64")]
    ciphertext: Vec<u8>,
    #[serde(with = "crypto::b64")]
    tag: Vec<u8>,
    thumbprint: String,
}

impl IdentityFile {
    fn new(role: KeyRole, thumbprint: &str, sealed: EncryptedSecret) -> Self {
        Self {
            version: FILE_VERSION,
            role,
            kdf: KdfDescriptor {
                algorithm: KDF_ALGORITHM.to_string(),
                iterations: sealed.iterations,
            },
            salt: sealed.salt,
            iv: sealed.iv,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
            thumbprint: thumbprint.to_string(),
        }
    }

    fn sealed(&self) -> EncryptedSecret {
        EncryptedSecret {
            iterations: self.kdf.iterations,
            salt: self.salt.clone(),
            iv: self.iv.clone(),
            ciphertext: self.ciphertext.clone(),
            tag: self.tag.clone(),
        }
    }
}

/// Plaintext of the public file.
#[derive(Serialize, Deserialize)]
struct PublicBundle {
    #[serde(with = "crypto::b64")]
    public_key: Vec<u8>,
    #[serde(with = "crypto::b64")]
    certificate: Vec<u8>,
}

fn associated_data(role: KeyRole, thumbprint: &str) -> Vec<u8> {
    format!("{}|{}|{}", AAD_CONTEXT, role.as_str(), thumbprint).into_bytes()
}

/// The verifying half of an identity.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    public_key: RsaPublicKey,
    certificate: Vec<u8>,
    thumbprint: String,
}

impl PublicIdentity {
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// DER-encoded self-signed certificate.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    /// Lowercase hex SHA-256 of the certificate DER.
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}

/// The signing half: a decrypted private key and the thumbprint it belongs to.
///
/// Dropping it zeroizes the key.
pub struct SigningIdentity {
    private_key: RsaPrivateKey,
    thumbprint: String,
}

impl SigningIdentity {
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        crypto::rsa_sign(&self.private_key, message)
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("thumbprint", &self.thumbprint)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// A complete identity.
pub struct Identity {
    public: PublicIdentity,
    signing: SigningIdentity,
}

impl Identity {
    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn signing(&self) -> &SigningIdentity {
        &self.signing
    }

    pub fn thumbprint(&self) -> &str {
        self.public.thumbprint()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("thumbprint", &self.public.thumbprint)
            .finish()
    }
}

/// Creates, stores and unlocks the signing identity under a key directory.
#[derive(Debug, Clone)]
pub struct KeyCustodian {
    key_dir: PathBuf,
    kdf: KdfSettings,
    identity: IdentitySettings,
    mode: SecurityMode,
}

impl KeyCustodian {
    pub fn new(key_dir: impl Into<PathBuf>, kdf: KdfSettings, identity: IdentitySettings) -> Self {
        Self {
            key_dir: key_dir.into(),
            kdf,
            identity,
            mode: SecurityMode::Production,
        }
    }

    /// Mode used for the key-size floor on initialisation.
    pub fn with_mode(mut self, mode: SecurityMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn public_path(&self) -> PathBuf {
        self.key_dir.join(PUBLIC_FILE)
    }

    pub fn private_path(&self) -> PathBuf {
        self.key_dir.join(PRIVATE_FILE)
    }

    /// Whether either identity file is present.
    pub fn exists(&self) -> bool {
        self.public_path().exists() || self.private_path().exists()
    }

    /// Generate and persist a fresh identity.
    pub fn initialize(
        &self,
        public_password: &SecretString,
        private_password: &SecretString,
        overwrite: bool,
    ) -> Result<Identity> {
        if self.exists() && !overwrite {
            return Err(Error::KeysAlreadyExist(self.key_dir.display().to_string()));
        }
        self.check_parameters(public_password, private_password)?;

        info!(
            key_dir = %self.key_dir.display(),
            bits = self.identity.key_bits,
            "generating signing identity"
        );
        let private_key = RsaPrivateKey::new(&mut OsRng, self.identity.key_bits)?;
        let public_key = private_key.to_public_key();
        let certificate = self.self_signed_certificate(&private_key)?;
        let thumbprint = crypto::sha256_hex(&certificate);

        let public_der = public_key
            .to_public_key_der()
            .map_err(|e| Error::Crypto(format!("public key encoding failed: {}", e)))?;
        let bundle = PublicBundle {
            public_key: public_der.as_bytes().to_vec(),
            certificate: certificate.clone(),
        };
        let public_plain = serde_json::to_vec(&bundle)?;
        let public_sealed = EncryptedSecret::seal(
            &public_plain,
            public_password,
            self.kdf.public_iterations,
            &associated_data(KeyRole::Public, &thumbprint),
        )?;

        let private_der = private_key
            .to_pkcs8_der()
            .map_err(|e| Error::Crypto(format!("private key encoding failed: {}", e)))?;
        let private_sealed = EncryptedSecret::seal(
            private_der.as_bytes(),
            private_password,
            self.kdf.private_iterations,
            &associated_data(KeyRole::Private, &thumbprint),
        )?;

        self.write_file(
            &self.public_path(),
            &IdentityFile::new(KeyRole::Public, &thumbprint, public_sealed),
        )?;
        self.write_file(
            &self.private_path(),
            &IdentityFile::new(KeyRole::Private, &thumbprint, private_sealed),
        )?;

        info!(thumbprint = %thumbprint, "signing identity stored");
        Ok(Identity {
            public: PublicIdentity {
                public_key,
                certificate,
                thumbprint: thumbprint.clone(),
            },
            signing: SigningIdentity {
                private_key,
                thumbprint,
            },
        })
    }

    /// Unlock both halves.
    pub fn load_keys(
        &self,
        public_password: &SecretString,
        private_password: &SecretString,
    ) -> Result<Identity> {
        let public = self.load_public(public_password)?;
        let signing = self.load_private(private_password)?;
        if signing.thumbprint != public.thumbprint
            || signing.private_key.to_public_key() != public.public_key
        {
            return Err(Error::Authentication);
        }
        Ok(Identity { public, signing })
    }

    /// Unlock the public half.
    pub fn load_public(&self, public_password: &SecretString) -> Result<PublicIdentity> {
        let file = self.read_file(&self.public_path(), KeyRole::Public)?;
        let plain = file.sealed().open(
            public_password,
            &associated_data(KeyRole::Public, &file.thumbprint),
        )?;
        let bundle: PublicBundle =
            serde_json::from_slice(&plain).map_err(|_| Error::Authentication)?;
        let public_key =
            RsaPublicKey::from_public_key_der(&bundle.public_key).map_err(|_| Error::Authentication)?;

        if !crypto::digests_match(&file.thumbprint, &crypto::sha256_hex(&bundle.certificate)) {
            return Err(Error::Authentication);
        }

        debug!(thumbprint = %file.thumbprint, "public identity unlocked");
        Ok(PublicIdentity {
            public_key,
            certificate: bundle.certificate,
            thumbprint: file.thumbprint,
        })
    }

    /// Unlock the private half.
    pub fn load_private(&self, private_password: &SecretString) -> Result<SigningIdentity> {
        let file = self.read_file(&self.private_path(), KeyRole::Private)?;
        let plain = file.sealed().open(
            private_password,
            &associated_data(KeyRole::Private, &file.thumbprint),
        )?;
        let private_key =
            RsaPrivateKey::from_pkcs8_der(&plain).map_err(|_| Error::Authentication)?;

        debug!(thumbprint = %file.thumbprint, "private identity unlocked");
        Ok(SigningIdentity {
            private_key,
            thumbprint: file.thumbprint,
        })
    }

    fn check_parameters(
        &self,
        public_password: &SecretString,
        private_password: &SecretString,
    ) -> Result<()> {
        if public_password.expose_secret().is_empty() || private_password.expose_secret().is_empty()
        {
            return Err(Error::Configuration("passwords must not be empty".into()));
        }
        if self.kdf.private_iterations <= self.kdf.public_iterations {
            return Err(Error::Configuration(format!(
                "private KDF iterations ({}) must exceed public iterations ({})",
                self.kdf.private_iterations, self.kdf.public_iterations
            )));
        }
        let floor = if self.mode.is_production() {
            MIN_PRODUCTION_KEY_BITS
        } else {
            MIN_KEY_BITS
        };
        if self.identity.key_bits < floor {
            return Err(Error::Configuration(format!(
                "{}-bit keys are below the {} minimum of {} bits",
                self.identity.key_bits, self.mode, floor
            )));
        }
        Ok(())
    }

    fn self_signed_certificate(&self, private_key: &RsaPrivateKey) -> Result<Vec<u8>> {
        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("private key encoding failed: {}", e)))?;
        let key_pair = rcgen::KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| Error::Crypto(format!("certificate key rejected: {}", e)))?;

        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, self.identity.common_name.as_str());

        let now = Utc::now();
        let until = now + ChronoDuration::days(i64::from(self.identity.validity_days));
        params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("certificate generation failed: {}", e)))?;
        Ok(cert.der().to_vec())
    }

    fn write_file(&self, path: &Path, file: &IdentityFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file)?;
        crate::fsutil::write_atomic(path, &json, true)
    }

    fn read_file(&self, path: &Path, role: KeyRole) -> Result<IdentityFile> {
        let content = match std::fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeysNotFound(path.display().to_string()));
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        // Damaged files fail the same way as a wrong password.
        let file: IdentityFile =
            serde_json::from_slice(&content).map_err(|_| Error::Authentication)?;
        if file.version != FILE_VERSION || file.role != role || file.kdf.algorithm != KDF_ALGORITHM
        {
            return Err(Error::Authentication);
        }
        Ok(file)
    }
}
