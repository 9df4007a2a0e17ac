//! Cryptographic primitives for Warden.
//!
//! ## Security Properties
//!
//! 1. **Password wrapping**: secrets at rest are sealed with AES-256-GCM under a
//!    key derived by PBKDF2-HMAC-SHA256 from a password and a per-secret salt.
//!    Every secret gets its own salt and IV.
//!
//! 2. **Fail closed**: opening a sealed secret either returns the exact plaintext
//!    or [`Error::Authentication`]. A wrong password and a damaged ciphertext are
//!    indistinguishable to the caller.
//!
//! 3. **Domain separation**: callers pass associated data naming what the secret
//!    is, so a ciphertext cannot be moved to a different slot.

use crate::error::{Error, Result};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Length of the per-secret KDF salt.
pub const SALT_LEN: usize = 16;

/// Length of the AES-GCM initialization vector.
pub const IV_LEN: usize = 12;

/// Length of the AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Length of the derived wrapping key (AES-256).
pub const KEY_LEN: usize = 32;

/// Identifier recorded in sealed files for the key derivation in use.
pub const KDF_ALGORITHM: &str = "pbkdf2-hmac-sha256";

/// Derive a wrapping key from a password.
pub fn derive_key(
    password: &SecretString,
    salt: &[u8],
    iterations: u32,
) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        key.as_mut(),
    );
    key
}

/// Fill a fixed-size array from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// A password-sealed secret: ciphertext, tag, salt and IV.
///
/// Binary fields serialize as standard base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// PBKDF2 iteration count used to derive the wrapping key
    pub iterations: u32,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

// Ciphertext is not secret, but there is nothing useful to see either.
impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("iterations", &self.iterations)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl EncryptedSecret {
    /// Seal `plaintext` under a key derived from `password`.
    ///
    /// A fresh salt and IV are drawn for every call.
    pub fn seal(
        plaintext: &[u8],
        password: &SecretString,
        iterations: u32,
        associated_data: &[u8],
    ) -> Result<Self> {
        if iterations == 0 {
            return Err(Error::Configuration(
                "KDF iteration count must be non-zero".into(),
            ));
        }

        let salt: [u8; SALT_LEN] = random_bytes();
        let iv: [u8; IV_LEN] = random_bytes();
        let key = derive_key(password, &salt, iterations);

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| Error::Crypto(format!("invalid wrapping key: {}", e)))?;

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), associated_data, &mut buffer)
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        Ok(Self {
            iterations,
            salt: salt.to_vec(),
            iv: iv.to_vec(),
            ciphertext: buffer,
            tag: tag.to_vec(),
        })
    }

    /// Open the secret.
    ///
    /// Any failure, including malformed salt/IV/tag lengths, is reported as
    /// [`Error::Authentication`].
    pub fn open(
        &self,
        password: &SecretString,
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        if self.iv.len() != IV_LEN
            || self.tag.len() != TAG_LEN
            || self.salt.len() != SALT_LEN
            || self.iterations == 0
        {
            return Err(Error::Authentication);
        }

        let key = derive_key(password, &self.salt, self.iterations);
        let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| Error::Authentication)?;

        let mut buffer = Zeroizing::new(self.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&self.iv),
                associated_data,
                buffer.as_mut_slice(),
                Tag::from_slice(&self.tag),
            )
            .map_err(|_| Error::Authentication)?;

        Ok(buffer)
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare two hex digests case-insensitively in constant time.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    let a = expected.trim().to_ascii_lowercase();
    let b = actual.trim().to_ascii_lowercase();
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Sign `message` with RSASSA-PKCS1-v1_5 / SHA-256.
pub fn rsa_sign(private_key: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    signing_key.sign(message).to_vec()
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature.
pub fn rsa_verify(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let signature = RsaSignature::try_from(signature)
        .map_err(|e| Error::SignatureInvalid(format!("malformed signature: {}", e)))?;
    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(message, &signature)
        .map_err(|_| Error::SignatureInvalid("signature does not match policy hash".into()))
}

/// Serde helper: `Vec<u8>` as standard base64.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
