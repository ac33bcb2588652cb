use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as Base64, Engine as _};
use keyring::Entry;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{AppError, AppResult};

const KEYRING_SERVICE: &str = "workpulse.provider.vault";
const MASTER_KEY_ENV: &str = "WORKPULSE_MASTER_KEY";
const VERSION_PREFIX: &str = "v1:";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 120_000;

/// Decrypted provider secret. Formatting never reveals the plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiSecret(String);

impl ApiSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiSecret(***)")
    }
}

impl fmt::Display for ApiSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Clone)]
enum MasterSource {
    Keyring { account: String },
    Inline(Vec<u8>),
}

#[derive(Clone)]
pub struct CryptoVault {
    source: MasterSource,
}

impl fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            MasterSource::Keyring { account } => format!("keyring:{account}"),
            MasterSource::Inline(_) => "inline".to_string(),
        };
        f.debug_struct("CryptoVault").field("source", &source).finish()
    }
}

impl CryptoVault {
    /// Prefers `WORKPULSE_MASTER_KEY` (base64, 32 bytes) and falls back to the OS keyring.
    pub fn from_env_or_keyring(account_id: &str) -> AppResult<Self> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(encoded) if !encoded.trim().is_empty() => {
                let master = decode_master_secret(encoded.trim())?;
                Ok(Self {
                    source: MasterSource::Inline(master),
                })
            }
            _ => Self::keyring(account_id),
        }
    }

    pub fn keyring(account_id: &str) -> AppResult<Self> {
        Entry::new(KEYRING_SERVICE, account_id)
            .map_err(|err| AppError::other(format!("unable to open system keyring: {err}")))?;
        Ok(Self {
            source: MasterSource::Keyring {
                account: account_id.to_string(),
            },
        })
    }

    pub fn with_master_secret(master: &[u8]) -> AppResult<Self> {
        if master.len() != KEY_LEN {
            return Err(AppError::credential(None, "master secret must be 32 bytes"));
        }
        Ok(Self {
            source: MasterSource::Inline(master.to_vec()),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> AppResult<String> {
        let master = self.master_secret()?;
        encrypt_with_master(&master, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &str) -> AppResult<Vec<u8>> {
        let master = self.master_secret()?;
        decrypt_with_master(&master, ciphertext)
    }

    /// Decrypts a stored credential secret; failures are credential errors, never retried.
    pub fn decrypt_secret(&self, credential_id: i64, ciphertext: &str) -> AppResult<ApiSecret> {
        let bytes = self
            .decrypt(ciphertext)
            .map_err(|err| AppError::credential(Some(credential_id), err.to_string()))?;
        let value = String::from_utf8(bytes).map_err(|_| {
            AppError::credential(Some(credential_id), "stored secret is not valid UTF-8")
        })?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AppError::credential(Some(credential_id), "stored secret is empty"));
        }
        Ok(ApiSecret::new(trimmed))
    }

    fn master_secret(&self) -> AppResult<Vec<u8>> {
        match &self.source {
            MasterSource::Inline(master) => Ok(master.clone()),
            MasterSource::Keyring { account } => load_or_create_keyring_secret(account),
        }
    }
}

fn load_or_create_keyring_secret(account: &str) -> AppResult<Vec<u8>> {
    let entry = Entry::new(KEYRING_SERVICE, account)
        .map_err(|err| AppError::other(format!("unable to open system keyring: {err}")))?;
    match entry.get_password() {
        Ok(secret) => decode_master_secret(&secret),
        Err(keyring::Error::NoEntry) => {
            let mut secret = vec![0u8; KEY_LEN];
            OsRng.fill_bytes(&mut secret);
            entry
                .set_password(&Base64.encode(&secret))
                .map_err(|err| AppError::other(format!("unable to write system keyring: {err}")))?;
            Ok(secret)
        }
        Err(err) => Err(AppError::other(format!("unable to read system keyring: {err}"))),
    }
}

pub(crate) fn encrypt_with_master(master_secret: &[u8], plaintext: &[u8]) -> AppResult<String> {
    if master_secret.len() != KEY_LEN {
        return Err(AppError::other("invalid master secret length"));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(master_secret, &salt);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| AppError::other("unable to initialize cipher"))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AppError::other("encryption failed"))?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(format!("{VERSION_PREFIX}{}", Base64.encode(payload)))
}

pub(crate) fn decrypt_with_master(master_secret: &[u8], ciphertext: &str) -> AppResult<Vec<u8>> {
    if master_secret.len() != KEY_LEN {
        return Err(AppError::other("invalid master secret length"));
    }

    let encoded = ciphertext
        .strip_prefix(VERSION_PREFIX)
        .ok_or_else(|| AppError::other("unsupported ciphertext format"))?;

    let decoded = Base64
        .decode(encoded.as_bytes())
        .map_err(|_| AppError::other("ciphertext is not valid base64"))?;

    if decoded.len() <= SALT_LEN + NONCE_LEN {
        return Err(AppError::other("ciphertext too short"));
    }

    let (salt, rest) = decoded.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext_bytes) = rest.split_at(NONCE_LEN);

    let key = derive_key(master_secret, salt);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| AppError::other("unable to initialize cipher"))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext_bytes)
        .map_err(|_| AppError::other("decryption failed"))
}

fn derive_key(master: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(master, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn decode_master_secret(encoded: &str) -> AppResult<Vec<u8>> {
    let secret = Base64
        .decode(encoded.as_bytes())
        .map_err(|_| AppError::credential(None, "master secret is not valid base64"))?;
    if secret.len() != KEY_LEN {
        return Err(AppError::credential(None, "master secret must be 32 bytes"));
    }
    Ok(secret)
}
