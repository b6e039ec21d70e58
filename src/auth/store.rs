//! Secret storage for long-lived credentials.
//!
//! # Responsibilities
//! - Persist a named opaque blob, encrypted at rest
//! - Read it back for the token provider
//!
//! # Design Decisions
//! - One file per key under the user's config directory
//! - Envelope encryption: each secret gets a fresh AES-256-GCM data key,
//!   which is itself sealed with the store's master key
//! - The master key comes from `IAP_PROXY_MASTER_KEY` (64 hex chars) or from
//!   a generated key file kept outside the secrets directory
//! - Owner-only permissions on Unix (0700 directories, 0600 files)
//! - Writes go through a temp file and a rename so a crash never leaves half a key

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable holding a hex master key.
pub const MASTER_KEY_ENV: &str = "IAP_PROXY_MASTER_KEY";

const MAGIC: &[u8; 4] = b"IAP1";
const NONCE_LEN: usize = 12;
// 32-byte data key plus the 16-byte GCM tag.
const SEALED_DEK_LEN: usize = 48;
const HEADER_LEN: usize = MAGIC.len() + NONCE_LEN + SEALED_DEK_LEN + NONCE_LEN;

/// Errors raised by a secret store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No usable location for the store.
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),

    /// Key is empty or would escape the store directory.
    #[error("Invalid secret key '{0}'")]
    InvalidKey(String),

    /// Master key is malformed.
    #[error("Invalid master key: {0}")]
    MasterKey(String),

    /// Sealing or opening a secret failed.
    #[error("Secret could not be decrypted: {0}")]
    Crypto(String),

    /// Underlying file operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A durable key/value store for opaque secrets.
pub trait SecretStore: Send + Sync {
    /// Persist `data` under `key`, replacing any previous value.
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Read the value under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Where the master key lives.
#[derive(Debug, Clone)]
enum MasterKey {
    Fixed([u8; 32]),
    File(PathBuf),
}

/// File-backed, encrypted secret store.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
    master: MasterKey,
}

impl FileSecretStore {
    /// Store rooted at an explicit directory, with its master key file
    /// (`.master_key`) generated inside it on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let master = MasterKey::File(dir.join(".master_key"));
        Self { dir, master }
    }

    /// Use `key` as the master key instead of a key file.
    pub fn with_master_key(mut self, key: [u8; 32]) -> Self {
        self.master = MasterKey::Fixed(key);
        self
    }

    /// Store for `service` under the user's config directory.
    ///
    /// The master key is taken from `IAP_PROXY_MASTER_KEY` when set, else
    /// from `master.key` under the user's local data directory.
    pub fn open(service: &str) -> Result<Self, StoreError> {
        if !is_valid_key(service) {
            return Err(StoreError::InvalidKey(service.to_string()));
        }
        let base = dirs::config_dir()
            .ok_or_else(|| StoreError::Unavailable("no user config directory".to_string()))?;
        let store = Self::new(base.join("iap-proxy").join(service));

        if let Ok(hex_key) = std::env::var(MASTER_KEY_ENV) {
            return Ok(store.with_master_key(parse_master_key(&hex_key)?));
        }
        let data = dirs::data_local_dir()
            .ok_or_else(|| StoreError::Unavailable("no user data directory".to_string()))?;
        Ok(Self {
            master: MasterKey::File(data.join("iap-proxy").join("master.key")),
            ..store
        })
    }

    /// Directory holding the secrets.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    /// Master key, generating and persisting one if `create` and none exists.
    fn master_key(&self, create: bool) -> Result<Option<[u8; 32]>, StoreError> {
        let path = match &self.master {
            MasterKey::Fixed(key) => return Ok(Some(*key)),
            MasterKey::File(path) => path,
        };
        match fs::read_to_string(path) {
            Ok(hex_key) => return parse_master_key(hex_key.trim()).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        }

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        if let Some(parent) = path.parent() {
            ensure_private_dir(parent)?;
        }
        write_private(path, hex::encode(key).as_bytes())?;
        tracing::info!(path = ?path, "Generated secret store master key");
        Ok(Some(key))
    }
}

impl SecretStore for FileSecretStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let master = self
            .master_key(true)?
            .ok_or_else(|| StoreError::Unavailable("no master key".to_string()))?;
        let sealed = seal(&master, data)?;

        ensure_private_dir(&self.dir)?;
        write_private(&path, &sealed)?;
        tracing::debug!(path = ?path, "Secret written");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        let sealed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let master = self
            .master_key(false)?
            .ok_or_else(|| StoreError::Crypto("master key is missing".to_string()))?;
        open_sealed(&master, &sealed).map(Some)
    }
}

/// Encrypt `plaintext` under a fresh data key sealed with `master`.
///
/// Layout: magic, data key nonce, sealed data key, secret nonce, ciphertext.
fn seal(master: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut dek = [0u8; 32];
    OsRng.fill_bytes(&mut dek);

    let secret_cipher = Aes256Gcm::new_from_slice(&dek)
        .map_err(|e| StoreError::Crypto(format!("invalid key length: {:?}", e)))?;
    let secret_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = secret_cipher
        .encrypt(&secret_nonce, plaintext)
        .map_err(|e| StoreError::Crypto(format!("secret encryption failed: {}", e)))?;

    let kek_cipher = Aes256Gcm::new_from_slice(master)
        .map_err(|e| StoreError::Crypto(format!("invalid key length: {:?}", e)))?;
    let dek_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed_dek = kek_cipher
        .encrypt(&dek_nonce, dek.as_ref())
        .map_err(|e| StoreError::Crypto(format!("data key encryption failed: {}", e)))?;
    dek.fill(0);

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&dek_nonce);
    out.extend_from_slice(&sealed_dek);
    out.extend_from_slice(&secret_nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_sealed(master: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
    if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
        return Err(StoreError::Crypto("not a sealed secret".to_string()));
    }
    let (dek_nonce, rest) = sealed[MAGIC.len()..].split_at(NONCE_LEN);
    let (sealed_dek, rest) = rest.split_at(SEALED_DEK_LEN);
    let (secret_nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let kek_cipher = Aes256Gcm::new_from_slice(master)
        .map_err(|e| StoreError::Crypto(format!("invalid key length: {:?}", e)))?;
    let dek_bytes = kek_cipher
        .decrypt(Nonce::from_slice(dek_nonce), sealed_dek)
        .map_err(|e| StoreError::Crypto(format!("data key decryption failed: {}", e)))?;

    let mut dek = [0u8; 32];
    dek.copy_from_slice(&dek_bytes);
    let secret_cipher = Aes256Gcm::new_from_slice(&dek)
        .map_err(|e| StoreError::Crypto(format!("invalid key length: {:?}", e)))?;
    let plaintext = secret_cipher
        .decrypt(Nonce::from_slice(secret_nonce), ciphertext)
        .map_err(|e| StoreError::Crypto(format!("secret decryption failed: {}", e)));
    dek.fill(0);
    plaintext
}

/// Parse a 64-char hex master key.
pub fn parse_master_key(hex_key: &str) -> Result<[u8; 32], StoreError> {
    let bytes = hex::decode(hex_key).map_err(|e| StoreError::MasterKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| StoreError::MasterKey(format!("expected 32 bytes, got {}", b.len())))
}

fn ensure_private_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `data` to `path` with owner-only permissions, via a temp file.
fn write_private(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.trim_start_matches('.')));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.starts_with('.')
        && !key.contains(['/', '\\', '\0'])
}
