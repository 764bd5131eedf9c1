//! Secure Storage Module
//!
//! Encrypted keyed blobs on disk (Windows DPAPI when available, a reversible
//! base64 encoding otherwise) and the [`SessionStore`] holding the refresh secret.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN,
};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;

/// Prefix marking a blob produced by the secure cipher
const ENCRYPTED_MARKER: &[u8] = b"v10";

const SESSION_KEY: &str = "session";

/// At-rest string encryption primitive
pub trait AtRestCipher: Send + Sync {
    /// Whether the secure primitive can be used on this machine
    fn is_available(&self) -> bool;

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError>;
}

/// OS-backed cipher: DPAPI on Windows, unavailable elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformCipher;

impl AtRestCipher for PlatformCipher {
    fn is_available(&self) -> bool {
        cfg!(windows)
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Encryption("DPAPI encryption failed".into()));
            }

            let encrypted = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

            // Memory allocated by CryptProtectData is ours to free
            windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as *mut std::ffi::c_void,
            ));

            Ok(encrypted)
        }
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Decryption("DPAPI decryption failed".into()));
            }

            let decrypted = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

            windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as *mut std::ffi::c_void,
            ));

            Ok(decrypted)
        }
    }

    #[cfg(not(windows))]
    fn encrypt(&self, _data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Encryption("no secure cipher on this platform".into()))
    }

    #[cfg(not(windows))]
    fn decrypt(&self, _data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Decryption("no secure cipher on this platform".into()))
    }
}

/// Keyed blob storage encrypted at rest
pub struct SecureStorage {
    storage_path: PathBuf,
    cipher: Box<dyn AtRestCipher>,
}

impl SecureStorage {
    /// Create storage under `dir` using the platform cipher
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_cipher(dir, Box::new(PlatformCipher))
    }

    pub fn with_cipher(dir: impl Into<PathBuf>, cipher: Box<dyn AtRestCipher>) -> Self {
        let storage_path = dir.into();

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!(
            "Secure storage initialized at: {:?} (encryption: {})",
            storage_path,
            cipher.is_available()
        );

        Self { storage_path, cipher }
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    /// Serialize, encode and write `data` under `key`
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let encoded = self.encode(json.as_bytes())?;

        std::fs::write(self.file_path(key), encoded)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        debug!("Saved data for key: {}", key);
        Ok(())
    }

    /// Read, decode and deserialize the blob under `key`
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, StorageError> {
        let raw = std::fs::read(self.file_path(key))
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let decoded = self.decode(&raw)?;

        serde_json::from_slice(&decoded).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.file_path(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    /// Check if key exists
    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, StorageError> {
        if self.cipher.is_available() {
            let mut blob = ENCRYPTED_MARKER.to_vec();
            blob.extend(self.cipher.encrypt(plain)?);
            Ok(blob)
        } else {
            Ok(BASE64.encode(plain).into_bytes())
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, StorageError> {
        if let Some(ciphertext) = raw.strip_prefix(ENCRYPTED_MARKER) {
            if !self.cipher.is_available() {
                return Err(StorageError::Decryption(
                    "blob is encrypted but no cipher is available".into(),
                ));
            }
            self.cipher.decrypt(ciphertext)
        } else {
            BASE64
                .decode(raw.trim_ascii())
                .map_err(|e| StorageError::Decryption(e.to_string()))
        }
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}

#[derive(Serialize, Deserialize)]
struct PersistedSecret {
    refresh_token: String,
    saved_at: chrono::DateTime<chrono::Utc>,
}

/// Holds the long-lived refresh secret, persisted encrypted.
///
/// Corrupt and absent blobs look the same to callers: both load as `None`.
pub struct SessionStore {
    storage: Arc<SecureStorage>,
    secret: Mutex<Option<String>>,
    failures: AtomicU32,
}

impl SessionStore {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        Self {
            storage,
            secret: Mutex::new(None),
            failures: AtomicU32::new(0),
        }
    }

    /// Persist the refresh secret and reset the failure counter.
    ///
    /// The in-memory copy is updated even when the write fails so the running
    /// process keeps working; the error is logged and returned for information.
    pub fn save(&self, secret: &str) -> Result<(), StorageError> {
        replace_secret(&mut self.secret.lock(), Some(secret.to_string()));
        self.failures.store(0, Ordering::SeqCst);

        let blob = PersistedSecret {
            refresh_token: secret.to_string(),
            saved_at: chrono::Utc::now(),
        };

        self.storage.save(SESSION_KEY, &blob).map_err(|e| {
            error!("Failed to persist refresh secret: {}", e);
            e
        })
    }

    /// The refresh secret, or `None` when absent or unreadable
    pub fn load(&self) -> Option<String> {
        if let Some(secret) = self.secret.lock().clone() {
            return Some(secret);
        }

        if !self.storage.exists(SESSION_KEY) {
            debug!("No stored refresh secret");
            return None;
        }

        match self.storage.load::<PersistedSecret>(SESSION_KEY) {
            Ok(blob) if !blob.refresh_token.is_empty() => {
                let mut slot = self.secret.lock();
                *slot = Some(blob.refresh_token.clone());
                Some(blob.refresh_token)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Stored refresh secret is unreadable, discarding: {}", e);
                let _ = self.storage.delete(SESSION_KEY);
                None
            }
        }
    }

    /// Delete persisted state and zero the in-memory copy
    pub fn clear(&self) {
        replace_secret(&mut self.secret.lock(), None);
        if let Err(e) = self.storage.delete(SESSION_KEY) {
            error!("Failed to delete stored refresh secret: {}", e);
        }
    }

    /// Count a failed refresh, returning the consecutive failure count
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

fn replace_secret(slot: &mut Option<String>, next: Option<String>) {
    if let Some(old) = std::mem::replace(slot, next) {
        let mut bytes = old.into_bytes();
        bytes.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&bytes);
    }
}
