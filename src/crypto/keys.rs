//! Key Management for docvault
//!
//! Implements a two-tier key structure:
//! - Master Keypair: RSA, loaded once per process, wraps data keys
//! - Data Keys: fresh random AES-256 key per document, persisted only wrapped

use crate::crypto::{KEY_SIZE, MIN_RSA_BITS};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Per-document AES-256 key
#[derive(Clone)]
pub struct DataKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl DataKey {
    /// Wrap existing key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        DataKey {
            key: Zeroizing::new(bytes),
        }
    }

    fn zeroed() -> Self {
        Self::from_bytes([0u8; KEY_SIZE])
    }

    /// Copy key bytes out of a slice that must be exactly 32 bytes
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = Self::zeroed();
        key.key.copy_from_slice(bytes);
        Ok(key)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Source of fresh data keys
pub struct DataKeyFactory;

impl DataKeyFactory {
    /// Generate a new random data key from the OS-seeded CSPRNG
    pub fn generate() -> DataKey {
        let mut key = DataKey::zeroed();
        rand::thread_rng().fill_bytes(&mut key.key[..]);
        key
    }
}

/// Base64 RSA-OAEP ciphertext of a data key. The only persisted form of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedKey(String);

impl WrappedKey {
    pub fn new(encoded: impl Into<String>) -> Self {
        WrappedKey(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the master keypair comes from
#[derive(Clone)]
pub enum MasterKeySource {
    /// PEM text supplied directly, typically from the environment
    Inline {
        private_pem: Zeroizing<String>,
        public_pem: String,
    },
    /// PEM files on disk
    Files {
        private_path: PathBuf,
        public_path: PathBuf,
    },
}

impl MasterKeySource {
    fn describe(&self) -> String {
        match self {
            MasterKeySource::Inline { .. } => "inline configuration".to_string(),
            MasterKeySource::Files { private_path, .. } => private_path.display().to_string(),
        }
    }

    fn load_pair(&self) -> Result<MasterKeyPair> {
        match self {
            MasterKeySource::Inline {
                private_pem,
                public_pem,
            } => MasterKeyPair::from_pem(private_pem, public_pem),
            MasterKeySource::Files {
                private_path,
                public_path,
            } => {
                let read = |path: &PathBuf| {
                    std::fs::read_to_string(path).map(Zeroizing::new).map_err(|e| {
                        Error::Configuration(format!(
                            "RSA key not readable at {}: {} (run `docvault keygen`)",
                            path.display(),
                            e
                        ))
                    })
                };
                let private_pem = read(private_path)?;
                let public_pem = read(public_path)?;
                MasterKeyPair::from_pem(&private_pem, &public_pem)
            }
        }
    }
}

impl fmt::Debug for MasterKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterKeySource::Inline { .. } => f.write_str("MasterKeySource::Inline(..)"),
            MasterKeySource::Files {
                private_path,
                public_path,
            } => f
                .debug_struct("MasterKeySource::Files")
                .field("private_path", private_path)
                .field("public_path", public_path)
                .finish(),
        }
    }
}

/// Undo escaped newlines from single-line environment values
pub fn normalize_pem(value: &str) -> String {
    value.replace("\\n", "\n").replace("\r\n", "\n")
}

/// Loaded RSA master keypair
struct MasterKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl MasterKeyPair {
    fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_pem))
            .map_err(|e| Error::Configuration(format!("Invalid RSA private key PEM: {}", e)))?;
        let public = RsaPublicKey::from_public_key_pem(public_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_pem))
            .map_err(|e| Error::Configuration(format!("Invalid RSA public key PEM: {}", e)))?;

        if private.size() * 8 < MIN_RSA_BITS {
            return Err(Error::Configuration(format!(
                "RSA modulus is {} bits, at least {} required",
                private.size() * 8,
                MIN_RSA_BITS
            )));
        }
        if RsaPublicKey::from(&private) != public {
            return Err(Error::Configuration(
                "RSA public key does not belong to the private key".to_string(),
            ));
        }

        Ok(MasterKeyPair { private, public })
    }

    /// SHA-256 of the DER public key, for logs and `show-config`
    fn fingerprint(&self) -> String {
        match self.public.to_public_key_der() {
            Ok(der) => hex::encode(Sha256::digest(der.as_bytes())),
            Err(_) => "unavailable".to_string(),
        }
    }
}

/// Key manager holding the process-wide master keypair
///
/// Built once at startup and shared by reference; the keypair is read lazily
/// on first use and immutable afterwards.
pub struct KeyManager {
    source: MasterKeySource,
    pair: OnceLock<MasterKeyPair>,
    init: Mutex<()>,
    #[cfg(test)]
    parses: std::sync::atomic::AtomicUsize,
}

impl KeyManager {
    /// Create a key manager; nothing is read until first use
    pub fn new(source: MasterKeySource) -> Self {
        KeyManager {
            source,
            pair: OnceLock::new(),
            init: Mutex::new(()),
            #[cfg(test)]
            parses: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Create and immediately load from inline PEM text
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self> {
        let manager = KeyManager::new(MasterKeySource::Inline {
            private_pem: Zeroizing::new(private_pem.to_string()),
            public_pem: public_pem.to_string(),
        });
        manager.load()?;
        Ok(manager)
    }

    /// Resolve and parse the master keypair. No-op once loaded.
    pub fn load(&self) -> Result<()> {
        if self.pair.get().is_some() {
            return Ok(());
        }

        let _guard = self.init.lock();
        if self.pair.get().is_some() {
            return Ok(());
        }

        #[cfg(test)]
        self.parses
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let pair = self.source.load_pair()?;
        info!(
            "Master keypair loaded from {} ({} bits, fingerprint {})",
            self.source.describe(),
            pair.private.size() * 8,
            pair.fingerprint()
        );
        // Only reachable while holding the init lock, so the cell is still empty
        let _ = self.pair.set(pair);
        Ok(())
    }

    /// Whether the keypair has been loaded
    pub fn is_loaded(&self) -> bool {
        self.pair.get().is_some()
    }

    /// Public key fingerprint, loading the keypair if needed
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.pair()?.fingerprint())
    }

    /// Encrypt a 32-byte data key under the master public key (RSA-OAEP, SHA-256)
    pub fn wrap(&self, data_key: &[u8]) -> Result<WrappedKey> {
        if data_key.len() != KEY_SIZE {
            return Err(Error::KeyOperation(format!(
                "data key must be {} bytes, got {}",
                KEY_SIZE,
                data_key.len()
            )));
        }

        let pair = self.pair()?;
        let wrapped = pair
            .public
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data_key)
            .map_err(|e| Error::KeyOperation(format!("RSA-OAEP encryption failed: {}", e)))?;

        Ok(WrappedKey(BASE64.encode(wrapped)))
    }

    /// Recover a data key from its wrapped form
    ///
    /// Every failure past key loading, whether bad base64, wrong length, bad
    /// padding or a foreign key, yields the same `DecryptionFailed`.
    pub fn unwrap(&self, wrapped: &WrappedKey) -> Result<DataKey> {
        let pair = self.pair()?;

        let ciphertext = match BASE64.decode(wrapped.as_str()) {
            Ok(bytes) if bytes.len() == pair.private.size() => bytes,
            _ => {
                debug!("Rejected wrapped key");
                return Err(Error::DecryptionFailed);
            }
        };

        let plaintext = pair
            .private
            .decrypt_blinded(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| {
                debug!("Rejected wrapped key");
                Error::DecryptionFailed
            })?;

        DataKey::try_from_slice(&plaintext).map_err(|_| Error::DecryptionFailed)
    }

    fn pair(&self) -> Result<&MasterKeyPair> {
        self.load()
            .map_err(|e| Error::KeyOperation(format!("master key material unavailable: {}", e)))?;
        self.pair
            .get()
            .ok_or_else(|| Error::KeyOperation("master key material unavailable".to_string()))
    }
}

/// Freshly generated PEM-encoded keypair
pub struct PemKeyPair {
    /// PKCS#8 private key
    pub private_pem: Zeroizing<String>,
    /// SPKI public key
    pub public_pem: String,
}

/// Generate a new RSA master keypair
pub fn generate_pem_pair(bits: usize) -> Result<PemKeyPair> {
    if bits < MIN_RSA_BITS {
        return Err(Error::Configuration(format!(
            "RSA keys must be at least {} bits",
            MIN_RSA_BITS
        )));
    }

    let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| Error::KeyOperation(format!("RSA key generation failed: {}", e)))?;
    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::KeyOperation(format!("PEM encoding failed: {}", e)))?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::KeyOperation(format!("PEM encoding failed: {}", e)))?;

    Ok(PemKeyPair {
        private_pem,
        public_pem,
    })
}

/// One RSA-2048 keypair shared by every unit test in the crate
#[cfg(test)]
pub(crate) fn test_pem_pair() -> &'static PemKeyPair {
    static PAIR: OnceLock<PemKeyPair> = OnceLock::new();
    PAIR.get_or_init(|| generate_pem_pair(2048).unwrap())
}
