//! Configuration management for docvault

use crate::crypto::{normalize_pem, MasterKeySource};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;
use zeroize::Zeroizing;

/// Default upload limit: 50MB
pub const DEFAULT_MAX_DOCUMENT_SIZE: u64 = 50 * 1024 * 1024;

/// Default read size when streaming local files: 64KB
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Largest accepted read size
const MAX_READ_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default storage prefix for envelope blobs
pub const DEFAULT_STORAGE_PREFIX: &str = "encrypted";

/// Master keypair location
///
/// Either both PEM strings are set, or neither is and the key files are used.
/// Inline PEM takes precedence over paths.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MasterKeyConfig {
    /// PKCS#8 private key PEM; escaped `\n` sequences are accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,

    /// SPKI public key PEM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,

    /// Private key file (default: `<data_dir>/keys/private.pem`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,

    /// Public key file (default: `<data_dir>/keys/public.pem`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<PathBuf>,
}

impl fmt::Debug for MasterKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyConfig")
            .field("private_key_pem", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .field("public_key_pem", &self.public_key_pem.as_ref().map(|_| "<set>"))
            .field("private_key_path", &self.private_key_path)
            .field("public_key_path", &self.public_key_path)
            .finish()
    }
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root (default: `<data_dir>/blobs`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Path prefix for envelope blobs inside the root
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    DEFAULT_STORAGE_PREFIX.to_string()
}

/// Metadata database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Sled database directory (default: `<data_dir>/metadata`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted plaintext document in bytes
    #[serde(default = "default_max_document_size")]
    pub max_document_size: u64,

    /// Read size when streaming local files
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_max_document_size() -> u64 {
    DEFAULT_MAX_DOCUMENT_SIZE
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for keys, blobs and metadata
    pub data_dir: PathBuf,

    #[serde(default)]
    pub master_key: MasterKeyConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docvault");

        Config {
            data_dir,
            master_key: MasterKeyConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: None,
            prefix: default_prefix(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise build from defaults and environment
    pub fn load_or_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    /// Apply environment variable overrides to the configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // Master key material, either inline PEM or file paths
        if let Some(pem) = non_empty("RSA_PRIVATE_KEY") {
            self.master_key.private_key_pem = Some(normalize_pem(&pem));
        }
        if let Some(pem) = non_empty("RSA_PUBLIC_KEY") {
            self.master_key.public_key_pem = Some(normalize_pem(&pem));
        }
        if let Some(path) = non_empty("RSA_PRIVATE_KEY_PATH") {
            self.master_key.private_key_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(path) = non_empty("RSA_PUBLIC_KEY_PATH") {
            self.master_key.public_key_path = Some(PathBuf::from(path.trim()));
        }

        if let Some(dir) = non_empty("DOCVAULT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir.trim());
        }

        if let Some(size) = non_empty("DOCVAULT_MAX_DOCUMENT_SIZE") {
            if let Ok(size) = size.trim().parse::<u64>() {
                self.limits.max_document_size = size;
            }
        }
    }

    /// Create configuration from defaults plus environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_document_size == 0 {
            return Err(Error::Configuration(
                "max_document_size must be greater than 0".to_string(),
            ));
        }

        if self.limits.read_chunk_size == 0 || self.limits.read_chunk_size > MAX_READ_CHUNK_SIZE {
            return Err(Error::Configuration(format!(
                "read_chunk_size must be between 1 and {} bytes",
                MAX_READ_CHUNK_SIZE
            )));
        }

        let prefix = self.storage.prefix.trim_matches('/');
        if prefix.is_empty() || prefix.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(Error::Configuration(format!(
                "Invalid storage prefix: {:?}",
                self.storage.prefix
            )));
        }

        Ok(())
    }

    /// Resolve the master key source
    ///
    /// Inline PEM wins when both strings are present. Otherwise both key
    /// files must exist; a lone inline string is ignored.
    pub fn master_key_source(&self) -> Result<MasterKeySource> {
        match (&self.master_key.private_key_pem, &self.master_key.public_key_pem) {
            (Some(private_pem), Some(public_pem)) => {
                return Ok(MasterKeySource::Inline {
                    private_pem: Zeroizing::new(normalize_pem(private_pem)),
                    public_pem: normalize_pem(public_pem),
                });
            }
            (None, None) => {}
            (Some(_), None) => {
                warn!("RSA_PRIVATE_KEY is set without RSA_PUBLIC_KEY, using key files");
            }
            (None, Some(_)) => {
                warn!("RSA_PUBLIC_KEY is set without RSA_PRIVATE_KEY, using key files");
            }
        }

        let private_path = self.private_key_path();
        let public_path = self.public_key_path();
        for path in [&private_path, &public_path] {
            if !path.is_file() {
                return Err(Error::Configuration(format!(
                    "No master key configured: set RSA_PRIVATE_KEY and RSA_PUBLIC_KEY, \
                     or create {} (run `docvault keygen`)",
                    path.display()
                )));
            }
        }

        Ok(MasterKeySource::Files {
            private_path,
            public_path,
        })
    }

    /// Private key file location
    pub fn private_key_path(&self) -> PathBuf {
        self.master_key
            .private_key_path
            .clone()
            .unwrap_or_else(|| self.keys_dir().join("private.pem"))
    }

    /// Public key file location
    pub fn public_key_path(&self) -> PathBuf {
        self.master_key
            .public_key_path
            .clone()
            .unwrap_or_else(|| self.keys_dir().join("public.pem"))
    }

    /// Default key directory
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    /// Blob storage root
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("blobs"))
    }

    /// Metadata database directory
    pub fn metadata_path(&self) -> PathBuf {
        self.metadata
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("metadata"))
    }

    /// Create necessary directories
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.storage_root())?;
        if let Some(parent) = self.metadata_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
