//! Registry credential storage.
//!
//! Credentials are resolved through the `CredentialSource` trait; the
//! default implementation is a JSON file at
//! `<config>/kitforge/credentials.json`, written atomically.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use kitforge_core::{config, KitError, Result};
use serde::{Deserialize, Serialize};

/// A username/secret pair for one registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Supplies credentials for registry hosts.
pub trait CredentialSource: Send + Sync {
    fn get(&self, registry: &str) -> Result<Option<Credential>>;
}

/// A source with no credentials; every lookup is anonymous.
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn get(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(None)
    }
}

/// Persistent credential file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: HashMap<String, Credential>,
}

/// Persistent credential store for registries.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store at the default path under the KitForge config directory.
    pub fn default_path() -> Result<Self> {
        let base = config::default_config_path()?;
        Ok(Self {
            path: config::credentials_path(&base),
        })
    }

    /// Store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials for a registry. Overwrites any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Remove credentials for a registry. Returns true if an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<CredentialFile> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                KitError::Storage(format!("failed to parse credential store: {}", e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialFile::default()),
            Err(e) => Err(KitError::Io(e)),
        }
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| KitError::Storage("credential path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| KitError::Storage(format!("failed to create temp file: {}", e)))?;
        temp.write_all(&serde_json::to_vec_pretty(file)?)?;
        temp.persist(&self.path)
            .map_err(|e| KitError::Storage(format!("failed to save credentials: {}", e)))?;
        Ok(())
    }
}

impl CredentialSource for FileCredentialStore {
    fn get(&self, registry: &str) -> Result<Option<Credential>> {
        let file = self.load()?;
        Ok(file.registries.get(&normalize_registry(registry)).cloned())
    }
}

/// Normalize a registry key: strip scheme and trailing slashes, lowercase.
fn normalize_registry(registry: &str) -> String {
    registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_ascii_lowercase()
}
