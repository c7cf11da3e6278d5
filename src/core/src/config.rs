//! Shared constants, storage paths, and network configuration.
//!
//! ModelKits are stored under `<config>/kitforge/storage/` and registry
//! credentials under `<config>/kitforge/credentials.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KitError, Result};

/// Default name for a Kitfile (otherwise specified explicitly at pack time).
pub const DEFAULT_KITFILE_NAME: &str = "Kitfile";

/// Name of the ignore file consulted while packing.
pub const IGNORE_FILE_NAME: &str = ".kitignore";

/// Subdirectory of the platform config path holding all KitForge state.
pub const DEFAULT_CONFIG_SUBDIR: &str = "kitforge";

/// Storage subpath for the local modelkit store.
pub const STORAGE_SUBPATH: &str = "storage";

/// Credentials file subpath.
pub const CREDENTIALS_SUBPATH: &str = "credentials.json";

/// Annotation recording the CLI version that packed a modelkit.
pub const CLI_VERSION_ANNOTATION: &str = "ml.kitops.modelkit.cli-version";

/// Maximum number of "parent" modelkits a modelkit may have by referring to
/// another modelkit in its `.model.path`.
pub const MAX_MODEL_REF_CHAIN: usize = 10;

/// File names probed when searching a context directory for a Kitfile.
pub fn default_kitfile_names() -> [&'static str; 3] {
    ["Kitfile", "kitfile", ".kitfile"]
}

/// Default configuration and cache directory.
///
/// Platform-dependent:
///   - `$XDG_DATA_HOME/kitforge` on Linux, falling back to `~/.local/share/kitforge`
///   - `~/Library/Application Support/kitforge` on macOS
///   - `%LOCALAPPDATA%\kitforge` on Windows
pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| KitError::Storage("could not determine data directory".to_string()))?;
    Ok(base.join(DEFAULT_CONFIG_SUBDIR))
}

/// Local store root for a given config base.
pub fn storage_path(config_base: &Path) -> PathBuf {
    config_base.join(STORAGE_SUBPATH)
}

/// Credentials file path for a given config base.
pub fn credentials_path(config_base: &Path) -> PathBuf {
    config_base.join(CREDENTIALS_SUBPATH)
}

/// `index.json` path for a local OCI index, based off the index base path.
pub fn index_json_path(storage_base: &Path) -> PathBuf {
    storage_base.join("index.json")
}

/// Network options consumed by the registry client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOptions {
    /// Use plain HTTP instead of HTTPS.
    pub plain_http: bool,

    /// Verify TLS certificates (disable only for self-signed test registries).
    pub tls_verify: bool,

    /// Additional PEM certificates to trust.
    pub tls_trust_cert_paths: Vec<PathBuf>,

    /// Client certificate for mutual TLS.
    pub client_cert_path: Option<PathBuf>,

    /// Client key for mutual TLS.
    pub client_key_path: Option<PathBuf>,

    /// Proxy URL for all registry traffic.
    pub proxy: Option<String>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            plain_http: false,
            tls_verify: true,
            tls_trust_cert_paths: Vec::new(),
            client_cert_path: None,
            client_key_path: None,
            proxy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_paths() {
        let base = Path::new("/data/kitforge");
        assert_eq!(storage_path(base), PathBuf::from("/data/kitforge/storage"));
        assert_eq!(
            credentials_path(base),
            PathBuf::from("/data/kitforge/credentials.json")
        );
        assert_eq!(
            index_json_path(&storage_path(base).join("repo")),
            PathBuf::from("/data/kitforge/storage/repo/index.json")
        );
    }

    #[test]
    fn test_network_options_default() {
        let opts = NetworkOptions::default();
        assert!(!opts.plain_http);
        assert!(opts.tls_verify);
        assert!(opts.proxy.is_none());
    }
}
