//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.cedula/config.toml` (user)
//! 3. `/etc/cedula/config.toml` (system)
//!
//! Tenant credentials are loaded separately with mandatory permission checks:
//! 1. `~/.cedula/secrets.toml` (user, must be 0600)
//! 2. `/etc/cedula/secrets.toml` (system, must be 0600)

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::CachePolicy;
use crate::limiter::RateLimitConfig;
use crate::registry::{CredentialMap, RegistrySettings, TenantCredentials};
use crate::store::StorageSettings;
use crate::types::TenantId;
use crate::{CedulaError, Result};

const CONFIG_DIR: &str = ".cedula";
const SYSTEM_DIR: &str = "/etc/cedula";

/// Service configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Per-tenant registry credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub tenants: HashMap<TenantId, TenantCredentials>,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.cedula/config.toml`
    /// 3. `/etc/cedula/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CedulaError::Configuration(format!("failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            CedulaError::Configuration(format!("failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(CedulaError::Configuration(format!(
                "config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(CONFIG_DIR).join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = Path::new(SYSTEM_DIR).join("config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(CedulaError::Configuration(
            "no config file found. Create ~/.cedula/config.toml or /etc/cedula/config.toml"
                .to_string(),
        ))
    }
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists; lookups need no credentials,
    /// only document reception does.
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(CONFIG_DIR).join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = Path::new(SYSTEM_DIR).join("secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Load one secrets file, rejecting group/world-readable files.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            CedulaError::Configuration(format!("failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            CedulaError::Configuration(format!("failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            CedulaError::Configuration(format!("failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        // Reject if group or other bits are set
        if mode & 0o077 != 0 {
            return Err(CedulaError::Configuration(format!(
                "secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    pub fn credentials(&self) -> CredentialMap {
        self.tenants.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Environment;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.refresh_batch_size, 100);
        assert_eq!(config.cache.max_age_days, 90);
        assert_eq!(config.cache.priority_threshold, 10);
        assert_eq!(config.rate_limit.capacity, 20.0);
        assert_eq!(config.registry.timeout_secs, 30);
        assert_eq!(config.storage.database_path, None);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [cache]
            refresh_batch_size = 25
            max_age_days = 60
            priority_threshold = 3
            snapshot_path = "/var/lib/cedula/cache.json"

            [rate_limit]
            capacity = 5.0
            refill_rate = 1.5

            [registry]
            timeout_secs = 10
            mirror_url = "http://localhost:8080"

            [registry.retry]
            max_attempts = 5
            initial_delay_ms = 100

            [storage]
            database_path = "/var/lib/cedula/cedula.db"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.refresh_batch_size, 25);
        assert_eq!(config.cache.max_age_days, 60);
        assert_eq!(config.cache.priority_threshold, 3);
        assert_eq!(
            config.cache.snapshot_path,
            Some(PathBuf::from("/var/lib/cedula/cache.json"))
        );
        assert_eq!(config.rate_limit.capacity, 5.0);
        assert_eq!(config.rate_limit.refill_rate, 1.5);
        // Defaults preserved
        assert_eq!(config.rate_limit.key, "registry_api");
        assert_eq!(config.registry.mirror_url, "http://localhost:8080");
        assert_eq!(config.registry.retry.max_attempts, 5);
        assert_eq!(config.registry.retry.initial_delay_ms, 100);
        assert_eq!(config.registry.retry.max_delay_ms, 30_000);
        assert_eq!(
            config.storage.database_path,
            Some(PathBuf::from("/var/lib/cedula/cedula.db"))
        );
    }

    #[test]
    fn parse_secrets() {
        let toml = r#"
            [tenants.acme]
            username = "cpj-3-101-123456@stag.comprobanteselectronicos.go.cr"
            password = "hunter2"

            [tenants.globex]
            username = "cpf-1-1111-1111@prod.comprobanteselectronicos.go.cr"
            password = "s3cret"
            environment = "production"
        "#;
        let secrets: Secrets = toml::from_str(toml).unwrap();
        let acme = &secrets.tenants[&TenantId::from("acme")];
        assert_eq!(acme.environment, Environment::Sandbox);
        let globex = &secrets.tenants[&TenantId::from("globex")];
        assert_eq!(globex.environment, Environment::Production);
        assert_eq!(secrets.credentials().len(), 2);
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("config file not found"));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache]\nmax_age_days = 30\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cache.max_age_days, 30);
    }

    #[test]
    fn invalid_config_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, CedulaError::Configuration(_)));
    }

    #[cfg(unix)]
    #[test]
    fn secrets_with_open_permissions_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");
        fs::write(&path, "").unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = Secrets::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("insecure permissions"));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let secrets = Secrets::load_from_file(&path).unwrap();
        assert!(secrets.tenants.is_empty());
    }
}
