//! Configuration management

use fleetssh_core::{Error, ExecutorConfig, PoolConfig, Result, SshSettings};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Login and authentication used for every host
    pub ssh: SshSettings,

    /// Deadlines and worker pool sizes
    pub executor: ExecutorConfig,

    /// Connection pool limits
    pub pool: PoolConfig,
}

impl Config {
    /// Load configuration from file or environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = if let Some(p) = path {
            Self::load_from_file(p)?
        } else {
            Self::load_from_env()?
        };
        config.executor.validate()?;
        Ok(config)
    }

    /// Load from configuration file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    fn load_from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(user) = std::env::var("FLEETSSH_USER") {
            config.ssh.username = user;
        }
        if let Some(port) = parse_var("FLEETSSH_PORT")? {
            config.ssh.port = port;
        }

        // Support file-based secrets (Docker/K8s secrets)
        config.ssh.private_key_path = get_secret("FLEETSSH_KEY_PATH");
        config.ssh.passphrase = get_secret("FLEETSSH_KEY_PASSPHRASE");
        config.ssh.password = get_secret("FLEETSSH_PASSWORD");

        if let Some(ms) = parse_var("FLEETSSH_TIMEOUT_MS")? {
            config.executor.server_op_timeout_ms = ms;
        }
        if let Some(ms) = parse_var("FLEETSSH_CONNECT_TIMEOUT_MS")? {
            config.ssh.connect_timeout_ms = ms;
        }
        if let Some(max) = parse_var("FLEETSSH_MAX_PER_HOST")? {
            config.pool.max_per_host = max;
        }

        Ok(config)
    }
}

/// Read and parse an optional numeric environment variable
fn parse_var<T: FromStr>(var_name: &str) -> Result<Option<T>> {
    match std::env::var(var_name) {
        Ok(value) => parse_value(var_name, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T: FromStr>(var_name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {}", var_name, value)))
}

/// Get secret from environment variable or file
///
/// Supports both direct environment variables and file-based secrets (Docker/Kubernetes pattern).
/// If `VAR_NAME` is not found, tries `VAR_NAME_FILE` which should point to a file containing the secret.
pub fn get_secret(var_name: &str) -> Option<String> {
    // Try environment variable first
    if let Ok(value) = std::env::var(var_name) {
        return Some(value);
    }

    // Try file-based secret (Docker secrets / Kubernetes)
    let file_var = format!("{}_FILE", var_name);
    if let Ok(path) = std::env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_file() {
        let config = Config::parse(
            r#"
            [ssh]
            username = "mqadmin"
            port = 2222
            private_key_path = "/etc/fleetssh/id_ed25519"

            [executor]
            server_op_timeout_ms = 3000
            run_workers = 50

            [pool]
            max_per_host = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.ssh.username, "mqadmin");
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(
            config.ssh.private_key_path.as_deref(),
            Some("/etc/fleetssh/id_ed25519")
        );
        assert_eq!(config.executor.server_op_timeout_ms, 3000);
        assert_eq!(config.executor.run_workers, 50);
        assert_eq!(config.executor.open_workers, 100);
        assert_eq!(config.pool.max_per_host, 2);
        assert_eq!(config.pool.max_idle_per_host, 4);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.ssh.username, "root");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.executor, ExecutorConfig::default());
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let err = Config::parse("[ssh]\nport = \"ssh\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_rejects_zero_workers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\nrun_workers = 0").unwrap();

        let err = Config::load(file.path().to_str()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some("/nonexistent/fleetssh.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value::<u16>("FLEETSSH_PORT", " 2222 ").unwrap(), 2222);
        assert!(parse_value::<u16>("FLEETSSH_PORT", "ssh").is_err());
    }

    #[test]
    fn test_get_secret_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hunter2").unwrap();
        std::env::set_var(
            "FLEETSSH_TEST_SECRET_FILE",
            file.path().to_str().unwrap(),
        );

        assert_eq!(
            get_secret("FLEETSSH_TEST_SECRET").as_deref(),
            Some("hunter2")
        );
        assert_eq!(get_secret("FLEETSSH_TEST_UNSET"), None);
    }
}
