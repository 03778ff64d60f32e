use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::NetkitError;

/// Configuration principale chargée depuis les variables d'environnement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Start the DHCP server module on launch
    pub dhcp_enabled: bool,
    /// Address the DHCP server binds to
    pub dhcp_address: Ipv4Addr,
    pub dhcp_port: u16,
    /// JSON file with the DHCP module configuration
    pub dhcp_config_path: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            dhcp_enabled: true,
            dhcp_address: Ipv4Addr::UNSPECIFIED,
            dhcp_port: 67,
            dhcp_config_path: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl EnvConfig {
    /// Charge la configuration depuis les variables d'environnement
    pub fn from_env() -> Result<Self, NetkitError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, NetkitError> {
        let mut config = Self::default();

        if let Some(v) = lookup("NETKIT_DHCP_ENABLED") {
            config.dhcp_enabled = parse_bool(&v);
        }
        if let Some(v) = lookup("NETKIT_DHCP_ADDRESS") {
            config.dhcp_address = v
                .parse()
                .map_err(|_| NetkitError::Config(format!("NETKIT_DHCP_ADDRESS: invalid IPv4 '{v}'")))?;
        }
        if let Some(v) = lookup("NETKIT_DHCP_PORT") {
            config.dhcp_port = v
                .parse()
                .map_err(|_| NetkitError::Config(format!("NETKIT_DHCP_PORT: invalid port '{v}'")))?;
        }
        if let Some(v) = lookup("NETKIT_DHCP_CONFIG") {
            config.dhcp_config_path = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    /// Charge le fichier .env puis les variables d'environnement
    pub fn load(env_file: Option<&Path>) -> Result<Self, NetkitError> {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidate = PathBuf::from(".env");
            if candidate.exists() {
                load_dotenv(&candidate);
            }
        }

        Self::from_env()
    }
}

/// Charge un fichier .env basique (KEY=VALUE par ligne)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EnvConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EnvConfig::default());
        assert!(config.dhcp_enabled);
        assert_eq!(config.dhcp_port, 67);
    }

    #[test]
    fn test_overrides() {
        let config = EnvConfig::from_lookup(lookup(&[
            ("NETKIT_DHCP_ENABLED", "false"),
            ("NETKIT_DHCP_ADDRESS", "10.0.0.1"),
            ("NETKIT_DHCP_PORT", "6767"),
            ("NETKIT_DHCP_CONFIG", "/etc/netkit/dhcp.json"),
        ]))
        .unwrap();
        assert!(!config.dhcp_enabled);
        assert_eq!(config.dhcp_address, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.dhcp_port, 6767);
        assert_eq!(
            config.dhcp_config_path,
            Some(PathBuf::from("/etc/netkit/dhcp.json"))
        );
    }

    #[test]
    fn test_invalid_port() {
        let err = EnvConfig::from_lookup(lookup(&[("NETKIT_DHCP_PORT", "dhcp")])).unwrap_err();
        assert!(matches!(err, NetkitError::Config(_)));
    }

    #[test]
    fn test_dotenv_does_not_override_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# comment\nNETKIT_TEST_DOTENV_NEW=\"fresh\"\nNETKIT_TEST_DOTENV_KEPT=file\n",
        )
        .unwrap();
        // SAFETY: test-only variable names, not read by other tests
        unsafe { std::env::set_var("NETKIT_TEST_DOTENV_KEPT", "env") };
        load_dotenv(&path);
        assert_eq!(std::env::var("NETKIT_TEST_DOTENV_NEW").unwrap(), "fresh");
        assert_eq!(std::env::var("NETKIT_TEST_DOTENV_KEPT").unwrap(), "env");
    }
}
