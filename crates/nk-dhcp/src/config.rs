use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::{Context, Result, bail};
use ipnet::Ipv4Net;
use nk_common::{Ip4Config, MacAddr};
use nk_runtime::{ModuleError, ModuleHandle};
use serde::{Deserialize, Serialize};

use crate::server::{CLIENT_PORT, DhcpControl, DhcpModule, SERVER_PORT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub address: Ipv4Addr,
    pub port: u16,
    pub reply_to: SocketAddr,
    /// Server address and prefix on the served network, e.g. "10.0.0.1/24"
    pub interface: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub range_start: Option<Ipv4Addr>,
    pub range_end: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    pub static_hosts: Vec<StaticHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticHost {
    pub mac: MacAddr,
    pub address: Ipv4Addr,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: SERVER_PORT,
            reply_to: SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT).into(),
            interface: None,
            gateway: None,
            range_start: None,
            range_end: None,
            dns: None,
            hostname: Some("netkit".to_string()),
            static_hosts: Vec::new(),
        }
    }
}

impl DhcpConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read DHCP config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid DHCP config in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match (self.range_start, self.range_end) {
            (Some(start), Some(end)) if start > end => {
                bail!("DHCP range start {start} is after range end {end}")
            }
            (Some(_), None) | (None, Some(_)) => {
                bail!("DHCP range needs both range_start and range_end")
            }
            _ => {}
        }
        if self.gateway.is_some() && self.interface.is_none() {
            bail!("DHCP gateway set without an interface address");
        }
        Ok(())
    }

    pub fn ipconfig(&self) -> Option<Ip4Config> {
        self.interface
            .map(|interface| Ip4Config::new(interface, self.gateway))
    }

    pub fn range(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        Some((self.range_start?, self.range_end?))
    }

    /// Push the configuration into a module handle.
    ///
    /// Fails on pre-run fields if the module is running.
    pub fn apply(&self, handle: &ModuleHandle<DhcpModule>) -> Result<(), ModuleError> {
        handle.set_address(self.address)?;
        handle.set_port(self.port)?;
        handle.set_reply_to(self.reply_to)?;
        handle.set_ipconfig(self.ipconfig())?;
        handle.set_range(self.range())?;
        handle.set_dns(self.dns)?;
        handle.set_hostname(self.hostname.clone())?;
        let hosts: HashMap<MacAddr, Ipv4Addr> = self
            .static_hosts
            .iter()
            .map(|host| (host.mac, host.address))
            .collect();
        handle.set_static_hosts(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nk_common::EventBus;
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = DhcpConfig::default();
        assert_eq!(config.port, 67);
        assert_eq!(config.reply_to, "255.255.255.255:68".parse().unwrap());
        assert_eq!(config.ipconfig(), None);
        assert_eq!(config.range(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize() {
        let json = r#"{
            "interface": "10.0.0.1/24",
            "range_start": "10.0.0.100",
            "range_end": "10.0.0.200",
            "dns": "10.0.0.1",
            "static_hosts": [{ "mac": "aa:bb:cc:dd:ee:ff", "address": "10.0.0.50" }]
        }"#;
        let config: DhcpConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 67);
        assert_eq!(config.ipconfig().unwrap().address(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            config.range(),
            Some((Ipv4Addr::new(10, 0, 0, 100), Ipv4Addr::new(10, 0, 0, 200)))
        );
        assert_eq!(config.static_hosts[0].mac.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_validation() {
        let half_range = DhcpConfig {
            range_start: Some(Ipv4Addr::new(10, 0, 0, 100)),
            ..Default::default()
        };
        assert!(half_range.validate().is_err());

        let reversed = DhcpConfig {
            range_start: Some(Ipv4Addr::new(10, 0, 0, 200)),
            range_end: Some(Ipv4Addr::new(10, 0, 0, 100)),
            ..Default::default()
        };
        assert!(reversed.validate().unwrap_err().to_string().contains("after"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcp.json");
        std::fs::write(&path, r#"{ "port": 6767, "hostname": null }"#).unwrap();
        let config = DhcpConfig::load(&path).unwrap();
        assert_eq!(config.port, 6767);
        assert_eq!(config.hostname, None);

        std::fs::write(&path, r#"{ "port": "dhcp" }"#).unwrap();
        let err = DhcpConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid DHCP config"));

        assert!(DhcpConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_apply_to_handle() {
        let handle = ModuleHandle::new("dhcp", DhcpModule::new(), Arc::new(EventBus::new()));
        let config = DhcpConfig {
            address: Ipv4Addr::LOCALHOST,
            port: 0,
            interface: Some("10.0.0.1/24".parse().unwrap()),
            range_start: Some(Ipv4Addr::new(10, 0, 0, 100)),
            range_end: Some(Ipv4Addr::new(10, 0, 0, 103)),
            static_hosts: vec![StaticHost {
                mac: "aa:bb:cc:dd:ee:09".parse().unwrap(),
                address: Ipv4Addr::new(10, 0, 0, 9),
            }],
            ..Default::default()
        };
        config.apply(&handle).unwrap();
        let settings = handle.inspect(|m| m.settings().clone()).unwrap();
        assert_eq!(settings.ipconfig, config.ipconfig());
        assert_eq!(settings.range, config.range());
        assert_eq!(handle.leases().unwrap().len(), 1);

        handle.start().unwrap();
        let err = config.apply(&handle).unwrap_err();
        assert!(matches!(err, ModuleError::ConfigState { field: "address", .. }));
        handle.stop().unwrap();
    }
}
