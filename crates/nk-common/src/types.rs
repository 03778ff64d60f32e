use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::NetkitError;

/// Adresse matérielle Ethernet (6 octets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Build from the first 6 bytes of a hardware address field.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = NetkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(NetkitError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(NetkitError::InvalidMac(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| NetkitError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = NetkitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// IPv4 configuration of an interface: address with prefix, plus an optional gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ip4Config {
    pub interface: Ipv4Net,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

impl Ip4Config {
    pub fn new(interface: Ipv4Net, gateway: Option<Ipv4Addr>) -> Self {
        Self { interface, gateway }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.interface.addr()
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.interface.netmask()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.interface.broadcast()
    }

    pub fn network(&self) -> Ipv4Net {
        self.interface.trunc()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterType {
    Wired,
    WirelessSta,
    WirelessAp,
}

/// A network adapter as reported by the platform backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    /// Platform identifier (interface name, GUID...)
    pub name: String,
    /// Human readable name
    pub title: String,
    #[serde(rename = "type")]
    pub kind: AdapterType,
}

impl NetworkAdapter {
    pub fn new(name: impl Into<String>, title: impl Into<String>, kind: AdapterType) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            kind,
        }
    }

    pub fn ensure_kind(&self, expected: AdapterType) -> Result<(), NetkitError> {
        if self.kind != expected {
            return Err(NetkitError::AdapterType {
                adapter: self.name.clone(),
                expected,
                actual: self.kind,
            });
        }
        Ok(())
    }

    pub fn ensure_wifi_sta(&self) -> Result<(), NetkitError> {
        self.ensure_kind(AdapterType::WirelessSta)
    }

    pub fn ensure_wifi_ap(&self) -> Result<(), NetkitError> {
        self.ensure_kind(AdapterType::WirelessAp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiAuth {
    SharedKey,
    WpaPsk,
    WpaEnt,
    Wpa2Psk,
    Wpa2Ent,
    Wpa3Psk,
    Wpa3Ent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiCipher {
    Wep,
    Tkip,
    Aes,
}

/// A Wi-Fi network, either found by a scan or requested by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    #[serde(default, skip_serializing)]
    pub password: Option<Vec<u8>>,
    #[serde(default)]
    pub auth: Option<WifiAuth>,
    #[serde(default)]
    pub cipher: Option<WifiCipher>,
    #[serde(default)]
    pub rssi: Option<f32>,
    #[serde(default)]
    pub ad_hoc: bool,
}

impl WifiNetwork {
    pub fn open(ssid: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: None,
            auth: None,
            cipher: None,
            rssi: None,
            ad_hoc: false,
        }
    }

    pub fn protected(&self) -> bool {
        self.auth.is_some() || self.cipher.is_some()
    }
}
