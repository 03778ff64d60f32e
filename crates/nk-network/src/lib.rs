//! Network adapter manager: enumerates adapters and drives their IPv4 addressing
//! through a platform [`AdapterBackend`].

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use nk_common::events::AdapterAddressesChangedEvent;
use nk_common::types::AdapterType;
use nk_common::NetworkAdapter;
use nk_runtime::{Field, Module, ModuleContext, ModuleError, ModuleHandle};
use tracing::{debug, info};

/// Virtual adapters hidden from listings by default
pub const DEFAULT_IGNORED: &[&str] = &[
    "VMware",
    "VirtualBox",
    "ISATAP",
    "Loopback",
    "Wintun",
    "Bluetooth",
];

/// Platform binding for adapter enumeration and addressing.
///
/// Called from the module's own thread only.
pub trait AdapterBackend: Send + 'static {
    fn list_adapters(&mut self) -> Result<Vec<NetworkAdapter>>;

    fn get_addresses(&mut self, adapter: &NetworkAdapter) -> Result<Vec<Ipv4Net>>;

    /// Replace the static addresses. An empty list switches the adapter to DHCP.
    fn set_addresses(&mut self, adapter: &NetworkAdapter, addresses: &[Ipv4Net]) -> Result<()>;
}

pub struct NetworkModule<B: AdapterBackend> {
    backend: B,
    /// Title substrings of adapters to hide
    ignored: Vec<String>,
}

impl<B: AdapterBackend> NetworkModule<B> {
    pub const IGNORED: Field<Self, Vec<String>> =
        Field::new("ignored", |m: &mut Self, ignored| m.ignored = ignored);

    pub fn new(backend: B) -> Self {
        Self {
            backend,
            ignored: DEFAULT_IGNORED.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn list_adapters(&mut self) -> Result<Vec<NetworkAdapter>> {
        let mut adapters = self
            .backend
            .list_adapters()
            .context("Failed to list network adapters")?;
        adapters.retain(|adapter| {
            !self
                .ignored
                .iter()
                .any(|s| adapter.title.contains(s.as_str()))
        });
        Ok(adapters)
    }

    pub fn get_adapter(&mut self, name: &str) -> Result<Option<NetworkAdapter>> {
        Ok(self.list_adapters()?.into_iter().find(|a| a.name == name))
    }

    /// First adapter of the given type
    pub fn adapter_by_type(&mut self, kind: AdapterType) -> Result<Option<NetworkAdapter>> {
        Ok(self.list_adapters()?.into_iter().find(|a| a.kind == kind))
    }

    pub fn get_addresses(&mut self, adapter: &NetworkAdapter) -> Result<Vec<Ipv4Net>> {
        self.backend
            .get_addresses(adapter)
            .with_context(|| format!("Failed to read addresses of '{}'", adapter.name))
    }

    pub fn set_addresses(
        &mut self,
        adapter: &NetworkAdapter,
        addresses: Vec<Ipv4Net>,
        ctx: &ModuleContext<Self>,
    ) -> Result<()> {
        if addresses.is_empty() {
            info!("Enabling DHCP address on '{}'", adapter.name);
        }
        for address in &addresses {
            info!("Setting static IP address {address} on '{}'", adapter.name);
        }
        self.backend
            .set_addresses(adapter, &addresses)
            .with_context(|| format!("Failed to set addresses of '{}'", adapter.name))?;
        ctx.publish(AdapterAddressesChangedEvent {
            adapter: adapter.name.clone(),
            addresses,
        });
        Ok(())
    }
}

impl<B: AdapterBackend> Module for NetworkModule<B> {
    type Io = ();

    async fn setup(&mut self, _ctx: &ModuleContext<Self>) -> Result<()> {
        let adapters = self.list_adapters()?;
        debug!("{} network adapters", adapters.len());
        Ok(())
    }
}

/// Network operations on a module handle, for the command layer.
pub trait NetworkControl {
    fn set_ignored(&self, ignored: Vec<String>) -> Result<(), ModuleError>;
    fn list_adapters(&self) -> Result<Vec<NetworkAdapter>, ModuleError>;
    fn get_adapter(&self, name: &str) -> Result<Option<NetworkAdapter>, ModuleError>;
    fn adapter_by_type(&self, kind: AdapterType) -> Result<Option<NetworkAdapter>, ModuleError>;
    fn get_addresses(&self, adapter: &NetworkAdapter) -> Result<Vec<Ipv4Net>, ModuleError>;
    fn set_addresses(
        &self,
        adapter: &NetworkAdapter,
        addresses: Vec<Ipv4Net>,
    ) -> Result<(), ModuleError>;
}

impl<B: AdapterBackend> NetworkControl for ModuleHandle<NetworkModule<B>> {
    fn set_ignored(&self, ignored: Vec<String>) -> Result<(), ModuleError> {
        self.set(NetworkModule::<B>::IGNORED, ignored)
    }

    fn list_adapters(&self) -> Result<Vec<NetworkAdapter>, ModuleError> {
        self.call_blocking(|m, _| Box::pin(async move { m.list_adapters() }))
    }

    fn get_adapter(&self, name: &str) -> Result<Option<NetworkAdapter>, ModuleError> {
        let name = name.to_string();
        self.call_blocking(move |m, _| Box::pin(async move { m.get_adapter(&name) }))
    }

    fn adapter_by_type(&self, kind: AdapterType) -> Result<Option<NetworkAdapter>, ModuleError> {
        self.call_blocking(move |m, _| Box::pin(async move { m.adapter_by_type(kind) }))
    }

    fn get_addresses(&self, adapter: &NetworkAdapter) -> Result<Vec<Ipv4Net>, ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, _| Box::pin(async move { m.get_addresses(&adapter) }))
    }

    fn set_addresses(
        &self,
        adapter: &NetworkAdapter,
        addresses: Vec<Ipv4Net>,
    ) -> Result<(), ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.set_addresses(&adapter, addresses, ctx) })
        })
    }
}
