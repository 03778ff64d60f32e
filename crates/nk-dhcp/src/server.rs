use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use nk_common::{Ip4Config, MacAddr};
use nk_runtime::{Field, Module, ModuleContext, ModuleError, ModuleHandle};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info, trace, warn};

use crate::lease_store::{Lease, LeaseTable};
use crate::packet::DhcpPacket;
use crate::state_machine::{self, ServeError, ServerSettings};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;
const RECV_BUFFER: usize = 4096;

/// DHCP server module.
///
/// `address`, `port` and `reply_to` are locked while running; the rest of
/// the configuration may change at any time.
pub struct DhcpModule {
    address: Ipv4Addr,
    port: u16,
    /// Where replies go, the limited broadcast address on a real network
    reply_to: SocketAddr,
    settings: ServerSettings,
    leases: LeaseTable,
    socket: Option<UdpSocket>,
    buf: Box<[u8; RECV_BUFFER]>,
}

impl Default for DhcpModule {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: SERVER_PORT,
            reply_to: SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT).into(),
            settings: ServerSettings {
                hostname: Some("netkit".to_string()),
                ..Default::default()
            },
            leases: LeaseTable::new(),
            socket: None,
            buf: Box::new([0; RECV_BUFFER]),
        }
    }
}

impl DhcpModule {
    pub const ADDRESS: Field<Self, Ipv4Addr> =
        Field::new("address", |m: &mut Self, address| m.address = address);
    pub const PORT: Field<Self, u16> = Field::new("port", |m: &mut Self, port| m.port = port);
    pub const REPLY_TO: Field<Self, SocketAddr> =
        Field::new("reply_to", |m: &mut Self, reply_to| m.reply_to = reply_to);
    pub const IPCONFIG: Field<Self, Option<Ip4Config>> =
        Field::new("ipconfig", |m: &mut Self, ipconfig| m.settings.ipconfig = ipconfig);
    pub const RANGE: Field<Self, Option<(Ipv4Addr, Ipv4Addr)>> =
        Field::new("range", |m: &mut Self, range| m.settings.range = range);
    pub const DNS: Field<Self, Option<Ipv4Addr>> =
        Field::new("dns", |m: &mut Self, dns| m.settings.dns = dns);
    pub const HOSTNAME: Field<Self, Option<String>> =
        Field::new("hostname", |m: &mut Self, hostname| m.settings.hostname = hostname);
    pub const HOSTS: Field<Self, HashMap<MacAddr, Ipv4Addr>> =
        Field::new("hosts", |m: &mut Self, hosts| m.leases.set_static_hosts(hosts));

    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn bind(&self) -> Result<UdpSocket> {
        // socket2 for SO_BROADCAST before bind
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        let addr = SocketAddr::from((self.address, self.port));
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind DHCP server to {addr}"))?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn serve(&mut self, data: &[u8], src: SocketAddr, ctx: &ModuleContext<Self>) {
        let request = match DhcpPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Invalid DHCP packet from {src}: {e}");
                return;
            }
        };

        let served = match state_machine::handle_request(&request, &self.settings, &mut self.leases)
        {
            Ok(served) => served,
            Err(ServeError::NotRequest) => return,
            Err(
                e @ (ServeError::NoIpConfig | ServeError::NoRange | ServeError::Lease(_)),
            ) => {
                error!("{e}");
                return;
            }
            Err(e) => {
                warn!("{e}");
                return;
            }
        };

        let Some(socket) = &self.socket else {
            return;
        };
        if let Err(e) = socket.send_to(&served.reply.encode(), self.reply_to).await {
            warn!("Failed to send DHCP response to {}: {e}", self.reply_to);
            return;
        }

        if let Some(lease) = served.lease {
            ctx.publish(lease);
        }
    }
}

impl Module for DhcpModule {
    type Io = (usize, SocketAddr);

    const PRE_RUN_CONFIG: &'static [&'static str] =
        &[Self::ADDRESS.name(), Self::PORT.name(), Self::REPLY_TO.name()];

    async fn setup(&mut self, _ctx: &ModuleContext<Self>) -> Result<()> {
        info!("Starting DHCP server on {}:{}", self.address, self.port);
        self.socket = Some(self.bind()?);
        Ok(())
    }

    async fn poll_io(&mut self) -> Result<(usize, SocketAddr)> {
        let Some(socket) = &self.socket else {
            anyhow::bail!("DHCP socket is closed");
        };
        loop {
            match socket.recv_from(&mut self.buf[..]).await {
                Ok(received) => return Ok(received),
                Err(e) => warn!("DHCP recv error: {e}"),
            }
        }
    }

    async fn on_io(&mut self, (len, src): (usize, SocketAddr), ctx: &ModuleContext<Self>) -> Result<()> {
        trace!("{len} bytes from {src}");
        let data = self.buf[..len].to_vec();
        self.serve(&data, src, ctx).await;
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.socket = None;
        self.leases.clear();
    }
}

/// DHCP operations on a module handle, for the command layer.
pub trait DhcpControl {
    fn set_address(&self, address: Ipv4Addr) -> Result<(), ModuleError>;
    fn set_port(&self, port: u16) -> Result<(), ModuleError>;
    fn set_reply_to(&self, reply_to: SocketAddr) -> Result<(), ModuleError>;
    fn set_ipconfig(&self, ipconfig: Option<Ip4Config>) -> Result<(), ModuleError>;
    fn set_range(&self, range: Option<(Ipv4Addr, Ipv4Addr)>) -> Result<(), ModuleError>;
    fn set_dns(&self, dns: Option<Ipv4Addr>) -> Result<(), ModuleError>;
    fn set_hostname(&self, hostname: Option<String>) -> Result<(), ModuleError>;
    fn set_static_hosts(&self, hosts: HashMap<MacAddr, Ipv4Addr>) -> Result<(), ModuleError>;
    /// Bound address of the running server
    fn local_addr(&self) -> Result<SocketAddr, ModuleError>;
    /// Current lease table, reservations included
    fn leases(&self) -> Result<Vec<Lease>, ModuleError>;
}

impl DhcpControl for ModuleHandle<DhcpModule> {
    fn set_address(&self, address: Ipv4Addr) -> Result<(), ModuleError> {
        self.set(DhcpModule::ADDRESS, address)
    }

    fn set_port(&self, port: u16) -> Result<(), ModuleError> {
        self.set(DhcpModule::PORT, port)
    }

    fn set_reply_to(&self, reply_to: SocketAddr) -> Result<(), ModuleError> {
        self.set(DhcpModule::REPLY_TO, reply_to)
    }

    fn set_ipconfig(&self, ipconfig: Option<Ip4Config>) -> Result<(), ModuleError> {
        self.set(DhcpModule::IPCONFIG, ipconfig)
    }

    fn set_range(&self, range: Option<(Ipv4Addr, Ipv4Addr)>) -> Result<(), ModuleError> {
        self.set(DhcpModule::RANGE, range)
    }

    fn set_dns(&self, dns: Option<Ipv4Addr>) -> Result<(), ModuleError> {
        self.set(DhcpModule::DNS, dns)
    }

    fn set_hostname(&self, hostname: Option<String>) -> Result<(), ModuleError> {
        self.set(DhcpModule::HOSTNAME, hostname)
    }

    fn set_static_hosts(&self, hosts: HashMap<MacAddr, Ipv4Addr>) -> Result<(), ModuleError> {
        self.set(DhcpModule::HOSTS, hosts)
    }

    fn local_addr(&self) -> Result<SocketAddr, ModuleError> {
        self.call_blocking(|m, _| {
            Box::pin(async move {
                let socket = m.socket.as_ref().context("DHCP socket is closed")?;
                Ok(socket.local_addr()?)
            })
        })
    }

    fn leases(&self) -> Result<Vec<Lease>, ModuleError> {
        match self.inspect(|m| m.leases.leases()) {
            Ok(leases) => Ok(leases),
            Err(ModuleError::AlreadyRunning { .. }) => {
                self.call_blocking(|m, _| Box::pin(async move { Ok(m.leases.leases()) }))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nk_common::EventBus;
    use std::sync::Arc;

    fn handle() -> ModuleHandle<DhcpModule> {
        ModuleHandle::new("dhcp", DhcpModule::new(), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_defaults() {
        let handle = handle();
        let (address, port, reply_to) = handle
            .inspect(|m| (m.address, m.port, m.reply_to))
            .unwrap();
        assert_eq!(address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(port, 67);
        assert_eq!(reply_to, "255.255.255.255:68".parse().unwrap());
        assert_eq!(
            handle.inspect(|m| m.settings().hostname.clone()).unwrap(),
            Some("netkit".to_string())
        );
    }

    #[test]
    fn test_pre_run_fields_locked() {
        let handle = handle();
        handle.set_address(Ipv4Addr::LOCALHOST).unwrap();
        handle.set_port(0).unwrap();
        handle.start().unwrap();

        assert!(matches!(
            handle.set_port(6767),
            Err(ModuleError::ConfigState { field: "port", .. })
        ));
        assert!(matches!(
            handle.set_address(Ipv4Addr::UNSPECIFIED),
            Err(ModuleError::ConfigState { field: "address", .. })
        ));
        assert!(matches!(
            handle.set_reply_to("127.0.0.1:68".parse().unwrap()),
            Err(ModuleError::ConfigState { field: "reply_to", .. })
        ));
        // Runtime fields can change
        handle.set_dns(Some(Ipv4Addr::new(1, 1, 1, 1))).unwrap();
        handle.set_range(None).unwrap();

        let addr = handle.local_addr().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);

        handle.stop().unwrap();
        handle.set_port(6767).unwrap();
        assert!(matches!(handle.local_addr(), Err(ModuleError::NotRunning { .. })));
    }

    #[test]
    fn test_bind_failure_fails_start() {
        let handle = handle();
        // Not a local address
        handle.set_address(Ipv4Addr::new(192, 0, 2, 1)).unwrap();
        handle.set_port(0).unwrap();
        let err = handle.start().unwrap_err();
        assert!(matches!(err, ModuleError::Setup { .. }));
        assert!(!handle.is_running());
    }
}
