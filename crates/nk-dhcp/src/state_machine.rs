use std::net::Ipv4Addr;
use std::time::Duration;

use nk_common::Ip4Config;
use nk_common::events::DhcpLeaseEvent;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::lease_store::{LeaseError, LeaseTable};
use crate::options::{DhcpMessageType, OptionCode};
use crate::packet::{DhcpPacket, DhcpPacketType};

const LEASE_TIME: Duration = Duration::from_secs(7 * 24 * 3600);
const RENEW_TIME: Duration = Duration::from_secs(12 * 3600);
const REBINDING_TIME: Duration = Duration::from_secs(7 * 24 * 3600);
const INTERFACE_MTU: u16 = 1500;
/// H-node (hybrid)
const NETBIOS_NODE_TYPE: u8 = 8;
const DOMAIN_NAME: &str = "local";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServeError {
    #[error("Not a BOOTREQUEST")]
    NotRequest,
    #[error("Request without a message type")]
    MissingMessageType,
    #[error("Unhandled message type: {0}")]
    Unhandled(DhcpMessageType),
    #[error("Cannot serve DHCP request - no IP config set")]
    NoIpConfig,
    #[error("Cannot serve DHCP request - no lease address range set")]
    NoRange,
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Runtime settings of a DHCP server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSettings {
    pub ipconfig: Option<Ip4Config>,
    /// Inclusive lease range
    pub range: Option<(Ipv4Addr, Ipv4Addr)>,
    pub dns: Option<Ipv4Addr>,
    /// Written to the reply's `sname` field
    pub hostname: Option<String>,
}

/// Outcome of a served request.
#[derive(Debug, Clone)]
pub struct Served {
    pub reply: DhcpPacket,
    /// Set for REQUEST and INFORM
    pub lease: Option<DhcpLeaseEvent>,
    /// Requested parameters the reply does not carry
    pub unpopulated: Vec<OptionCode>,
}

/// Handle an incoming DHCP packet and produce the reply.
pub fn handle_request(
    request: &DhcpPacket,
    settings: &ServerSettings,
    leases: &mut LeaseTable,
) -> Result<Served, ServeError> {
    if request.packet_type != DhcpPacketType::BootRequest {
        return Err(ServeError::NotRequest);
    }
    let message_type = request
        .message_type()
        .ok_or(ServeError::MissingMessageType)?;
    if !matches!(
        message_type,
        DhcpMessageType::Discover | DhcpMessageType::Request | DhcpMessageType::Inform
    ) {
        return Err(ServeError::Unhandled(message_type));
    }

    let ipconfig = settings.ipconfig.ok_or(ServeError::NoIpConfig)?;
    let (start, end) = settings.range.ok_or(ServeError::NoRange)?;

    let client = request.client_mac;
    let host_name = request.host_name().map(str::to_string);
    let vendor_cid = request.vendor_class().map(str::to_string);
    trace!(
        "Got BOOT_REQUEST({message_type}) from {client} (host_name={host_name:?}, vendor_cid={vendor_cid:?})"
    );

    let address = leases.allocate(client, start, end)?;

    let mut reply = request.clone();
    reply.packet_type = DhcpPacketType::BootReply;
    reply.your_ip = address;
    reply.server_ip = ipconfig.address();
    if let Some(hostname) = &settings.hostname {
        reply.server_host_name = hostname.clone();
    }
    reply.clear_options();

    let (action, reply_type) = match message_type {
        DhcpMessageType::Discover => ("Offering", DhcpMessageType::Offer),
        _ => ("ACK-ing", DhcpMessageType::Ack),
    };
    reply.set(OptionCode::MessageType, reply_type);
    reply.set(OptionCode::SubnetMask, ipconfig.netmask());
    reply.set(
        OptionCode::Router,
        ipconfig.gateway.unwrap_or(ipconfig.address()),
    );
    if let Some(dns) = settings.dns {
        reply.set(OptionCode::DnsServers, dns);
        reply.set(OptionCode::DomainName, DOMAIN_NAME);
    }
    reply.set(OptionCode::InterfaceMtu, INTERFACE_MTU);
    reply.set(OptionCode::BroadcastAddress, ipconfig.broadcast());
    reply.set(OptionCode::NetbiosNodeType, NETBIOS_NODE_TYPE);
    reply.set(OptionCode::IpAddressLeaseTime, LEASE_TIME);
    reply.set(OptionCode::ServerIdentifier, ipconfig.address());
    reply.set(OptionCode::RenewTimeValue, RENEW_TIME);
    reply.set(OptionCode::RebindingTimeValue, REBINDING_TIME);

    let unpopulated: Vec<OptionCode> = request
        .parameter_list()
        .unwrap_or_default()
        .iter()
        .filter(|code| !reply.contains(**code))
        .copied()
        .collect();
    for code in &unpopulated {
        warn!("Requested DHCP option {code} not populated");
    }

    debug!(
        "{action} {address} to {client} ({})",
        host_name.as_deref().unwrap_or("-")
    );

    let lease = (message_type != DhcpMessageType::Discover).then(|| DhcpLeaseEvent {
        client,
        address,
        host_name,
        vendor_cid,
    });

    Ok(Served {
        reply,
        lease,
        unpopulated,
    })
}
