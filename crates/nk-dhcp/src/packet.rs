//! DHCPv4 packet parser/serializer (RFC 2131)

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use nk_common::MacAddr;
use thiserror::Error;

use crate::options::{
    DhcpMessageType, DhcpOptionValue, OPT_END, OPT_PAD, OptionCode, ValueKind,
};

/// DHCP magic cookie
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const HEADER_LEN: usize = 236;
const OPTIONS_OFFSET: usize = HEADER_LEN + MAGIC_COOKIE.len();
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;
/// Minimum BOOTP message size
const MIN_PACKET_LEN: usize = 300;

pub const FLAG_BROADCAST: u16 = 1 << 15;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Packet too short: {0} bytes (minimum 240)")]
    TooShort(usize),
    #[error("Invalid magic cookie")]
    InvalidMagic,
    #[error("Invalid BOOTP operation {0}")]
    PacketType(u8),
    #[error("Invalid hardware address length {0}")]
    HardwareLen(u8),
    #[error("Option {code} at offset {offset}: length byte missing")]
    MissingLength { code: u8, offset: usize },
    #[error("Option {code} at offset {offset}: {len} bytes announced, {available} available")]
    Truncated {
        code: u8,
        offset: usize,
        len: usize,
        available: usize,
    },
    #[error("Option {code} at offset {offset}: {len} bytes is not a valid {kind:?} value")]
    InvalidValue {
        code: u8,
        offset: usize,
        kind: ValueKind,
        len: usize,
    },
}

/// BOOTP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpPacketType {
    BootRequest = 1,
    BootReply = 2,
}

/// Parsed DHCPv4 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub packet_type: DhcpPacketType,
    pub hardware_type: u8,
    pub hardware_len: u8,
    pub hops: u8,
    pub transaction_id: u32,
    pub seconds: u16,
    pub flags: u16,
    pub client_ip: Ipv4Addr,
    pub your_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub client_mac: MacAddr,
    pub server_host_name: String,
    pub boot_file: String,
    /// Keyed by code, values already checked against the code's kind
    options: BTreeMap<u8, DhcpOptionValue>,
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

/// NUL-terminated header string (sname, file)
fn cstr(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn put_cstr(buf: &mut Vec<u8>, value: &str, len: usize) {
    // Keep room for the terminating NUL
    let bytes = &value.as_bytes()[..value.len().min(len - 1)];
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + len - bytes.len(), 0);
}

impl DhcpPacket {
    /// Empty BOOTREQUEST from `client_mac`, for clients and tests.
    pub fn request(client_mac: MacAddr, transaction_id: u32, message_type: DhcpMessageType) -> Self {
        let mut packet = DhcpPacket {
            packet_type: DhcpPacketType::BootRequest,
            hardware_type: 1,
            hardware_len: 6,
            hops: 0,
            transaction_id,
            seconds: 0,
            flags: 0,
            client_ip: Ipv4Addr::UNSPECIFIED,
            your_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: Ipv4Addr::UNSPECIFIED,
            gateway_ip: Ipv4Addr::UNSPECIFIED,
            client_mac,
            server_host_name: String::new(),
            boot_file: String::new(),
            options: BTreeMap::new(),
        };
        packet.set(OptionCode::MessageType, message_type);
        packet
    }

    /// Parse a DHCP packet from raw bytes
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < OPTIONS_OFFSET {
            return Err(DecodeError::TooShort(data.len()));
        }
        if data[HEADER_LEN..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(DecodeError::InvalidMagic);
        }

        let packet_type = match data[0] {
            1 => DhcpPacketType::BootRequest,
            2 => DhcpPacketType::BootReply,
            other => return Err(DecodeError::PacketType(other)),
        };
        let hardware_len = data[2];
        if hardware_len > 16 {
            return Err(DecodeError::HardwareLen(hardware_len));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[28..34]);

        Ok(DhcpPacket {
            packet_type,
            hardware_type: data[1],
            hardware_len,
            hops: data[3],
            transaction_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            seconds: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            client_ip: ipv4_at(data, 12),
            your_ip: ipv4_at(data, 16),
            server_ip: ipv4_at(data, 20),
            gateway_ip: ipv4_at(data, 24),
            client_mac: MacAddr(mac),
            server_host_name: cstr(&data[44..44 + SNAME_LEN]),
            boot_file: cstr(&data[108..108 + FILE_LEN]),
            options: decode_options(data, OPTIONS_OFFSET)?,
        })
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(576);

        buf.push(self.packet_type as u8);
        buf.push(self.hardware_type);
        buf.push(self.hardware_len);
        buf.push(self.hops);
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&self.seconds.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.client_ip.octets());
        buf.extend_from_slice(&self.your_ip.octets());
        buf.extend_from_slice(&self.server_ip.octets());
        buf.extend_from_slice(&self.gateway_ip.octets());
        buf.extend_from_slice(&self.client_mac.octets());
        buf.extend_from_slice(&[0u8; 10]);
        put_cstr(&mut buf, &self.server_host_name, SNAME_LEN);
        put_cstr(&mut buf, &self.boot_file, FILE_LEN);
        buf.extend_from_slice(&MAGIC_COOKIE);

        // Message type first, as clients expect
        let message_type = OptionCode::MessageType.code();
        if let Some(value) = self.options.get(&message_type) {
            encode_option(&mut buf, message_type, &value.encode());
        }
        for (code, value) in &self.options {
            if *code != message_type {
                encode_option(&mut buf, *code, &value.encode());
            }
        }
        buf.push(OPT_END);

        if buf.len() < MIN_PACKET_LEN {
            buf.resize(MIN_PACKET_LEN, OPT_PAD);
        }
        buf
    }

    pub fn get(&self, code: OptionCode) -> Option<&DhcpOptionValue> {
        self.options.get(&code.code())
    }

    pub fn contains(&self, code: OptionCode) -> bool {
        self.options.contains_key(&code.code())
    }

    /// Set an option, replacing any previous value.
    ///
    /// # Panics
    ///
    /// If the value's type does not match the option's declared layout.
    pub fn set(&mut self, code: OptionCode, value: impl Into<DhcpOptionValue>) {
        let value = value.into();
        let Some(value) = value.clone().coerce(code.kind()) else {
            panic!(
                "{code} holds {:?} values, got {value:?}",
                code.kind()
            );
        };
        self.options.insert(code.code(), value);
    }

    pub fn remove(&mut self, code: OptionCode) -> Option<DhcpOptionValue> {
        self.options.remove(&code.code())
    }

    pub fn clear_options(&mut self) {
        self.options.clear();
    }

    pub fn options(&self) -> impl Iterator<Item = (OptionCode, &DhcpOptionValue)> {
        self.options
            .iter()
            .map(|(code, value)| (OptionCode::from_code(*code), value))
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        match self.get(OptionCode::MessageType)? {
            DhcpOptionValue::MessageType(t) => Some(*t),
            _ => None,
        }
    }

    fn text(&self, code: OptionCode) -> Option<&str> {
        match self.get(code)? {
            DhcpOptionValue::Text(text) => Some(text),
            _ => None,
        }
    }

    fn address(&self, code: OptionCode) -> Option<Ipv4Addr> {
        match self.get(code)? {
            DhcpOptionValue::Address(address) => Some(*address),
            _ => None,
        }
    }

    pub fn host_name(&self) -> Option<&str> {
        self.text(OptionCode::HostName)
    }

    pub fn vendor_class(&self) -> Option<&str> {
        self.text(OptionCode::VendorClassIdentifier)
    }

    pub fn requested_address(&self) -> Option<Ipv4Addr> {
        self.address(OptionCode::RequestedIpAddress)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.address(OptionCode::ServerIdentifier)
    }

    pub fn parameter_list(&self) -> Option<&[OptionCode]> {
        match self.get(OptionCode::ParameterRequestList)? {
            DhcpOptionValue::ParameterList(codes) => Some(codes),
            _ => None,
        }
    }

    /// Check if broadcast flag is set
    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }
}

/// Long values are split over consecutive instances of the code (RFC 3396)
fn encode_option(buf: &mut Vec<u8>, code: u8, data: &[u8]) {
    if data.is_empty() {
        buf.extend_from_slice(&[code, 0]);
        return;
    }
    for chunk in data.chunks(usize::from(u8::MAX)) {
        buf.push(code);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}

fn decode_options(
    data: &[u8],
    start: usize,
) -> Result<BTreeMap<u8, DhcpOptionValue>, DecodeError> {
    // code -> (offset of first instance, concatenated data)
    let mut raw: BTreeMap<u8, (usize, Vec<u8>)> = BTreeMap::new();
    let mut i = start;

    while i < data.len() {
        let code = data[i];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }
        let offset = i;
        let Some(&len) = data.get(i + 1) else {
            return Err(DecodeError::MissingLength { code, offset });
        };
        let len = usize::from(len);
        let value_start = i + 2;
        let available = data.len() - value_start;
        if len > available {
            return Err(DecodeError::Truncated {
                code,
                offset,
                len,
                available,
            });
        }
        raw.entry(code)
            .or_insert_with(|| (offset, Vec::new()))
            .1
            .extend_from_slice(&data[value_start..value_start + len]);
        i = value_start + len;
    }

    raw.into_iter()
        .map(|(code, (offset, bytes))| {
            let kind = OptionCode::from_code(code).kind();
            DhcpOptionValue::decode(kind, &bytes)
                .map(|value| (code, value))
                .ok_or(DecodeError::InvalidValue {
                    code,
                    offset,
                    kind,
                    len: bytes.len(),
                })
        })
        .collect()
}
