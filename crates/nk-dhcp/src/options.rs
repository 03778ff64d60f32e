//! DHCP option catalogue (RFC 2132 and later assignments) and typed values.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const OPT_PAD: u8 = 0;
pub const OPT_END: u8 = 255;

/// Byte layout of an option's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Exactly one IPv4 address
    Address,
    /// One or more IPv4 addresses
    Addresses,
    /// 32-bit seconds
    Duration,
    /// UTF-8 string, trailing NULs stripped
    Text,
    U8,
    U16,
    I32,
    /// One byte, 0 or 1
    Bool,
    MessageType,
    /// List of option codes
    ParameterList,
    /// Opaque bytes
    Bytes,
}

macro_rules! option_catalogue {
    ($($variant:ident = $code:literal => $kind:ident),* $(,)?) => {
        /// Option code. Codes missing from the catalogue are kept as `Other`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OptionCode {
            $($variant,)*
            Other(u8),
        }

        impl OptionCode {
            pub fn from_code(code: u8) -> Self {
                match code {
                    $($code => OptionCode::$variant,)*
                    other => OptionCode::Other(other),
                }
            }

            pub fn code(self) -> u8 {
                match self {
                    $(OptionCode::$variant => $code,)*
                    OptionCode::Other(code) => code,
                }
            }

            pub fn kind(self) -> ValueKind {
                match self {
                    $(OptionCode::$variant => ValueKind::$kind,)*
                    OptionCode::Other(_) => ValueKind::Bytes,
                }
            }
        }
    };
}

option_catalogue! {
    SubnetMask = 1 => Address,
    TimeOffset = 2 => I32,
    Router = 3 => Addresses,
    TimeServers = 4 => Addresses,
    NameServers = 5 => Addresses,
    DnsServers = 6 => Addresses,
    LogServers = 7 => Addresses,
    CookieServers = 8 => Addresses,
    LprServers = 9 => Addresses,
    ImpressServers = 10 => Addresses,
    RlpServers = 11 => Addresses,
    HostName = 12 => Text,
    BootFileSize = 13 => U16,
    MeritDumpFile = 14 => Text,
    DomainName = 15 => Text,
    SwapServer = 16 => Address,
    RootPath = 17 => Text,
    ExtensionFile = 18 => Text,
    IpForwarding = 19 => Bool,
    SourceRouting = 20 => Bool,
    PolicyFilter = 21 => Addresses,
    MaxDatagramReassembly = 22 => U16,
    DefaultIpTtl = 23 => U8,
    PathMtuAgingTimeout = 24 => Duration,
    PathMtuPlateauTable = 25 => Bytes,
    InterfaceMtu = 26 => U16,
    AllSubnetsLocal = 27 => Bool,
    BroadcastAddress = 28 => Address,
    PerformMaskDiscovery = 29 => Bool,
    MaskSupplier = 30 => Bool,
    PerformRouterDiscovery = 31 => Bool,
    RouterSolicitationAddress = 32 => Address,
    StaticRoutes = 33 => Addresses,
    TrailerEncapsulation = 34 => Bool,
    ArpCacheTimeout = 35 => Duration,
    EthernetEncapsulation = 36 => Bool,
    DefaultTcpTtl = 37 => U8,
    TcpKeepaliveInterval = 38 => Duration,
    TcpKeepaliveGarbage = 39 => Bool,
    NisDomainName = 40 => Text,
    NisServers = 41 => Addresses,
    NtpServers = 42 => Addresses,
    VendorSpecific = 43 => Bytes,
    NetbiosNameServers = 44 => Addresses,
    NetbiosDatagramDistribution = 45 => Addresses,
    NetbiosNodeType = 46 => U8,
    NetbiosScope = 47 => Text,
    XWindowFontServers = 48 => Addresses,
    XWindowDisplayManagers = 49 => Addresses,
    RequestedIpAddress = 50 => Address,
    IpAddressLeaseTime = 51 => Duration,
    OptionOverload = 52 => U8,
    MessageType = 53 => MessageType,
    ServerIdentifier = 54 => Address,
    ParameterRequestList = 55 => ParameterList,
    Message = 56 => Text,
    MaximumMessageSize = 57 => U16,
    RenewTimeValue = 58 => Duration,
    RebindingTimeValue = 59 => Duration,
    VendorClassIdentifier = 60 => Text,
    ClientIdentifier = 61 => Bytes,
    NetwareIpDomainName = 62 => Text,
    NetwareIpSubOptions = 63 => Bytes,
    NisPlusDomainName = 64 => Text,
    NisPlusServers = 65 => Addresses,
    TftpServerName = 66 => Text,
    BootFileName = 67 => Text,
    HomeAgentAddresses = 68 => Bytes,
    SmtpServers = 69 => Addresses,
    Pop3Servers = 70 => Addresses,
    NntpServers = 71 => Addresses,
    WwwServers = 72 => Addresses,
    FingerServers = 73 => Addresses,
    IrcServers = 74 => Addresses,
    StreetTalkServers = 75 => Addresses,
    StreetTalkDirectoryAssistance = 76 => Addresses,
    UserClass = 77 => Bytes,
    SlpDirectoryAgent = 78 => Bytes,
    SlpServiceScope = 79 => Bytes,
    RapidCommit = 80 => Bytes,
    Fqdn = 81 => Bytes,
    RelayAgentInformation = 82 => Bytes,
    Isns = 83 => Bytes,
    NdsServers = 85 => Addresses,
    NdsTreeName = 86 => Text,
    NdsContext = 87 => Text,
    BcmcsDomainList = 88 => Bytes,
    BcmcsAddressList = 89 => Addresses,
    Authentication = 90 => Bytes,
    ClientSystem = 93 => Bytes,
    ClientNetworkInterface = 94 => Bytes,
    LdapUse = 95 => Bytes,
    UuidClientIdentifier = 97 => Bytes,
    OpenGroupUserAuthentication = 98 => Text,
    Ipv6OnlyPreferred = 108 => Duration,
    CaptivePortal = 114 => Text,
    DomainSearch = 119 => Bytes,
    ClasslessStaticRoute = 121 => Bytes,
    Private = 224 => Bytes,
    PrivateClasslessStaticRoute = 249 => Bytes,
    PrivateProxyAutodiscovery = 252 => Bytes,
}

impl OptionCode {
    /// Site-specific range (RFC 2132 §2), always passed through opaque
    pub fn is_private(self) -> bool {
        (224..=254).contains(&self.code())
    }
}

impl fmt::Display for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionCode::Other(code) => write!(f, "Option{code}"),
            known => write!(f, "{known:?}({})", known.code()),
        }
    }
}

impl From<u8> for OptionCode {
    fn from(code: u8) -> Self {
        OptionCode::from_code(code)
    }
}

/// DHCP message type (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    ForceRenew,
    LeaseQuery,
    LeaseUnassigned,
    LeaseUnknown,
    LeaseActive,
    BulkLeaseQuery,
    LeaseQueryDone,
    ActiveLeaseQuery,
    LeaseQueryStatus,
    Tls,
    Unknown(u8),
}

impl DhcpMessageType {
    const KNOWN: [DhcpMessageType; 18] = [
        DhcpMessageType::Discover,
        DhcpMessageType::Offer,
        DhcpMessageType::Request,
        DhcpMessageType::Decline,
        DhcpMessageType::Ack,
        DhcpMessageType::Nak,
        DhcpMessageType::Release,
        DhcpMessageType::Inform,
        DhcpMessageType::ForceRenew,
        DhcpMessageType::LeaseQuery,
        DhcpMessageType::LeaseUnassigned,
        DhcpMessageType::LeaseUnknown,
        DhcpMessageType::LeaseActive,
        DhcpMessageType::BulkLeaseQuery,
        DhcpMessageType::LeaseQueryDone,
        DhcpMessageType::ActiveLeaseQuery,
        DhcpMessageType::LeaseQueryStatus,
        DhcpMessageType::Tls,
    ];

    pub fn from_code(code: u8) -> Self {
        match code {
            1..=18 => Self::KNOWN[usize::from(code) - 1],
            other => DhcpMessageType::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DhcpMessageType::Unknown(code) => code,
            known => Self::KNOWN
                .iter()
                .position(|t| *t == known)
                .map_or(0, |i| i as u8 + 1),
        }
    }
}

impl fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpMessageType::Unknown(code) => write!(f, "UNKNOWN({code})"),
            known => write!(f, "{}", format!("{known:?}").to_uppercase()),
        }
    }
}

/// Decoded value of one option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOptionValue {
    Address(Ipv4Addr),
    Addresses(Vec<Ipv4Addr>),
    Duration(Duration),
    Text(String),
    U8(u8),
    U16(u16),
    I32(i32),
    Bool(bool),
    MessageType(DhcpMessageType),
    ParameterList(Vec<OptionCode>),
    Bytes(Vec<u8>),
}

impl DhcpOptionValue {
    /// Normalize the value for an option of the given kind.
    ///
    /// Returns `None` when the value cannot be stored under that kind.
    /// Opaque bytes fit every kind.
    pub fn coerce(self, kind: ValueKind) -> Option<Self> {
        use DhcpOptionValue as V;
        match (kind, self) {
            (ValueKind::Addresses, V::Address(a)) => Some(V::Addresses(vec![a])),
            (ValueKind::Addresses, V::Addresses(list)) if list.is_empty() => None,
            (_, value @ V::Bytes(_)) => Some(value),
            (ValueKind::Address, value @ V::Address(_))
            | (ValueKind::Addresses, value @ V::Addresses(_))
            | (ValueKind::Duration, value @ V::Duration(_))
            | (ValueKind::Text, value @ V::Text(_))
            | (ValueKind::U8, value @ V::U8(_))
            | (ValueKind::U16, value @ V::U16(_))
            | (ValueKind::I32, value @ V::I32(_))
            | (ValueKind::Bool, value @ V::Bool(_))
            | (ValueKind::MessageType, value @ V::MessageType(_))
            | (ValueKind::ParameterList, value @ V::ParameterList(_)) => Some(value),
            _ => None,
        }
    }

    /// Parse raw option data according to `kind`. `None` if the data does not fit.
    pub fn decode(kind: ValueKind, data: &[u8]) -> Option<Self> {
        use DhcpOptionValue as V;
        let value = match kind {
            ValueKind::Address => V::Address(Ipv4Addr::from(<[u8; 4]>::try_from(data).ok()?)),
            ValueKind::Addresses => {
                if data.is_empty() || data.len() % 4 != 0 {
                    return None;
                }
                V::Addresses(
                    data.chunks_exact(4)
                        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                        .collect(),
                )
            }
            ValueKind::Duration => V::Duration(Duration::from_secs(u64::from(u32::from_be_bytes(
                data.try_into().ok()?,
            )))),
            ValueKind::Text => {
                let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                match std::str::from_utf8(&data[..end]) {
                    Ok(text) => V::Text(text.to_string()),
                    Err(_) => V::Bytes(data.to_vec()),
                }
            }
            ValueKind::U8 => match data {
                [v] => V::U8(*v),
                _ => return None,
            },
            ValueKind::U16 => V::U16(u16::from_be_bytes(data.try_into().ok()?)),
            ValueKind::I32 => V::I32(i32::from_be_bytes(data.try_into().ok()?)),
            ValueKind::Bool => match data {
                [0] => V::Bool(false),
                [1] => V::Bool(true),
                _ => return None,
            },
            ValueKind::MessageType => match data {
                [v] => V::MessageType(DhcpMessageType::from_code(*v)),
                _ => return None,
            },
            ValueKind::ParameterList => {
                V::ParameterList(data.iter().map(|c| OptionCode::from_code(*c)).collect())
            }
            ValueKind::Bytes => V::Bytes(data.to_vec()),
        };
        Some(value)
    }

    pub fn encode(&self) -> Vec<u8> {
        use DhcpOptionValue as V;
        match self {
            V::Address(a) => a.octets().to_vec(),
            V::Addresses(list) => list.iter().flat_map(|a| a.octets()).collect(),
            V::Duration(d) => u32::try_from(d.as_secs())
                .unwrap_or(u32::MAX)
                .to_be_bytes()
                .to_vec(),
            V::Text(text) => text.as_bytes().to_vec(),
            V::U8(v) => vec![*v],
            V::U16(v) => v.to_be_bytes().to_vec(),
            V::I32(v) => v.to_be_bytes().to_vec(),
            V::Bool(v) => vec![u8::from(*v)],
            V::MessageType(t) => vec![t.code()],
            V::ParameterList(codes) => codes.iter().map(|c| c.code()).collect(),
            V::Bytes(bytes) => bytes.clone(),
        }
    }
}

impl From<Ipv4Addr> for DhcpOptionValue {
    fn from(value: Ipv4Addr) -> Self {
        DhcpOptionValue::Address(value)
    }
}

impl From<Vec<Ipv4Addr>> for DhcpOptionValue {
    fn from(value: Vec<Ipv4Addr>) -> Self {
        DhcpOptionValue::Addresses(value)
    }
}

impl From<Duration> for DhcpOptionValue {
    fn from(value: Duration) -> Self {
        DhcpOptionValue::Duration(value)
    }
}

impl From<&str> for DhcpOptionValue {
    fn from(value: &str) -> Self {
        DhcpOptionValue::Text(value.to_string())
    }
}

impl From<String> for DhcpOptionValue {
    fn from(value: String) -> Self {
        DhcpOptionValue::Text(value)
    }
}

impl From<u8> for DhcpOptionValue {
    fn from(value: u8) -> Self {
        DhcpOptionValue::U8(value)
    }
}

impl From<u16> for DhcpOptionValue {
    fn from(value: u16) -> Self {
        DhcpOptionValue::U16(value)
    }
}

impl From<i32> for DhcpOptionValue {
    fn from(value: i32) -> Self {
        DhcpOptionValue::I32(value)
    }
}

impl From<bool> for DhcpOptionValue {
    fn from(value: bool) -> Self {
        DhcpOptionValue::Bool(value)
    }
}

impl From<DhcpMessageType> for DhcpOptionValue {
    fn from(value: DhcpMessageType) -> Self {
        DhcpOptionValue::MessageType(value)
    }
}

impl From<Vec<OptionCode>> for DhcpOptionValue {
    fn from(value: Vec<OptionCode>) -> Self {
        DhcpOptionValue::ParameterList(value)
    }
}
