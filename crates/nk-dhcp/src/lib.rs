//! DHCPv4 server: wire codec, lease table and the `DhcpModule` runtime module.

pub mod config;
pub mod lease_store;
pub mod options;
pub mod packet;
pub mod server;
pub mod state_machine;

pub use config::{DhcpConfig, StaticHost};
pub use lease_store::{Lease, LeaseError, LeaseTable};
pub use options::{DhcpMessageType, DhcpOptionValue, OptionCode};
pub use packet::{DecodeError, DhcpPacket, DhcpPacketType};
pub use server::{DhcpControl, DhcpModule};
pub use state_machine::{ServeError, ServerSettings};
