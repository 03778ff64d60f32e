pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use events::{Event, EventBus, EventKind};
pub use types::{Ip4Config, MacAddr, NetworkAdapter, WifiNetwork};
