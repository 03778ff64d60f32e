//! Wi-Fi station and access point control over a platform [`WifiBackend`].

pub mod backend;
pub mod module;

pub use backend::{WifiBackend, WifiNotification};
pub use module::{WifiControl, WifiModule};
