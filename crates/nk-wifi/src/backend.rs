use std::collections::HashSet;

use anyhow::Result;
use nk_common::{MacAddr, NetworkAdapter, WifiNetwork};
use tokio::sync::mpsc;

/// Asynchronous notification raised by the platform Wi-Fi service.
#[derive(Debug, Clone, PartialEq)]
pub enum WifiNotification {
    ScanComplete { networks: Vec<WifiNetwork> },
    Connected { ssid: String },
    Disconnected { ssid: String },
    ApStarted,
    ApStopped,
    /// The access point peer list changed, query it again
    ApPeersChanged,
    Raw { code: String, data: Option<String> },
}

/// Platform binding for Wi-Fi control.
///
/// Actions return once the request is submitted; completion is reported
/// through the notification stream.
pub trait WifiBackend: Send + 'static {
    /// Register for notifications. Called on every module start.
    fn notifications(&mut self) -> Result<mpsc::UnboundedReceiver<WifiNotification>>;

    fn request_scan(&mut self, adapter: &NetworkAdapter) -> Result<()>;

    fn connect(&mut self, adapter: &NetworkAdapter, network: &WifiNetwork) -> Result<()>;

    fn disconnect(&mut self, adapter: &NetworkAdapter) -> Result<()>;

    /// Network the station is connected to
    fn station_state(&mut self, adapter: &NetworkAdapter) -> Result<Option<WifiNetwork>>;

    fn start_access_point(&mut self, adapter: &NetworkAdapter, network: &WifiNetwork)
    -> Result<()>;

    fn stop_access_point(&mut self, adapter: &NetworkAdapter) -> Result<()>;

    fn access_point_active(&mut self, adapter: &NetworkAdapter) -> Result<bool>;

    fn access_point_peers(&mut self) -> Result<HashSet<MacAddr>>;
}
