use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nk_common::events::{
    Event, EventKind, WifiApClientConnectedEvent, WifiApClientDisconnectedEvent,
    WifiApStartedEvent, WifiApStoppedEvent, WifiConnectedEvent, WifiDisconnectedEvent,
    WifiRawEvent, WifiScanCompleteEvent,
};
use nk_common::{EventBus, MacAddr, NetworkAdapter, WifiNetwork};
use nk_runtime::{Deferrer, Field, Module, ModuleContext, ModuleError, ModuleHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{WifiBackend, WifiNotification};

/// Default bound on waits for a backend notification
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WifiModule<B: WifiBackend> {
    backend: B,
    timeout: Duration,
    /// Access point peers as of the last refresh
    ap_clients: HashSet<MacAddr>,
    /// Addresses leased to access point peers
    client_addresses: HashMap<MacAddr, Ipv4Addr>,
    pump: Option<JoinHandle<()>>,
}

impl<B: WifiBackend> WifiModule<B> {
    pub const TIMEOUT: Field<Self, Duration> =
        Field::new("timeout", |m: &mut Self, timeout| m.timeout = timeout);

    pub fn new(backend: B) -> Self {
        Self {
            backend,
            timeout: COMPLETION_TIMEOUT,
            ap_clients: HashSet::new(),
            client_addresses: HashMap::new(),
            pump: None,
        }
    }

    pub async fn scan_networks(
        &mut self,
        adapter: &NetworkAdapter,
        ctx: &ModuleContext<Self>,
    ) -> Result<Vec<WifiNetwork>> {
        adapter.ensure_wifi_sta()?;
        let done = ctx.next::<WifiScanCompleteEvent>();
        self.backend.request_scan(adapter)?;
        Ok(done.recv_timeout(self.timeout).await?.networks)
    }

    pub async fn start_station(
        &mut self,
        adapter: &NetworkAdapter,
        network: &WifiNetwork,
        ctx: &ModuleContext<Self>,
    ) -> Result<()> {
        adapter.ensure_wifi_sta()?;
        if self.backend.station_state(adapter)?.is_some() {
            self.stop_station(adapter, ctx).await?;
        }
        let ssid = network.ssid.clone();
        let connected = ctx
            .bus()
            .next_where::<WifiConnectedEvent, _>(move |e| e.ssid == ssid);
        info!("Connecting to '{}' on {}", network.ssid, adapter.name);
        self.backend.connect(adapter, network)?;
        connected.recv_timeout(self.timeout).await?;
        Ok(())
    }

    pub async fn stop_station(
        &mut self,
        adapter: &NetworkAdapter,
        ctx: &ModuleContext<Self>,
    ) -> Result<()> {
        adapter.ensure_wifi_sta()?;
        let Some(current) = self.backend.station_state(adapter)? else {
            self.backend.disconnect(adapter)?;
            return Ok(());
        };
        let disconnected = ctx.next::<WifiDisconnectedEvent>();
        info!("Disconnecting from '{}' on {}", current.ssid, adapter.name);
        self.backend.disconnect(adapter)?;
        disconnected.recv_timeout(self.timeout).await?;
        Ok(())
    }

    pub fn station_state(&mut self, adapter: &NetworkAdapter) -> Result<Option<WifiNetwork>> {
        adapter.ensure_wifi_sta()?;
        self.backend.station_state(adapter)
    }

    pub async fn start_access_point(
        &mut self,
        adapter: &NetworkAdapter,
        network: &WifiNetwork,
        ctx: &ModuleContext<Self>,
    ) -> Result<()> {
        adapter.ensure_wifi_ap()?;
        if self.backend.access_point_active(adapter)? {
            info!("Access point '{}' is already running", network.ssid);
            ctx.publish(WifiApStartedEvent);
        } else {
            let started = ctx.next::<WifiApStartedEvent>();
            info!("Starting access point '{}'", network.ssid);
            self.backend.start_access_point(adapter, network)?;
            started.recv_timeout(self.timeout).await?;
        }
        self.refresh_clients(ctx)?;
        Ok(())
    }

    pub async fn stop_access_point(
        &mut self,
        adapter: &NetworkAdapter,
        ctx: &ModuleContext<Self>,
    ) -> Result<()> {
        adapter.ensure_wifi_ap()?;
        if !self.backend.access_point_active(adapter)? {
            return Ok(());
        }
        let stopped = ctx.next::<WifiApStoppedEvent>();
        info!("Stopping access point");
        self.backend.stop_access_point(adapter)?;
        stopped.recv_timeout(self.timeout).await?;
        Ok(())
    }

    pub fn access_point_state(&mut self, adapter: &NetworkAdapter) -> Result<bool> {
        adapter.ensure_wifi_ap()?;
        self.backend.access_point_active(adapter)
    }

    pub fn access_point_clients(
        &mut self,
        adapter: &NetworkAdapter,
        ctx: &ModuleContext<Self>,
    ) -> Result<HashSet<MacAddr>> {
        adapter.ensure_wifi_ap()?;
        self.refresh_clients(ctx)
    }

    /// Query the peer list and publish the difference with the previous one.
    fn refresh_clients(&mut self, ctx: &ModuleContext<Self>) -> Result<HashSet<MacAddr>> {
        let clients = self.backend.access_point_peers()?;
        for client in self.ap_clients.difference(&clients) {
            debug!("Client {client} left the access point");
            self.client_addresses.remove(client);
            ctx.publish(WifiApClientDisconnectedEvent { client: *client });
        }
        for client in clients.difference(&self.ap_clients) {
            debug!("Client {client} joined the access point");
            ctx.publish(WifiApClientConnectedEvent { client: *client });
        }
        self.ap_clients = clients.clone();
        Ok(clients)
    }

    pub fn client_addresses(&self) -> &HashMap<MacAddr, Ipv4Addr> {
        &self.client_addresses
    }
}

/// Forward backend notifications to the bus until the stream closes.
async fn pump<B: WifiBackend>(
    mut notifications: mpsc::UnboundedReceiver<WifiNotification>,
    bus: Arc<EventBus>,
    deferrer: Deferrer<WifiModule<B>>,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            WifiNotification::ScanComplete { networks } => {
                bus.publish(WifiScanCompleteEvent { networks });
            }
            WifiNotification::Connected { ssid } => {
                bus.publish(WifiConnectedEvent { ssid });
            }
            WifiNotification::Disconnected { ssid } => {
                bus.publish(WifiDisconnectedEvent { ssid });
            }
            WifiNotification::ApStarted => {
                bus.publish(WifiApStartedEvent);
            }
            WifiNotification::ApStopped => {
                bus.publish(WifiApStoppedEvent);
            }
            WifiNotification::ApPeersChanged => deferrer.defer(|m, ctx| {
                Box::pin(async move {
                    m.refresh_clients(ctx)?;
                    Ok(())
                })
            }),
            WifiNotification::Raw { code, data } => {
                bus.publish(WifiRawEvent { code, data });
            }
        }
    }
    debug!("Wi-Fi notification stream closed");
}

impl<B: WifiBackend> Module for WifiModule<B> {
    type Io = ();

    fn subscriptions(&self) -> &'static [EventKind] {
        &[EventKind::DhcpLease]
    }

    async fn setup(&mut self, ctx: &ModuleContext<Self>) -> Result<()> {
        self.ap_clients.clear();
        self.client_addresses.clear();
        let notifications = self.backend.notifications()?;
        self.pump = Some(tokio::spawn(pump(
            notifications,
            Arc::clone(ctx.bus()),
            ctx.deferrer(),
        )));
        Ok(())
    }

    async fn on_event(&mut self, event: Event, _ctx: &ModuleContext<Self>) -> Result<()> {
        let Event::DhcpLease(lease) = event else {
            return Ok(());
        };
        if self.ap_clients.contains(&lease.client) {
            info!("Access point client {} got {}", lease.client, lease.address);
            self.client_addresses.insert(lease.client, lease.address);
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Wi-Fi operations on a module handle, for the command layer.
pub trait WifiControl {
    /// Bound on waits for the backend to report completion
    fn set_timeout(&self, timeout: Duration) -> Result<(), ModuleError>;
    fn scan_networks(&self, adapter: &NetworkAdapter) -> Result<Vec<WifiNetwork>, ModuleError>;
    fn start_station(
        &self,
        adapter: &NetworkAdapter,
        network: &WifiNetwork,
    ) -> Result<(), ModuleError>;
    fn stop_station(&self, adapter: &NetworkAdapter) -> Result<(), ModuleError>;
    fn station_state(&self, adapter: &NetworkAdapter) -> Result<Option<WifiNetwork>, ModuleError>;
    fn start_access_point(
        &self,
        adapter: &NetworkAdapter,
        network: &WifiNetwork,
    ) -> Result<(), ModuleError>;
    fn stop_access_point(&self, adapter: &NetworkAdapter) -> Result<(), ModuleError>;
    fn access_point_state(&self, adapter: &NetworkAdapter) -> Result<bool, ModuleError>;
    fn access_point_clients(
        &self,
        adapter: &NetworkAdapter,
    ) -> Result<HashSet<MacAddr>, ModuleError>;
    fn client_addresses(&self) -> Result<HashMap<MacAddr, Ipv4Addr>, ModuleError>;
}

impl<B: WifiBackend> WifiControl for ModuleHandle<WifiModule<B>> {
    fn set_timeout(&self, timeout: Duration) -> Result<(), ModuleError> {
        self.set(WifiModule::<B>::TIMEOUT, timeout)
    }

    fn scan_networks(&self, adapter: &NetworkAdapter) -> Result<Vec<WifiNetwork>, ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.scan_networks(&adapter, ctx).await })
        })
    }

    fn start_station(
        &self,
        adapter: &NetworkAdapter,
        network: &WifiNetwork,
    ) -> Result<(), ModuleError> {
        let (adapter, network) = (adapter.clone(), network.clone());
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.start_station(&adapter, &network, ctx).await })
        })
    }

    fn stop_station(&self, adapter: &NetworkAdapter) -> Result<(), ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.stop_station(&adapter, ctx).await })
        })
    }

    fn station_state(&self, adapter: &NetworkAdapter) -> Result<Option<WifiNetwork>, ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, _| Box::pin(async move { m.station_state(&adapter) }))
    }

    fn start_access_point(
        &self,
        adapter: &NetworkAdapter,
        network: &WifiNetwork,
    ) -> Result<(), ModuleError> {
        let (adapter, network) = (adapter.clone(), network.clone());
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.start_access_point(&adapter, &network, ctx).await })
        })
    }

    fn stop_access_point(&self, adapter: &NetworkAdapter) -> Result<(), ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.stop_access_point(&adapter, ctx).await })
        })
    }

    fn access_point_state(&self, adapter: &NetworkAdapter) -> Result<bool, ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, _| Box::pin(async move { m.access_point_state(&adapter) }))
    }

    fn access_point_clients(
        &self,
        adapter: &NetworkAdapter,
    ) -> Result<HashSet<MacAddr>, ModuleError> {
        let adapter = adapter.clone();
        self.call_blocking(move |m, ctx| {
            Box::pin(async move { m.access_point_clients(&adapter, ctx) })
        })
    }

    fn client_addresses(&self) -> Result<HashMap<MacAddr, Ipv4Addr>, ModuleError> {
        self.call_blocking(|m, _| Box::pin(async move { Ok(m.client_addresses().clone()) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nk_common::error::NetkitError;
    use nk_common::events::{BusError, BusEvent, DhcpLeaseEvent, Subscription};
    use nk_common::types::AdapterType;
    use std::sync::Mutex;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    /// Simulated radio; actions report completion through the notification channel.
    #[derive(Default)]
    struct FakeRadio {
        tx: Option<mpsc::UnboundedSender<WifiNotification>>,
        scan_results: Vec<WifiNetwork>,
        connected: Option<WifiNetwork>,
        ap_active: bool,
        peers: HashSet<MacAddr>,
        /// Accept requests without ever reporting completion
        mute: bool,
        log: Vec<String>,
    }

    impl FakeRadio {
        fn notify(&self, notification: WifiNotification) {
            if self.mute {
                return;
            }
            if let Some(tx) = &self.tx {
                tx.send(notification).unwrap();
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakeBackend(Arc<Mutex<FakeRadio>>);

    impl FakeBackend {
        fn radio(&self) -> std::sync::MutexGuard<'_, FakeRadio> {
            self.0.lock().unwrap()
        }
    }

    impl WifiBackend for FakeBackend {
        fn notifications(&mut self) -> Result<mpsc::UnboundedReceiver<WifiNotification>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.radio().tx = Some(tx);
            Ok(rx)
        }

        fn request_scan(&mut self, _adapter: &NetworkAdapter) -> Result<()> {
            let radio = self.radio();
            radio.notify(WifiNotification::ScanComplete {
                networks: radio.scan_results.clone(),
            });
            Ok(())
        }

        fn connect(&mut self, _adapter: &NetworkAdapter, network: &WifiNetwork) -> Result<()> {
            let mut radio = self.radio();
            radio.log.push(format!("connect {}", network.ssid));
            radio.connected = Some(network.clone());
            radio.notify(WifiNotification::Connected {
                ssid: network.ssid.clone(),
            });
            Ok(())
        }

        fn disconnect(&mut self, _adapter: &NetworkAdapter) -> Result<()> {
            let mut radio = self.radio();
            radio.log.push("disconnect".to_string());
            if let Some(network) = radio.connected.take() {
                radio.notify(WifiNotification::Disconnected { ssid: network.ssid });
            }
            Ok(())
        }

        fn station_state(&mut self, _adapter: &NetworkAdapter) -> Result<Option<WifiNetwork>> {
            Ok(self.radio().connected.clone())
        }

        fn start_access_point(
            &mut self,
            _adapter: &NetworkAdapter,
            network: &WifiNetwork,
        ) -> Result<()> {
            let mut radio = self.radio();
            radio.log.push(format!("start ap {}", network.ssid));
            radio.ap_active = true;
            radio.notify(WifiNotification::ApStarted);
            Ok(())
        }

        fn stop_access_point(&mut self, _adapter: &NetworkAdapter) -> Result<()> {
            let mut radio = self.radio();
            radio.log.push("stop ap".to_string());
            radio.ap_active = false;
            radio.notify(WifiNotification::ApStopped);
            Ok(())
        }

        fn access_point_active(&mut self, _adapter: &NetworkAdapter) -> Result<bool> {
            Ok(self.radio().ap_active)
        }

        fn access_point_peers(&mut self) -> Result<HashSet<MacAddr>> {
            Ok(self.radio().peers.clone())
        }
    }

    fn sta() -> NetworkAdapter {
        NetworkAdapter::new("wlan0", "Wi-Fi", AdapterType::WirelessSta)
    }

    fn ap() -> NetworkAdapter {
        NetworkAdapter::new("ap0", "Hosted Network", AdapterType::WirelessAp)
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn started() -> (ModuleHandle<WifiModule<FakeBackend>>, FakeBackend) {
        let backend = FakeBackend::default();
        let handle = ModuleHandle::new(
            "wifi",
            WifiModule::new(backend.clone()),
            Arc::new(EventBus::new()),
        );
        handle.set_timeout(WAIT).unwrap();
        handle.start().unwrap();
        (handle, backend)
    }

    fn wait<T: BusEvent>(subscription: Subscription<T>) -> Result<T, BusError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(subscription.recv_timeout(WAIT))
    }

    #[test]
    fn test_scan_returns_reported_networks() {
        let (handle, backend) = started();
        backend.radio().scan_results = vec![WifiNetwork::open("lab"), WifiNetwork::open("guest")];

        let networks = handle.scan_networks(&sta()).unwrap();
        let ssids: Vec<&str> = networks.iter().map(|n| n.ssid.as_str()).collect();
        assert_eq!(ssids, vec!["lab", "guest"]);
        handle.stop().unwrap();
    }

    #[test]
    fn test_wrong_adapter_type_is_rejected() {
        let (handle, backend) = started();
        let err = handle.scan_networks(&ap()).unwrap_err();
        assert!(matches!(
            err.call_error::<NetkitError>(),
            Some(NetkitError::AdapterType { .. })
        ));
        let err = handle.start_access_point(&sta(), &WifiNetwork::open("x")).unwrap_err();
        assert!(err.call_error::<NetkitError>().is_some());
        assert!(backend.radio().log.is_empty());
        handle.stop().unwrap();
    }

    #[test]
    fn test_station_switches_network() {
        let (handle, backend) = started();
        assert_eq!(handle.station_state(&sta()).unwrap(), None);

        handle.start_station(&sta(), &WifiNetwork::open("lab")).unwrap();
        assert_eq!(handle.station_state(&sta()).unwrap().unwrap().ssid, "lab");

        let dropped = handle.bus().next::<WifiDisconnectedEvent>();
        handle.start_station(&sta(), &WifiNetwork::open("guest")).unwrap();
        assert_eq!(wait(dropped).unwrap().ssid, "lab");
        assert_eq!(
            backend.radio().log,
            vec!["connect lab", "disconnect", "connect guest"]
        );

        handle.stop_station(&sta()).unwrap();
        assert_eq!(handle.station_state(&sta()).unwrap(), None);
        // Not connected: nothing to wait for
        handle.stop_station(&sta()).unwrap();
        handle.stop().unwrap();
    }

    #[test]
    fn test_access_point_start_and_stop() {
        let (handle, backend) = started();
        assert!(!handle.access_point_state(&ap()).unwrap());

        handle.start_access_point(&ap(), &WifiNetwork::open("netkit")).unwrap();
        assert!(handle.access_point_state(&ap()).unwrap());

        // Already running: announced again without touching the radio
        let announced = handle.bus().next::<WifiApStartedEvent>();
        handle.start_access_point(&ap(), &WifiNetwork::open("netkit")).unwrap();
        assert_eq!(wait(announced), Ok(WifiApStartedEvent));
        assert_eq!(backend.radio().log, vec!["start ap netkit"]);

        handle.stop_access_point(&ap()).unwrap();
        assert!(!handle.access_point_state(&ap()).unwrap());
        handle.stop_access_point(&ap()).unwrap();
        assert_eq!(backend.radio().log, vec!["start ap netkit", "stop ap"]);
        handle.stop().unwrap();
    }

    #[test]
    fn test_client_diff_events() {
        let (handle, backend) = started();
        backend.radio().peers = HashSet::from([mac(1), mac(2)]);

        let joined = handle.bus().next_where::<WifiApClientConnectedEvent, _>(|e| e.client == mac(2));
        let clients = handle.access_point_clients(&ap()).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(wait(joined).unwrap().client, mac(2));

        // Peer change notification triggers a refresh on the module context
        backend.radio().peers = HashSet::from([mac(2)]);
        let left = handle.bus().next::<WifiApClientDisconnectedEvent>();
        backend.radio().notify(WifiNotification::ApPeersChanged);
        assert_eq!(wait(left).unwrap().client, mac(1));

        // No change, no event
        let quiet = handle.bus().next::<WifiApClientDisconnectedEvent>();
        handle.access_point_clients(&ap()).unwrap();
        assert!(wait(quiet).is_err());
        handle.stop().unwrap();
    }

    #[test]
    fn test_lease_addresses_recorded_for_clients() {
        let (handle, backend) = started();
        backend.radio().peers = HashSet::from([mac(1)]);
        handle.access_point_clients(&ap()).unwrap();

        for (client, last) in [(mac(1), 10), (mac(9), 11)] {
            handle.bus().publish(DhcpLeaseEvent {
                client,
                address: Ipv4Addr::new(10, 0, 0, last),
                host_name: None,
                vendor_cid: None,
            });
        }

        // Events reach the context after pending calls
        let deadline = Instant::now() + WAIT;
        let addresses = loop {
            let addresses = handle.client_addresses().unwrap();
            if !addresses.is_empty() || Instant::now() > deadline {
                break addresses;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(addresses, HashMap::from([(mac(1), Ipv4Addr::new(10, 0, 0, 10))]));
        handle.stop().unwrap();
    }

    #[test]
    fn test_raw_notification_published() {
        let (handle, backend) = started();
        let raw = handle.bus().next::<WifiRawEvent>();
        backend.radio().notify(WifiNotification::Raw {
            code: "interface_arrival".to_string(),
            data: None,
        });
        assert_eq!(wait(raw).unwrap().code, "interface_arrival");
        handle.stop().unwrap();
    }

    #[test]
    fn test_missing_completion_times_out() {
        let (handle, backend) = started();
        handle.set_timeout(Duration::from_millis(100)).unwrap();
        backend.radio().mute = true;

        let err = handle.scan_networks(&sta()).unwrap_err();
        assert_eq!(
            err.call_error::<BusError>(),
            Some(&BusError::Timeout(Duration::from_millis(100)))
        );
        // The module keeps serving
        assert!(handle.is_running());
        assert_eq!(handle.station_state(&sta()).unwrap(), None);
        handle.stop().unwrap();
    }

    #[test]
    fn test_restart_registers_again() {
        let (handle, backend) = started();
        handle.stop().unwrap();
        backend.radio().tx = None;
        handle.start().unwrap();
        assert!(backend.radio().tx.is_some());

        backend.radio().scan_results = vec![WifiNetwork::open("lab")];
        assert_eq!(handle.scan_networks(&sta()).unwrap().len(), 1);
        handle.stop().unwrap();
    }
}
