use nk_common::EventBus;
use nk_common::MacAddr;
use nk_common::events::{BusError, BusEvent, DhcpLeaseEvent, Subscription};
use nk_dhcp::{DhcpConfig, DhcpControl, DhcpMessageType, DhcpModule, DhcpPacket, OptionCode};
use nk_runtime::ModuleHandle;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    handle: ModuleHandle<DhcpModule>,
    client: UdpSocket,
    server: SocketAddr,
}

impl TestServer {
    /// Range 10.0.0.100-10.0.0.103, server at 10.0.0.1/24, replies to the test client
    fn start() -> Self {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(TIMEOUT)).unwrap();

        let handle = ModuleHandle::new("dhcp", DhcpModule::new(), Arc::new(EventBus::new()));
        DhcpConfig {
            address: Ipv4Addr::LOCALHOST,
            port: 0,
            reply_to: client.local_addr().unwrap(),
            interface: Some("10.0.0.1/24".parse().unwrap()),
            range_start: Some(Ipv4Addr::new(10, 0, 0, 100)),
            range_end: Some(Ipv4Addr::new(10, 0, 0, 103)),
            ..Default::default()
        }
        .apply(&handle)
        .unwrap();
        handle.start().unwrap();
        let server = handle.local_addr().unwrap();

        Self {
            handle,
            client,
            server,
        }
    }

    fn send(&self, mac: MacAddr, message_type: DhcpMessageType) {
        let mut packet = DhcpPacket::request(mac, u32::from(mac.0[5]), message_type);
        packet.set(OptionCode::HostName, format!("host-{}", mac.0[5]));
        self.client.send_to(&packet.encode(), self.server).unwrap();
    }

    fn exchange(&self, mac: MacAddr, message_type: DhcpMessageType) -> DhcpPacket {
        self.send(mac, message_type);
        let mut buf = [0u8; 1500];
        let (len, _) = self.client.recv_from(&mut buf).unwrap();
        DhcpPacket::decode(&buf[..len]).unwrap()
    }

    fn expect_silence(&self, mac: MacAddr, message_type: DhcpMessageType) {
        self.send(mac, message_type);
        self.client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut buf = [0u8; 1500];
        assert!(self.client.recv_from(&mut buf).is_err(), "unexpected reply");
        self.client.set_read_timeout(Some(TIMEOUT)).unwrap();
    }
}

fn mac(last: u8) -> MacAddr {
    MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
}

fn wait<T: BusEvent>(subscription: Subscription<T>) -> Result<T, BusError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(subscription.recv_timeout(TIMEOUT))
}

/// Vérifie le scénario complet OFFER / ACK / épuisement de la plage
#[test]
fn test_offer_ack_and_exhaustion() {
    let server = TestServer::start();
    let bus = Arc::clone(server.handle.bus());

    let offer = server.exchange(mac(1), DhcpMessageType::Discover);
    assert_eq!(offer.message_type(), Some(DhcpMessageType::Offer));
    assert_eq!(offer.your_ip, Ipv4Addr::new(10, 0, 0, 100));
    assert_eq!(offer.server_ip, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(offer.transaction_id, 1);
    assert_eq!(offer.server_host_name, "netkit");

    let lease = bus.next::<DhcpLeaseEvent>();
    let ack = server.exchange(mac(1), DhcpMessageType::Request);
    assert_eq!(ack.message_type(), Some(DhcpMessageType::Ack));
    assert_eq!(ack.your_ip, Ipv4Addr::new(10, 0, 0, 100));
    let lease = wait(lease).unwrap();
    assert_eq!(lease.client, mac(1));
    assert_eq!(lease.address, Ipv4Addr::new(10, 0, 0, 100));
    assert_eq!(lease.host_name.as_deref(), Some("host-1"));

    for i in 2..=4 {
        let offer = server.exchange(mac(i), DhcpMessageType::Discover);
        assert_eq!(offer.your_ip, Ipv4Addr::new(10, 0, 0, 98 + i));
    }

    // Fifth client: dropped, the server keeps serving
    server.expect_silence(mac(5), DhcpMessageType::Discover);
    assert!(server.handle.is_running());
    let offer = server.exchange(mac(3), DhcpMessageType::Discover);
    assert_eq!(offer.your_ip, Ipv4Addr::new(10, 0, 0, 102));

    assert_eq!(server.handle.leases().unwrap().len(), 4);
    server.handle.stop().unwrap();
    assert!(server.handle.leases().unwrap().is_empty());
}

/// Vérifie qu'un même client obtient toujours la même adresse
#[test]
fn test_sticky_and_unique_leases() {
    let server = TestServer::start();
    let mut seen = Vec::new();
    for i in 1..=3 {
        let first = server.exchange(mac(i), DhcpMessageType::Discover).your_ip;
        let second = server.exchange(mac(i), DhcpMessageType::Request).your_ip;
        let third = server.exchange(mac(i), DhcpMessageType::Discover).your_ip;
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert!(!seen.contains(&first));
        seen.push(first);
    }
    server.handle.stop().unwrap();
}

/// Un abonné arrivé après le REQUEST ne voit pas l'événement
#[test]
fn test_lease_event_is_not_buffered() {
    let server = TestServer::start();
    let bus = Arc::clone(server.handle.bus());

    let early = bus.next::<DhcpLeaseEvent>();
    server.exchange(mac(1), DhcpMessageType::Request);
    assert_eq!(wait(early).unwrap().client, mac(1));

    let late = bus.next::<DhcpLeaseEvent>();
    assert_eq!(wait(late), Err(BusError::Timeout(TIMEOUT)));

    // DISCOVER does not publish
    let lease = bus.next::<DhcpLeaseEvent>();
    server.exchange(mac(2), DhcpMessageType::Discover);
    server.exchange(mac(2), DhcpMessageType::Inform);
    assert_eq!(wait(lease).unwrap().client, mac(2));
    server.handle.stop().unwrap();
}

/// Les paquets invalides sont ignorés sans arrêter le serveur
#[test]
fn test_invalid_packets_are_dropped() {
    let server = TestServer::start();
    server.client.send_to(&[0u8; 32], server.server).unwrap();
    server.expect_silence(mac(1), DhcpMessageType::Release);

    let offer = server.exchange(mac(1), DhcpMessageType::Discover);
    assert_eq!(offer.your_ip, Ipv4Addr::new(10, 0, 0, 100));
    server.handle.stop().unwrap();
}

/// Sans plage configurée, aucune réponse; la plage peut être ajoutée à chaud
#[test]
fn test_runtime_reconfiguration() {
    let server = TestServer::start();
    server.handle.set_range(None).unwrap();
    server.expect_silence(mac(1), DhcpMessageType::Discover);

    server
        .handle
        .set_range(Some((Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 0, 60))))
        .unwrap();
    server.handle.set_dns(Some(Ipv4Addr::new(1, 1, 1, 1))).unwrap();
    let offer = server.exchange(mac(1), DhcpMessageType::Discover);
    assert_eq!(offer.your_ip, Ipv4Addr::new(10, 0, 0, 50));
    assert!(offer.contains(OptionCode::DnsServers));
    server.handle.stop().unwrap();
}
