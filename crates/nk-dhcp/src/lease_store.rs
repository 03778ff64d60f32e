use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use nk_common::MacAddr;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LeaseError {
    #[error("No more addresses to allocate in {start}-{end}")]
    Exhausted { start: Ipv4Addr, end: Ipv4Addr },
}

/// A DHCP lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub client: MacAddr,
    pub address: Ipv4Addr,
    /// Configured host reservation rather than a dynamic lease
    pub reserved: bool,
}

/// MAC -> address assignments of one DHCP server.
///
/// Static host reservations are looked up first and never handed to another
/// MAC. Dynamic leases last until [`clear`](Self::clear), no expiry is tracked.
#[derive(Debug, Default)]
pub struct LeaseTable {
    static_hosts: HashMap<MacAddr, Ipv4Addr>,
    by_mac: HashMap<MacAddr, Ipv4Addr>,
    by_address: BTreeMap<Ipv4Addr, MacAddr>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the host reservations.
    ///
    /// Dynamic leases colliding with a reservation are dropped.
    pub fn set_static_hosts(&mut self, hosts: HashMap<MacAddr, Ipv4Addr>) {
        self.static_hosts = hosts;
        let conflicting: Vec<MacAddr> = self
            .by_mac
            .iter()
            .filter(|(mac, address)| {
                self.static_hosts.contains_key(*mac) || self.reserved_for_other(**address, mac)
            })
            .map(|(mac, _)| *mac)
            .collect();
        for mac in conflicting {
            debug!("Dropping lease of {mac}, superseded by a host reservation");
            self.release(mac);
        }
    }

    pub fn static_hosts(&self) -> &HashMap<MacAddr, Ipv4Addr> {
        &self.static_hosts
    }

    fn reserved_for_other(&self, address: Ipv4Addr, mac: &MacAddr) -> bool {
        self.static_hosts
            .iter()
            .any(|(host, reserved)| *reserved == address && host != mac)
    }

    /// Current address of `mac`, reservation or dynamic lease
    pub fn get(&self, mac: &MacAddr) -> Option<Ipv4Addr> {
        self.static_hosts
            .get(mac)
            .or_else(|| self.by_mac.get(mac))
            .copied()
    }

    /// Address for `mac`: its reservation, its existing lease, or the first
    /// free address of `start..=end`.
    pub fn allocate(
        &mut self,
        mac: MacAddr,
        start: Ipv4Addr,
        end: Ipv4Addr,
    ) -> Result<Ipv4Addr, LeaseError> {
        if let Some(address) = self.get(&mac) {
            return Ok(address);
        }

        let free = (u32::from(start)..=u32::from(end))
            .map(Ipv4Addr::from)
            .find(|address| {
                !self.by_address.contains_key(address) && !self.reserved_for_other(*address, &mac)
            })
            .ok_or(LeaseError::Exhausted { start, end })?;

        self.by_mac.insert(mac, free);
        self.by_address.insert(free, mac);
        Ok(free)
    }

    /// Drop the dynamic lease of `mac`
    pub fn release(&mut self, mac: MacAddr) -> Option<Ipv4Addr> {
        let address = self.by_mac.remove(&mac)?;
        self.by_address.remove(&address);
        Some(address)
    }

    /// Drop every dynamic lease. Reservations are kept.
    pub fn clear(&mut self) {
        self.by_mac.clear();
        self.by_address.clear();
    }

    /// Number of dynamic leases
    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }

    /// Reservations and dynamic leases, sorted by address
    pub fn leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .static_hosts
            .iter()
            .map(|(mac, address)| Lease {
                client: *mac,
                address: *address,
                reserved: true,
            })
            .chain(self.by_address.iter().map(|(address, mac)| Lease {
                client: *mac,
                address: *address,
                reserved: false,
            }))
            .collect();
        leases.sort_by_key(|lease| (lease.address, lease.client));
        leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    const START: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);
    const END: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 103);

    #[test]
    fn test_allocate_sequential_and_sticky() {
        let mut table = LeaseTable::new();
        assert_eq!(table.allocate(mac(1), START, END), Ok(Ipv4Addr::new(10, 0, 0, 100)));
        assert_eq!(table.allocate(mac(2), START, END), Ok(Ipv4Addr::new(10, 0, 0, 101)));
        assert_eq!(table.allocate(mac(1), START, END), Ok(Ipv4Addr::new(10, 0, 0, 100)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let mut table = LeaseTable::new();
        for i in 1..=4 {
            table.allocate(mac(i), START, END).unwrap();
        }
        assert_eq!(
            table.allocate(mac(5), START, END),
            Err(LeaseError::Exhausted { start: START, end: END })
        );
        // Known clients are still served
        assert_eq!(table.allocate(mac(4), START, END), Ok(Ipv4Addr::new(10, 0, 0, 103)));
    }

    #[test]
    fn test_released_address_is_reused() {
        let mut table = LeaseTable::new();
        table.allocate(mac(1), START, END).unwrap();
        table.allocate(mac(2), START, END).unwrap();
        assert_eq!(table.release(mac(1)), Some(START));
        assert_eq!(table.allocate(mac(3), START, END), Ok(START));
    }

    #[test]
    fn test_static_hosts() {
        let mut table = LeaseTable::new();
        table.set_static_hosts(HashMap::from([(mac(9), START)]));

        // The reservation is skipped for others, and may sit outside the range
        assert_eq!(table.allocate(mac(1), START, END), Ok(Ipv4Addr::new(10, 0, 0, 101)));
        assert_eq!(table.allocate(mac(9), START, END), Ok(START));
        assert_eq!(table.len(), 1);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.get(&mac(9)), Some(START));
    }

    #[test]
    fn test_reservation_supersedes_lease() {
        let mut table = LeaseTable::new();
        table.allocate(mac(1), START, END).unwrap();
        table.allocate(mac(2), START, END).unwrap();
        table.set_static_hosts(HashMap::from([(mac(3), START)]));
        assert_eq!(table.get(&mac(1)), None);
        assert_eq!(table.allocate(mac(1), START, END), Ok(Ipv4Addr::new(10, 0, 0, 102)));
    }

    #[test]
    fn test_leases_listing() {
        let mut table = LeaseTable::new();
        table.set_static_hosts(HashMap::from([(mac(9), Ipv4Addr::new(10, 0, 0, 5))]));
        table.allocate(mac(1), START, END).unwrap();
        let leases = table.leases();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].client, mac(9));
        assert!(leases[0].reserved);
        assert_eq!(leases[1].address, START);
        assert!(!leases[1].reserved);
    }
}
