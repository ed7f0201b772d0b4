//! ARP resolver (spec 4.6), grounded on `original_source/kernel/arp.c`/`.h`.
//!
//! The cache is a flat `Vec<CacheEntry>` behind a `spin::Mutex` rather
//! than the original's intrusive list, since Rust gives us no
//! `container_of` to walk back from a list node to its owning entry.

use alloc::rc::Rc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{ARP_CACHE_TIMEOUT_MS, ARP_RESOLVE_TIMEOUT_MS};
use crate::error::{KernelError, KResult};
use crate::net::addr::{Ipv4Addr, MacAddr};
use crate::net::device::{Interface, NetDevice};
use crate::net::ethernet;
use crate::net::skb::Skb;
use crate::serial_println;
use crate::timer::{self, TimerId};

const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ARP_HWTYPE_ETHERNET: u16 = 1;
const ARP_HEADER_LEN: usize = 28;

/// State of one neighbor entry. Mirrors `arp_state_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    /// No cache entry exists for this (device, IP) pair.
    Invalid,
    /// A request was sent; awaiting a reply.
    Waiting,
    /// The resolve timeout elapsed with no reply.
    Unreachable,
    /// A reply was received; `mac` is valid.
    Reachable,
}

struct PendingPacket {
    skb: Skb,
}

struct CacheEntry {
    dev_name: alloc::string::String,
    ip: Ipv4Addr,
    mac: MacAddr,
    state: ArpState,
    timeout: Option<TimerId>,
    queue: Vec<PendingPacket>,
}

lazy_static! {
    static ref CACHE: Mutex<Vec<CacheEntry>> = Mutex::new(Vec::new());
}

fn find_index(cache: &[CacheEntry], dev_name: &str, ip: Ipv4Addr) -> Option<usize> {
    cache.iter().position(|e| e.dev_name == dev_name && e.ip == ip)
}

/// Looks up the cache entry for `ip` on `dev`, returning its state and
/// (if reachable) its MAC address.
#[must_use]
pub fn get_state(dev: &Rc<dyn NetDevice>, ip: Ipv4Addr) -> (ArpState, Option<MacAddr>) {
    let cache = CACHE.lock();
    match find_index(&cache, dev.name(), ip) {
        Some(i) => (cache[i].state, (cache[i].state == ArpState::Reachable).then_some(cache[i].mac)),
        None => (ArpState::Invalid, None),
    }
}

/// Inserts (or overwrites) a cache entry and schedules its resolve
/// timeout, entering the `Waiting` state. Sends an ARP request.
pub fn send_request(iface: &Interface, ip: Ipv4Addr) -> KResult<()> {
    let dev = iface.dev.clone().ok_or(KernelError::InvalidArgument)?;

    {
        let mut cache = CACHE.lock();
        if let Some(i) = find_index(&cache, dev.name(), ip) {
            if let Some(id) = cache[i].timeout.take() {
                timer::cancel(id);
            }
            cache[i].state = ArpState::Waiting;
        } else {
            cache.push(CacheEntry {
                dev_name: alloc::string::String::from(dev.name()),
                ip,
                mac: MacAddr::ZERO,
                state: ArpState::Waiting,
                timeout: None,
                queue: Vec::new(),
            });
        }
        let i = find_index(&cache, dev.name(), ip).expect("entry just inserted");
        let dev_name = cache[i].dev_name.clone();
        cache[i].timeout = Some(timer::schedule(ARP_RESOLVE_TIMEOUT_MS, move || {
            on_resolve_timeout(&dev_name, ip);
        }));
    }

    let skb = Skb::alloc(ethernet::HEADER_LEN + ARP_HEADER_LEN);
    skb.reserve(ethernet::HEADER_LEN)?;
    skb.put(ARP_HEADER_LEN)?;
    write_arp_packet(
        &skb,
        ARP_OP_REQUEST,
        dev.mac_addr(),
        iface.ip_addr,
        MacAddr::ZERO,
        ip,
    );
    ethernet::send_mac(&dev, &skb, MacAddr::BROADCAST, ethernet::ETHERTYPE_ARP)
}

/// Queues `skb` to be sent once `ip` resolves (or drops it once the
/// entry becomes unreachable).
pub fn queue_insert(dev: &Rc<dyn NetDevice>, ip: Ipv4Addr, skb: &Skb) -> KResult<()> {
    let mut cache = CACHE.lock();
    let i = find_index(&cache, dev.name(), ip).ok_or(KernelError::NotFound)?;
    cache[i].queue.push(PendingPacket { skb: skb.clone_data() });
    Ok(())
}

/// Handles an incoming ARP packet: updates the cache on replies seen for
/// our own outstanding requests, and answers requests for our own IP.
pub fn handle_rx(dev: &Rc<dyn NetDevice>, skb: &Skb) -> KResult<()> {
    if !skb.may_pull(ARP_HEADER_LEN) {
        serial_println!("ARP packet too small");
        return Err(KernelError::InvalidArgument);
    }

    let (hw_type, proto_type, op, src_mac, src_ip, dest_ip) = skb.with_data(|data| {
        let hw_type = u16::from_be_bytes([data[0], data[1]]);
        let proto_type = u16::from_be_bytes([data[2], data[3]]);
        let op = u16::from_be_bytes([data[6], data[7]]);
        let src_mac = MacAddr::new(data[8..14].try_into().expect("6 bytes"));
        let src_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);
        let dest_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);
        (hw_type, proto_type, op, src_mac, src_ip, dest_ip)
    });

    if hw_type != ARP_HWTYPE_ETHERNET || proto_type != ethernet::ETHERTYPE_IPV4 {
        return Err(KernelError::InvalidArgument);
    }

    cache_insert_reachable(dev, src_ip, src_mac);

    if op == ARP_OP_REQUEST {
        if let Some(iface_ip) = crate::net::device::with_interface_by_device(dev.name(), |i| i.ip_addr) {
            if iface_ip == dest_ip {
                return send_reply(dev, iface_ip, src_mac, src_ip);
            }
        }
    }

    Ok(())
}

fn send_reply(dev: &Rc<dyn NetDevice>, our_ip: Ipv4Addr, dest_mac: MacAddr, dest_ip: Ipv4Addr) -> KResult<()> {
    let skb = Skb::alloc(ethernet::HEADER_LEN + ARP_HEADER_LEN);
    skb.reserve(ethernet::HEADER_LEN)?;
    skb.put(ARP_HEADER_LEN)?;
    write_arp_packet(&skb, ARP_OP_REPLY, dev.mac_addr(), our_ip, dest_mac, dest_ip);
    ethernet::send_mac(dev, &skb, dest_mac, ethernet::ETHERTYPE_ARP)
}

fn write_arp_packet(
    skb: &Skb,
    op: u16,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    dest_mac: MacAddr,
    dest_ip: Ipv4Addr,
) {
    skb.with_data_mut(|data| {
        data[0..2].copy_from_slice(&ARP_HWTYPE_ETHERNET.to_be_bytes());
        data[2..4].copy_from_slice(&ethernet::ETHERTYPE_IPV4.to_be_bytes());
        data[4] = 6; // hw_len
        data[5] = 4; // proto_len
        data[6..8].copy_from_slice(&op.to_be_bytes());
        data[8..14].copy_from_slice(&src_mac.0);
        data[14..18].copy_from_slice(&src_ip.0);
        data[18..24].copy_from_slice(&dest_mac.0);
        data[24..28].copy_from_slice(&dest_ip.0);
    });
}

fn cache_insert_reachable(dev: &Rc<dyn NetDevice>, ip: Ipv4Addr, mac: MacAddr) {
    let mut cache = CACHE.lock();
    let i = match find_index(&cache, dev.name(), ip) {
        Some(i) => i,
        None => {
            cache.push(CacheEntry {
                dev_name: alloc::string::String::from(dev.name()),
                ip,
                mac,
                state: ArpState::Reachable,
                timeout: None,
                queue: Vec::new(),
            });
            cache.len() - 1
        }
    };

    if let Some(id) = cache[i].timeout.take() {
        timer::cancel(id);
    }
    cache[i].mac = mac;
    cache[i].state = ArpState::Reachable;
    let queue = core::mem::take(&mut cache[i].queue);
    let dev_name = cache[i].dev_name.clone();
    cache[i].timeout = Some(timer::schedule(ARP_CACHE_TIMEOUT_MS, move || {
        on_cache_timeout(&dev_name, ip);
    }));
    drop(cache);

    for pkt in queue {
        let _ = ethernet::send_mac(dev, &pkt.skb, mac, ethernet::ETHERTYPE_IPV4);
    }
}

fn on_resolve_timeout(dev_name: &str, ip: Ipv4Addr) {
    let mut cache = CACHE.lock();
    if let Some(i) = find_index(&cache, dev_name, ip) {
        cache[i].state = ArpState::Unreachable;
        cache[i].queue.clear();
        let dev_name = cache[i].dev_name.clone();
        cache[i].timeout = Some(timer::schedule(ARP_CACHE_TIMEOUT_MS, move || {
            on_cache_timeout(&dev_name, ip);
        }));
    }
}

fn on_cache_timeout(dev_name: &str, ip: Ipv4Addr) {
    let mut cache = CACHE.lock();
    if let Some(i) = find_index(&cache, dev_name, ip) {
        debug_assert!(cache[i].queue.is_empty());
        cache.remove(i);
    }
}

/// Clears the ARP cache. Test-only.
#[cfg(test)]
pub fn reset_for_test() {
    CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::NetDevice;

    struct MockDevice {
        name: alloc::string::String,
        mac: MacAddr,
    }

    impl NetDevice for MockDevice {
        fn name(&self) -> &str {
            &self.name
        }
        fn mac_addr(&self) -> MacAddr {
            self.mac
        }
        fn send_mac_skb(&self, _skb: &Skb) -> KResult<()> {
            Ok(())
        }
    }

    #[test_case]
    fn unknown_entry_is_invalid() {
        reset_for_test();
        let dev: Rc<dyn NetDevice> = Rc::new(MockDevice {
            name: "mock0".into(),
            mac: MacAddr::new([1, 2, 3, 4, 5, 6]),
        });
        let (state, mac) = get_state(&dev, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(state, ArpState::Invalid);
        assert!(mac.is_none());
    }

    #[test_case]
    fn reply_marks_entry_reachable() {
        reset_for_test();
        let dev: Rc<dyn NetDevice> = Rc::new(MockDevice {
            name: "mock1".into(),
            mac: MacAddr::new([1, 2, 3, 4, 5, 6]),
        });
        let neighbor_mac = MacAddr::new([9, 9, 9, 9, 9, 9]);
        let neighbor_ip = Ipv4Addr::new(10, 0, 0, 2);
        cache_insert_reachable(&dev, neighbor_ip, neighbor_mac);
        let (state, mac) = get_state(&dev, neighbor_ip);
        assert_eq!(state, ArpState::Reachable);
        assert_eq!(mac, Some(neighbor_mac));
    }
}
