//! Ethernet framing, grounded on `original_source/kernel/ethernet.c`/`.h`.

use alloc::rc::Rc;

use crate::error::{KernelError, KResult};
use crate::net::addr::MacAddr;
use crate::net::arp::{self, ArpState};
use crate::net::device::{self, Interface, NetDevice};
use crate::net::ip;
use crate::net::addr::Ipv4Addr;
use crate::net::skb::Skb;
use crate::serial_println;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const HEADER_LEN: usize = 14;

/// Parses/serializes the 14-byte Ethernet header in place in an SKB.
pub struct Header {
    pub dest: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl Header {
    fn from_bytes(b: &[u8]) -> Self {
        Self {
            dest: MacAddr::new([b[0], b[1], b[2], b[3], b[4], b[5]]),
            src: MacAddr::new([b[6], b[7], b[8], b[9], b[10], b[11]]),
            ethertype: u16::from_be_bytes([b[12], b[13]]),
        }
    }

    fn write_to(&self, b: &mut [u8]) {
        b[0..6].copy_from_slice(&self.dest.0);
        b[6..12].copy_from_slice(&self.src.0);
        b[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

/// Handles an incoming Ethernet frame: pops the header and dispatches to
/// `net::ip` or `net::arp` based on ethertype.
pub fn handle_rx(dev: &Rc<dyn NetDevice>, skb: &Skb) -> KResult<()> {
    if !skb.may_pull(HEADER_LEN) {
        serial_println!("Ethernet frame too small");
        return Err(KernelError::InvalidArgument);
    }

    let header = skb.with_data(|data| Header::from_bytes(&data[..HEADER_LEN]));
    skb.set_mac_header();
    skb.pull(HEADER_LEN)?;

    match header.ethertype {
        ETHERTYPE_IPV4 => {
            let Some(iface_ip) = device::with_interface_by_device(dev.name(), |i| i.ip_addr) else {
                serial_println!("No interface for packet");
                return Err(KernelError::NotFound);
            };
            ip::handle_rx(iface_ip, skb)
        }
        ETHERTYPE_ARP => arp::handle_rx(dev, skb),
        other => {
            serial_println!("Unknown packet ethertype {:#06x}", other);
            Err(KernelError::InvalidArgument)
        }
    }
}

/// Sends an Ethernet frame to the neighbor at `mac`. `skb` must not
/// already have a mac header set.
pub fn send_mac(dev: &Rc<dyn NetDevice>, skb: &Skb, mac: MacAddr, ethertype: u16) -> KResult<()> {
    debug_assert!(skb.mac_header().is_none());
    let offset = skb.push(HEADER_LEN)?;
    let header = Header {
        dest: mac,
        src: dev.mac_addr(),
        ethertype,
    };
    skb.with_data_mut(|data| header.write_to(&mut data[..HEADER_LEN]));
    skb.set_mac_header();
    let _ = offset;

    let result = dev.send_mac_skb(skb);
    skb.clear_mac_header();
    skb.pull(HEADER_LEN)?;
    result
}

/// Sends an IP-over-Ethernet packet to `ip`, performing ARP resolution as
/// needed. If the neighbor is already known, transmits immediately;
/// otherwise the packet is queued until resolution completes (or dropped
/// if resolution fails).
pub fn send_ip(iface: &Interface, skb: &Skb, ip: Ipv4Addr) -> KResult<()> {
    let Some(dev) = iface.dev.clone() else {
        return Err(KernelError::InvalidArgument);
    };

    match arp::get_state(&dev, ip) {
        (ArpState::Invalid, _) => {
            arp::send_request(iface, ip)?;
            arp::queue_insert(&dev, ip, skb)
        }
        (ArpState::Waiting, _) => arp::queue_insert(&dev, ip, skb),
        (ArpState::Unreachable, _) => {
            serial_println!("Destination unreachable, dropping packet");
            Err(KernelError::NotFound)
        }
        (ArpState::Reachable, Some(mac)) => send_mac(&dev, skb, mac, ETHERTYPE_IPV4),
        (ArpState::Reachable, None) => unreachable!("reachable state always carries a MAC"),
    }
}
