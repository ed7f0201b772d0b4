//! IPv4 header handling, grounded on `original_source/kernel/ip.c`/`.h`
//! (supplemented feature B: not named as its own spec.md component, but
//! the direct upper layer Ethernet/ARP/TCP/UDP depend on).

use crate::error::{KernelError, KResult};
use crate::net::addr::{internet_checksum, Ipv4Addr};
use crate::net::device;
use crate::net::ethernet;
use crate::net::{loopback, tcp, udp};
use crate::net::skb::Skb;
use crate::serial_println;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const HEADER_LEN: usize = 20;

struct Header {
    total_length: u16,
    flags_and_fragment: u16,
    protocol: u8,
    src_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
}

impl Header {
    fn parse(b: &[u8]) -> Self {
        Self {
            total_length: u16::from_be_bytes([b[2], b[3]]),
            flags_and_fragment: u16::from_be_bytes([b[6], b[7]]),
            protocol: b[9],
            src_ip: Ipv4Addr::new(b[12], b[13], b[14], b[15]),
            dest_ip: Ipv4Addr::new(b[16], b[17], b[18], b[19]),
        }
    }
}

fn write_header(b: &mut [u8], total_length: u16, protocol: u8, src_ip: Ipv4Addr, dest_ip: Ipv4Addr) {
    b[0] = (4 << 4) | (HEADER_LEN as u8 / 4); // version=4, ihl=5
    b[1] = 0; // dscp/ecn
    b[2..4].copy_from_slice(&total_length.to_be_bytes());
    b[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    b[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    b[8] = 64; // ttl
    b[9] = protocol;
    b[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    b[12..16].copy_from_slice(&src_ip.0);
    b[16..20].copy_from_slice(&dest_ip.0);
    let checksum = internet_checksum(&b[..HEADER_LEN]);
    b[10..12].copy_from_slice(&checksum.to_be_bytes());
}

/// Handles an incoming IP packet addressed to the interface whose local
/// IP is `iface_ip`: validates, then dispatches to TCP/UDP.
pub fn handle_rx(iface_ip: Ipv4Addr, skb: &Skb) -> KResult<()> {
    if !skb.may_pull(HEADER_LEN) {
        serial_println!("IP packet too small");
        return Err(KernelError::InvalidArgument);
    }

    let (header, checksum_ok) = skb.with_data(|data| {
        (Header::parse(&data[..HEADER_LEN]), internet_checksum(&data[..HEADER_LEN]) == 0)
    });
    let ip_len = header.total_length as usize;
    if ip_len < HEADER_LEN || ip_len > skb.len() {
        serial_println!("Invalid packet length");
        return Err(KernelError::InvalidArgument);
    }

    skb.set_network_header();
    skb.trim(ip_len)?;
    skb.pull(HEADER_LEN)?;

    if header.flags_and_fragment & 0xffbf != 0 {
        serial_println!("Fragmented packets not supported");
        return Err(KernelError::InvalidArgument);
    }

    if header.dest_ip != iface_ip {
        serial_println!("Destination IP mismatch");
        return Err(KernelError::InvalidArgument);
    }

    if !checksum_ok {
        serial_println!("Invalid IP header checksum");
        return Err(KernelError::InvalidArgument);
    }

    match header.protocol {
        IPPROTO_TCP => tcp::handle_rx(header.src_ip, skb),
        IPPROTO_UDP => udp::handle_rx(header.src_ip, skb),
        other => {
            serial_println!("Unhandled IP protocol {other}");
            Err(KernelError::InvalidArgument)
        }
    }
}

/// Pushes an IP header onto `skb` (which must carry only a transport
/// header) and forwards it to the routed interface.
pub fn send(skb: &Skb, dest_ip: Ipv4Addr, protocol: u8) -> KResult<()> {
    debug_assert!(skb.network_header().is_none());

    let (iface_name, neigh_ip) = device::route(dest_ip).ok_or(KernelError::NotFound)?;

    skb.push(HEADER_LEN)?;
    skb.set_network_header();
    let src_ip = device::with_interface_by_name(&iface_name, |i| i.ip_addr).ok_or(KernelError::NotFound)?;
    let total_length = skb.len() as u16;
    skb.with_data_mut(|data| write_header(&mut data[..HEADER_LEN], total_length, protocol, src_ip, dest_ip));

    let result = device::with_interface_by_name(&iface_name, |iface| match &iface.dev {
        Some(_) => ethernet::send_ip(iface, skb, neigh_ip),
        None => loopback::send(skb),
    })
    .ok_or(KernelError::NotFound)
    .and_then(|r| r);

    skb.clear_network_header();
    skb.pull(HEADER_LEN)?;
    result
}

/// Computes the TCP/UDP pseudo-header checksum over `skb`'s transport
/// payload. `skb` must carry only a transport header (no network/mac
/// header yet).
#[must_use]
pub fn pseudo_checksum(skb: &Skb, src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8) -> u16 {
    debug_assert!(skb.transport_header().is_some());
    debug_assert!(skb.network_header().is_none());

    let len = skb.len();
    let mut pseudo = alloc::vec::Vec::with_capacity(12 + len);
    pseudo.extend_from_slice(&src_ip.0);
    pseudo.extend_from_slice(&dest_ip.0);
    pseudo.push(0);
    pseudo.push(protocol);
    pseudo.extend_from_slice(&(len as u16).to_be_bytes());
    skb.with_data(|data| pseudo.extend_from_slice(data));
    internet_checksum(&pseudo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn header_round_trips_fields() {
        let skb = Skb::alloc(HEADER_LEN + 4);
        skb.reserve(0).ok();
        skb.put(HEADER_LEN + 4).expect("put should succeed");
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);
        skb.with_data_mut(|data| write_header(&mut data[..HEADER_LEN], (HEADER_LEN + 4) as u16, IPPROTO_UDP, src, dest));
        let header = skb.with_data(|data| Header::parse(&data[..HEADER_LEN]));
        assert_eq!(header.src_ip, src);
        assert_eq!(header.dest_ip, dest);
        assert_eq!(header.protocol, IPPROTO_UDP);
        assert_eq!(header.total_length, (HEADER_LEN + 4) as u16);
    }

    #[test_case]
    fn written_header_checksum_is_valid() {
        let skb = Skb::alloc(HEADER_LEN);
        skb.put(HEADER_LEN).expect("put should succeed");
        skb.with_data_mut(|data| {
            write_header(data, HEADER_LEN as u16, IPPROTO_TCP, Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8));
        });
        skb.with_data(|data| assert_eq!(internet_checksum(data), 0));
    }
}
