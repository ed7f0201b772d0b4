//! UDP (supplemented feature B), grounded on `original_source/kernel/udp.c`/`.h`.
//!
//! `udp_sock_t`'s back-pointer/inbox/sleep-queue becomes a `Vec<UdpState>`
//! table keyed by [`SocketId`], matching the separation chosen in
//! `net::socket`.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KResult};
use crate::net::addr::Ipv4Addr;
use crate::net::device;
use crate::net::ip::{self, IPPROTO_UDP};
use crate::net::skb::Skb;
use crate::net::socket::{SockType, Socket, SocketAddr, SocketId};
use crate::serial_println;

const HEADER_LEN: usize = 8;

struct Datagram {
    data: alloc::vec::Vec<u8>,
    from: SocketAddr,
}

struct UdpState {
    id: SocketId,
    inbox: VecDeque<Datagram>,
}

lazy_static! {
    static ref TABLE: Mutex<Vec<UdpState>> = Mutex::new(Vec::new());
}

/// Allocates the per-socket inbox. Mirrors `udp_ctor`.
pub fn socket(sock: &Socket) {
    TABLE.lock().push(UdpState {
        id: sock.id(),
        inbox: VecDeque::new(),
    });
}

/// Releases the per-socket inbox. Mirrors `udp_dtor`.
pub fn close(sock: &Socket) {
    TABLE.lock().retain(|s| s.id != sock.id());
    sock.release();
}

/// Receives one datagram, truncating to `buf`'s length if it's shorter
/// than the datagram. Returns the number of bytes copied and the
/// sender's address.
pub fn recvfrom(sock: &Socket, buf: &mut [u8]) -> KResult<(usize, SocketAddr)> {
    let mut table = TABLE.lock();
    let state = table.iter_mut().find(|s| s.id == sock.id()).ok_or(KernelError::InvalidArgument)?;
    let Some(datagram) = state.inbox.pop_front() else {
        return Err(KernelError::WouldBlock);
    };
    let n = datagram.data.len().min(buf.len());
    buf[..n].copy_from_slice(&datagram.data[..n]);
    Ok((n, datagram.from))
}

/// Sends `buf` as one UDP datagram to `(ip, port)`, auto-binding the
/// socket to an ephemeral port first if it isn't already bound.
pub fn sendto(sock: &Socket, buf: &[u8], ip: Ipv4Addr, port: u16) -> KResult<usize> {
    if !sock.is_bound() {
        sock.bind(Ipv4Addr::ANY, 0)?;
    }

    let skb = Skb::alloc(HEADER_LEN + buf.len());
    skb.reserve(HEADER_LEN)?;
    skb.put(buf.len())?;
    skb.write_at(0, buf)?;
    skb.push(HEADER_LEN)?;
    skb.set_transport_header();

    let (_, neigh_ip) = device::route(ip).ok_or(KernelError::NotFound)?;
    let _ = neigh_ip;
    let src_ip = sock.local().ip;

    let total_len = skb.len() as u16;
    skb.with_data_mut(|data| {
        data[0..2].copy_from_slice(&sock.local().port.to_be_bytes());
        data[2..4].copy_from_slice(&port.to_be_bytes());
        data[4..6].copy_from_slice(&total_len.to_be_bytes());
        data[6..8].copy_from_slice(&0u16.to_be_bytes());
    });

    let mut checksum = ip::pseudo_checksum(&skb, src_ip, ip, IPPROTO_UDP);
    if checksum == 0 {
        checksum = 0xffff;
    }
    skb.with_data_mut(|data| data[6..8].copy_from_slice(&checksum.to_be_bytes()));

    skb.clear_transport_header();
    ip::send(&skb, ip, IPPROTO_UDP)?;
    Ok(buf.len())
}

/// Handles an incoming UDP datagram: validates length, finds the bound
/// socket, and appends to its inbox.
pub fn handle_rx(src_ip: Ipv4Addr, skb: &Skb) -> KResult<()> {
    if !skb.may_pull(HEADER_LEN) {
        serial_println!("UDP datagram too small");
        return Err(KernelError::InvalidArgument);
    }

    let (src_port, dest_port, length) = skb.with_data(|data| {
        (
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
            u16::from_be_bytes([data[4], data[5]]),
        )
    });

    if length as usize != skb.len() {
        serial_println!("UDP datagram size mismatch");
        return Err(KernelError::InvalidArgument);
    }

    skb.set_transport_header();
    skb.pull(HEADER_LEN)?;

    let Some(sock) = crate::net::socket::find_by_local_addr(SockType::Udp, Ipv4Addr::ANY, dest_port)
        .or_else(|| crate::net::socket::find_by_local_addr(SockType::Udp, src_ip, dest_port))
    else {
        serial_println!("No UDP socket for (IP, port), dropping datagram");
        return Err(KernelError::NotFound);
    };

    if sock.is_connected() {
        let remote = sock.remote();
        if remote.ip != src_ip || remote.port != src_port {
            serial_println!("UDP socket is connected to different addr, dropping datagram");
            return Err(KernelError::InvalidArgument);
        }
    }

    let mut table = TABLE.lock();
    if let Some(state) = table.iter_mut().find(|s| s.id == sock.id()) {
        let data = skb.with_data(alloc::borrow::ToOwned::to_owned);
        state.inbox.push_back(Datagram {
            data,
            from: SocketAddr { ip: src_ip, port: src_port },
        });
    }
    Ok(())
}

#[cfg(test)]
pub fn reset_for_test() {
    TABLE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn socket_then_close_drops_inbox() {
        reset_for_test();
        crate::net::socket::reset_for_test();
        let sock = Socket::alloc(SockType::Udp);
        socket(&sock);
        assert_eq!(TABLE.lock().len(), 1);
        close(&sock);
        assert_eq!(TABLE.lock().len(), 0);
    }

    #[test_case]
    fn recvfrom_with_no_data_would_block() {
        reset_for_test();
        crate::net::socket::reset_for_test();
        let sock = Socket::alloc(SockType::Udp);
        socket(&sock);
        let mut buf = [0u8; 16];
        assert_eq!(recvfrom(&sock, &mut buf), Err(KernelError::WouldBlock));
    }
}
