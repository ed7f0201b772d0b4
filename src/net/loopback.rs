//! Loopback interface (supplemented feature B), grounded on
//! `original_source/kernel/loopback.c`.
//!
//! Lets TCP/UDP connect to `127.0.0.1` without a real Ethernet driver —
//! an explicit Non-goal collaborator. `send` queues a data clone instead
//! of delivering it inline, exactly as the original does, because the
//! stack's rx path is not re-entrant: delivering inline from inside
//! `ip::send` would recurse back into `ip::handle_rx` from within the
//! same non-reentrant call stack.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::KResult;
use crate::net::addr::Ipv4Addr;
use crate::net::device::{self, Interface};
use crate::net::ip;
use crate::net::skb::Skb;

pub const LOOPBACK_NAME: &str = "lo";

lazy_static! {
    static ref QUEUE: Mutex<Vec<Skb>> = Mutex::new(Vec::new());
}

/// Registers the `lo` interface at `127.0.0.1/8`.
pub fn init() {
    device::register_interface(Interface {
        name: alloc::string::String::from(LOOPBACK_NAME),
        subnet_mask: Ipv4Addr::new(255, 0, 0, 0),
        ip_addr: Ipv4Addr::LOOPBACK,
        gateway_addr: Ipv4Addr::ANY,
        dev: None,
    });
}

/// Queues a data-only clone of `skb` (network/transport headers cleared,
/// as there's no link layer to re-parse) for delivery at the end of the
/// current interrupt.
pub fn send(skb: &Skb) -> KResult<()> {
    debug_assert!(skb.mac_header().is_none());
    let clone = skb.clone_data();
    clone.clear_network_header();
    clone.clear_transport_header();
    QUEUE.lock().push(clone);
    Ok(())
}

/// Delivers any queued loopback packets. Called at the end of every
/// interrupt, mirroring `loopback_deliver`.
pub fn deliver() {
    loop {
        let pending = QUEUE.lock().pop();
        let Some(pending) = pending else { break };
        let _ = ip::handle_rx(Ipv4Addr::LOOPBACK, &pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::Ipv4Addr;

    #[test_case]
    fn send_queues_exactly_one_packet() {
        QUEUE.lock().clear();
        let skb = Skb::alloc(64);
        skb.put(10).expect("put should succeed");
        send(&skb).expect("send should succeed");
        assert_eq!(QUEUE.lock().len(), 1);
        QUEUE.lock().clear();
    }

    #[test_case]
    fn loopback_constants_match_rfc() {
        assert_eq!(Ipv4Addr::LOOPBACK, Ipv4Addr::new(127, 0, 0, 1));
    }
}
