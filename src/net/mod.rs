//! TCP/IP networking stack (spec 4.5-4.9), grounded on
//! `original_source/kernel/{skb,net,arp,ip,loopback,socket,udp,tcp}.{c,h}`.
//!
//! Layering mirrors the original's include order: link-layer framing
//! (`ethernet`, `arp`) sits below `ip`, which dispatches up into the
//! transport protocols (`tcp`, `udp`) through the shared socket core.

pub mod addr;
pub mod arp;
pub mod device;
pub mod ethernet;
pub mod ip;
pub mod loopback;
pub mod skb;
pub mod socket;
pub mod stream;
pub mod tcp;
pub mod udp;

/// Brings up the interfaces that don't depend on a driver being probed
/// first. Real Ethernet interfaces are registered by their driver's own
/// init path via [`device::register_interface`].
pub fn init() {
    loopback::init();
}
