//! Layer-2/3 device and interface registry, grounded on
//! `original_source/kernel/net.c`/`net.h`.
//!
//! `net_dev_t`'s function pointer becomes the [`NetDevice`] trait object;
//! `net_iface_t` becomes [`Interface`]. The registry is a global
//! `Vec<Interface>` behind a `spin::Mutex`, matching the synchronization
//! style of every other kernel singleton in this crate.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KResult};
use crate::net::addr::{MacAddr, Ipv4Addr};
use crate::net::skb::Skb;

/// A layer-2 Ethernet-capable device. The one concrete implementation in
/// this crate is [`crate::net::loopback::Loopback`]; a real NIC driver is
/// an explicit Non-goal collaborator.
pub trait NetDevice {
    fn name(&self) -> &str;
    fn mac_addr(&self) -> MacAddr;
    /// Transmits a fully-formed Ethernet frame.
    fn send_mac_skb(&self, skb: &Skb) -> KResult<()>;
}

/// A layer-3 IP interface bound to (at most) one [`NetDevice`].
pub struct Interface {
    pub name: String,
    pub subnet_mask: Ipv4Addr,
    pub ip_addr: Ipv4Addr,
    pub gateway_addr: Ipv4Addr,
    pub dev: Option<Rc<dyn NetDevice>>,
}

lazy_static! {
    static ref INTERFACES: Mutex<Vec<Interface>> = Mutex::new(Vec::new());
}

/// Registers a new interface. Mirrors `net_register_interface`.
pub fn register_interface(iface: Interface) {
    INTERFACES.lock().push(iface);
}

/// Runs `f` with the interface whose local IP is `ip`, if any. Mirrors
/// `net_find`.
pub fn with_interface_by_ip<R>(ip: Ipv4Addr, f: impl FnOnce(&Interface) -> R) -> Option<R> {
    INTERFACES.lock().iter().find(|i| i.ip_addr == ip).map(f)
}

/// Runs `f` with the interface bound to the device named `dev_name`, if
/// any. Mirrors `net_get_interface`.
pub fn with_interface_by_device<R>(dev_name: &str, f: impl FnOnce(&Interface) -> R) -> Option<R> {
    INTERFACES
        .lock()
        .iter()
        .find(|i| i.dev.as_ref().is_some_and(|d| d.name() == dev_name))
        .map(f)
}

/// Runs `f` with the interface named `iface_name`, if any.
pub fn with_interface_by_name<R>(iface_name: &str, f: impl FnOnce(&Interface) -> R) -> Option<R> {
    INTERFACES.lock().iter().find(|i| i.name == iface_name).map(f)
}

/// Finds the interface that routes to `dest`, and the next-hop IP to
/// resolve at the link layer (the gateway if `dest` is off-subnet,
/// otherwise `dest` itself). Mirrors `net_route`.
#[must_use]
pub fn route(dest: Ipv4Addr) -> Option<(String, Ipv4Addr)> {
    let interfaces = INTERFACES.lock();
    let iface = interfaces
        .iter()
        .find(|i| i.ip_addr.same_subnet(dest, i.subnet_mask))
        .or_else(|| interfaces.iter().find(|i| i.gateway_addr != Ipv4Addr::ANY))?;
    let neigh = if iface.ip_addr.same_subnet(dest, iface.subnet_mask) {
        dest
    } else {
        iface.gateway_addr
    };
    Some((iface.name.clone(), neigh))
}

/// Clears every registered interface. Test-only: production boot code
/// never needs to undo interface registration.
#[cfg(test)]
pub fn reset_for_test() {
    INTERFACES.lock().clear();
}

/// Errors common to every layer of the network stack when a lookup fails.
pub const NO_ROUTE: KernelError = KernelError::NotFound;
