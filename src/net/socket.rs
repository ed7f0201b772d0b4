//! Socket core (spec 4.8), grounded on `original_source/kernel/socket.c`/`.h`.
//!
//! `net_sock_t`'s `void *private` becomes a per-protocol side table
//! (`net::tcp`'s PCB table, `net::udp`'s datagram-queue table) keyed by
//! [`SocketId`], rather than an embedded enum — this keeps `net::tcp` and
//! `net::udp` from needing to know about each other's state layout, the
//! same separation the original gets from its `sock_ops_t` vtable.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{EPHEMERAL_PORT_END, EPHEMERAL_PORT_START};
use crate::error::{KernelError, KResult};
use crate::net::addr::Ipv4Addr;
use crate::net::device;

/// Transport protocol a socket was created for. Mirrors `SOCK_TCP`/`SOCK_UDP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp,
    Udp,
}

/// An (IP, port) pair. Mirrors `sock_addr_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Opaque identifier stable for the socket's lifetime; used by `net::tcp`
/// and `net::udp` to key their own per-protocol state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

struct Core {
    id: SocketId,
    sock_type: SockType,
    local: SocketAddr,
    remote: SocketAddr,
    bound: bool,
    connected: bool,
    listening: bool,
}

/// A reference-counted handle to one socket's core state. Mirrors
/// `net_sock_t` plus its manual refcount.
#[derive(Clone)]
pub struct Socket(Rc<RefCell<Core>>);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref REGISTRY: Mutex<Vec<Socket>> = Mutex::new(Vec::new());
}

impl Socket {
    /// Allocates a new, unbound socket of the given type and registers
    /// it globally so lookups by address can find it.
    #[must_use]
    pub fn alloc(sock_type: SockType) -> Self {
        let id = SocketId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let sock = Self(Rc::new(RefCell::new(Core {
            id,
            sock_type,
            local: SocketAddr::default(),
            remote: SocketAddr::default(),
            bound: false,
            connected: false,
            listening: false,
        })));
        REGISTRY.lock().push(sock.clone());
        sock
    }

    #[must_use]
    pub fn id(&self) -> SocketId {
        self.0.borrow().id
    }

    #[must_use]
    pub fn sock_type(&self) -> SockType {
        self.0.borrow().sock_type
    }

    #[must_use]
    pub fn local(&self) -> SocketAddr {
        self.0.borrow().local
    }

    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.0.borrow().remote
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.0.borrow().bound
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.0.borrow().listening
    }

    pub fn set_listening(&self, listening: bool) {
        self.0.borrow_mut().listening = listening;
    }

    pub fn set_remote(&self, remote: SocketAddr) {
        let mut core = self.0.borrow_mut();
        core.remote = remote;
        core.connected = true;
    }

    /// Binds directly to `local`, bypassing the collision check in
    /// [`Socket::bind`]. Used when spawning a TCP connection accepted on a
    /// listening socket: the child legitimately shares the listener's
    /// `(ip, port)`, distinguished instead by its remote address.
    pub(crate) fn adopt_local(&self, local: SocketAddr) {
        let mut core = self.0.borrow_mut();
        core.bound = true;
        core.local = local;
    }

    /// Binds to `(ip, port)`. `ip == ANY` binds to every interface;
    /// `port == 0` picks a free ephemeral port. Fails if the IP has no
    /// matching interface, all ephemeral ports are in use, or the
    /// resolved address is already bound by a different socket of the
    /// same protocol.
    pub fn bind(&self, ip: Ipv4Addr, port: u16) -> KResult<()> {
        if ip != Ipv4Addr::ANY && device::with_interface_by_ip(ip, |_| ()).is_none() {
            return Err(KernelError::InvalidArgument);
        }

        let sock_type = self.sock_type();
        let port = if port == 0 {
            find_free_port(ip, sock_type).ok_or(KernelError::OutOfMemory)?
        } else {
            port
        };

        if let Some(existing) = find_by_local_addr(sock_type, ip, port) {
            if existing.id() != self.id() {
                return Err(KernelError::InvalidArgument);
            }
        }

        let mut core = self.0.borrow_mut();
        core.bound = true;
        core.local = SocketAddr { ip, port };
        Ok(())
    }

    /// Removes this socket from the global registry. Mirrors
    /// `socket_obj_free`; called once the last file descriptor
    /// referencing it is closed.
    pub fn release(&self) {
        REGISTRY.lock().retain(|s| s.id() != self.id());
    }
}

fn addr_matches(sock: &Socket, sock_type: SockType, local: SocketAddr, remote: Option<SocketAddr>) -> bool {
    let core = sock.0.borrow();
    if core.sock_type != sock_type {
        return false;
    }
    let local_ip_matches = core.local.ip == local.ip || core.local.ip == Ipv4Addr::ANY;
    if core.local.port != local.port || !local_ip_matches {
        return false;
    }
    match remote {
        Some(remote) => core.remote == remote,
        None => true,
    }
}

/// Finds the socket bound to `(ip, port)` for protocol `sock_type`, with
/// no regard for its remote endpoint. Mirrors `get_sock_by_local_addr`.
#[must_use]
pub fn find_by_local_addr(sock_type: SockType, ip: Ipv4Addr, port: u16) -> Option<Socket> {
    REGISTRY
        .lock()
        .iter()
        .find(|s| addr_matches(s, sock_type, SocketAddr { ip, port }, None))
        .cloned()
}

/// Finds the socket matching both the local and remote address exactly.
/// Mirrors `get_sock_by_addr`.
#[must_use]
pub fn find_by_addr(sock_type: SockType, local: SocketAddr, remote: SocketAddr) -> Option<Socket> {
    REGISTRY
        .lock()
        .iter()
        .find(|s| addr_matches(s, sock_type, local, Some(remote)))
        .cloned()
}

/// Finds the socket with the given opaque id, regardless of protocol or
/// binding state. Used by protocol side tables (e.g. `net::tcp`'s PCB
/// table) that only keep a [`SocketId`] around.
#[must_use]
pub fn find_by_id(id: SocketId) -> Option<Socket> {
    REGISTRY.lock().iter().find(|s| s.id() == id).cloned()
}

/// A small xorshift PRNG seeded from the monotonic clock, replacing the
/// original's Mersenne Twister (`mt19937.c`) for picking a starting
/// ephemeral port — any of the pack's PRNGs is overkill for a value that
/// only needs to avoid always starting the linear scan at the same port.
pub(crate) fn prng_next() -> u64 {
    static STATE: AtomicU64 = AtomicU64::new(0x2545_f491_4f6c_dd1d);
    let mut x = STATE.load(Ordering::Relaxed) ^ (crate::timer::now_ms().wrapping_add(1));
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    x
}

/// Finds a free ephemeral port for `(ip, sock_type)` by scanning
/// `[EPHEMERAL_PORT_START, EPHEMERAL_PORT_END]` starting from a
/// pseudo-random offset. Returns `None` if every port in range is in use.
fn find_free_port(ip: Ipv4Addr, sock_type: SockType) -> Option<u16> {
    let range = u64::from(EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) + 1;
    let start_offset = (prng_next() % range) as u16;
    let start_port = EPHEMERAL_PORT_START + start_offset;

    let mut port = start_port;
    loop {
        if find_by_local_addr(sock_type, ip, port).is_none() {
            return Some(port);
        }
        port = if port == EPHEMERAL_PORT_END {
            EPHEMERAL_PORT_START
        } else {
            port + 1
        };
        if port == start_port {
            return None;
        }
    }
}

/// Clears the socket registry. Test-only.
#[cfg(test)]
pub fn reset_for_test() {
    REGISTRY.lock().clear();
}

#[cfg(test)]
impl SocketId {
    /// Builds an arbitrary id for tests that exercise `net::tcp`'s PCB
    /// logic directly, without going through [`Socket::alloc`].
    pub fn for_test(n: u64) -> Self {
        Self(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn bind_to_explicit_port_succeeds_once() {
        reset_for_test();
        let a = Socket::alloc(SockType::Tcp);
        a.bind(Ipv4Addr::ANY, 8080).expect("first bind should succeed");
        let b = Socket::alloc(SockType::Tcp);
        assert_eq!(b.bind(Ipv4Addr::ANY, 8080), Err(KernelError::InvalidArgument));
    }

    #[test_case]
    fn bind_to_zero_port_picks_distinct_ephemeral_ports() {
        reset_for_test();
        let a = Socket::alloc(SockType::Udp);
        a.bind(Ipv4Addr::ANY, 0).expect("bind should succeed");
        let b = Socket::alloc(SockType::Udp);
        b.bind(Ipv4Addr::ANY, 0).expect("bind should succeed");
        assert_ne!(a.local().port, b.local().port);
        assert!(a.local().port >= EPHEMERAL_PORT_START);
    }

    #[test_case]
    fn different_protocols_can_share_a_port() {
        reset_for_test();
        let tcp = Socket::alloc(SockType::Tcp);
        tcp.bind(Ipv4Addr::ANY, 9000).expect("tcp bind should succeed");
        let udp = Socket::alloc(SockType::Udp);
        assert!(udp.bind(Ipv4Addr::ANY, 9000).is_ok());
    }

    #[test_case]
    fn release_removes_from_registry() {
        reset_for_test();
        let a = Socket::alloc(SockType::Tcp);
        a.bind(Ipv4Addr::ANY, 7000).expect("bind should succeed");
        a.release();
        let b = Socket::alloc(SockType::Tcp);
        assert!(b.bind(Ipv4Addr::ANY, 7000).is_ok());
    }
}
