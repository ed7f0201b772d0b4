//! Bridges a socket core handle ([`Socket`]) into the generic
//! file-descriptor machinery (spec 4.7/4.8), the same way
//! [`crate::tty::terminal::TerminalStream`] bridges a virtual terminal.
//! `read`/`write`/`close` dispatch to [`crate::net::tcp`] or
//! [`crate::net::udp`] by the socket's own [`SockType`].

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{KernelError, KResult};
use crate::fs::file::{mode, FileObject, FileOps, SeekWhence};
use crate::net::addr::Ipv4Addr;
use crate::net::socket::{SockType, Socket, SocketAddr};
use crate::net::{tcp, udp};

pub struct SocketStream {
    socket: Socket,
}

impl SocketStream {
    #[must_use]
    pub const fn new(socket: Socket) -> Self {
        Self { socket }
    }

    #[must_use]
    pub const fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl FileOps for SocketStream {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        recvfrom(&self.socket, buf).map(|(n, _)| n)
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        match self.socket.sock_type() {
            SockType::Tcp => tcp::sendto(&self.socket, buf),
            SockType::Udp => {
                if !self.socket.is_connected() {
                    return Err(KernelError::InvalidArgument);
                }
                let remote = self.socket.remote();
                udp::sendto(&self.socket, buf, remote.ip, remote.port)
            }
        }
    }

    fn seek(&self, _offset: i64, _whence: SeekWhence) -> KResult<u64> {
        Err(KernelError::InvalidArgument)
    }

    fn close(&self) {
        match self.socket.sock_type() {
            SockType::Tcp => {
                let _ = tcp::close(&self.socket);
            }
            SockType::Udp => udp::close(&self.socket),
        }
    }

    fn bind(&self, ip: [u8; 4], port: u16) -> KResult<()> {
        self.socket.bind(Ipv4Addr(ip), port)
    }

    fn connect(&self, ip: [u8; 4], port: u16) -> KResult<()> {
        match self.socket.sock_type() {
            SockType::Tcp => tcp::connect(&self.socket, Ipv4Addr(ip), port),
            SockType::Udp => {
                if !self.socket.is_bound() {
                    self.socket.bind(Ipv4Addr::ANY, 0)?;
                }
                self.socket.set_remote(SocketAddr { ip: Ipv4Addr(ip), port });
                Ok(())
            }
        }
    }

    fn listen(&self) -> KResult<()> {
        match self.socket.sock_type() {
            SockType::Tcp => tcp::listen(&self.socket),
            SockType::Udp => Err(KernelError::InvalidArgument),
        }
    }

    fn accept(&self) -> KResult<FileObject> {
        match self.socket.sock_type() {
            SockType::Tcp => {
                let child = tcp::accept(&self.socket)?;
                Ok(FileObject::new(Box::new(Self::new(child)), mode::RDWR, None))
            }
            SockType::Udp => Err(KernelError::InvalidArgument),
        }
    }

    fn local_addr(&self) -> KResult<([u8; 4], u16)> {
        let addr = self.socket.local();
        Ok((addr.ip.0, addr.port))
    }

    fn remote_addr(&self) -> KResult<([u8; 4], u16)> {
        let addr = self.socket.remote();
        Ok((addr.ip.0, addr.port))
    }

    fn recvfrom(&self, buf: &mut [u8]) -> KResult<(usize, [u8; 4], u16)> {
        let (n, addr) = recvfrom(&self.socket, buf)?;
        Ok((n, addr.ip.0, addr.port))
    }

    fn sendto(&self, buf: &[u8], ip: [u8; 4], port: u16) -> KResult<usize> {
        sendto(&self.socket, buf, SocketAddr { ip: Ipv4Addr(ip), port })
    }

    fn shutdown(&self) -> KResult<()> {
        match self.socket.sock_type() {
            SockType::Tcp => tcp::close(&self.socket),
            SockType::Udp => Ok(()),
        }
    }
}

/// Receives one payload and its sender's address, used both by
/// [`SocketStream::read`] and directly by the `recvfrom` syscall (which
/// additionally reports the peer address to the caller).
pub fn recvfrom(socket: &Socket, buf: &mut [u8]) -> KResult<(usize, SocketAddr)> {
    match socket.sock_type() {
        SockType::Tcp => {
            let data: Vec<u8> = tcp::recvfrom(socket)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((n, socket.remote()))
        }
        SockType::Udp => udp::recvfrom(socket, buf),
    }
}

/// Sends `buf` to `to`, used directly by the `sendto` syscall. A connected
/// TCP socket ignores `to` (its peer was fixed by `connect`/`accept`),
/// matching the original's "sendto on a stream socket behaves like write".
pub fn sendto(socket: &Socket, buf: &[u8], to: SocketAddr) -> KResult<usize> {
    match socket.sock_type() {
        SockType::Tcp => tcp::sendto(socket, buf),
        SockType::Udp => udp::sendto(socket, buf, to.ip, to.port),
    }
}
