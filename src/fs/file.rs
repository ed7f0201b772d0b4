//! File objects and the per-process descriptor table (spec 4.7), grounded
//! on `original_source/kernel/file.c`/`file.h`.
//!
//! `file_obj_t`'s `fd_table[type]` vtable + manual refcount becomes a
//! `Box<dyn FileOps>` behind an `Rc<RefCell<_>>`: Rust's `Drop` runs exactly
//! when the last `Rc` clone disappears, so [`close`](FileOps::close) needs
//! no explicit refcount bookkeeping by callers — `file_obj_release`'s "free
//! when count hits zero" is just what [`Drop for Inner`] already does.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

use crate::config::MAX_FILES;
use crate::error::{KernelError, KResult};
use crate::fs::inode::{self, InodeId};

/// `open()`'s `flags` argument and the bits `fcntl` can read back. Mirrors
/// `O_*` in `file.h`.
pub mod mode {
    pub const ACCESS_MASK: u32 = 0x3;
    pub const RDONLY: u32 = 0x0;
    pub const WRONLY: u32 = 0x1;
    pub const RDWR: u32 = 0x2;
    pub const CREAT: u32 = 0x0100;
    pub const TRUNC: u32 = 0x0200;
    pub const APPEND: u32 = 0x0400;
    pub const NONBLOCK: u32 = 0x0800;
}

/// Where a `seek` is measured from. Mirrors `SEEK_SET`/`SEEK_CUR`/`SEEK_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

/// The operations a concrete stream type implements. Every method defaults
/// to `InvalidArgument`, matching the original's convention that a
/// `sock_ops_t` slot left null fails the syscall rather than panicking.
pub trait FileOps {
    fn read(&self, _buf: &mut [u8]) -> KResult<usize> {
        Err(KernelError::InvalidArgument)
    }

    fn write(&self, _buf: &[u8]) -> KResult<usize> {
        Err(KernelError::InvalidArgument)
    }

    fn ioctl(&self, _request: u32, _arg: usize) -> KResult<usize> {
        Err(KernelError::InvalidArgument)
    }

    fn seek(&self, _offset: i64, _whence: SeekWhence) -> KResult<u64> {
        Err(KernelError::InvalidArgument)
    }

    fn truncate(&self, _len: u64) -> KResult<()> {
        Err(KernelError::InvalidArgument)
    }

    fn stat(&self) -> KResult<FileStat> {
        Err(KernelError::InvalidArgument)
    }

    /// Runs once, when the last descriptor referencing this file object is
    /// dropped. Default no-op; streams that own a resource (an inode, a
    /// socket) override it.
    fn close(&self) {}

    // The methods below only `Socket`-backed streams implement; every other
    // stream keeps the default. Addresses are passed as raw
    // `([u8; 4], u16)` IPv4/port pairs rather than a `net` module type, so
    // this generic fd layer doesn't need to depend on the networking stack.

    fn bind(&self, _ip: [u8; 4], _port: u16) -> KResult<()> {
        Err(KernelError::InvalidArgument)
    }

    fn connect(&self, _ip: [u8; 4], _port: u16) -> KResult<()> {
        Err(KernelError::InvalidArgument)
    }

    fn listen(&self) -> KResult<()> {
        Err(KernelError::InvalidArgument)
    }

    fn accept(&self) -> KResult<FileObject> {
        Err(KernelError::InvalidArgument)
    }

    fn local_addr(&self) -> KResult<([u8; 4], u16)> {
        Err(KernelError::InvalidArgument)
    }

    fn remote_addr(&self) -> KResult<([u8; 4], u16)> {
        Err(KernelError::InvalidArgument)
    }

    fn recvfrom(&self, _buf: &mut [u8]) -> KResult<(usize, [u8; 4], u16)> {
        Err(KernelError::InvalidArgument)
    }

    fn sendto(&self, _buf: &[u8], _ip: [u8; 4], _port: u16) -> KResult<usize> {
        Err(KernelError::InvalidArgument)
    }

    fn shutdown(&self) -> KResult<()> {
        Err(KernelError::InvalidArgument)
    }
}

/// Minimal `stat()` result (spec 4.7): enough for a shell's `ls`/`fstat`
/// equivalents without a full POSIX `struct stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
}

struct Inner {
    ops: Box<dyn FileOps>,
    mode: u32,
    inode: Option<InodeId>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.ops.close();
        if let Some(id) = self.inode {
            // Backing-data reclaim, if any, is the concrete stream's own
            // close(); this just drops the inode's last reference.
            let _ = inode::release(id);
        }
    }
}

/// A reference-counted handle to one open file. Mirrors `file_obj_t *`.
/// Cloning is a descriptor-table `dup`; the underlying stream's
/// [`FileOps::close`] runs when the last clone is dropped.
#[derive(Clone)]
pub struct FileObject(Rc<RefCell<Inner>>);

impl FileObject {
    /// Wraps a concrete stream with the given open mode. If `inode` is
    /// given, it is retained for the life of this file object's underlying
    /// chain of clones (released once, on final drop).
    #[must_use]
    pub fn new(ops: Box<dyn FileOps>, mode: u32, inode: Option<InodeId>) -> Self {
        Self(Rc::new(RefCell::new(Inner { ops, mode, inode })))
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        self.0.borrow().mode
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        matches!(self.mode() & mode::ACCESS_MASK, mode::WRONLY | mode::RDWR)
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        matches!(self.mode() & mode::ACCESS_MASK, mode::RDONLY | mode::RDWR)
    }

    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        self.mode() & mode::NONBLOCK != 0
    }

    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        if !self.is_readable() {
            return Err(KernelError::PermissionDenied);
        }
        self.0.borrow().ops.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        if !self.is_writable() {
            return Err(KernelError::PermissionDenied);
        }
        self.0.borrow().ops.write(buf)
    }

    pub fn ioctl(&self, request: u32, arg: usize) -> KResult<usize> {
        self.0.borrow().ops.ioctl(request, arg)
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> KResult<u64> {
        self.0.borrow().ops.seek(offset, whence)
    }

    pub fn truncate(&self, len: u64) -> KResult<()> {
        if !self.is_writable() {
            return Err(KernelError::PermissionDenied);
        }
        self.0.borrow().ops.truncate(len)
    }

    pub fn stat(&self) -> KResult<FileStat> {
        self.0.borrow().ops.stat()
    }

    pub fn bind(&self, ip: [u8; 4], port: u16) -> KResult<()> {
        self.0.borrow().ops.bind(ip, port)
    }

    pub fn connect(&self, ip: [u8; 4], port: u16) -> KResult<()> {
        self.0.borrow().ops.connect(ip, port)
    }

    pub fn listen(&self) -> KResult<()> {
        self.0.borrow().ops.listen()
    }

    pub fn accept(&self) -> KResult<FileObject> {
        self.0.borrow().ops.accept()
    }

    pub fn local_addr(&self) -> KResult<([u8; 4], u16)> {
        self.0.borrow().ops.local_addr()
    }

    pub fn remote_addr(&self) -> KResult<([u8; 4], u16)> {
        self.0.borrow().ops.remote_addr()
    }

    pub fn recvfrom(&self, buf: &mut [u8]) -> KResult<(usize, [u8; 4], u16)> {
        self.0.borrow().ops.recvfrom(buf)
    }

    pub fn sendto(&self, buf: &[u8], ip: [u8; 4], port: u16) -> KResult<usize> {
        self.0.borrow().ops.sendto(buf, ip, port)
    }

    pub fn shutdown(&self) -> KResult<()> {
        self.0.borrow().ops.shutdown()
    }
}

/// Per-process open file descriptor table. Mirrors the PCB's `fd_table`
/// array plus `file_desc_bind`/`unbind`/`rebind`.
pub struct DescriptorTable {
    slots: [Option<FileObject>; MAX_FILES],
}

impl DescriptorTable {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|_| None) }
    }

    /// Binds `obj` to `fd` if given and free, or to the lowest free slot if
    /// `fd` is `None`. Returns the chosen descriptor number. Mirrors
    /// `file_desc_bind`.
    pub fn bind(&mut self, fd: Option<usize>, obj: FileObject) -> KResult<usize> {
        let slot = match fd {
            Some(fd) => {
                if fd >= MAX_FILES || self.slots[fd].is_some() {
                    return Err(KernelError::InvalidArgument);
                }
                fd
            }
            None => self
                .slots
                .iter()
                .position(Option::is_none)
                .ok_or(KernelError::OutOfDescriptors)?,
        };
        self.slots[slot] = Some(obj);
        Ok(slot)
    }

    /// Atomically replaces whatever is bound at `fd` (dropping the old
    /// binding, which may trigger that file's close). Mirrors
    /// `file_desc_rebind`, used by `dup2`-style fd remapping.
    pub fn rebind(&mut self, fd: usize, obj: FileObject) -> KResult<()> {
        if fd >= MAX_FILES {
            return Err(KernelError::InvalidArgument);
        }
        self.slots[fd] = Some(obj);
        Ok(())
    }

    /// Drops the binding at `fd`, triggering close if this was the file's
    /// last reference. Mirrors `file_desc_unbind`.
    pub fn unbind(&mut self, fd: usize) -> KResult<()> {
        if fd >= MAX_FILES || self.slots[fd].is_none() {
            return Err(KernelError::InvalidArgument);
        }
        self.slots[fd] = None;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, fd: usize) -> Option<FileObject> {
        self.slots.get(fd).and_then(Clone::clone)
    }

    /// Deep-clones every live binding into a fresh table (an `Rc` clone
    /// per slot, i.e. a retain). Used by `fork` to give the child its own
    /// descriptor table sharing the same open files.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self { slots: core::array::from_fn(|i| self.slots[i].clone()) }
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc as StdRc;
    use core::cell::Cell;

    struct RecordingStream {
        closed: StdRc<Cell<bool>>,
    }

    impl FileOps for RecordingStream {
        fn read(&self, buf: &mut [u8]) -> KResult<usize> {
            buf.iter_mut().for_each(|b| *b = 0x42);
            Ok(buf.len())
        }

        fn close(&self) {
            self.closed.set(true);
        }
    }

    #[test_case]
    fn bind_picks_lowest_free_slot() {
        let mut table = DescriptorTable::new();
        let obj = FileObject::new(Box::new(RecordingStream { closed: StdRc::new(Cell::new(false)) }), mode::RDONLY, None);
        let fd = table.bind(None, obj.clone()).expect("bind should succeed");
        assert_eq!(fd, 0);
        let fd2 = table.bind(None, obj).expect("bind should succeed");
        assert_eq!(fd2, 1);
    }

    #[test_case]
    fn unbind_drops_last_reference_and_closes() {
        let mut table = DescriptorTable::new();
        let closed = StdRc::new(Cell::new(false));
        let obj = FileObject::new(Box::new(RecordingStream { closed: closed.clone() }), mode::RDONLY, None);
        let fd = table.bind(None, obj).expect("bind should succeed");
        assert!(!closed.get());
        table.unbind(fd).expect("unbind should succeed");
        assert!(closed.get(), "dropping the last file object clone must run close()");
    }

    #[test_case]
    fn write_to_read_only_file_is_denied() {
        let obj = FileObject::new(Box::new(RecordingStream { closed: StdRc::new(Cell::new(false)) }), mode::RDONLY, None);
        assert_eq!(obj.write(&[1, 2, 3]), Err(KernelError::PermissionDenied));
    }

    #[test_case]
    fn fork_shares_underlying_file_object() {
        let mut table = DescriptorTable::new();
        let closed = StdRc::new(Cell::new(false));
        let obj = FileObject::new(Box::new(RecordingStream { closed: closed.clone() }), mode::RDONLY, None);
        let fd = table.bind(None, obj).expect("bind should succeed");
        let child = table.fork();
        table.unbind(fd).expect("unbind should succeed");
        assert!(!closed.get(), "child's clone should keep the file alive");
        drop(child);
        assert!(closed.get());
    }
}
