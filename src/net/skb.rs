//! Socket kernel buffer (spec 4.5): a fixed-capacity byte buffer with
//! `head`/`data`/`tail`/`end` offsets, grounded on
//! `original_source/kernel/skb.c` and `skb.h`.
//!
//! The original's `refcnt` field becomes [`alloc::rc::Rc`]: cloning a
//! [`Skb`] handle is `skb_retain`, and dropping the last handle is
//! `skb_release`. There is no dynamic reallocation; the maximum size must
//! be known at [`Skb::alloc`] time, matching the original's flexible
//! array member.

use alloc::rc::Rc;
use alloc::vec;
use core::cell::{Ref, RefCell, RefMut};

use crate::error::{KernelError, KResult};

struct Inner {
    buf: alloc::vec::Vec<u8>,
    head: usize,
    data: usize,
    tail: usize,
    end: usize,
    mac_header: Option<usize>,
    network_header: Option<usize>,
    transport_header: Option<usize>,
}

/// A reference-counted handle to one socket kernel buffer. Clone to
/// retain, drop to release.
#[derive(Clone)]
pub struct Skb(Rc<RefCell<Inner>>);

impl Skb {
    /// Allocates a new SKB with `size` bytes of total capacity. `data`,
    /// `tail` and `head` all start at offset 0 (no headroom reserved).
    #[must_use]
    pub fn alloc(size: usize) -> Self {
        let inner = Inner {
            buf: vec![0u8; size],
            head: 0,
            data: 0,
            tail: 0,
            end: size,
            mac_header: None,
            network_header: None,
            transport_header: None,
        };
        Self(Rc::new(RefCell::new(inner)))
    }

    /// Creates an independent deep copy with its own backing buffer and a
    /// fresh refcount of 1.
    #[must_use]
    pub fn clone_data(&self) -> Self {
        let src = self.0.borrow();
        let inner = Inner {
            buf: src.buf.clone(),
            head: src.head,
            data: src.data,
            tail: src.tail,
            end: src.end,
            mac_header: src.mac_header,
            network_header: src.network_header,
            transport_header: src.transport_header,
        };
        Self(Rc::new(RefCell::new(inner)))
    }

    /// Number of handles currently referencing this buffer (for tests and
    /// diagnostics; mirrors `skb_t::refcnt`).
    #[must_use]
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    fn borrow(&self) -> Ref<'_, Inner> {
        self.0.borrow()
    }

    fn borrow_mut(&self) -> RefMut<'_, Inner> {
        self.0.borrow_mut()
    }

    /// Current data length, `tail - data`.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.borrow();
        inner.tail - inner.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available between `head` and `data`.
    #[must_use]
    pub fn headroom(&self) -> usize {
        let inner = self.borrow();
        inner.data - inner.head
    }

    /// Bytes available between `tail` and `end`.
    #[must_use]
    pub fn tailroom(&self) -> usize {
        let inner = self.borrow();
        inner.end - inner.tail
    }

    /// Reserves `len` bytes of headroom by advancing `data`/`tail`
    /// together. Only valid immediately after allocation, before any data
    /// has been pushed or put.
    pub fn reserve(&self, len: usize) -> KResult<()> {
        let mut inner = self.borrow_mut();
        if inner.data != inner.tail || inner.tail + len > inner.end {
            return Err(KernelError::InvalidArgument);
        }
        inner.data += len;
        inner.tail += len;
        Ok(())
    }

    /// Pushes `len` bytes at the start of the data section, returning the
    /// index of the newly exposed region within the buffer.
    pub fn push(&self, len: usize) -> KResult<usize> {
        let mut inner = self.borrow_mut();
        if len > inner.data - inner.head {
            return Err(KernelError::InvalidArgument);
        }
        inner.data -= len;
        Ok(inner.data)
    }

    /// Returns whether `len` bytes can be pulled off the front.
    #[must_use]
    pub fn may_pull(&self, len: usize) -> bool {
        self.len() >= len
    }

    /// Pops `len` bytes off the front of the data section, returning the
    /// index the popped region started at.
    pub fn pull(&self, len: usize) -> KResult<usize> {
        let mut inner = self.borrow_mut();
        if len > inner.tail - inner.data {
            return Err(KernelError::InvalidArgument);
        }
        let start = inner.data;
        inner.data += len;
        Ok(start)
    }

    /// Appends `len` bytes to the end of the data section, returning the
    /// index of the newly exposed region.
    pub fn put(&self, len: usize) -> KResult<usize> {
        let mut inner = self.borrow_mut();
        if len > inner.end - inner.tail {
            return Err(KernelError::InvalidArgument);
        }
        let start = inner.tail;
        inner.tail += len;
        Ok(start)
    }

    /// Removes bytes from the end of the data section so its length
    /// becomes `len`.
    pub fn trim(&self, len: usize) -> KResult<()> {
        let mut inner = self.borrow_mut();
        let current = inner.tail - inner.data;
        if len > current {
            return Err(KernelError::InvalidArgument);
        }
        inner.tail = inner.data + len;
        Ok(())
    }

    /// Copies `bytes` into the data section starting at `data + offset`.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> KResult<()> {
        let mut inner = self.borrow_mut();
        let start = inner.data + offset;
        let end = start + bytes.len();
        if end > inner.tail {
            return Err(KernelError::InvalidArgument);
        }
        inner.buf[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Runs `f` with a read-only view of the current data section.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.borrow();
        f(&inner.buf[inner.data..inner.tail])
    }

    /// Runs `f` with a mutable view of the current data section.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.borrow_mut();
        let (data, tail) = (inner.data, inner.tail);
        f(&mut inner.buf[data..tail])
    }

    fn set_header(&self, which: impl FnOnce(&mut Inner, Option<usize>)) {
        let mut inner = self.borrow_mut();
        let data = inner.data;
        which(&mut inner, Some(data));
    }

    pub fn set_mac_header(&self) {
        self.set_header(|inner, v| inner.mac_header = v);
    }

    pub fn set_network_header(&self) {
        self.set_header(|inner, v| inner.network_header = v);
    }

    pub fn set_transport_header(&self) {
        self.set_header(|inner, v| inner.transport_header = v);
    }

    pub fn clear_mac_header(&self) {
        self.borrow_mut().mac_header = None;
    }

    pub fn clear_network_header(&self) {
        self.borrow_mut().network_header = None;
    }

    pub fn clear_transport_header(&self) {
        self.borrow_mut().transport_header = None;
    }

    #[must_use]
    pub fn mac_header(&self) -> Option<usize> {
        self.borrow().mac_header
    }

    #[must_use]
    pub fn network_header(&self) -> Option<usize> {
        self.borrow().network_header
    }

    #[must_use]
    pub fn transport_header(&self) -> Option<usize> {
        self.borrow().transport_header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn reserve_then_put_tracks_headroom_and_len() {
        let skb = Skb::alloc(256);
        skb.reserve(32).expect("reserve should succeed");
        assert_eq!(skb.headroom(), 32);
        skb.put(64).expect("put should succeed");
        assert_eq!(skb.len(), 64);
    }

    #[test_case]
    fn push_then_pull_round_trips() {
        let skb = Skb::alloc(256);
        skb.reserve(32).expect("reserve should succeed");
        skb.put(20).expect("put should succeed");
        skb.push(14).expect("push should succeed");
        assert_eq!(skb.len(), 34);
        skb.pull(14).expect("pull should succeed");
        assert_eq!(skb.len(), 20);
    }

    #[test_case]
    fn clone_retains_and_release_drops_refcount() {
        let a = Skb::alloc(64);
        assert_eq!(a.refcount(), 1);
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(b);
        assert_eq!(a.refcount(), 1);
    }

    #[test_case]
    fn clone_data_is_independent_buffer() {
        let a = Skb::alloc(64);
        a.put(4).expect("put should succeed");
        a.write_at(0, &[1, 2, 3, 4]).expect("write should succeed");
        let b = a.clone_data();
        b.write_at(0, &[9, 9, 9, 9]).expect("write should succeed");
        a.with_data(|data| assert_eq!(data, &[1, 2, 3, 4]));
        b.with_data(|data| assert_eq!(data, &[9, 9, 9, 9]));
    }

    #[test_case]
    fn pull_more_than_available_fails() {
        let skb = Skb::alloc(64);
        skb.put(4).expect("put should succeed");
        assert_eq!(skb.pull(5), Err(KernelError::InvalidArgument));
    }
}
