//! Boundary-tag kernel allocator (spec 4.4): `malloc`/`free`/`realloc`/
//! `calloc` over an implicit doubly-linked list of blocks, with two
//! sentinel blocks bounding the heap.
//!
//! This is a from-scratch model of the spec's allocator, operating over a
//! caller-supplied byte buffer. It is independent from Rust's
//! `#[global_allocator]`, which stays backed by `linked_list_allocator`
//! exactly as in the teacher crate (see `crate::allocator`) — the two
//! serve different roles, matching spec 4.3's note that "bootstrap does
//! not depend on an allocator that does not yet exist".

use core::mem::size_of;
use core::ptr::NonNull;

use crate::error::{KernelError, KResult};

/// Number of pointer-words blocks are aligned to.
const ALIGN: usize = size_of::<usize>() * 2;

const POISON_ALLOC: u32 = 0xba11_0ced;
const POISON_FREE: u32 = 0xdead_beef;

/// Packs a byte size and a used bit into one word. Sizes are always a
/// multiple of `ALIGN`, so the low bit is free to use as the used flag.
#[derive(Clone, Copy)]
struct Info(usize);

impl Info {
    const fn new(size: usize, used: bool) -> Self {
        Self(size | (used as usize))
    }

    const fn size(self) -> usize {
        self.0 & !1
    }

    const fn used(self) -> bool {
        self.0 & 1 != 0
    }
}

/// Header shared by every block (free or used).
#[repr(C)]
struct BlockHeader {
    prev_info: Info,
    curr_info: Info,
}

/// Extra fields present only while a block is free; laid out right after
/// [`BlockHeader`], inside the payload area.
#[repr(C)]
struct FreeLinks {
    prev_free: *mut BlockHeader,
    next_free: *mut BlockHeader,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const MIN_PAYLOAD: usize = size_of::<FreeLinks>();

/// A boundary-tag allocator over one contiguous buffer.
pub struct Kalloc {
    base: *mut u8,
    len: usize,
    free_list: *mut BlockHeader,
    poison: bool,
}

// SAFETY: `Kalloc` is only ever accessed through an external lock
// (`spin::Mutex` in the owning singleton); the raw pointers never escape
// a locked section.
unsafe impl Send for Kalloc {}

impl Kalloc {
    /// Builds an allocator over `buf`, installing two sentinel blocks (one
    /// at each end) and forming the middle into one free block.
    ///
    /// # Panics
    /// Panics if `buf` is too small to hold two sentinels and a minimum
    /// free block.
    pub fn new(buf: &'static mut [u8], poison: bool) -> Self {
        let len = buf.len();
        let base = buf.as_mut_ptr();
        assert!(
            len >= 2 * HEADER_SIZE + HEADER_SIZE + MIN_PAYLOAD,
            "kernel heap buffer too small"
        );

        // SAFETY: `base` points to `len` writable bytes owned by this
        // allocator for its entire lifetime ('static).
        unsafe {
            let bottom_sentinel = base.cast::<BlockHeader>();
            let top_sentinel = base.add(len - HEADER_SIZE).cast::<BlockHeader>();
            let middle = base.add(HEADER_SIZE).cast::<BlockHeader>();
            let middle_size = len - 3 * HEADER_SIZE;

            bottom_sentinel.write(BlockHeader {
                prev_info: Info::new(0, true),
                curr_info: Info::new(0, true),
            });
            middle.write(BlockHeader {
                prev_info: Info::new(0, true),
                curr_info: Info::new(middle_size, false),
            });
            top_sentinel.write(BlockHeader {
                prev_info: Info::new(middle_size, false),
                curr_info: Info::new(0, true),
            });

            let mut allocator = Self {
                base,
                len,
                free_list: core::ptr::null_mut(),
                poison,
            };
            allocator.free_list_push(middle);
            allocator
        }
    }

    fn align_up(size: usize) -> usize {
        (size + ALIGN - 1) & !(ALIGN - 1)
    }

    fn payload_ptr(block: *mut BlockHeader) -> *mut u8 {
        // SAFETY: caller guarantees `block` is a valid block header.
        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }

    fn block_of_payload(payload: *mut u8) -> *mut BlockHeader {
        // SAFETY: caller guarantees `payload` was returned by this allocator.
        unsafe { payload.sub(HEADER_SIZE).cast::<BlockHeader>() }
    }

    fn next_block(block: *mut BlockHeader) -> *mut BlockHeader {
        // SAFETY: caller guarantees `block` is not the top sentinel.
        unsafe {
            let size = (*block).curr_info.size();
            block.cast::<u8>().add(HEADER_SIZE + size).cast::<BlockHeader>()
        }
    }

    fn free_links(block: *mut BlockHeader) -> *mut FreeLinks {
        Self::payload_ptr(block).cast::<FreeLinks>()
    }

    fn free_list_push(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is a free block with room for `FreeLinks` in
        // its payload (guaranteed by `MIN_PAYLOAD`).
        unsafe {
            let links = Self::free_links(block);
            (*links).prev_free = core::ptr::null_mut();
            (*links).next_free = self.free_list;
            if !self.free_list.is_null() {
                (*Self::free_links(self.free_list)).prev_free = block;
            }
            self.free_list = block;
        }
    }

    fn free_list_remove(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is currently in the free list.
        unsafe {
            let links = Self::free_links(block);
            let prev = (*links).prev_free;
            let next = (*links).next_free;
            if prev.is_null() {
                self.free_list = next;
            } else {
                (*Self::free_links(prev)).next_free = next;
            }
            if !next.is_null() {
                (*Self::free_links(next)).prev_free = prev;
            }
        }
    }

    fn mark_used(&mut self, block: *mut BlockHeader, used: bool) {
        // SAFETY: `block` is a valid block header owned by this allocator.
        unsafe {
            let size = (*block).curr_info.size();
            (*block).curr_info = Info::new(size, used);
            let next = Self::next_block(block);
            (*next).prev_info = Info::new(size, used);
        }
    }

    /// Splits `block` (currently sized `old_size`) so its payload becomes
    /// exactly `new_size` bytes, if the remainder is large enough to form
    /// another free block. Returns the new free remainder block, if any.
    fn maybe_split(&mut self, block: *mut BlockHeader, new_size: usize) -> Option<*mut BlockHeader> {
        // SAFETY: `block` is a valid, currently-used-sized block.
        unsafe {
            let old_size = (*block).curr_info.size();
            let remainder = old_size.checked_sub(new_size)?;
            if remainder < HEADER_SIZE + MIN_PAYLOAD {
                return None;
            }

            let remainder_payload = remainder - HEADER_SIZE;
            (*block).curr_info = Info::new(new_size, true);

            let remainder_block = block.cast::<u8>().add(HEADER_SIZE + new_size).cast::<BlockHeader>();
            remainder_block.write(BlockHeader {
                prev_info: Info::new(new_size, true),
                curr_info: Info::new(remainder_payload, false),
            });

            let next = Self::next_block(remainder_block);
            (*next).prev_info = Info::new(remainder_payload, false);

            Some(remainder_block)
        }
    }

    /// Best-fit search of the free list.
    fn find_best_fit(&self, size: usize) -> Option<*mut BlockHeader> {
        let mut best: Option<*mut BlockHeader> = None;
        let mut best_size = usize::MAX;
        let mut cur = self.free_list;
        while !cur.is_null() {
            // SAFETY: `cur` is a live free-list node.
            let block_size = unsafe { (*cur).curr_info.size() };
            if block_size >= size && block_size < best_size {
                best = Some(cur);
                best_size = block_size;
            }
            // SAFETY: `cur` is a live free-list node.
            cur = unsafe { (*Self::free_links(cur)).next_free };
        }
        best
    }

    /// Coalesces `block` with its free neighbors, returning the
    /// (possibly merged) free block.
    fn coalesce(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        let mut block = block;
        // SAFETY: traversal stays within sentinel-bounded blocks.
        unsafe {
            let next = Self::next_block(block);
            if !(*next).curr_info.used() {
                self.free_list_remove(next);
                let merged_size = (*block).curr_info.size() + HEADER_SIZE + (*next).curr_info.size();
                (*block).curr_info = Info::new(merged_size, false);
                let after = Self::next_block(block);
                (*after).prev_info = Info::new(merged_size, false);
            }

            if !(*block).prev_info.used() {
                let prev_size = (*block).prev_info.size();
                let prev = block.cast::<u8>().sub(HEADER_SIZE + prev_size).cast::<BlockHeader>();
                self.free_list_remove(prev);
                let merged_size = prev_size + HEADER_SIZE + (*block).curr_info.size();
                (*prev).curr_info = Info::new(merged_size, false);
                let after = Self::next_block(prev);
                (*after).prev_info = Info::new(merged_size, false);
                block = prev;
            }
        }
        block
    }

    /// Allocates `size` bytes, rounded up to the data alignment.
    pub fn malloc(&mut self, size: usize) -> KResult<NonNull<u8>> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let size = Self::align_up(size.max(MIN_PAYLOAD));

        let block = match self.find_best_fit(size) {
            Some(b) => b,
            None => return Err(KernelError::OutOfMemory),
        };

        self.free_list_remove(block);
        self.maybe_split(block, size);
        self.mark_used(block, true);

        if self.poison {
            // SAFETY: the block was just sized to `size` bytes of payload.
            unsafe {
                core::ptr::write_bytes(Self::payload_ptr(block), (POISON_ALLOC & 0xff) as u8, size);
            }
        }

        // SAFETY: `payload_ptr` is non-null within the allocator's buffer.
        Ok(unsafe { NonNull::new_unchecked(Self::payload_ptr(block)) })
    }

    /// Frees a pointer previously returned by [`malloc`](Self::malloc) (or
    /// [`realloc`](Self::realloc)/[`calloc`](Self::calloc)).
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not already
    /// freed.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = Self::block_of_payload(ptr.as_ptr());
        // SAFETY: `block` is a valid, currently-used block per the
        // caller's contract.
        let size = unsafe { (*block).curr_info.size() };
        if self.poison {
            // SAFETY: `size` bytes of payload belong to this block.
            unsafe {
                core::ptr::write_bytes(ptr.as_ptr(), (POISON_FREE & 0xff) as u8, size);
            }
        }
        self.mark_used(block, false);
        let merged = self.coalesce(block);
        self.free_list_push(merged);
    }

    /// Reallocates `ptr` to `new_size` bytes, preserving contents up to
    /// `min(old_size, new_size)`.
    ///
    /// # Safety
    /// `ptr`, if non-null, must have been returned by this allocator.
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> KResult<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.malloc(new_size);
        };
        if new_size == 0 {
            // SAFETY: per this function's contract.
            unsafe { self.free(ptr) };
            return Err(KernelError::InvalidArgument);
        }

        let new_size = Self::align_up(new_size.max(MIN_PAYLOAD));
        let block = Self::block_of_payload(ptr.as_ptr());
        // SAFETY: `block` is valid and currently used.
        let old_size = unsafe { (*block).curr_info.size() };

        if new_size <= old_size {
            self.maybe_split(block, new_size);
            return Ok(ptr);
        }

        // Try to grow in place by absorbing a free next neighbor.
        // SAFETY: `block` is a valid used block.
        let next = unsafe { Self::next_block(block) };
        // SAFETY: `next` is a valid block header.
        let next_free = unsafe { !(*next).curr_info.used() };
        if next_free {
            // SAFETY: `next` is free and in the free list.
            let next_size = unsafe { (*next).curr_info.size() };
            if old_size + HEADER_SIZE + next_size >= new_size {
                self.free_list_remove(next);
                let merged = old_size + HEADER_SIZE + next_size;
                // SAFETY: `block` is a valid block header.
                unsafe {
                    (*block).curr_info = Info::new(merged, true);
                }
                self.maybe_split(block, new_size);
                self.mark_used(block, true);
                return Ok(ptr);
            }
        }

        // Fall back: allocate fresh, copy, free the old block.
        let new_ptr = self.malloc(new_size)?;
        let copy_len = old_size.min(new_size);
        // SAFETY: both regions are distinct allocator payloads of at
        // least `copy_len` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
            self.free(ptr);
        }
        Ok(new_ptr)
    }

    /// Allocates `n * size` zeroed bytes, checking for multiplication
    /// overflow.
    pub fn calloc(&mut self, n: usize, size: usize) -> KResult<NonNull<u8>> {
        let total = n.checked_mul(size).ok_or(KernelError::InvalidArgument)?;
        let ptr = self.malloc(total)?;
        // SAFETY: `malloc` guarantees at least `total` writable bytes.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0, total);
        }
        Ok(ptr)
    }

    /// Walks the implicit list from the bottom sentinel to the top,
    /// checking that `prev_info` always matches the previous block's
    /// `curr_info`, and that the free list contains exactly the blocks
    /// whose used bit is clear. Used by tests and debug assertions.
    #[must_use]
    pub fn check_invariants(&self) -> bool {
        // SAFETY: traversal is bounded by the buffer's sentinel blocks.
        unsafe {
            let bottom = self.base.cast::<BlockHeader>();
            let top = self.base.add(self.len - HEADER_SIZE).cast::<BlockHeader>();
            let mut cur = bottom;
            let mut prev_curr_info = (*bottom).curr_info;
            let mut free_count_walked = 0usize;
            loop {
                if cur != bottom && (*cur).prev_info.0 != prev_curr_info.0 {
                    return false;
                }
                if !(*cur).curr_info.used() && cur != bottom && cur != top {
                    free_count_walked += 1;
                }
                prev_curr_info = (*cur).curr_info;
                if cur == top {
                    break;
                }
                cur = Self::next_block(cur);
            }

            let mut free_count_listed = 0usize;
            let mut node = self.free_list;
            while !node.is_null() {
                free_count_listed += 1;
                node = (*Self::free_links(node)).next_free;
            }

            free_count_walked == free_count_listed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_heap(size: usize) -> Kalloc {
        let buf = alloc::vec![0u8; size].leak();
        Kalloc::new(buf, false)
    }

    #[test_case]
    fn malloc_free_round_trip() {
        let mut heap = new_test_heap(4096);
        let p = heap.malloc(64).expect("malloc should succeed");
        // SAFETY: `p` was returned by this allocator and not yet freed.
        unsafe { heap.free(p) };
        assert!(heap.check_invariants());
    }

    #[test_case]
    fn coalescing_merges_free_neighbors() {
        // Scenario from spec section 8: a=malloc(64); b=malloc(64);
        // c=malloc(64); free(a); free(c); free(b) must leave exactly one
        // free block.
        let mut heap = new_test_heap(4096);
        let a = heap.malloc(64).expect("malloc a");
        let b = heap.malloc(64).expect("malloc b");
        let c = heap.malloc(64).expect("malloc c");
        // SAFETY: each pointer was returned by this allocator and is
        // freed exactly once.
        unsafe {
            heap.free(a);
            heap.free(c);
            heap.free(b);
        }
        assert!(heap.check_invariants());

        let mut free_blocks = 0;
        let mut node = heap.free_list;
        while !node.is_null() {
            free_blocks += 1;
            // SAFETY: `node` is a live free-list entry.
            node = unsafe { (*Kalloc::free_links(node)).next_free };
        }
        assert_eq!(free_blocks, 1, "a,b,c freed in any order must coalesce to one block");
    }

    #[test_case]
    fn calloc_zeroes_memory() {
        let mut heap = new_test_heap(4096);
        let p = heap.calloc(8, 8).expect("calloc should succeed");
        // SAFETY: calloc guarantees 64 zeroed, writable bytes.
        let slice = unsafe { core::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test_case]
    fn realloc_grow_preserves_contents() {
        let mut heap = new_test_heap(4096);
        let p = heap.malloc(16).expect("malloc should succeed");
        // SAFETY: `p` has 16 writable bytes.
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xAB, 16);
        }
        // SAFETY: `p` was returned by this allocator.
        let grown = unsafe { heap.realloc(Some(p), 128).expect("realloc should succeed") };
        // SAFETY: `grown` has at least 16 valid bytes preserved from `p`.
        let slice = unsafe { core::slice::from_raw_parts(grown.as_ptr(), 16) };
        assert!(slice.iter().all(|&b| b == 0xAB));
    }
}
