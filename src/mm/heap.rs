//! Heap descriptor (spec 4.3): a growable virtual region backed by an
//! explicit vector of physical frames, with copy-on-fork cloning.

use alloc::vec::Vec;

use crate::error::{KernelError, KResult};
use crate::mm::frame::{self, Frame};
use crate::mm::paging;

/// `[start_vaddr, end_vaddr)` with a logical byte size, a vector of
/// backing frames, and whether the region is currently mapped into the
/// address space.
pub struct Heap {
    start_vaddr: u64,
    end_vaddr: u64,
    user: bool,
    size: usize,
    cap_pages: usize,
    frames: Vec<Frame>,
    mapped: bool,
}

impl Heap {
    /// Creates an empty heap over `[start_vaddr, end_vaddr)`.
    #[must_use]
    pub fn new(start_vaddr: u64, end_vaddr: u64, user: bool) -> Self {
        let cap_pages = ((end_vaddr - start_vaddr) / 4096) as usize;
        Self {
            start_vaddr,
            end_vaddr,
            user,
            size: 0,
            cap_pages,
            frames: Vec::new(),
            mapped: false,
        }
    }

    /// Current logical byte size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Checks the invariant from spec section 8:
    /// `size <= num_pages*PAGE_SIZE <= cap_pages*PAGE_SIZE <= end-start`.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        self.size <= self.frames.len() * 4096
            && self.frames.len() <= self.cap_pages
            && (self.cap_pages * 4096) as u64 <= self.end_vaddr - self.start_vaddr
    }

    /// Grows or shrinks the heap by `delta` bytes (may be negative).
    /// `delta == 0` never fails and returns the current brk. On growth,
    /// newly exposed bytes are zeroed.
    pub fn sbrk(&mut self, delta: i64) -> KResult<u64> {
        if delta == 0 {
            return Ok(self.start_vaddr + self.size as u64);
        }

        let new_size = if delta > 0 {
            self.size
                .checked_add(delta as usize)
                .ok_or(KernelError::InvalidArgument)?
        } else {
            self.size
                .checked_sub((-delta) as usize)
                .ok_or(KernelError::InvalidArgument)?
        };

        let new_pages = new_size.div_ceil(4096);
        if new_pages > self.cap_pages {
            return Err(KernelError::OutOfMemory);
        }

        let old_pages = self.frames.len();
        if new_pages > old_pages {
            self.grow_frames(new_pages)?;
        } else if new_pages < old_pages {
            self.shrink_frames(new_pages);
        }

        let old_size = self.size;
        self.size = new_size;

        if self.mapped && new_size > old_size {
            self.zero_from(old_size);
        }

        Ok(self.start_vaddr + self.size as u64)
    }

    fn grow_frames(&mut self, new_pages: usize) -> KResult<()> {
        let mut reserved = Vec::new();
        reserved.try_reserve(new_pages - self.frames.len())
            .map_err(|_| KernelError::OutOfMemory)?;

        while self.frames.len() + reserved.len() < new_pages {
            match frame::alloc() {
                Ok(f) => reserved.push(f),
                Err(e) => {
                    for f in reserved {
                        frame::free(f);
                    }
                    return Err(e);
                }
            }
        }

        for f in reserved {
            let index = self.frames.len();
            if self.mapped {
                paging::with_address_space(|space| {
                    space.page_map(self.page_vaddr(index), f, self.user, true)
                })?;
            }
            self.frames.push(f);
        }
        Ok(())
    }

    fn shrink_frames(&mut self, new_pages: usize) {
        while self.frames.len() > new_pages {
            let index = self.frames.len() - 1;
            let f = self.frames.pop().expect("frames non-empty while shrinking");
            if self.mapped {
                let _ = paging::with_address_space(|space| space.page_unmap(self.page_vaddr(index)));
            }
            frame::free(f);
        }
    }

    fn page_vaddr(&self, index: usize) -> u64 {
        self.start_vaddr + (index as u64) * 4096
    }

    fn zero_from(&self, old_size: usize) {
        let total = self.frames.len() * 4096;
        // SAFETY: the heap is mapped and every byte in [old_size, total) is
        // backed by a frame owned by this heap.
        unsafe {
            let ptr = (self.start_vaddr as *mut u8).add(old_size);
            core::ptr::write_bytes(ptr, 0, total - old_size);
        }
    }

    /// Maps every backing frame at its logical page offset. Called on
    /// context switch when this heap's process becomes current.
    pub fn map(&mut self) -> KResult<()> {
        if self.mapped {
            return Ok(());
        }
        for (i, &f) in self.frames.iter().enumerate() {
            paging::with_address_space(|space| {
                space.page_map(self.page_vaddr(i), f, self.user, true)
            })?;
        }
        self.mapped = true;
        Ok(())
    }

    /// Removes every page-table entry for this heap's frames. Called when
    /// the owning process is switched out.
    pub fn unmap(&mut self) -> KResult<()> {
        if !self.mapped {
            return Ok(());
        }
        for i in 0..self.frames.len() {
            paging::with_address_space(|space| space.page_unmap(self.page_vaddr(i)))?;
        }
        self.mapped = false;
        Ok(())
    }

    /// Deep-copies this heap: fresh frames, memcpy'd through the temporary
    /// mapping slot. The source heap must currently be mapped. The clone
    /// is returned in the `unmapped` state.
    pub fn clone_deep(&self) -> KResult<Self> {
        assert!(self.mapped, "clone source heap must be mapped");

        let mut frames = Vec::new();
        frames.try_reserve(self.frames.len()).map_err(|_| KernelError::OutOfMemory)?;

        for i in 0..self.frames.len() {
            match frame::alloc() {
                Ok(f) => {
                    let src = self.page_vaddr(i);
                    copy_page_through_temp(src, f)?;
                    frames.push(f);
                }
                Err(e) => {
                    for f in frames {
                        frame::free(f);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            start_vaddr: self.start_vaddr,
            end_vaddr: self.end_vaddr,
            user: self.user,
            size: self.size,
            cap_pages: self.cap_pages,
            frames,
            mapped: false,
        })
    }

    /// Frees every backing frame and resets the heap to empty. Unmaps
    /// first if currently mapped.
    pub fn clear(&mut self) {
        let _ = self.unmap();
        for f in self.frames.drain(..) {
            frame::free(f);
        }
        self.size = 0;
    }
}

/// Copies one 4 KiB page from a mapped source virtual address into a
/// freshly allocated destination frame via the reserved temporary slot.
fn copy_page_through_temp(src_vaddr: u64, dest: Frame) -> KResult<()> {
    const TEMP_SLOT: u64 = crate::config::TEMP_PAGE - 4096;
    paging::with_address_space(|space| space.page_map(TEMP_SLOT, dest, false, true))?;
    // SAFETY: `src_vaddr` belongs to a currently-mapped heap page, and
    // `TEMP_SLOT` was just mapped to `dest` above.
    unsafe {
        core::ptr::copy_nonoverlapping(src_vaddr as *const u8, TEMP_SLOT as *mut u8, 4096);
    }
    paging::with_address_space(|space| space.page_unmap(TEMP_SLOT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn sbrk_zero_never_fails_and_returns_brk() {
        let mut heap = Heap::new(0x1000_0000, 0x1100_0000, true);
        assert_eq!(heap.sbrk(0).expect("sbrk(0) must not fail"), 0x1000_0000);
    }

    #[test_case]
    fn invariant_holds_on_empty_heap() {
        let heap = Heap::new(0x1000_0000, 0x1100_0000, true);
        assert!(heap.invariant_holds());
    }
}
