//! Paging (spec 4.2).
//!
//! The kernel runs in long mode, so the spec's 32-bit "single page directory
//! of 1024 entries, each either absent / a 4 MiB super-page / a pointer to a
//! 1024-entry leaf table" is modeled on top of the real 4-level tables the
//! `x86_64` crate manages for us: the spec's "4 MiB super-page" becomes a
//! 2 MiB huge page (the closest native long-mode analog — see DESIGN.md),
//! and "leaf table of 4 KiB pages" is exactly [`Mapper<Size4KiB>`].
//!
//! There is a single global [`AddressSpace`]: kernel mappings are
//! installed once at boot and never removed; the user-page, vidmap and
//! VBE-framebuffer slots are rewritten on every process context switch,
//! matching spec's "single directory is active at any time" model.

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{
    structures::paging::{
        mapper::MapToError, FrameAllocator as X86FrameAllocator, Mapper, OffsetPageTable, Page,
        PageTableFlags, PhysFrame, Size2MiB, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::config::{TEMP_PAGE, VBE_FRAMEBUFFER_PAGES, VBE_FRAMEBUFFER_START, VIDMAP_PAGE};
use crate::error::{KernelError, KResult};
use crate::mm::frame::{self, Frame};

/// Physical base address of the huge-frame pool backing user/kernel
/// super-pages. Deliberately disjoint from the 4 KiB frame pool so the two
/// bitmap allocators never contend for the same physical memory (see
/// DESIGN.md "dual frame granularity").
const HUGE_POOL_PHYS_BASE: u64 = 0x4000_0000; // 1 GiB

/// Number of 2 MiB huge frames in the pool (covers 256 MiB).
const NUM_HUGE_FRAMES: usize = 128;

/// Physical base address of the 4 KiB frame pool tracked by [`frame`].
const FRAME_POOL_PHYS_BASE: u64 = 0x0000_0000;

/// A huge (2 MiB) physical frame number, used for the user/kernel super-page
/// slots.
pub type HugeFrame = u32;

/// Bitmap allocator for the 128-entry huge-frame pool.
struct HugeFrameAllocator {
    bitmap: [u64; NUM_HUGE_FRAMES / 64],
}

impl HugeFrameAllocator {
    const fn new() -> Self {
        Self {
            bitmap: [0; NUM_HUGE_FRAMES / 64],
        }
    }

    fn mark_unavailable_above(&mut self, limit: usize) {
        for frame in limit..NUM_HUGE_FRAMES {
            self.bitmap[frame / 64] |= 1 << (frame % 64);
        }
    }

    fn alloc(&mut self) -> KResult<HugeFrame> {
        for frame in 0..NUM_HUGE_FRAMES {
            if self.bitmap[frame / 64] & (1 << (frame % 64)) == 0 {
                self.bitmap[frame / 64] |= 1 << (frame % 64);
                return Ok(frame as HugeFrame);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    fn free(&mut self, frame: HugeFrame) {
        let frame = frame as usize;
        assert!(
            self.bitmap[frame / 64] & (1 << (frame % 64)) != 0,
            "double free of huge frame {frame}"
        );
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }
}

lazy_static! {
    static ref HUGE_FRAMES: Mutex<HugeFrameAllocator> = Mutex::new(HugeFrameAllocator::new());
}

/// Caps the huge-frame pool to `available` entries so a small VM doesn't
/// hand out frames with no real backing. Call once at boot.
pub fn init_huge_frames(available: usize) {
    HUGE_FRAMES
        .lock()
        .mark_unavailable_above(available.min(NUM_HUGE_FRAMES));
}

/// Allocates a free huge frame.
pub fn huge_alloc() -> KResult<HugeFrame> {
    HUGE_FRAMES.lock().alloc()
}

/// Frees a previously allocated huge frame.
pub fn huge_free(frame: HugeFrame) {
    HUGE_FRAMES.lock().free(frame);
}

fn frame_phys_addr(frame: Frame) -> PhysAddr {
    PhysAddr::new(FRAME_POOL_PHYS_BASE + u64::from(frame) * 4096)
}

fn huge_frame_phys_addr(frame: HugeFrame) -> PhysAddr {
    PhysAddr::new(HUGE_POOL_PHYS_BASE + u64::from(frame) * Size2MiB::SIZE)
}

use x86_64::structures::paging::PageSize;

/// Bridges the modeled [`frame`] bitmap into the `x86_64` crate's
/// [`X86FrameAllocator`] trait, for intermediate page-table allocations
/// (always 4 KiB regardless of the leaf page size being mapped).
struct BridgeFrameAllocator;

unsafe impl X86FrameAllocator<Size4KiB> for BridgeFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let modeled = frame::alloc().ok()?;
        Some(PhysFrame::containing_address(frame_phys_addr(modeled)))
    }
}

/// The kernel's single active address space.
pub struct AddressSpace {
    mapper: OffsetPageTable<'static>,
}

impl AddressSpace {
    /// Wraps an already-initialized offset-mapped page table (built by
    /// [`crate::memory::init`] from the bootloader's physical memory
    /// offset).
    pub fn new(mapper: OffsetPageTable<'static>) -> Self {
        Self { mapper }
    }

    /// Installs or removes a 2 MiB mapping, flushing the TLB afterwards.
    /// A no-op if the entry already matches the requested state.
    pub fn page_map_huge(&mut self, vaddr: u64, paddr: HugeFrame, user: bool) -> KResult<()> {
        let page: Page<Size2MiB> = Page::containing_address(VirtAddr::new(vaddr));
        let frame = PhysFrame::containing_address(huge_frame_phys_addr(paddr));
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }

        // SAFETY: `frame` is owned by the caller through the huge-frame
        // allocator and `page` lies in one of the fixed super-page slots
        // reserved by the address-space layout.
        let result = unsafe { self.mapper.map_to(page, frame, flags, &mut BridgeFrameAllocator) };
        match result {
            Ok(flush) => {
                flush.flush();
                Ok(())
            }
            Err(MapToError::PageAlreadyMapped(_)) => {
                self.page_unmap_huge(vaddr)?;
                self.page_map_huge(vaddr, paddr, user)
            }
            Err(_) => Err(KernelError::OutOfMemory),
        }
    }

    /// Removes a 2 MiB mapping installed by [`page_map_huge`](Self::page_map_huge).
    pub fn page_unmap_huge(&mut self, vaddr: u64) -> KResult<()> {
        let page: Page<Size2MiB> = Page::containing_address(VirtAddr::new(vaddr));
        match self.mapper.unmap(page) {
            Ok((_, flush)) => {
                flush.flush();
                Ok(())
            }
            Err(_) => Ok(()), // unmapping an absent page is a no-op, not an error
        }
    }

    /// Installs or removes a 4 KiB mapping, flushing the TLB afterwards.
    pub fn page_map(&mut self, vaddr: u64, paddr: Frame, user: bool, writable: bool) -> KResult<()> {
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(vaddr));
        let frame = PhysFrame::containing_address(frame_phys_addr(paddr));
        let mut flags = PageTableFlags::PRESENT;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }

        // SAFETY: `frame` is owned by the caller through the frame
        // allocator and `page` lies in a reserved slot of the address
        // space layout (heap, stack, vidmap, temp, or VBE range).
        let result = unsafe { self.mapper.map_to(page, frame, flags, &mut BridgeFrameAllocator) };
        match result {
            Ok(flush) => {
                flush.flush();
                Ok(())
            }
            Err(MapToError::PageAlreadyMapped(_)) => {
                self.page_unmap(vaddr)?;
                self.page_map(vaddr, paddr, user, writable)
            }
            Err(_) => Err(KernelError::OutOfMemory),
        }
    }

    /// Removes a 4 KiB mapping. A no-op if nothing was mapped there.
    pub fn page_unmap(&mut self, vaddr: u64) -> KResult<()> {
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(vaddr));
        match self.mapper.unmap(page) {
            Ok((_, flush)) => {
                flush.flush();
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Rewrites the well-known user code/data super-page slot to point at
    /// `paddr`. Called on every process context switch.
    pub fn map_user_page(&mut self, vaddr: u64, paddr: HugeFrame) -> KResult<()> {
        self.page_map_huge(vaddr, paddr, true)
    }

    /// Copies the full 2 MiB user super-page from the currently mapped
    /// source address into a freshly allocated `dest` frame, by mapping
    /// `dest` at the reserved temporary slot, memcpying, then unmapping.
    ///
    /// # Safety
    /// The caller must ensure `src_vaddr` is currently backed by a mapped
    /// user super-page of at least `Size2MiB::SIZE` bytes.
    pub unsafe fn clone_user_page(&mut self, src_vaddr: u64, dest: HugeFrame) -> KResult<()> {
        self.page_map_huge(TEMP_PAGE & !(Size2MiB::SIZE - 1), dest, false)?;
        let temp_base = TEMP_PAGE & !(Size2MiB::SIZE - 1);

        // SAFETY: `src_vaddr` is backed per the caller's contract, and
        // `temp_base` was just mapped to `dest` above with matching size.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src_vaddr as *const u8,
                temp_base as *mut u8,
                Size2MiB::SIZE as usize,
            );
        }

        self.page_unmap_huge(temp_base)
    }

    /// Maps or unmaps the per-process vidmap page at the fixed virtual
    /// address, pointing at the VGA text-buffer physical frame.
    pub fn update_vidmap_page(&mut self, vga_frame: Frame, present: bool) -> KResult<()> {
        if present {
            self.page_map(VIDMAP_PAGE, vga_frame, true, true)
        } else {
            self.page_unmap(VIDMAP_PAGE)
        }
    }

    /// Maps or unmaps the VBE linear framebuffer region for the current
    /// process. `frames` supplies the backing for each of
    /// [`VBE_FRAMEBUFFER_PAGES`] pages when `present` is true.
    pub fn update_vbe_page(&mut self, frames: Option<&[Frame]>) -> KResult<()> {
        match frames {
            Some(frames) => {
                assert_eq!(frames.len(), VBE_FRAMEBUFFER_PAGES, "VBE region size mismatch");
                for (i, &f) in frames.iter().enumerate() {
                    self.page_map(VBE_FRAMEBUFFER_START + (i as u64) * 4096, f, true, true)?;
                }
                Ok(())
            }
            None => {
                for i in 0..VBE_FRAMEBUFFER_PAGES {
                    self.page_unmap(VBE_FRAMEBUFFER_START + (i as u64) * 4096)?;
                }
                Ok(())
            }
        }
    }

    /// Walks the tables checking, for every page in `[start, start+n)`,
    /// that it is present and carries the requested user/write permission.
    /// Rejects negative lengths (via the `u32` type) and address overflow.
    #[must_use]
    pub fn is_memory_accessible(&self, start: u64, n: u32, user: bool, write: bool) -> bool {
        use x86_64::structures::paging::mapper::{Translate, TranslateResult};

        let Some(end) = start.checked_add(u64::from(n)) else {
            return false;
        };
        if n == 0 {
            return true;
        }

        let start_page = VirtAddr::new(start).align_down(4096u64);
        let mut addr = start_page.as_u64();
        while addr < end {
            let flags = match self.mapper.translate(VirtAddr::new(addr)) {
                TranslateResult::Mapped { flags, .. } => flags,
                _ => return false,
            };
            if user && !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
                return false;
            }
            if write && !flags.contains(PageTableFlags::WRITABLE) {
                return false;
            }
            addr += 4096;
        }
        true
    }

    /// Bounded copy from a user pointer until a NUL byte or `dest.len()`
    /// bytes have been copied. Returns the copied length (excluding the
    /// NUL) or an error if no NUL was found within `dest.len()` bytes or
    /// the source is not user-readable.
    pub fn strscpy_from_user(&self, dest: &mut [u8], src_vaddr: u64) -> KResult<usize> {
        if !self.is_memory_accessible(src_vaddr, dest.len() as u32, true, false) {
            return Err(KernelError::InvalidArgument);
        }

        // SAFETY: accessibility was just checked for the full length.
        let src = unsafe { core::slice::from_raw_parts(src_vaddr as *const u8, dest.len()) };
        for (i, &byte) in src.iter().enumerate() {
            dest[i] = byte;
            if byte == 0 {
                return Ok(i);
            }
        }
        Err(KernelError::InvalidArgument)
    }

    /// Copies `dest.len()` bytes from user memory at `src_vaddr`, gated on
    /// [`is_memory_accessible`](Self::is_memory_accessible).
    pub fn copy_from_user(&self, dest: &mut [u8], src_vaddr: u64) -> KResult<()> {
        if !self.is_memory_accessible(src_vaddr, dest.len() as u32, true, false) {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: accessibility was just checked for the full length.
        unsafe {
            core::ptr::copy_nonoverlapping(src_vaddr as *const u8, dest.as_mut_ptr(), dest.len());
        }
        Ok(())
    }

    /// Copies `src.len()` bytes to user memory at `dest_vaddr`, gated on
    /// [`is_memory_accessible`](Self::is_memory_accessible).
    pub fn copy_to_user(&self, dest_vaddr: u64, src: &[u8]) -> KResult<()> {
        if !self.is_memory_accessible(dest_vaddr, src.len() as u32, true, true) {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: accessibility was just checked for the full length.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dest_vaddr as *mut u8, src.len());
        }
        Ok(())
    }

    /// Fills `n` bytes of user memory at `dest_vaddr` with `value`, gated
    /// on [`is_memory_accessible`](Self::is_memory_accessible).
    pub fn memset_user(&self, dest_vaddr: u64, value: u8, n: u32) -> KResult<()> {
        if !self.is_memory_accessible(dest_vaddr, n, true, true) {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: accessibility was just checked for the full length.
        unsafe {
            core::ptr::write_bytes(dest_vaddr as *mut u8, value, n as usize);
        }
        Ok(())
    }
}

lazy_static! {
    static ref ADDRESS_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);
}

/// Installs the global address space. Must run once at boot, after
/// [`crate::memory::init`] has produced the offset-mapped page table.
pub fn init(mapper: OffsetPageTable<'static>) {
    *ADDRESS_SPACE.lock() = Some(AddressSpace::new(mapper));
}

/// Runs `f` with exclusive access to the global address space.
pub fn with_address_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    let mut guard = ADDRESS_SPACE.lock();
    let space = guard.as_mut().expect("address space not initialized");
    f(space)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn huge_frame_alloc_respects_cap() {
        let mut allocator = HugeFrameAllocator::new();
        allocator.mark_unavailable_above(2);
        assert!(allocator.alloc().is_ok());
        assert!(allocator.alloc().is_ok());
        assert!(allocator.alloc().is_err(), "pool capped at 2 must reject a third alloc");
    }

    #[test_case]
    fn huge_frame_free_allows_reuse() {
        let mut allocator = HugeFrameAllocator::new();
        allocator.mark_unavailable_above(1);
        let f = allocator.alloc().expect("first alloc must succeed");
        allocator.free(f);
        assert!(allocator.alloc().is_ok(), "freed huge frame should be reusable");
    }
}
