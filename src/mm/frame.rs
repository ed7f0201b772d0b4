//! Page-frame allocator (spec 4.1).
//!
//! Tracks free physical 4 KiB frames with a bitmap. Frame numbers live in
//! `[0, NUM_FRAMES)`, covering 256 MiB of modeled physical memory. Frame 0
//! is reserved at boot so callers may use it as an "absent" sentinel.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::NUM_FRAMES;
use crate::error::{KernelError, KResult};

/// A physical frame number. `0` is never handed out by [`alloc`] and is
/// used by callers as "no frame".
pub type Frame = u32;

/// Bitmap-backed frame allocator.
pub struct FrameAllocator {
    bitmap: [u64; NUM_FRAMES / 64],
    next_hint: usize,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            bitmap: [0; NUM_FRAMES / 64],
            next_hint: 0,
        }
    }

    fn is_set(&self, frame: Frame) -> bool {
        let frame = frame as usize;
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set(&mut self, frame: Frame) {
        let frame = frame as usize;
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    fn clear(&mut self, frame: Frame) {
        let frame = frame as usize;
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }

    /// Reserves a frame at boot (frame 0 and the frame backing the kernel
    /// image), so it is never handed out by [`alloc`].
    fn reserve(&mut self, frame: Frame) {
        self.set(frame);
    }

    /// Scans for the first clear bit, sets it, and returns the frame.
    fn alloc(&mut self) -> KResult<Frame> {
        for offset in 0..NUM_FRAMES {
            let frame = ((self.next_hint + offset) % NUM_FRAMES) as Frame;
            if !self.is_set(frame) {
                self.set(frame);
                self.next_hint = (frame as usize + 1) % NUM_FRAMES;
                return Ok(frame);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Returns a frame to the free pool. Asserts the frame was allocated.
    fn free(&mut self, frame: Frame) {
        assert!(self.is_set(frame), "double free of physical frame {frame}");
        self.clear(frame);
    }
}

lazy_static! {
    static ref ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
}

/// Reserves frame 0 (the "no frame" sentinel) and the frame backing the
/// kernel image so they are never handed out. Must run once at boot
/// before any other call into this module.
pub fn init(kernel_frame: Frame) {
    let mut allocator = ALLOCATOR.lock();
    allocator.reserve(0);
    allocator.reserve(kernel_frame);
}

/// Allocates a free physical frame.
pub fn alloc() -> KResult<Frame> {
    ALLOCATOR.lock().alloc()
}

/// Frees a previously allocated physical frame.
pub fn free(frame: Frame) {
    ALLOCATOR.lock().free(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_never_returns_frame_twice_without_free() {
        let mut allocator = FrameAllocator::new();
        let a = allocator.alloc().expect("alloc should succeed");
        let b = allocator.alloc().expect("alloc should succeed");
        assert_ne!(a, b, "two live allocations must not share a frame");
    }

    #[test_case]
    fn free_then_alloc_can_reuse_frame() {
        let mut allocator = FrameAllocator::new();
        let a = allocator.alloc().expect("alloc should succeed");
        allocator.free(a);
        let b = allocator.alloc().expect("alloc should succeed");
        assert_eq!(a, b, "freed frame should be reusable");
    }

    #[test_case]
    fn reserved_frame_is_never_handed_out() {
        let mut allocator = FrameAllocator::new();
        allocator.reserve(0);
        for _ in 0..4 {
            assert_ne!(allocator.alloc().expect("alloc should succeed"), 0);
        }
    }
}
