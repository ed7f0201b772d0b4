//! Inode refcounting and delayed unlink (spec 4.7), grounded on
//! `original_source/kernel/file.c`'s `inode_t` open-count/unlink handling.
//!
//! The backing store is RAM-only (spec 9 Open Question: no block device, no
//! persistence across boots); an inode here is purely the refcount/unlink
//! bookkeeping that the real filesystem layer underneath a [`file::FileOps`]
//! stream is built on, not file content itself. Content lives with whatever
//! owns the inode (e.g. a directory's child list).

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

/// Identifies one inode for its lifetime. Indexes into the global table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(usize);

struct Entry {
    open_count: u32,
    unlink_pending: bool,
}

lazy_static! {
    static ref TABLE: Mutex<Vec<Option<Entry>>> = Mutex::new(Vec::new());
}

/// Allocates a fresh inode with an open count of 1. Mirrors `inode_alloc`.
#[must_use]
pub fn alloc() -> InodeId {
    let mut table = TABLE.lock();
    let entry = Entry { open_count: 1, unlink_pending: false };
    if let Some(slot) = table.iter_mut().position(Option::is_none) {
        table[slot] = Some(entry);
        InodeId(slot)
    } else {
        table.push(Some(entry));
        InodeId(table.len() - 1)
    }
}

/// Increments the open count. Mirrors `inode_retain`.
pub fn retain(id: InodeId) {
    let mut table = TABLE.lock();
    let entry = table[id.0].as_mut().expect("retain of freed inode");
    entry.open_count += 1;
}

/// Decrements the open count. Mirrors `inode_release`. Returns `true` if
/// this was the last reference and `unlink` had already been called on it,
/// meaning the caller should reclaim whatever backing data it owns.
#[must_use]
pub fn release(id: InodeId) -> bool {
    let mut table = TABLE.lock();
    let reclaim = {
        let entry = table[id.0].as_mut().expect("release of freed inode");
        entry.open_count -= 1;
        entry.open_count == 0 && entry.unlink_pending
    };
    if reclaim {
        table[id.0] = None;
    }
    reclaim
}

/// Marks an inode for deletion once its open count reaches zero. Mirrors
/// `unlink`'s delayed-free semantics: an unlinked-but-still-open file keeps
/// working for descriptors that already hold it. Returns whether the inode
/// was reclaimed immediately (open count was already zero, which normally
/// only happens for an inode nobody has opened through [`alloc`] yet).
#[must_use]
pub fn unlink(id: InodeId) -> bool {
    let mut table = TABLE.lock();
    let reclaim = {
        let entry = table[id.0].as_mut().expect("unlink of freed inode");
        entry.unlink_pending = true;
        entry.open_count == 0
    };
    if reclaim {
        table[id.0] = None;
    }
    reclaim
}

/// Whether `id` still has a live entry (not yet reclaimed).
#[must_use]
pub fn is_live(id: InodeId) -> bool {
    TABLE.lock().get(id.0).is_some_and(Option::is_some)
}

#[cfg(test)]
pub fn reset_for_test() {
    TABLE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_then_release_reclaims_with_no_unlink() {
        reset_for_test();
        let id = alloc();
        assert!(!release(id), "plain release with no unlink should not report reclaim");
        assert!(is_live(id), "inode lingers until unlinked, matching a still-closed-but-not-deleted file");
    }

    #[test_case]
    fn unlink_while_open_defers_reclaim() {
        reset_for_test();
        let id = alloc();
        retain(id);
        assert!(!unlink(id), "unlink with an open reference must not reclaim yet");
        assert!(is_live(id));
        assert!(!release(id), "one reference remains");
        assert!(release(id), "last release after unlink must reclaim");
        assert!(!is_live(id));
    }

    #[test_case]
    fn reclaimed_slot_is_reused_by_next_alloc() {
        reset_for_test();
        let a = alloc();
        release(a);
        unlink(a);
        let b = alloc();
        assert_eq!(a, b, "freed slot should be reused rather than growing the table");
    }
}
