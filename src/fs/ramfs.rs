//! Flat RAM-backed regular file store (spec 4.7/9: "the filesystem is a RAM
//! image... on boot the in-memory bitmaps are rebuilt from the on-disk
//! directory entries" simplified, since this kernel never persists anything
//! across a boot, to a single flat directory of named byte buffers built
//! fresh every boot), grounded on `original_source/kernel/fs.c`.
//!
//! Each directory entry owns an [`InodeId`] from [`crate::fs::inode`] for
//! open-count/delayed-unlink bookkeeping, and a shared content buffer two
//! independent `open()` calls on the same name both see.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KResult};
use crate::fs::file::{mode, FileObject, FileOps, FileStat, SeekWhence};
use crate::fs::inode::{self, InodeId};

struct Entry {
    name: String,
    inode: InodeId,
    content: Rc<RefCell<Vec<u8>>>,
}

lazy_static! {
    static ref DIR: Mutex<Vec<Entry>> = Mutex::new(Vec::new());
}

/// Resolves `name`, creating it if `flags` carries [`mode::CREAT`] and it
/// doesn't already exist. Truncates to zero if both [`mode::TRUNC`] and a
/// writable access mode are set. Mirrors spec's `open` resolution.
pub fn open(name: &str, flags: u32) -> KResult<FileObject> {
    let mut dir = DIR.lock();
    let idx = match dir.iter().position(|e| e.name == name) {
        Some(i) => {
            inode::retain(dir[i].inode);
            i
        }
        None => {
            if flags & mode::CREAT == 0 {
                return Err(KernelError::NotFound);
            }
            dir.push(Entry { name: String::from(name), inode: inode::alloc(), content: Rc::new(RefCell::new(Vec::new())) });
            dir.len() - 1
        }
    };

    let inode_id = dir[idx].inode;
    let content = Rc::clone(&dir[idx].content);
    if flags & mode::TRUNC != 0 && matches!(flags & mode::ACCESS_MASK, mode::WRONLY | mode::RDWR) {
        content.borrow_mut().clear();
    }
    drop(dir);

    Ok(FileObject::new(Box::new(RegularFile { content, pos: Cell::new(0) }), flags, Some(inode_id)))
}

/// Clears `name`'s directory entry. The inode (and its content) is only
/// reclaimed once every still-open [`FileObject`] referencing it closes,
/// matching [`inode::unlink`]'s delayed-free semantics.
pub fn unlink(name: &str) -> KResult<()> {
    let mut dir = DIR.lock();
    let idx = dir.iter().position(|e| e.name == name).ok_or(KernelError::NotFound)?;
    let entry = dir.remove(idx);
    let _ = inode::unlink(entry.inode);
    Ok(())
}

struct RegularFile {
    content: Rc<RefCell<Vec<u8>>>,
    pos: Cell<u64>,
}

impl FileOps for RegularFile {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let content = self.content.borrow();
        let pos = self.pos.get() as usize;
        if pos >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - pos);
        buf[..n].copy_from_slice(&content[pos..pos + n]);
        self.pos.set(self.pos.get() + n as u64);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        let mut content = self.content.borrow_mut();
        let pos = self.pos.get() as usize;
        if pos + buf.len() > content.len() {
            content.resize(pos + buf.len(), 0);
        }
        content[pos..pos + buf.len()].copy_from_slice(buf);
        drop(content);
        self.pos.set(self.pos.get() + buf.len() as u64);
        Ok(buf.len())
    }

    fn seek(&self, offset: i64, whence: SeekWhence) -> KResult<u64> {
        let base = match whence {
            SeekWhence::Set => 0i64,
            SeekWhence::Current => self.pos.get() as i64,
            SeekWhence::End => self.content.borrow().len() as i64,
        };
        let new_pos = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
        let new_pos = u64::try_from(new_pos).map_err(|_| KernelError::InvalidArgument)?;
        self.pos.set(new_pos);
        Ok(new_pos)
    }

    fn truncate(&self, len: u64) -> KResult<()> {
        self.content.borrow_mut().resize(len as usize, 0);
        Ok(())
    }

    fn stat(&self) -> KResult<FileStat> {
        Ok(FileStat { size: self.content.borrow().len() as u64, is_directory: false })
    }
}

#[cfg(test)]
pub fn reset_for_test() {
    DIR.lock().clear();
    inode::reset_for_test();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn open_without_create_on_missing_file_fails() {
        reset_for_test();
        assert_eq!(open("nope", mode::RDONLY), Err(KernelError::NotFound));
    }

    #[test_case]
    fn create_write_then_reopen_reads_back_same_content() {
        reset_for_test();
        let w = open("greeting", mode::CREAT | mode::WRONLY).expect("create should succeed");
        w.write(b"hello").expect("write should succeed");

        let r = open("greeting", mode::RDONLY).expect("reopen should succeed");
        let mut buf = [0u8; 5];
        let n = r.read(&mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], b"hello");
    }

    #[test_case]
    fn unlink_then_open_without_create_fails() {
        reset_for_test();
        open("scratch", mode::CREAT | mode::WRONLY).expect("create should succeed");
        unlink("scratch").expect("unlink should succeed");
        assert_eq!(open("scratch", mode::RDONLY), Err(KernelError::NotFound));
    }
}
