//! File object / descriptor table layer (spec 4.7), grounded on
//! `original_source/kernel/file.c`/`file.h`.
//!
//! The original's `file_obj_t` carries a `sock_ops_t`-style vtable
//! (`fd_table[type]`) selected by a small integer file type. Rust trait
//! objects give us that dispatch for free: each concrete stream (terminal,
//! RTC, directory, socket) implements [`file::FileOps`] directly rather than
//! registering into a global `file_register_type` table.

pub mod file;
pub mod inode;
pub mod ramfs;
