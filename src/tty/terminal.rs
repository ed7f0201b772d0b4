//! Cooked-mode stdin/stdout streams (spec 4.7/6), grounded on
//! `original_source/kernel/terminal.c`.
//!
//! Keystrokes accumulate into a per-terminal line buffer (erase on
//! backspace, echoed to the screen) and only become readable once a
//! newline completes the line — the same canonical-mode behavior the
//! original's `terminal_putc`/`terminal_read` implement. Output is gated
//! on the writer's process group matching the terminal's foreground group,
//! so a background job's `write` to its controlling terminal fails rather
//! than scribbling over the foreground job's screen.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::NUM_TERMINALS;
use crate::error::{KernelError, KResult};
use crate::fs::file::{FileOps, SeekWhence};
use crate::proc::pcb::{Pid, PID_KERNEL};

const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7f;

struct Terminal {
    /// Completed lines (including their trailing `\n`), ready to read.
    ready: VecDeque<u8>,
    /// In-progress line, not yet terminated by `\n`.
    editing: Vec<u8>,
    fg_pgrp: Pid,
    echo: bool,
}

impl Terminal {
    const fn new() -> Self {
        Self { ready: VecDeque::new(), editing: Vec::new(), fg_pgrp: PID_KERNEL, echo: true }
    }
}

lazy_static! {
    static ref TERMINALS: Mutex<[Terminal; NUM_TERMINALS]> = Mutex::new(core::array::from_fn(|_| Terminal::new()));
}

/// Feeds one keystroke into `terminal`'s line editor. Called from the
/// keyboard interrupt pipeline ([`crate::task::keyboard`]).
pub fn push_key(terminal: usize, byte: u8) {
    let mut terminals = TERMINALS.lock();
    let t = &mut terminals[terminal];
    match byte {
        b'\n' | b'\r' => {
            t.editing.push(b'\n');
            t.ready.extend(t.editing.drain(..));
            if t.echo {
                echo_to_screen(terminal, &[b'\n']);
            }
        }
        BACKSPACE | DEL => {
            if t.editing.pop().is_some() && t.echo {
                echo_to_screen(terminal, &[BACKSPACE, b' ', BACKSPACE]);
            }
        }
        byte => {
            t.editing.push(byte);
            if t.echo {
                echo_to_screen(terminal, &[byte]);
            }
        }
    }
}

fn echo_to_screen(terminal: usize, bytes: &[u8]) {
    if terminal == active() {
        for &b in bytes {
            crate::vga_buffer::writer::WRITER.lock().write_byte(b);
        }
    }
}

/// Which virtual terminal is currently displayed (and receives keystrokes
/// routed from the hardware keyboard).
static ACTIVE: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

#[must_use]
pub fn active() -> usize {
    ACTIVE.load(core::sync::atomic::Ordering::Relaxed)
}

pub fn set_active(terminal: usize) {
    if terminal < NUM_TERMINALS {
        ACTIVE.store(terminal, core::sync::atomic::Ordering::Relaxed);
    }
}

/// Reads up to one completed line into `buf`. `WouldBlock` if no line is
/// ready yet (cooked mode: a partial, not-yet-`\n`-terminated line never
/// satisfies a read).
pub fn read(terminal: usize, buf: &mut [u8]) -> KResult<usize> {
    let mut terminals = TERMINALS.lock();
    let t = &mut terminals[terminal];
    if t.ready.is_empty() {
        return Err(KernelError::WouldBlock);
    }
    let n = buf.len().min(t.ready.len());
    for slot in buf.iter_mut().take(n) {
        *slot = t.ready.pop_front().expect("checked len above");
    }
    Ok(n)
}

/// Writes `buf` to `terminal`'s display, only if `caller_pgrp` is that
/// terminal's current foreground group. Mirrors the original's `tcsetpgrp`
/// job-control gate.
pub fn write(terminal: usize, caller_pgrp: Pid, buf: &[u8]) -> KResult<usize> {
    let fg = TERMINALS.lock()[terminal].fg_pgrp;
    if fg != PID_KERNEL && fg != caller_pgrp {
        return Err(KernelError::PermissionDenied);
    }
    if terminal == active() {
        for &b in buf {
            crate::vga_buffer::writer::WRITER.lock().write_byte(b);
        }
    }
    Ok(buf.len())
}

#[must_use]
pub fn fg_pgrp(terminal: usize) -> Pid {
    TERMINALS.lock()[terminal].fg_pgrp
}

pub fn set_fg_pgrp(terminal: usize, pgrp: Pid) {
    TERMINALS.lock()[terminal].fg_pgrp = pgrp;
}

/// A file object bound to one virtual terminal's stdin/stdout. The process
/// that opened it is looked up at call time (via the scheduler's notion of
/// "who's currently running") to enforce the foreground-group write gate,
/// matching the original's reliance on the calling PCB's `pgid` rather than
/// a value captured at `open` time.
pub struct TerminalStream {
    terminal: usize,
}

impl TerminalStream {
    #[must_use]
    pub const fn new(terminal: usize) -> Self {
        Self { terminal }
    }
}

impl FileOps for TerminalStream {
    fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        read(self.terminal, buf)
    }

    fn write(&self, buf: &[u8]) -> KResult<usize> {
        let caller_pgrp = crate::proc::pcb::with_table(|table| {
            table[crate::proc::scheduler::current() as usize].pgid
        });
        write(self.terminal, caller_pgrp, buf)
    }

    fn seek(&self, _offset: i64, _whence: SeekWhence) -> KResult<u64> {
        Err(KernelError::InvalidArgument)
    }
}

#[cfg(test)]
pub fn reset_for_test() {
    let mut terminals = TERMINALS.lock();
    for t in terminals.iter_mut() {
        *t = Terminal::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn partial_line_is_not_readable() {
        reset_for_test();
        push_key(1, b'h');
        push_key(1, b'i');
        let mut buf = [0u8; 8];
        assert_eq!(read(1, &mut buf), Err(KernelError::WouldBlock));
    }

    #[test_case]
    fn completed_line_is_readable() {
        reset_for_test();
        push_key(1, b'h');
        push_key(1, b'i');
        push_key(1, b'\n');
        let mut buf = [0u8; 8];
        let n = read(1, &mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test_case]
    fn backspace_erases_last_char() {
        reset_for_test();
        push_key(1, b'h');
        push_key(1, b'x');
        push_key(1, BACKSPACE);
        push_key(1, b'i');
        push_key(1, b'\n');
        let mut buf = [0u8; 8];
        let n = read(1, &mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test_case]
    fn write_from_background_group_is_denied() {
        reset_for_test();
        set_fg_pgrp(1, 5);
        assert_eq!(write(1, 6, b"hi"), Err(KernelError::PermissionDenied));
        assert!(write(1, 5, b"hi").is_ok());
    }
}
