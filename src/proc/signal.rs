//! Per-process signal table and delivery (spec 4.10), grounded on
//! `original_source/kernel/signal.c`/`signal.h`.
//!
//! A handler's saved return address always points at
//! [`crate::config::SIGNAL_TRAMPOLINE_VADDR`] rather than back into
//! arbitrary user code, so the only way out of a handler is through
//! `sigreturn` — the trampoline page's own machine code just re-enters the
//! kernel with that syscall number. This is what spec 8 calls the "signal
//! trampoline validation" invariant: a PCB whose saved return address
//! points anywhere else could never have gotten there through this
//! kernel's own signal delivery.
//!
//! Unlike the original, which generates a few bytes of shellcode fresh on
//! every delivery and pushes it onto the (writable, executable) user stack,
//! this kernel maps one fixed trampoline page, shared by every process, at
//! [`crate::config::SIGNAL_TRAMPOLINE_VADDR`] — see
//! [`crate::proc::trampoline`]. Only the per-delivery data (the saved
//! context, a pointer to it, and the signal number) gets pushed onto the
//! user stack; the code side never changes.
//!
//! [`try_deliver`] and [`on_return_to_user`] are the two halves of the
//! actual wiring: the former builds a delivery frame on the user stack and
//! redirects into the handler, the latter is the single place
//! [`crate::userspace::syscall::syscall_entry`] calls on every return to
//! user mode to decide whether a restore or a fresh delivery should happen
//! instead of resuming normally.

use crate::error::{KernelError, KResult};
use crate::mm::paging;
use crate::proc::pcb::{self, Pid};

/// Divide-by-zero / invalid opcode class of fault. Mirrors `SIG_DIV_ZERO`.
pub const SIG_DIV_ZERO: u32 = 0;
/// Access to unmapped or protected memory. Mirrors `SIG_SEGFAULT`.
pub const SIG_SEGFAULT: u32 = 1;
/// Ctrl-C from the controlling terminal. Mirrors `SIG_INTERRUPT`.
pub const SIG_INTERRUPT: u32 = 2;
/// Periodic `SIGALRM`-equivalent, armed by `monosleep`/the per-process timer.
pub const SIG_ALARM: u32 = 3;
/// User-raised signal with no kernel-defined meaning.
pub const SIG_USER1: u32 = 4;

pub const NUM_SIGNALS: usize = crate::config::NUM_SIGNALS;

/// Encodes one process's registered handlers plus pending/in-handler state.
/// Mirrors the PCB's `signal_t signals[NUM_SIGNALS]` array.
#[derive(Clone)]
pub struct SignalTable {
    handlers: [Option<u64>; NUM_SIGNALS],
    /// Bit `n` set means signal `n` is pending delivery.
    pending: u32,
    /// Bit `n` set means signal `n`'s handler is currently executing (the
    /// process hasn't `sigreturn`ed yet), so it cannot be re-delivered.
    masked: u32,
}

impl SignalTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { handlers: [None; NUM_SIGNALS], pending: 0, masked: 0 }
    }

    /// Registers (or clears, with `handler = None`) the handler for `sig`.
    /// Mirrors the `signal` syscall.
    pub fn register(&mut self, sig: u32, handler: Option<u64>) -> KResult<()> {
        let slot = self.handlers.get_mut(sig as usize).ok_or(KernelError::InvalidArgument)?;
        *slot = handler;
        Ok(())
    }

    /// Marks `sig` pending. A no-op (not an error) for an unknown-to-the-test
    /// signal number higher than `NUM_SIGNALS`, matching the original's
    /// "raising a signal nobody can handle is silently dropped" behavior.
    pub fn raise(&mut self, sig: u32) {
        if (sig as usize) < NUM_SIGNALS {
            self.pending |= 1 << sig;
        }
    }

    /// Picks the lowest-numbered pending, unmasked, handled signal; masks
    /// it and clears its pending bit; returns its handler address. Called
    /// once per return-to-user-mode point, matching the original's "signals
    /// are only delivered at syscall/interrupt return, never mid-instruction".
    pub fn next_deliverable(&mut self) -> Option<(u32, u64)> {
        for sig in 0..NUM_SIGNALS as u32 {
            let bit = 1 << sig;
            if self.pending & bit != 0 && self.masked & bit == 0 {
                if let Some(handler) = self.handlers[sig as usize] {
                    self.pending &= !bit;
                    self.masked |= bit;
                    return Some((sig, handler));
                }
                // Registered or not, an unhandled signal that isn't fatal
                // just gets dropped here; proc::process handles the fatal
                // defaults (SIG_DIV_ZERO, SIG_SEGFAULT) before ever calling
                // into this table.
                self.pending &= !bit;
            }
        }
        None
    }

    /// Unmasks `sig`, allowing it to be re-delivered. Mirrors the
    /// `sigreturn` syscall's effect on the signal table.
    pub fn sigreturn(&mut self, sig: u32) -> KResult<()> {
        if sig as usize >= NUM_SIGNALS {
            return Err(KernelError::InvalidArgument);
        }
        self.masked &= !(1 << sig);
        Ok(())
    }

    #[must_use]
    pub fn is_masked(&self, sig: u32) -> bool {
        (sig as usize) < NUM_SIGNALS && self.masked & (1 << sig) != 0
    }

    /// Whether raising `sig` right now would actually reach a handler
    /// (registered and not currently masked), as opposed to being silently
    /// dropped by [`next_deliverable`](Self::next_deliverable).
    #[must_use]
    pub fn has_deliverable_handler(&self, sig: u32) -> bool {
        (sig as usize) < NUM_SIGNALS && self.masked & (1 << sig) == 0 && self.handlers[sig as usize].is_some()
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Register state preserved across a signal handler invocation: enough to
/// resume the interrupted point, not a full GPR file — this rewrite's
/// cooperative scheduler doesn't keep one of those across an ordinary
/// context switch either (see `proc::process`'s "fork resumption fidelity"
/// note). Mirrors the restore half of the original's `int_regs_t`.
#[derive(Clone, Copy)]
pub struct SavedContext {
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

impl SavedContext {
    fn to_bytes(self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.rip.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.rflags.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.rsp.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; 24]) -> Self {
        Self {
            rip: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            rflags: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            rsp: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// Builds a delivery frame on `pid`'s user stack for its next deliverable
/// signal and returns the `(rip, rsp)` the return-to-user path should use
/// instead of `rip`/`rsp`, or `None` if nothing is deliverable right now.
///
/// Pushes, from high address to low (mirroring `signal_deliver` in
/// `original_source/kernel/signal.c`, adapted to a fixed trampoline page
/// instead of per-delivery shellcode): the caller's `(rip, rflags, rsp)`,
/// a pointer to it, the signal number, and
/// [`crate::config::SIGNAL_TRAMPOLINE_VADDR`] as the return address. The
/// handler is entered as if `call`ed with no arguments, so its own `ret`
/// lands on the trampoline with the stack positioned exactly where the
/// trampoline's `pop sig; pop ctx_addr` sequence expects it.
pub fn try_deliver(pid: Pid, rip: u64, rflags: u64, rsp: u64) -> Option<(u64, u64)> {
    let (sig, handler) = pcb::with_table(|t| t[pid as usize].signals.next_deliverable())?;

    let ctx = SavedContext { rip, rflags, rsp };
    let ctx_addr = rsp - 24;
    let ctx_addr_slot = ctx_addr - 8;
    let sig_slot = ctx_addr_slot - 8;
    let new_rsp = sig_slot - 8;

    let pushed = paging::with_address_space(|space| -> KResult<()> {
        space.copy_to_user(ctx_addr, &ctx.to_bytes())?;
        space.copy_to_user(ctx_addr_slot, &ctx_addr.to_ne_bytes())?;
        space.copy_to_user(sig_slot, &u64::from(sig).to_ne_bytes())?;
        space.copy_to_user(new_rsp, &crate::config::SIGNAL_TRAMPOLINE_VADDR.to_ne_bytes())?;
        Ok(())
    });

    if pushed.is_err() {
        // Mirrors the original: a handler whose trampoline frame can't be
        // pushed (corrupt or unmapped user stack) kills the process rather
        // than silently dropping the signal.
        crate::proc::process::halt(pid, crate::config::EXIT_CODE_SIGNAL_KILLED);
    }

    Some((handler, new_rsp))
}

/// `sigreturn`'s real work: reads the saved context the trampoline handed
/// back, unmasks `sig`, and stashes the context as `pid`'s pending restore
/// for [`on_return_to_user`] to splice into the kernel's own IRET frame.
/// Mirrors `signal_sigreturn` overwriting `*kernel_regs` directly.
pub fn sigreturn_restore(pid: Pid, sig: u32, ctx_vaddr: u64) -> KResult<()> {
    let mut buf = [0u8; 24];
    paging::with_address_space(|space| space.copy_from_user(&mut buf, ctx_vaddr))?;
    let ctx = SavedContext::from_bytes(&buf);
    pcb::with_table(|t| -> KResult<()> {
        t[pid as usize].signals.sigreturn(sig)?;
        t[pid as usize].pending_restore = Some(ctx);
        Ok(())
    })
}

/// Takes and clears `pid`'s pending post-`sigreturn` restore, if any.
fn take_pending_restore(pid: Pid) -> Option<SavedContext> {
    pcb::with_table(|t| t[pid as usize].pending_restore.take())
}

/// Raises `sig` for `pid` as a CPU fault and delivers it immediately,
/// rather than waiting for the next syscall return — grounded on
/// `original_source/kernel/idt.c`'s `handle_user_exception`, which does the
/// same for a userspace `#DE`/`#PF`. Mirrors its default action too: with no
/// unmasked handler registered, `SIG_DIV_ZERO`/`SIG_SEGFAULT` kill the
/// process outright instead of being silently dropped like an ordinary
/// unhandled signal. Returns the `(rip, rsp)` the fault's `iretq` should
/// resume at.
pub fn fault_raise_and_resume(pid: Pid, sig: u32, rip: u64, rflags: u64, rsp: u64) -> (u64, u64) {
    let deliverable = pcb::with_table(|t| t[pid as usize].signals.has_deliverable_handler(sig));
    if !deliverable {
        crate::proc::process::halt(pid, crate::config::EXIT_CODE_SIGNAL_KILLED);
    }
    pcb::with_table(|t| t[pid as usize].signals.raise(sig));
    try_deliver(pid, rip, rflags, rsp).unwrap_or((rip, rsp))
}

/// The single point every return to user mode passes through (called from
/// [`crate::userspace::syscall::syscall_entry`]'s normal-return path, right
/// before its `iretq`). Splices in a pending `sigreturn`'s saved context if
/// one is waiting; otherwise redirects into the next deliverable signal
/// handler, if any. Leaves `rip`/`rflags`/`rsp` untouched if neither applies.
pub fn on_return_to_user(pid: Pid, rip: &mut u64, rflags: &mut u64, rsp: &mut u64) {
    if let Some(ctx) = take_pending_restore(pid) {
        *rip = ctx.rip;
        *rflags = ctx.rflags;
        *rsp = ctx.rsp;
        return;
    }
    if let Some((new_rip, new_rsp)) = try_deliver(pid, *rip, *rflags, *rsp) {
        *rip = new_rip;
        *rsp = new_rsp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn unregistered_signal_is_dropped_not_delivered() {
        let mut table = SignalTable::new();
        table.raise(SIG_USER1);
        assert_eq!(table.next_deliverable(), None);
    }

    #[test_case]
    fn registered_signal_delivers_once_then_masks() {
        let mut table = SignalTable::new();
        table.register(SIG_ALARM, Some(0x4000_1000)).expect("register should succeed");
        table.raise(SIG_ALARM);
        assert_eq!(table.next_deliverable(), Some((SIG_ALARM, 0x4000_1000)));
        table.raise(SIG_ALARM);
        assert_eq!(table.next_deliverable(), None, "masked signal must not re-deliver before sigreturn");
    }

    #[test_case]
    fn sigreturn_unmasks_for_next_delivery() {
        let mut table = SignalTable::new();
        table.register(SIG_ALARM, Some(0x4000_1000)).expect("register should succeed");
        table.raise(SIG_ALARM);
        table.next_deliverable();
        table.sigreturn(SIG_ALARM).expect("sigreturn should succeed");
        table.raise(SIG_ALARM);
        assert_eq!(table.next_deliverable(), Some((SIG_ALARM, 0x4000_1000)));
    }

    #[test_case]
    fn lowest_numbered_pending_signal_wins() {
        let mut table = SignalTable::new();
        table.register(SIG_SEGFAULT, Some(1)).expect("register should succeed");
        table.register(SIG_ALARM, Some(2)).expect("register should succeed");
        table.raise(SIG_ALARM);
        table.raise(SIG_SEGFAULT);
        assert_eq!(table.next_deliverable(), Some((SIG_SEGFAULT, 1)));
    }

    #[test_case]
    fn has_deliverable_handler_is_false_without_a_registered_handler() {
        let mut table = SignalTable::new();
        assert!(!table.has_deliverable_handler(SIG_SEGFAULT));
        table.register(SIG_SEGFAULT, Some(0x4000_1000)).expect("register should succeed");
        assert!(table.has_deliverable_handler(SIG_SEGFAULT));
        table.raise(SIG_SEGFAULT);
        table.next_deliverable();
        assert!(!table.has_deliverable_handler(SIG_SEGFAULT), "masked while the handler runs");
    }

    #[test_case]
    fn saved_context_round_trips_through_bytes() {
        let ctx = SavedContext { rip: 0x1234, rflags: 0x202, rsp: 0xdead_beef };
        let back = SavedContext::from_bytes(&ctx.to_bytes());
        assert_eq!(back.rip, ctx.rip);
        assert_eq!(back.rflags, ctx.rflags);
        assert_eq!(back.rsp, ctx.rsp);
    }

    #[test_case]
    fn on_return_to_user_prefers_pending_restore_over_delivery() {
        pcb::reset_for_test();
        let pid = pcb::alloc(1, 1).expect("alloc should succeed");
        let ctx = SavedContext { rip: 0x1000, rflags: 0x202, rsp: 0x2000 };
        pcb::with_table(|t| {
            t[pid as usize].pending_restore = Some(ctx);
            t[pid as usize].signals.register(SIG_ALARM, Some(0x3000)).expect("register should succeed");
            t[pid as usize].signals.raise(SIG_ALARM);
        });

        let (mut rip, mut rflags, mut rsp) = (0x9999, 0x1, 0x8888);
        on_return_to_user(pid, &mut rip, &mut rflags, &mut rsp);
        assert_eq!((rip, rflags, rsp), (ctx.rip, ctx.rflags, ctx.rsp));
        assert!(
            pcb::with_table(|t| t[pid as usize].pending_restore.is_none()),
            "restore must be consumed, not reusable"
        );
    }

    #[test_case]
    fn on_return_to_user_is_a_no_op_with_nothing_pending() {
        pcb::reset_for_test();
        let pid = pcb::alloc(1, 1).expect("alloc should succeed");
        let (mut rip, mut rflags, mut rsp) = (0x9999, 0x1, 0x8888);
        on_return_to_user(pid, &mut rip, &mut rflags, &mut rsp);
        assert_eq!((rip, rflags, rsp), (0x9999, 0x1, 0x8888));
    }
}
