//! The process control block and its table (spec 3, 4.10), grounded on
//! `original_source/kernel/process.h`'s `pcb_t`.

use alloc::string::String;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{MAX_PROCESSES, PROCESS_DATA_SIZE, USER_HEAP_CAP_PAGES, USER_HEAP_START, USER_PAGE_START};
use crate::error::{KernelError, KResult};
use crate::fs::file::DescriptorTable;
use crate::mm::frame::Frame;
use crate::mm::heap::Heap;
use crate::mm::paging::HugeFrame;
use crate::proc::signal::SignalTable;

/// Process identifier. Mirrors `pid_t`; also the PCB table index. `0` is
/// always the idle task (spec: "scheduler FIFO + idle task").
pub type Pid = i32;

/// No parent / orphaned to the kernel. Re-exported from [`crate::config`].
pub const PID_KERNEL: Pid = crate::config::PID_KERNEL;

/// Lifecycle state of one PCB slot. Mirrors `process_state_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot is free.
    Unused,
    /// On the scheduler's runnable queue.
    Runnable,
    /// Currently executing on the (single, modeled) CPU.
    Running,
    /// Waiting on I/O, a child, a timer, or a signal.
    Blocked,
    /// Exited; `exit_code` is set and a parent hasn't reaped it with `wait`.
    Zombie,
}

/// One process's complete kernel-visible state.
pub struct Pcb {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub state: ProcessState,
    /// Which virtual terminal this process's stdio is attached to.
    pub terminal: usize,
    /// Huge frame backing the fixed [`USER_PAGE_START`] code/data super-page,
    /// `None` for the idle task (which never enters user mode).
    pub code_frame: Option<HugeFrame>,
    /// Entry point virtual address, set by `exec` and consumed the first
    /// time this pid is scheduled (see [`crate::proc::process::process_trampoline`]).
    pub entry_vaddr: u64,
    pub heap: Heap,
    pub descriptors: DescriptorTable,
    pub signals: SignalTable,
    /// Monotonic clock reading, in milliseconds, of this process's last
    /// `SIG_ALARM` delivery (or of `exec`/`spawn`, which rearms it).
    /// Mirrors the original's per-PCB `last_alarm` RTC-counter field;
    /// [`crate::proc::process::check_alarms`] walks the table every timer
    /// tick and raises `SIG_ALARM` for any process whose alarm period has
    /// elapsed since this reading.
    pub last_alarm_ms: u64,
    /// Set by [`crate::proc::signal::sigreturn_restore`], consumed by
    /// [`crate::proc::signal::on_return_to_user`] on this process's next
    /// return to user mode.
    pub pending_restore: Option<crate::proc::signal::SavedContext>,
    /// This process's private kernel stack, used only while it is not the
    /// one actually running on the CPU (see [`crate::proc::scheduler`]).
    kernel_stack: Vec<u8>,
    /// Saved stack pointer into `kernel_stack`, valid when `state` isn't
    /// `Running`. Mirrors the original's reliance on a fixed per-process
    /// stack region instead of a saved register file.
    pub kernel_rsp: u64,
    pub exit_code: Option<i32>,
    pub vidmap: bool,
    /// Frames backing this process's VBE linear framebuffer mapping
    /// (`fbmap`), `None` when unmapped. `fbunmap` frees these via
    /// [`crate::mm::frame::free`]; `halt` must do the same for a process
    /// that exits without calling `fbunmap`.
    pub vbe_frames: Option<Vec<Frame>>,
    /// Selects the legacy flat-binary load path over ELF (spec 9 Open
    /// Question: kept for binaries produced before this kernel understood
    /// ELF headers).
    pub compat: bool,
    pub args: String,
}

impl Pcb {
    pub(crate) fn new(pid: Pid, ppid: Pid, pgid: Pid) -> Self {
        Self {
            pid,
            ppid,
            pgid,
            state: ProcessState::Unused,
            terminal: 0,
            code_frame: None,
            entry_vaddr: 0,
            heap: Heap::new(USER_HEAP_START, USER_HEAP_START + (USER_HEAP_CAP_PAGES * 4096) as u64, true),
            descriptors: DescriptorTable::new(),
            signals: SignalTable::new(),
            last_alarm_ms: 0,
            pending_restore: None,
            kernel_stack: Vec::new(),
            kernel_rsp: 0,
            exit_code: None,
            vidmap: false,
            vbe_frames: None,
            compat: false,
            args: String::new(),
        }
    }

    /// Virtual address of the fixed user code/data super-page. Every
    /// process is linked against this same address; only one process's
    /// frame is ever mapped there at a time (spec: "single directory active
    /// at any time").
    #[must_use]
    pub const fn user_page_vaddr() -> u64 {
        USER_PAGE_START
    }

    #[must_use]
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64
    }
}

lazy_static! {
    static ref TABLE: Mutex<Vec<Pcb>> = Mutex::new((0..MAX_PROCESSES as Pid).map(|pid| Pcb::new(pid, PID_KERNEL, pid)).collect());
}

/// Allocates a free PCB slot (not the idle task at pid 0), gives it a
/// fresh kernel stack, and marks it `Runnable`. Returns its pid.
pub fn alloc(ppid: Pid, pgid: Pid) -> KResult<Pid> {
    let mut table = TABLE.lock();
    let slot = table
        .iter()
        .skip(1)
        .position(|p| p.state == ProcessState::Unused)
        .ok_or(KernelError::OutOfMemory)?
        + 1;

    let mut stack = Vec::new();
    stack
        .try_reserve_exact(PROCESS_DATA_SIZE)
        .map_err(|_| KernelError::OutOfMemory)?;
    stack.resize(PROCESS_DATA_SIZE, 0);

    let pcb = &mut table[slot];
    *pcb = Pcb::new(pcb.pid, ppid, pgid);
    pcb.kernel_stack = stack;
    pcb.kernel_rsp = pcb.kernel_stack_top();
    pcb.state = ProcessState::Runnable;
    Ok(pcb.pid)
}

/// Frees a zombie's slot once its parent has `wait`ed on it.
pub fn free(pid: Pid) {
    let mut table = TABLE.lock();
    let pcb = &mut table[pid as usize];
    pcb.heap.clear();
    *pcb = Pcb::new(pid, PID_KERNEL, pid);
}

/// Runs `f` with exclusive access to the PCB table. Held briefly:
/// callers must not block while holding it (matches the original's
/// "process table lock is never held across a blocking call" discipline).
pub fn with_table<R>(f: impl FnOnce(&mut Vec<Pcb>) -> R) -> R {
    f(&mut TABLE.lock())
}

#[cfg(test)]
pub fn reset_for_test() {
    let mut table = TABLE.lock();
    for pid in 0..MAX_PROCESSES as Pid {
        table[pid as usize] = Pcb::new(pid, PID_KERNEL, pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_never_hands_out_idle_pid() {
        reset_for_test();
        let pid = alloc(PID_KERNEL, 1).expect("alloc should succeed");
        assert_ne!(pid, 0);
    }

    #[test_case]
    fn alloc_until_full_then_fails() {
        reset_for_test();
        for _ in 1..MAX_PROCESSES {
            alloc(PID_KERNEL, 1).expect("alloc should succeed while slots remain");
        }
        assert_eq!(alloc(PID_KERNEL, 1), Err(KernelError::OutOfMemory));
    }

    #[test_case]
    fn free_allows_slot_reuse() {
        reset_for_test();
        let pid = alloc(PID_KERNEL, 1).expect("alloc should succeed");
        free(pid);
        let pid2 = alloc(PID_KERNEL, 1).expect("alloc should succeed after free");
        assert_eq!(pid, pid2, "freed slot should be reused before scanning further");
    }
}
