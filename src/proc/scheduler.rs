//! FIFO run queue and kernel-stack context switch (spec 4.10), grounded on
//! `original_source/kernel/scheduler.c`.
//!
//! The original's scheduler picks the next PCB and performs a context
//! switch that is really just a stack-pointer swap plus a handful of
//! callee-saved registers — it never touches a full register file, because
//! every process that isn't currently running is parked inside a function
//! call (a syscall, or the scheduler itself), not at an arbitrary
//! interrupted instruction. [`context_switch`] below is exactly that:
//! push/save, swap `rsp`, pop/restore, `ret` — the same shape as
//! [`crate::userspace::process::switch_to_user_mode`]'s register save,
//! generalized from one saved slot to one per process.

use alloc::collections::VecDeque;
use core::arch::naked_asm;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::mm::paging;
use crate::proc::pcb::{self, Pid, ProcessState};

/// pid 0 is always the idle task: never blocks, never exits, and is chosen
/// whenever the run queue is empty.
pub const IDLE_PID: Pid = 0;

lazy_static! {
    static ref RUN_QUEUE: Mutex<VecDeque<Pid>> = Mutex::new(VecDeque::new());
    static ref CURRENT: Mutex<Pid> = Mutex::new(IDLE_PID);
}

/// The pid currently executing.
#[must_use]
pub fn current() -> Pid {
    *CURRENT.lock()
}

/// Marks the idle task as the running process at boot, without performing
/// an actual stack switch (we are already executing on its stack: the
/// kernel's boot stack, reused as pid 0's kernel stack).
pub fn init() {
    pcb::with_table(|table| table[IDLE_PID as usize].state = ProcessState::Running);
    *CURRENT.lock() = IDLE_PID;
}

/// Appends `pid` to the back of the run queue and marks it runnable.
/// Mirrors `scheduler_enqueue`.
pub fn enqueue(pid: Pid) {
    pcb::with_table(|table| table[pid as usize].state = ProcessState::Runnable);
    RUN_QUEUE.lock().push_back(pid);
}

fn pick_next() -> Pid {
    RUN_QUEUE.lock().pop_front().unwrap_or(IDLE_PID)
}

/// Voluntarily gives up the CPU: re-enqueues the current process (unless
/// it's the idle task, which is never queued) and switches to whatever's
/// next. Mirrors `scheduler_yield`.
pub fn yield_now() {
    let current = current();
    if current != IDLE_PID {
        enqueue(current);
    }
    switch_to(pick_next());
}

/// Marks the current process `Blocked` (not re-enqueued) and switches
/// away. The caller is responsible for arranging a later [`wake`].
pub fn block_current() {
    let current = current();
    pcb::with_table(|table| table[current as usize].state = ProcessState::Blocked);
    switch_to(pick_next());
}

/// Moves a blocked process back onto the run queue.
pub fn wake(pid: Pid) {
    enqueue(pid);
}

/// Switches off the current process without re-enqueuing or blocking it —
/// used by `exit`/`halt`, which have already set the PCB to `Zombie`.
pub fn switch_away_from_exiting() {
    switch_to(pick_next());
}

fn switch_to(next: Pid) {
    let current = current();
    if current == next {
        return;
    }

    // SAFETY: interrupts are disabled for the duration of a context switch
    // (spec 9's cooperative single-CPU model), so no other code observes
    // the table between taking these raw pointers and the stack swap
    // below. The table's backing `Vec` is sized once at boot and never
    // reallocated, so `prev_rsp_slot` stays valid across the switch.
    // The outgoing process's heap is unmapped before the switch (its frames
    // stay allocated; only the page-table entries go away) and the
    // incoming one's is mapped back in, matching `mm::heap::Heap::unmap`'s
    // own doc ("called when the owning process is switched out") — per
    // process address spaces share the one global page table, so at most
    // one heap may be mapped at a time.
    pcb::with_table(|table| {
        let _ = table[current as usize].heap.unmap();
    });

    let (prev_rsp_slot, next_rsp, next_code_frame) = pcb::with_table(|table| {
        table[next as usize].state = ProcessState::Running;
        (
            core::ptr::addr_of_mut!(table[current as usize].kernel_rsp),
            table[next as usize].kernel_rsp,
            table[next as usize].code_frame,
        )
    });

    // Rewrite the single shared user-page window to the process we're
    // switching to, matching the spec's "single directory active at any
    // time" model (mirrored in `mm::paging`'s module doc). A no-op for the
    // idle task, which never enters user mode.
    if let Some(frame) = next_code_frame {
        paging::with_address_space(|space| {
            let _ = space.map_user_page(pcb::Pcb::user_page_vaddr(), frame);
        });
    }
    pcb::with_table(|table| {
        let _ = table[next as usize].heap.map();
    });

    *CURRENT.lock() = next;
    // SAFETY: both stacks were either prepared by `prepare_kernel_stack`
    // (for a never-yet-run process) or last suspended by this very
    // function (for one resuming), so the layout `context_switch` expects
    // on each is guaranteed to match.
    unsafe {
        context_switch(prev_rsp_slot, next_rsp);
    }
}

/// Builds the initial stack contents for a process that has never run:
/// a return address of `entry` plus six zeroed callee-saved registers, in
/// the exact order [`context_switch`] restores them. The first time this
/// pid is switched to, `context_switch`'s `ret` lands in `entry`.
#[must_use]
pub fn prepare_kernel_stack(stack_top: u64, entry: extern "C" fn() -> !) -> u64 {
    // SAFETY: `stack_top` is the top of a freshly allocated, sufficiently
    // large kernel stack owned exclusively by the caller (a just-allocated
    // PCB); writing the initial frame below it is in-bounds.
    unsafe {
        let mut rsp = stack_top as *mut u64;
        rsp = rsp.sub(1);
        rsp.write(entry as u64); // return address for context_switch's `ret`
        for _ in 0..6 {
            rsp = rsp.sub(1);
            rsp.write(0); // rbx, rbp, r12, r13, r14, r15 in restore order
        }
        rsp as u64
    }
}

/// Swaps the current kernel stack for `next_rsp`, saving the old one to
/// `*prev_rsp`. Pure stack-pointer and callee-saved-register swap — no
/// segment, CR3, or interrupt-flag changes, since every process here
/// shares the kernel's address space and runs with interrupts off across
/// the switch.
#[naked]
unsafe extern "C" fn context_switch(_prev_rsp: *mut u64, _next_rsp: u64) {
    // SAFETY: standard cooperative-thread stack swap (same shape as
    // `switch_to_user_mode`'s save, generalized to a restore on both ends).
    // On entry: rdi = prev_rsp, rsi = next_rsp.
    unsafe {
        naked_asm!(
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",
            "ret",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn pick_next_falls_back_to_idle_when_queue_empty() {
        RUN_QUEUE.lock().clear();
        assert_eq!(pick_next(), IDLE_PID);
    }

    #[test_case]
    fn enqueue_then_pick_next_is_fifo() {
        pcb::reset_for_test();
        RUN_QUEUE.lock().clear();
        enqueue(2);
        enqueue(3);
        assert_eq!(pick_next(), 2);
        assert_eq!(pick_next(), 3);
    }
}
