//! Process lifecycle operations (spec 4.10): `fork`, `exec`, `wait`, `halt`.
//! Grounded on `original_source/kernel/process.c`.
//!
//! A process's kernel-visible "not currently running" state is entirely
//! captured by its [`pcb::Pcb`]: its own kernel stack/saved `rsp`
//! ([`scheduler`]), its heap, descriptor table, signal table, and the huge
//! frame backing its code/data/stack window. `exec` replaces that state
//! wholesale (spec: "replace the caller's register snapshot... reset signal
//! table; clear heap"); `fork` clones it into a fresh slot (spec: "deep-copy
//! the heap... clone the user page via the temporary mapping").
//!
//! This rewrite's cooperative scheduler (see `scheduler` module doc) doesn't
//! keep a full saved-register snapshot per process the way the original's
//! fixed per-process trapframe region does; a forked child resumes at its
//! program's entry point with its cloned heap/descriptors/frame already in
//! place, rather than at the instruction after the `fork` call with a `0`
//! return value. See DESIGN.md, "Open Question: fork resumption fidelity".

use alloc::string::String;

use crate::config::{EXIT_CODE_SIGNAL_KILLED, USER_STACK_TOP};
use crate::elf;
use crate::error::{KernelError, KResult};
use crate::gdt;
use crate::mm::paging;
use crate::proc::pcb::{self, Pcb, Pid, ProcessState, PID_KERNEL};
use crate::proc::scheduler;
use crate::userspace::process as uproc;

/// Copies `binary`'s loadable segments into a freshly allocated huge frame
/// and points `pid`'s PCB at it. Does not touch the PCB's heap, descriptor
/// table, or signal table — callers decide whether those should be reset
/// (`exec`) or already hold cloned state (`fork`).
fn load_image(pid: Pid, binary: &[u8]) -> KResult<()> {
    let image = elf::load(binary)?;
    let frame = paging::huge_alloc()?;
    let window = crate::config::USER_PAGE_WINDOW_SIZE as u32;
    let base = Pcb::user_page_vaddr();

    let result = paging::with_address_space(|space| -> KResult<()> {
        space.map_user_page(base, frame)?;
        space.memset_user(base, 0, window)?;
        for seg in &image.segments {
            let src = &binary[seg.file_offset..seg.file_offset + seg.file_size];
            space.copy_to_user(base + seg.page_offset as u64, src)?;
        }
        Ok(())
    });
    if let Err(e) = result {
        paging::huge_free(frame);
        return Err(e);
    }

    pcb::with_table(|table| {
        let p = &mut table[pid as usize];
        p.code_frame = Some(frame);
        p.entry_vaddr = base + image.entry_offset as u64;
        p.compat = image.compat;
    });
    Ok(())
}

/// Spawns a brand new process running `binary` (spec's `execute`: the
/// shell/init path that both allocates a PCB and loads an image in one
/// step, as distinct from an already-running process's `exec`).
pub fn spawn(ppid: Pid, pgid: Pid, terminal: usize, binary: &[u8], args: String) -> KResult<Pid> {
    let pid = pcb::alloc(ppid, pgid)?;
    if let Err(e) = load_image(pid, binary) {
        pcb::free(pid);
        return Err(e);
    }

    let stack_top = pcb::with_table(|table| {
        let p = &mut table[pid as usize];
        p.terminal = terminal;
        p.args = args;
        p.last_alarm_ms = crate::timer::now_ms();
        p.kernel_stack_top()
    });
    let rsp = scheduler::prepare_kernel_stack(stack_top, process_trampoline);
    pcb::with_table(|table| table[pid as usize].kernel_rsp = rsp);
    scheduler::enqueue(pid);
    Ok(pid)
}

/// `exec`: replaces the calling process's image in place. Spec: "parse the
/// command line... clear heap; rearm alarm timer". Since this can only be
/// called by the process currently running (no other process's code/data
/// window is mapped), it directly overwrites `pid`'s own frame and schedules
/// resumption at the new entry point.
pub fn exec(pid: Pid, binary: &[u8], args: String) -> KResult<()> {
    let old_frame = pcb::with_table(|table| table[pid as usize].code_frame.take());
    if let Some(frame) = old_frame {
        paging::huge_free(frame);
    }
    if let Err(e) = load_image(pid, binary) {
        return Err(e);
    }
    pcb::with_table(|table| {
        let p = &mut table[pid as usize];
        p.heap.clear();
        p.signals = crate::proc::signal::SignalTable::new();
        p.args = args;
        p.last_alarm_ms = crate::timer::now_ms();
    });
    Ok(())
}

/// `fork`: clones `parent`'s heap, descriptor table, signal table, terminal,
/// pgid, and code/data/stack frame into a freshly allocated PCB, which is
/// then enqueued as runnable. Returns the child's pid.
pub fn fork(parent: Pid) -> KResult<Pid> {
    let (ppid, pgid, terminal, args, entry_vaddr, compat, parent_frame) =
        pcb::with_table(|table| {
            let p = &table[parent as usize];
            (
                p.pid,
                p.pgid,
                p.terminal,
                p.args.clone(),
                p.entry_vaddr,
                p.compat,
                p.code_frame,
            )
        });

    let child = pcb::alloc(ppid, pgid)?;

    let child_frame = match parent_frame {
        Some(_) => {
            let dest = paging::huge_alloc().map_err(|e| {
                pcb::free(child);
                e
            })?;
            // SAFETY: the parent is the currently running process, so its
            // code/data/stack window is the one presently mapped at
            // `Pcb::user_page_vaddr()`.
            let result = unsafe { paging::with_address_space(|space| space.clone_user_page(Pcb::user_page_vaddr(), dest)) };
            if let Err(e) = result {
                paging::huge_free(dest);
                pcb::free(child);
                return Err(e);
            }
            Some(dest)
        }
        None => None,
    };

    let heap_clone = match pcb::with_table(|table| table[parent as usize].heap.clone_deep()) {
        Ok(heap) => heap,
        Err(e) => {
            if let Some(frame) = child_frame {
                paging::huge_free(frame);
            }
            pcb::free(child);
            return Err(e);
        }
    };
    let (descriptors_clone, signals_clone) = pcb::with_table(|table| {
        let p = &table[parent as usize];
        (p.descriptors.fork(), p.signals.clone())
    });

    let stack_top = pcb::with_table(|table| {
        let c = &mut table[child as usize];
        c.terminal = terminal;
        c.args = args;
        c.entry_vaddr = entry_vaddr;
        c.compat = compat;
        c.code_frame = child_frame;
        c.heap = heap_clone;
        c.descriptors = descriptors_clone;
        c.signals = signals_clone;
        c.kernel_stack_top()
    });
    let rsp = scheduler::prepare_kernel_stack(stack_top, process_trampoline);
    pcb::with_table(|table| table[child as usize].kernel_rsp = rsp);
    scheduler::enqueue(child);
    Ok(child)
}

/// `wait`: reaps a zombie child of `parent` matching `target` (a specific
/// pid, or `None` for "any child"). Blocks (re-checking on every wake) until
/// a match is found, or fails immediately if `parent` has no matching child
/// at all. Mirrors spec's "examine children... if none matches at all,
/// fail".
pub fn wait(parent: Pid, target: Option<Pid>) -> KResult<(Pid, i32)> {
    loop {
        let outcome = pcb::with_table(|table| {
            let mut has_match = false;
            for child in table.iter() {
                if child.ppid != parent {
                    continue;
                }
                if let Some(want) = target {
                    if child.pid != want {
                        continue;
                    }
                }
                has_match = true;
                if child.state == ProcessState::Zombie {
                    return Some((child.pid, child.exit_code.unwrap_or(0)));
                }
            }
            if has_match {
                None
            } else {
                Some((PID_KERNEL, -1)) // sentinel: "no matching child at all"
            }
        });

        match outcome {
            Some((pid, _)) if pid == PID_KERNEL => return Err(KernelError::InvalidArgument),
            Some((pid, code)) => {
                pcb::free(pid);
                return Ok((pid, code));
            }
            None => scheduler::block_current(),
        }
    }
}

/// `halt`: tears down `pid`'s resources, orphans live children to the
/// kernel, reaps already-dead children, and either zombifies (waking a live
/// parent) or auto-reaps (parent already gone).
pub fn halt(pid: Pid, status: i32) {
    let (ppid, frame, vbe_frames) = pcb::with_table(|table| {
        let p = &mut table[pid as usize];
        p.descriptors = crate::fs::file::DescriptorTable::new(); // drops every fd, closing as needed
        p.heap.clear();
        let frame = p.code_frame.take();
        let vbe_frames = p.vbe_frames.take();
        (p.ppid, frame, vbe_frames)
    });
    if let Some(frame) = frame {
        paging::with_address_space(|space| {
            let _ = space.page_unmap_huge(Pcb::user_page_vaddr());
        });
        paging::huge_free(frame);
    }
    if let Some(frames) = vbe_frames {
        paging::with_address_space(|space| {
            let _ = space.update_vbe_page(None);
        });
        for frame in frames {
            crate::mm::frame::free(frame);
        }
    }

    pcb::with_table(|table| {
        for child in table.iter_mut() {
            if child.ppid == pid {
                if child.state == ProcessState::Zombie {
                    // Already dead and now unreachable: reap immediately.
                    *child = Pcb::new(child.pid, PID_KERNEL, child.pid);
                } else {
                    child.ppid = PID_KERNEL;
                }
            }
        }
    });

    let parent_alive = ppid != PID_KERNEL
        && pcb::with_table(|table| table[ppid as usize].state != ProcessState::Unused);

    if parent_alive {
        pcb::with_table(|table| {
            let p = &mut table[pid as usize];
            p.state = ProcessState::Zombie;
            p.exit_code = Some(status);
        });
        scheduler::wake(ppid);
    } else {
        pcb::free(pid);
    }

    scheduler::switch_away_from_exiting();
    unreachable!("a zombie/freed pid is never rescheduled");
}

/// Walks every live process and raises `SIG_ALARM` for any whose alarm
/// period has elapsed since its last delivery (or since `spawn`/`exec`
/// armed it). Called once per timer tick from
/// [`crate::interrupts::timer_interrupt_handler`], mirroring the
/// original's `process_update_clock`. A process stops accumulating alarms
/// the instant `halt` moves it out of `Runnable`/`Running`/`Blocked` (into
/// `Zombie`, and eventually `Unused` once reaped) — there is no separate
/// "cancel" step because `check_alarms` simply never looks at it again.
pub fn check_alarms(now_ms: u64) {
    pcb::with_table(|table| {
        for p in table.iter_mut() {
            if !matches!(p.state, ProcessState::Runnable | ProcessState::Running | ProcessState::Blocked) {
                continue;
            }
            if now_ms.saturating_sub(p.last_alarm_ms) >= crate::config::SIGALRM_PERIOD_MS {
                p.last_alarm_ms = now_ms;
                p.signals.raise(crate::proc::signal::SIG_ALARM);
            }
        }
    });
}

/// The entry trampoline every freshly `spawn`ed or `fork`ed process's first
/// [`scheduler::context_switch`] returns into. Looks up its own pid (the
/// scheduler has already updated [`scheduler::current`] before switching
/// here), points the TSS at this process's own kernel stack so a later
/// `int 0x80` lands on it, and transitions to Ring 3 at the entry point
/// `exec`/`fork` recorded.
extern "C" fn process_trampoline() -> ! {
    let pid = scheduler::current();
    let (entry, kernel_stack_top) =
        pcb::with_table(|table| (table[pid as usize].entry_vaddr, table[pid as usize].kernel_stack_top()));

    let user_cs = gdt::user_code_selector();
    let user_ds = gdt::user_data_selector();

    let mut kernel_rsp_cell: u64 = 0;
    // SAFETY: `kernel_stack_top` is this pid's own live kernel stack
    // (allocated by `pcb::alloc`, outliving the process); `entry` was
    // validated by `elf::load` to land inside the mapped code/data window.
    unsafe {
        uproc::enter_user_mode(
            entry,
            USER_STACK_TOP,
            u64::from(user_cs.0),
            u64::from(user_ds.0),
            &mut kernel_rsp_cell,
            Some(kernel_stack_top),
        );
    }

    // A process's `halt` syscall handler calls `halt` directly and diverges
    // through `scheduler::switch_away_from_exiting` before ever returning
    // here. This call only fires if `enter_user_mode` somehow returned
    // without that happening (it shouldn't); treat it like a fatal signal.
    halt(pid, EXIT_CODE_SIGNAL_KILLED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn wait_with_no_children_fails_immediately() {
        pcb::reset_for_test();
        assert_eq!(wait(1, None), Err(KernelError::InvalidArgument));
    }

    #[test_case]
    fn check_alarms_raises_sig_alarm_once_period_elapses() {
        pcb::reset_for_test();
        let pid = pcb::alloc(1, 1).expect("alloc should succeed");
        pcb::with_table(|t| {
            t[pid as usize].state = ProcessState::Running;
            t[pid as usize].last_alarm_ms = 0;
        });
        check_alarms(crate::config::SIGALRM_PERIOD_MS - 1);
        assert_eq!(
            pcb::with_table(|t| t[pid as usize].signals.next_deliverable()),
            None,
            "alarm must not fire before its period elapses"
        );

        check_alarms(crate::config::SIGALRM_PERIOD_MS);
        pcb::with_table(|t| {
            t[pid as usize]
                .signals
                .register(crate::proc::signal::SIG_ALARM, Some(0x4000_2000))
                .expect("register should succeed");
        });
        // The raise already happened above; re-raising after registering a
        // handler lets next_deliverable hand back the handler address.
        pcb::with_table(|t| t[pid as usize].signals.raise(crate::proc::signal::SIG_ALARM));
        assert_eq!(
            pcb::with_table(|t| t[pid as usize].signals.next_deliverable()),
            Some((crate::proc::signal::SIG_ALARM, 0x4000_2000))
        );
    }

    #[test_case]
    fn check_alarms_ignores_non_live_processes() {
        pcb::reset_for_test();
        let pid = pcb::alloc(1, 1).expect("alloc should succeed");
        pcb::with_table(|t| {
            t[pid as usize].state = ProcessState::Zombie;
            t[pid as usize].last_alarm_ms = 0;
        });
        check_alarms(crate::config::SIGALRM_PERIOD_MS * 10);
        assert_eq!(pcb::with_table(|t| t[pid as usize].signals.next_deliverable()), None);
    }

    #[test_case]
    fn wait_reaps_existing_zombie_child() {
        pcb::reset_for_test();
        let child = pcb::alloc(1, 1).expect("alloc should succeed");
        pcb::with_table(|table| {
            table[child as usize].state = ProcessState::Zombie;
            table[child as usize].exit_code = Some(7);
        });
        let (pid, code) = wait(1, None).expect("wait should find the zombie");
        assert_eq!(pid, child);
        assert_eq!(code, 7);
        pcb::with_table(|table| assert_eq!(table[child as usize].state, ProcessState::Unused));
    }
}
