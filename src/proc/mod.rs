//! Process lifecycle and scheduling (spec 4.10), grounded on
//! `original_source/kernel/process.c`/`process.h` and `scheduler.c`.
//!
//! The original keeps one PCB per fixed-size kernel-stack-plus-PCB region
//! (`PROCESS_DATA_SIZE`, a power of two) so a syscall handler can recover
//! "which process is this" by masking the current `rsp`. We don't place
//! PCBs on their own stacks this way; instead [`scheduler::CURRENT`] tracks
//! the running [`pcb::Pid`] directly and each [`pcb::Pcb`] owns its kernel
//! stack region as a plain heap allocation, recovered by table lookup
//! rather than pointer arithmetic. See DESIGN.md for why.

pub mod pcb;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod trampoline;
