//! Compile-time kernel configuration constants.
//!
//! Gathers the scattered `#define`s of the original C kernel
//! (`process.c`, `net.h`, `tcp.c`, `file.h`) into one place.

/// Number of process control block slots, including the idle task at index 0.
pub const MAX_PROCESSES: usize = 16;

/// Per-process open file descriptor table size.
pub const MAX_FILES: usize = 8;

/// Size in bytes of one process's `{pcb, kernel stack}` region. Must be a
/// power of two so the PCB pointer can be recovered by masking `rsp`.
pub const PROCESS_DATA_SIZE: usize = 8192;

/// Number of virtual terminals.
pub const NUM_TERMINALS: usize = 3;

/// PIT frequency the kernel is driven at.
pub const TIMER_HZ: u32 = 100;

/// Milliseconds between one timer tick.
pub const TIMER_PERIOD_MS: u64 = 1000 / TIMER_HZ as u64;

/// Period of the per-process `SIGALRM` timer, in milliseconds.
pub const SIGALRM_PERIOD_MS: u64 = 10_000;

/// 4 KiB page size used throughout the modeled address space.
pub const PAGE_SIZE_4K: usize = 4096;

/// 4 MiB super-page size used for the user page and kernel page.
pub const PAGE_SIZE_4M: usize = 4 * 1024 * 1024;

/// Number of entries in a page directory / leaf page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Physical memory modeled by the frame bitmap: 256 MiB at 4 KiB granularity.
pub const NUM_FRAMES: usize = 65536;

/// Virtual address of the fixed 4 MiB user code/data super-page.
pub const USER_PAGE_START: u64 = 0x0800_0000;

/// Size of the fixed user code/data/stack window backed by one huge frame
/// (spec's single 4 MiB page holding a whole process's image, adapted to a
/// 2 MiB huge page — see DESIGN.md). Code and data live at the bottom per
/// [`crate::elf`]; the user stack lives at the top, growing down.
pub const USER_PAGE_WINDOW_SIZE: u64 = 2 * 1024 * 1024;

/// Initial top-of-stack virtual address for a freshly exec'd process.
pub const USER_STACK_TOP: u64 = USER_PAGE_START + USER_PAGE_WINDOW_SIZE;

/// Virtual address of the per-process growable heap region (one page below
/// the 128 MiB mark reserved for the user page; grows upward).
pub const USER_HEAP_START: u64 = 0x0c00_0000;

/// Maximum pages the user heap may grow to (32 MiB).
pub const USER_HEAP_CAP_PAGES: usize = (32 * 1024 * 1024) / PAGE_SIZE_4K;

/// Virtual address of the vidmap page exposed to processes that request it.
pub const VIDMAP_PAGE: u64 = 0x0e00_0000;

/// Virtual address of the VBE linear framebuffer region.
pub const VBE_FRAMEBUFFER_START: u64 = 0x0e40_0000;

/// Size of the VBE framebuffer region in 4 KiB pages (covers up to 1024x768x32bpp).
pub const VBE_FRAMEBUFFER_PAGES: usize = 768;

/// Virtual address of the temporary mapping slot used for clone operations.
pub const TEMP_PAGE: u64 = 0x0fff_f000;

/// Maximum TCP segment size, in bytes of payload.
pub const TCP_MSS: usize = 1460;

/// Starting receive window size, in bytes (spec: 8 KiB).
pub const TCP_RWND_INITIAL: i32 = 8192;

/// Minimum retransmission timeout, in milliseconds.
pub const TCP_MIN_RTO_MS: u64 = 1_000;

/// Maximum retransmission timeout, in milliseconds.
pub const TCP_MAX_RTO_MS: u64 = 120_000;

/// Default RTO before any RTT sample has been taken.
pub const TCP_DEFAULT_RTO_MS: u64 = 3_000;

/// Number of duplicate ACKs that triggers a fast retransmit.
pub const TCP_DUP_ACK_THRESHOLD: u32 = 3;

/// How long a TCP socket waits in `TIME_WAIT`/`FIN_WAIT_2` before closing, in ms.
pub const TCP_FIN_TIMEOUT_MS: u64 = 60_000;

/// How long a reachable or unreachable ARP entry is cached, in ms.
pub const ARP_CACHE_TIMEOUT_MS: u64 = 60_000;

/// How long an ARP entry waits for a reply before giving up, in ms.
pub const ARP_RESOLVE_TIMEOUT_MS: u64 = 1_000;

/// First port handed out by ephemeral port allocation.
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Last port handed out by ephemeral port allocation (inclusive).
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Exit status used for a process killed by an unhandled fatal signal.
pub const EXIT_CODE_SIGNAL_KILLED: i32 = 256;

/// Sentinel sleep/wait-queue PID meaning "no parent" (orphaned to the kernel).
pub const PID_KERNEL: i32 = -1;

/// Virtual address of the one-page signal return trampoline, mapped
/// read+execute into every process's address space. A handler's return
/// address is set to this page rather than into the handler's own code, so
/// returning from a signal handler always re-enters the kernel through
/// `sigreturn` instead of falling off the end of arbitrary user code.
pub const SIGNAL_TRAMPOLINE_VADDR: u64 = 0x0dff_f000;

/// Number of distinct signal numbers the kernel recognizes (spec 4.10).
pub const NUM_SIGNALS: usize = 5;
