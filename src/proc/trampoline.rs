//! One-time setup of the shared signal return trampoline page (spec 4.10),
//! adapted from `original_source/kernel/signal.c`'s per-delivery shellcode.
//!
//! This kernel has a single, shared address space (only one process's
//! code/data window is ever mapped at [`pcb::Pcb::user_page_vaddr`] at a
//! time — see that doc comment), so unlike the original's "generate the
//! trampoline fresh into the current stack on every delivery", one frame
//! mapped once at boot, before any process runs, is visible to all of them
//! for the life of the kernel.
//!
//! The trampoline itself is three instructions, reading its arguments off
//! the stack [`crate::proc::signal::try_deliver`] already prepared, rather
//! than the original's baked-in-immediates shellcode (there's no "per call"
//! to bake into, since this page is never regenerated):
//!
//! ```text
//! pop rdi          ; signal number
//! pop rsi          ; pointer to the saved context
//! mov eax, 43      ; SYS_SIGRETURN
//! int 0x80
//! ```

use crate::config::SIGNAL_TRAMPOLINE_VADDR;
use crate::error::KResult;
use crate::mm::{frame, paging};

/// `SYS_SIGRETURN`'s syscall number. Duplicated from `crate::syscall`
/// (a private constant there) since this shellcode bakes it in as an
/// immediate rather than calling through Rust.
const SYS_SIGRETURN: u32 = 43;

fn shellcode() -> [u8; 9] {
    let mut code = [0x5f, 0x5e, 0xb8, 0, 0, 0, 0, 0xcd, 0x80];
    code[3..7].copy_from_slice(&SYS_SIGRETURN.to_le_bytes());
    code
}

/// Allocates and maps the trampoline page. Must run once, before the first
/// process is scheduled into user mode.
pub fn init() -> KResult<()> {
    let f = frame::alloc()?;
    paging::with_address_space(|space| -> KResult<()> {
        space.page_map(SIGNAL_TRAMPOLINE_VADDR, f, true, true)?;
        space.copy_to_user(SIGNAL_TRAMPOLINE_VADDR, &shellcode())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn shellcode_encodes_pop_pop_mov_int80() {
        let code = shellcode();
        assert_eq!(code[0], 0x5f, "pop rdi");
        assert_eq!(code[1], 0x5e, "pop rsi");
        assert_eq!(code[2], 0xb8, "mov eax, imm32");
        assert_eq!(u32::from_le_bytes(code[3..7].try_into().unwrap()), SYS_SIGRETURN);
        assert_eq!(&code[7..9], &[0xcd, 0x80], "int 0x80");
    }
}
