//! Interrupt handling module
//! This module provides the implementation of the Interrupt Descriptor Table (IDT)
//! and the handlers for the interrupts.

use core::arch::naked_asm;

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::{
    instructions::port::Port,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::config::TIMER_PERIOD_MS;
use crate::proc::signal::{SIG_DIV_ZERO, SIG_SEGFAULT};
use crate::{gdt, println, task::keyboard, timer};

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting after interrupt table
/// max offset).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// The Programmable Interrupt Controller (PIC) used for handling hardware interrupts.
pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Enum for the interrupt indices.
pub enum InterruptIndex {
    /// Timer interrupt index.
    Timer = PIC_1_OFFSET,
    /// Keyboard interrupt index.
    Keyboard,
}

impl InterruptIndex {
    /// Returns the index as a `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the index as a `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        // SAFETY:
        // The double fault handler is safe to set as the index is valid.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[InterruptIndex::Timer.as_usize()]
            .set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

/// Shared return path for [`divide_error_handler`]/[`page_fault_handler`]:
/// a kernel-mode fault (RPL 0) halts with a register dump, mirroring
/// `double_fault_handler`; a user-mode fault (RPL 3) raises the matching
/// signal on the current process and redirects straight into its handler,
/// or kills the process if it has none (see
/// [`crate::proc::signal::fault_raise_and_resume`]). Grounded on
/// `original_source/kernel/idt.c`'s `handle_exception`/`handle_user_exception`.
///
/// `frame` points at the saved RIP; `rip_offset` is how many `u64` slots
/// separate it from the start of what the CPU pushed (`0` for a fault with
/// no error code, `1` for one that pushes one ahead of RIP).
extern "C" fn fault_step(sig: u32, frame: *mut u64, rip_offset: isize) {
    // SAFETY: `frame` is the raw `rsp` the CPU left on fault entry (see the
    // calling naked handlers), 16-byte aligned per the SysV/AMD64 exception
    // entry convention, with RIP/CS/RFLAGS/RSP laid out consecutively from
    // `rip_offset` onward.
    unsafe {
        let rip_ptr = frame.offset(rip_offset);
        let cs_ptr = frame.offset(rip_offset + 1);
        let rflags_ptr = frame.offset(rip_offset + 2);
        let rsp_ptr = frame.offset(rip_offset + 3);

        let rip = *rip_ptr;
        let cs = *cs_ptr;
        let rflags = *rflags_ptr;
        let rsp = *rsp_ptr;

        if cs & 0x3 != 3 {
            println!("EXCEPTION: fault in kernel mode (signal class {sig})\nRIP={rip:#x} CS={cs:#x} RFLAGS={rflags:#x} RSP={rsp:#x}");
            panic!("EXCEPTION: fault in kernel mode (signal class {sig}) at {rip:#x}");
        }

        let pid = crate::proc::scheduler::current();
        let (new_rip, new_rsp) = crate::proc::signal::fault_raise_and_resume(pid, sig, rip, rflags, rsp);
        *rip_ptr = new_rip;
        *rsp_ptr = new_rsp;
    }
}

extern "C" fn divide_error_step(frame: *mut u64) {
    fault_step(SIG_DIV_ZERO, frame, 0);
}

extern "C" fn page_fault_step(frame: *mut u64) {
    fault_step(SIG_SEGFAULT, frame, 1);
}

/// `#DE`. No CPU error code, so `rsp` on entry already points at RIP.
#[naked]
extern "x86-interrupt" fn divide_error_handler(_stack_frame: InterruptStackFrame) {
    // SAFETY: no GPRs need saving here — a fault redirected into a signal
    // handler resumes fresh at the handler's entry point, the same reduced
    // fidelity `proc::signal::SavedContext` already commits to for every
    // signal delivery, not just fault-raised ones.
    unsafe {
        naked_asm!(
            "mov rdi, rsp",
            "call {step}",
            "iretq",
            step = sym divide_error_step,
        );
    }
}

/// `#PF`. The CPU pushes a 64-bit error code ahead of RIP. `_error_code` is
/// unused directly (it's read back off the raw stack in [`page_fault_step`]
/// instead) but must stay in the signature to match the IDT's expected
/// handler type for this vector.
#[naked]
extern "x86-interrupt" fn page_fault_handler(
    _stack_frame: InterruptStackFrame,
    _error_code: PageFaultErrorCode,
) {
    // SAFETY: see `divide_error_handler`.
    unsafe {
        naked_asm!(
            "mov rdi, rsp",
            "call {step}",
            "iretq",
            step = sym page_fault_step,
        );
    }
}

/// Initialize the Interrupt Descriptor Table (IDT).
pub fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    println!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // Advances the monotonic clock and fires any expired one-shot timers
    // (alarms, sleeps). Does not force a context switch: this kernel's
    // scheduler is cooperative (see `proc::scheduler`'s module doc), so a
    // process only ever gets switched away from at a syscall/scheduler call
    // boundary, never at an arbitrary interrupted instruction.
    timer::tick(TIMER_PERIOD_MS);
    crate::proc::process::check_alarms(timer::now_ms());

    // Notify the PICs that the interrupt has been handled.
    //
    // SAFETY:
    // We are notifying the PIC that the interrupt has been handled.
    // Can fail if the PIC is not initialized.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let mut port = Port::new(0x60);

    // Read the scancode from the keyboard port.
    //
    // SAFETY:
    // We are reading from the keyboard port which is known to be safe.
    let scancode: u8 = unsafe { port.read() };
    keyboard::add_scancode(scancode);

    // Notify the PICs that the interrupt has been handled.
    //
    // SAFETY:
    // Unsafe because accessing PICS directly can lead to undefined behavior if not done correctly.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

#[cfg(test)]
mod tests {
    use x86_64::instructions::interrupts;

    #[test_case]
    fn test_breakpoint_exception() {
        interrupts::int3();
    }
}
