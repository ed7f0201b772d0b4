//! Main for little self made rust OS.

#![feature(custom_test_frameworks)]
#![test_runner(self_rust_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use x86_64::VirtAddr;

use self_rust_os::task::{executor::Executor, keyboard, Task};
use self_rust_os::{allocator, memory, mm, net, proc, println, serial_println};

entry_point!(kernel_main);

////////////////////////
//     Entry point    //
////////////////////////

/// Number of 2 MiB huge frames made available to user/kernel super-page
/// allocations. Picked to stay inside the 256 MiB the bootloader identity
/// maps for us; see `mm::paging`'s pool-sizing note in DESIGN.md.
const HUGE_FRAME_BUDGET: usize = 64;

/// Brings the kernel up from the bootloader handoff to a running idle
/// loop: kernel heap, the spec's own frame/paging pools, interrupts,
/// scheduling, and the network stack, in that order, then hands off to
/// the async executor (keyboard input today; future I/O-bound kernel
/// tasks later) as the idle task's body.
#[expect(clippy::expect_used, reason = "boot-time setup has no recovery path")]
fn kernel_main(boot_info: &'static BootInfo) -> ! {
    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);

    // SAFETY: `physical_memory_offset` is the offset the bootloader mapped
    // all of physical memory at, as promised by `BootInfo`.
    let mut mapper = unsafe { memory::init(phys_mem_offset) };
    // SAFETY: `boot_info.memory_map` is the map the bootloader itself built.
    let mut frame_allocator = unsafe { memory::BootInfoFrameAllocator::new(&boot_info.memory_map) };

    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");

    self_rust_os::init();

    mm::frame::init(0);
    mm::paging::init(mapper);
    mm::paging::init_huge_frames(HUGE_FRAME_BUDGET);

    proc::scheduler::init();
    proc::trampoline::init().expect("signal trampoline page setup failed");
    net::init();

    println!("[kernel] boot complete");
    serial_println!("[kernel] boot complete");

    #[cfg(test)]
    test_main();

    let mut executor = Executor::new();
    executor.spawn(Task::new(print_keypresses()));
    executor.run();
}

async fn print_keypresses() {
    keyboard::print_keypresses().await;
}

////////////////////////
//    Panic handler   //
////////////////////////

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    self_rust_os::hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    self_rust_os::test_panic_handler(info)
}
