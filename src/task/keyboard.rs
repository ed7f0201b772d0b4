//! Async keyboard scancode pipeline, grounded on the standard blog_os
//! interrupt-to-stream pattern: the interrupt handler ([`crate::interrupts`])
//! only pushes a raw scancode byte into a lock-free queue and wakes whoever
//! is polling [`ScancodeStream`]; decoding into key events and routing them
//! into a terminal happens later, off the interrupt stack, in
//! [`print_keypresses`].

use core::pin::Pin;
use core::task::{Context, Poll};

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use futures_util::stream::Stream;
use futures_util::task::AtomicWaker;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

use crate::tty::terminal;

static SCANCODE_QUEUE: OnceCell<ArrayQueue<u8>> = OnceCell::uninit();
static WAKER: AtomicWaker = AtomicWaker::new();

/// Called by [`crate::interrupts::keyboard_interrupt_handler`]. Must not
/// allocate or block: it runs with interrupts disabled, on whatever kernel
/// stack happened to be active when the IRQ fired.
pub(crate) fn add_scancode(scancode: u8) {
    if let Ok(queue) = SCANCODE_QUEUE.try_get() {
        if queue.push(scancode).is_err() {
            crate::serial_println!("[kernel] WARNING: scancode queue full; dropping keypress");
        } else {
            WAKER.wake();
        }
    } else {
        crate::serial_println!("[kernel] WARNING: scancode queue used before init");
    }
}

/// A stream of raw scancode bytes, backed by the queue [`add_scancode`]
/// feeds. Construct at most one — a second [`ScancodeStream::new`] would
/// find the queue already initialized and panic.
pub struct ScancodeStream {
    _private: (),
}

impl ScancodeStream {
    #[allow(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        SCANCODE_QUEUE
            .try_init_once(|| ArrayQueue::new(100))
            .expect("ScancodeStream::new should only be called once");
        Self { _private: () }
    }
}

impl Stream for ScancodeStream {
    type Item = u8;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<u8>> {
        let queue = SCANCODE_QUEUE.try_get().expect("scancode queue not initialized");

        if let Some(scancode) = queue.pop() {
            return Poll::Ready(Some(scancode));
        }

        WAKER.register(cx.waker());
        match queue.pop() {
            Some(scancode) => {
                WAKER.take();
                Poll::Ready(Some(scancode))
            }
            None => Poll::Pending,
        }
    }
}

/// Decodes scancodes into key events and feeds the resulting bytes into
/// whichever virtual terminal is currently active. Runs as a task under
/// [`super::executor::Executor`]; never returns.
pub async fn print_keypresses() {
    use futures_util::stream::StreamExt;

    let mut scancodes = ScancodeStream::new();
    let mut keyboard = Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore);

    while let Some(scancode) = scancodes.next().await {
        if let Ok(Some(event)) = keyboard.add_byte(scancode) {
            if let Some(key) = keyboard.process_keyevent(event) {
                match key {
                    DecodedKey::Unicode(character) => {
                        let mut buf = [0u8; 4];
                        for b in character.encode_utf8(&mut buf).as_bytes() {
                            terminal::push_key(terminal::active(), *b);
                        }
                    }
                    DecodedKey::RawKey(_) => {}
                }
            }
        }
    }
}
