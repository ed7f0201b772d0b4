//! Cooperative async executor for kernel-side tasks (the keyboard pipeline,
//! and future I/O-bound bookkeeping), grounded on the standard blog_os
//! waker-queue executor pattern: each task gets a [`Waker`] that just pushes
//! its [`TaskId`] back onto a ready queue, so waking from an interrupt
//! handler never needs to touch the task map itself.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::task::{Context, Poll, Waker};

use crossbeam_queue::ArrayQueue;

use super::{Task, TaskId};

struct TaskWaker {
    task_id: TaskId,
    task_queue: Arc<ArrayQueue<TaskId>>,
}

impl TaskWaker {
    fn new(task_id: TaskId, task_queue: Arc<ArrayQueue<TaskId>>) -> Waker {
        Waker::from(Arc::new(Self { task_id, task_queue }))
    }

    fn wake_task(&self) {
        if self.task_queue.push(self.task_id).is_err() {
            crate::serial_println!("[kernel] WARNING: task_queue full; dropping wake");
        }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task();
    }
}

/// Runs tasks to completion, round-robin, only polling a task again once
/// something has woken it. Never returns; between rounds with nothing ready
/// it halts the CPU until the next interrupt (matching the kernel's idle
/// loop elsewhere).
pub struct Executor {
    tasks: BTreeMap<TaskId, Task>,
    task_queue: Arc<ArrayQueue<TaskId>>,
    waker_cache: BTreeMap<TaskId, Waker>,
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            task_queue: Arc::new(ArrayQueue::new(100)),
            waker_cache: BTreeMap::new(),
        }
    }

    pub fn spawn(&mut self, task: Task) {
        let task_id = task.id;
        if self.tasks.insert(task_id, task).is_some() {
            panic!("task with same ID already in tasks");
        }
        self.task_queue.push(task_id).expect("task_queue full");
    }

    fn run_ready_tasks(&mut self) {
        let Self { tasks, task_queue, waker_cache } = self;

        while let Some(task_id) = task_queue.pop() {
            let Some(task) = tasks.get_mut(&task_id) else {
                continue; // task already completed and was removed
            };
            let waker = waker_cache.entry(task_id).or_insert_with(|| TaskWaker::new(task_id, task_queue.clone()));
            let mut context = Context::from_waker(waker);
            match task.poll(&mut context) {
                Poll::Ready(()) => {
                    tasks.remove(&task_id);
                    waker_cache.remove(&task_id);
                }
                Poll::Pending => {}
            }
        }
    }

    fn sleep_if_idle(&self) {
        use x86_64::instructions::interrupts::{self, enable_and_hlt};

        interrupts::disable();
        if self.task_queue.is_empty() {
            enable_and_hlt();
        } else {
            interrupts::enable();
        }
    }

    /// Drives every spawned task to completion, forever. Intended to run
    /// on the idle task's own kernel stack once `proc::scheduler`'s run
    /// queue is otherwise empty.
    pub fn run(&mut self) -> ! {
        loop {
            self.run_ready_tasks();
            self.sleep_if_idle();
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}
