// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! Implementation of [`MessageLoop`], a single-threaded cooperative
//! [`Future`](future::Future) task executor.

use std::{
    future, marker, pin,
    sync::{self, Arc, atomic},
    task,
};

fn lock<T>(m: &sync::Mutex<T>) -> sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(sync::PoisonError::into_inner)
}

/// Identifier of a task [posted](MessageLoop::post_task) to a [`MessageLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Dyn dispatcher trait to a [`Future`](future::Future) posted to a
/// [`MessageLoop`].
///
/// # See also:
///
/// * [`QueuedTask`]
trait QueuedTaskDispatch: marker::Send {
    /// Poll the wrapped [`Future`](future::Future).
    ///
    /// Return true once the wrapped future's
    /// [`poll()`](future::Future::poll) returns
    /// [`Ready`](task::Poll::Ready), `false` otherwise.
    fn poll_pinned(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> bool;
}

/// Dyn dispatcher to a [`Future`](future::Future) posted to a
/// [`MessageLoop`].
///
/// As the individual posted futures can all have different
/// [`Output`](future::Future::Output) types, it is not possible to store them
/// as `dyn` objects and dispatch to their [`poll()`](future::Future::poll)
/// implementations directly, hence the indirection.
struct QueuedTask<F: future::Future + marker::Send>
where
    F::Output: marker::Send + 'static,
{
    f: pin::Pin<Box<F>>,
    /// The result, stored once `f` completes. Shared with the task's
    /// [`MessageLoopTaskWaiter`].
    result: Arc<sync::Mutex<Option<F::Output>>>,
}

impl<F: future::Future + marker::Send> QueuedTaskDispatch for QueuedTask<F>
where
    F::Output: marker::Send + 'static,
{
    fn poll_pinned(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> bool {
        let this = pin::Pin::into_inner(self);
        match this.f.as_mut().poll(cx) {
            task::Poll::Ready(result) => {
                *lock(&this.result) = Some(result);
                true
            }
            task::Poll::Pending => false,
        }
    }
}

enum TaskStatus {
    /// The task's last poll returned [`Pending`](task::Poll::Pending) and the
    /// task has not been woken since.
    Blocked,
    /// The task has been freshly posted or woken.
    Runnable,
}

struct TaskQueueEntry {
    id: TaskId,
    status: TaskStatus,
    /// Temporarily taken out while the task is being polled.
    task: Option<pin::Pin<Box<dyn QueuedTaskDispatch>>>,
    /// [`Waker`](task::Waker) installed by the [`MessageLoopTaskWaiter`]'s
    /// [`Future::poll()`](future::Future::poll), if any.
    waiter_waker: Option<task::Waker>,
}

struct Waker {
    task_id: TaskId,
    message_loop: sync::Weak<MessageLoop>,
}

impl task::Wake for Waker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let message_loop = match self.message_loop.upgrade() {
            Some(message_loop) => message_loop,
            None => return,
        };
        let mut tasks = lock(&message_loop.tasks);
        if let Some(t) = tasks.iter_mut().find(|t| t.id == self.task_id) {
            t.status = TaskStatus::Runnable;
        }
    }
}

enum TaskWaiterState<T: marker::Send> {
    Pending {
        message_loop: Arc<MessageLoop>,
        task_id: TaskId,
        result: Arc<sync::Mutex<Option<T>>>,
    },
    Done,
}

/// Waiter returned for tasks [posted](MessageLoop::post_task) to a
/// [`MessageLoop`].
///
/// Provides a means to obtain the posted task's
/// [`Output`](future::Future::Output). A `MessageLoopTaskWaiter` implements
/// [`Future`](future::Future) itself, resolving to `None` if the task got
/// [cancelled](MessageLoop::cancel_task) before completion.
///
/// Dropping the waiter of a task still pending cancels the task.
pub struct MessageLoopTaskWaiter<T: marker::Send> {
    state: TaskWaiterState<T>,
}

impl<T: marker::Send> MessageLoopTaskWaiter<T> {
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.state {
            TaskWaiterState::Pending { task_id, .. } => Some(*task_id),
            TaskWaiterState::Done => None,
        }
    }

    /// Take the task's [`Output`](future::Future::Output) if it has
    /// completed.
    ///
    /// Returns `None` if the task has not completed yet, has been cancelled or
    /// if the result has already been taken.
    pub fn take(mut self) -> Option<T> {
        match &mut self.state {
            TaskWaiterState::Pending { result, .. } => {
                let result = lock(result).take();
                self.state = TaskWaiterState::Done;
                result
            }
            TaskWaiterState::Done => None,
        }
    }
}

impl<T: marker::Send> Drop for MessageLoopTaskWaiter<T> {
    fn drop(&mut self) {
        if let TaskWaiterState::Pending {
            message_loop,
            task_id,
            result,
        } = &self.state
        {
            if lock(result).is_none() {
                MessageLoop::cancel_task(message_loop, *task_id);
            }
        }
    }
}

impl<T: marker::Send> marker::Unpin for MessageLoopTaskWaiter<T> {}

impl<T: marker::Send> future::Future for MessageLoopTaskWaiter<T> {
    type Output = Option<T>;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = self.get_mut();
        let poll = match &this.state {
            TaskWaiterState::Pending {
                message_loop,
                task_id,
                result,
            } => {
                let mut locked_result = lock(result);
                if let Some(result) = locked_result.take() {
                    task::Poll::Ready(Some(result))
                } else {
                    drop(locked_result);
                    let mut tasks = lock(&message_loop.tasks);
                    match tasks.iter_mut().find(|task| task.id == *task_id) {
                        Some(task) => {
                            task.waiter_waker = Some(cx.waker().clone());
                            task::Poll::Pending
                        }
                        // Cancelled.
                        None => task::Poll::Ready(None),
                    }
                }
            }
            TaskWaiterState::Done => task::Poll::Ready(None),
        };
        if poll.is_ready() {
            this.state = TaskWaiterState::Done;
        }
        poll
    }
}

/// Single-threaded cooperative [`Future`](future::Future) task executor.
///
/// Post top-level futures via [`post_task()`](Self::post_task) and poll all
/// runnable ones via [`run()`](Self::run). Tasks get polled in a
/// round-robin fashion, in the order of their posting. Only a single task is
/// ever being polled at a time, hence tasks never run in parallel.
///
/// Posted tasks may post further ones from their
/// [`Future::poll()`](future::Future::poll) and poll on the resulting
/// [`MessageLoopTaskWaiter`].
pub struct MessageLoop {
    tasks: sync::Mutex<Vec<TaskQueueEntry>>,
    next_id: atomic::AtomicU64,
}

impl MessageLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: sync::Mutex::new(Vec::new()),
            next_id: atomic::AtomicU64::new(0),
        })
    }

    /// Post a top-level [`Future`](future::Future) for polling from a
    /// subsequent [`run()`](Self::run) invocation.
    pub fn post_task<F: future::Future + marker::Send + 'static>(this: &Arc<Self>, f: F) -> MessageLoopTaskWaiter<F::Output>
    where
        F::Output: marker::Send + 'static,
    {
        let id = TaskId(this.next_id.fetch_add(1, atomic::Ordering::Relaxed));

        let result = Arc::new(sync::Mutex::new(None));
        let waiter = MessageLoopTaskWaiter {
            state: TaskWaiterState::Pending {
                message_loop: this.clone(),
                task_id: id,
                result: result.clone(),
            },
        };

        let task = Box::pin(QueuedTask { f: Box::pin(f), result }) as pin::Pin<Box<dyn QueuedTaskDispatch>>;
        lock(&this.tasks).push(TaskQueueEntry {
            id,
            status: TaskStatus::Runnable,
            task: Some(task),
            waiter_waker: None,
        });

        waiter
    }

    /// Cancel a posted task.
    ///
    /// The task's [`Future`](future::Future) gets dropped without being polled
    /// any further. Returns `false` if no task with the given `id` is
    /// queued, e.g. because it has completed already.
    pub fn cancel_task(this: &Arc<Self>, id: TaskId) -> bool {
        let mut tasks = lock(&this.tasks);
        let index = match tasks.iter().position(|task| task.id == id) {
            Some(index) => index,
            None => return false,
        };
        // Dropping the task might drop further waiters held by it, which would in
        // turn invoke this function again. Do it outside the lock.
        let entry = tasks.remove(index);
        drop(tasks);
        tracing::debug!(task = id.0, "message loop task cancelled");
        let TaskQueueEntry { task, waiter_waker, .. } = entry;
        drop(task);
        if let Some(waiter_waker) = waiter_waker {
            waiter_waker.wake();
        }
        true
    }

    /// Whether there are no posted tasks left, runnable or blocked.
    pub fn is_empty(this: &Arc<Self>) -> bool {
        lock(&this.tasks).is_empty()
    }

    /// Poll runnable tasks until none is left.
    ///
    /// Returns once all tasks have completed or the remaining ones are all
    /// blocked waiting for an external wakeup. Returns `true` in the former
    /// case.
    pub fn run(this: &Arc<Self>) -> bool {
        let mut last_polled: Option<TaskId> = None;
        loop {
            let mut tasks = lock(&this.tasks);
            if tasks.is_empty() {
                return true;
            }

            // Continue the round-robin after the last polled task, wrapping
            // around to the beginning.
            let search_begin = match last_polled {
                Some(last_task_id) => tasks
                    .iter()
                    .position(|entry| entry.id > last_task_id)
                    .unwrap_or(0),
                None => 0,
            };
            let index = match tasks
                .iter()
                .enumerate()
                .skip(search_begin)
                .chain(tasks.iter().enumerate().take(search_begin))
                .find(|(_, entry)| matches!(entry.status, TaskStatus::Runnable) && entry.task.is_some())
            {
                Some((index, _)) => index,
                None => return false,
            };

            let entry = &mut tasks[index];
            let task_id = entry.id;
            last_polled = Some(task_id);
            let mut task = match entry.task.take() {
                Some(task) => task,
                None => continue,
            };
            // Set the status to blocked now, so that any wake-ups from wakers
            // won't get missed.
            entry.status = TaskStatus::Blocked;
            // The task might want to post more tasks or drop some waiters.
            drop(tasks);

            let waker = task::Waker::from(Arc::new(Waker {
                task_id,
                message_loop: Arc::downgrade(this),
            }));
            let mut cx = task::Context::from_waker(&waker);
            let done = task.as_mut().poll_pinned(&mut cx);

            let task = if done {
                drop(task);
                None
            } else {
                Some(task)
            };

            let mut tasks = lock(&this.tasks);
            let index = match tasks.iter().position(|entry| entry.id == task_id) {
                Some(index) => index,
                // Cancelled while being polled.
                None => continue,
            };

            if done {
                let entry = tasks.remove(index);
                drop(tasks);
                if let Some(waiter_waker) = entry.waiter_waker {
                    waiter_waker.wake();
                }
            } else {
                tasks[index].task = task;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PendingTwice {
        polls: u32,
    }

    impl future::Future for PendingTwice {
        type Output = u32;

        fn poll(mut self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
            self.polls += 1;
            if self.polls < 3 {
                cx.waker().wake_by_ref();
                task::Poll::Pending
            } else {
                task::Poll::Ready(self.polls)
            }
        }
    }

    #[test]
    fn test_message_loop_simple() {
        let message_loop = MessageLoop::new();
        let waiter = MessageLoop::post_task(&message_loop, PendingTwice { polls: 0 });
        assert!(MessageLoop::run(&message_loop));
        assert_eq!(waiter.take(), Some(3));
        assert!(MessageLoop::is_empty(&message_loop));
    }

    #[test]
    fn test_message_loop_chained_waiters() {
        let message_loop = MessageLoop::new();
        let waiter = MessageLoop::post_task(&message_loop, async { 42 });
        let waiter = MessageLoop::post_task(&message_loop, waiter);
        assert!(MessageLoop::run(&message_loop));
        assert_eq!(waiter.take(), Some(Some(42)));
    }

    #[test]
    fn test_message_loop_cancel_task() {
        let message_loop = MessageLoop::new();
        let cancelled = MessageLoop::post_task(&message_loop, PendingTwice { polls: 0 });
        let task_id = cancelled.task_id().unwrap();
        let observer = MessageLoop::post_task(&message_loop, cancelled);
        assert!(MessageLoop::cancel_task(&message_loop, task_id));
        assert!(!MessageLoop::cancel_task(&message_loop, task_id));
        assert!(MessageLoop::run(&message_loop));
        assert_eq!(observer.take(), Some(None));
    }

    #[test]
    fn test_message_loop_blocked_task() {
        struct NeverReady;

        impl future::Future for NeverReady {
            type Output = ();

            fn poll(self: pin::Pin<&mut Self>, _cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
                task::Poll::Pending
            }
        }

        let message_loop = MessageLoop::new();
        let waiter = MessageLoop::post_task(&message_loop, NeverReady);
        assert!(!MessageLoop::run(&message_loop));
        assert!(!MessageLoop::is_empty(&message_loop));
        drop(waiter);
        assert!(MessageLoop::is_empty(&message_loop));
    }
}
