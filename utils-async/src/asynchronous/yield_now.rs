// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

use std::{future, pin, task};

/// [`Future`](future::Future) which returns [`Pending`](task::Poll::Pending)
/// exactly once, after waking its task.
///
/// Allows long running tasks to give other tasks enqueued at the same
/// executor a chance to make progress.
#[derive(Default)]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll without the need for pinning.
    ///
    /// Convenience for hand-written state machines holding a `YieldNow` by
    /// value.
    pub fn poll_yield(&mut self, cx: &mut task::Context<'_>) -> task::Poll<()> {
        if self.yielded {
            task::Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            task::Poll::Pending
        }
    }
}

impl future::Future for YieldNow {
    type Output = ();

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        self.get_mut().poll_yield(cx)
    }
}
