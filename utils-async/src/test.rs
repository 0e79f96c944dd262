// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC

//! A [`Future`](core::future::Future) [test executor](TestAsyncExecutor)
//! implementation.

use crate::asynchronous::{MessageLoop, MessageLoopTaskWaiter};
use std::{future, marker, sync};

/// Waiter for top level futures [spawned](TestAsyncExecutor::spawn) at a
/// [`TestAsyncExecutor`].
pub type TestAsyncExecutorTaskWaiter<T> = MessageLoopTaskWaiter<T>;

/// Single-threaded [`Future`](future::Future) task executor for testing
/// purposes.
///
/// Enqueue top-level futures via [`spawn()`](Self::spawn) and poll all
/// currently enqueued ones to completion via
/// [`run_to_completion()`](Self::run_to_completion).
pub struct TestAsyncExecutor {
    message_loop: sync::Arc<MessageLoop>,
}

impl TestAsyncExecutor {
    pub fn new() -> sync::Arc<Self> {
        sync::Arc::new(Self {
            message_loop: MessageLoop::new(),
        })
    }

    /// Enqueue a top-level [`Future`](future::Future) for polling from a
    /// subsequent [`run_to_completion()`](Self::run_to_completion)
    /// invocation.
    pub fn spawn<F: future::Future + marker::Send + 'static>(
        this: &sync::Arc<Self>,
        f: F,
    ) -> TestAsyncExecutorTaskWaiter<F::Output>
    where
        F::Output: marker::Send + 'static,
    {
        MessageLoop::post_task(&this.message_loop, f)
    }

    /// Poll all currently [enqueued](Self::spawn) futures to completion.
    ///
    /// There must always be at least one runnable task left, or the executor
    /// will become stuck and report the fact via a panic.
    pub fn run_to_completion(this: &sync::Arc<Self>) {
        assert!(
            MessageLoop::run(&this.message_loop),
            "TestAsyncExecutor stuck with no runnable task."
        );
    }

    pub fn message_loop(this: &sync::Arc<Self>) -> &sync::Arc<MessageLoop> {
        &this.message_loop
    }
}

#[test]
fn test_test_async_executor_simple() {
    struct SimpleTask {}

    impl future::Future for SimpleTask {
        type Output = u32;

        fn poll(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Self::Output> {
            std::task::Poll::Ready(42)
        }
    }

    let executor = TestAsyncExecutor::new();
    let waiter = TestAsyncExecutor::spawn(&executor, SimpleTask {});
    TestAsyncExecutor::run_to_completion(&executor);
    assert_eq!(waiter.take().unwrap(), 42);

    let waiter = TestAsyncExecutor::spawn(&executor, async { async { 42 }.await });
    TestAsyncExecutor::run_to_completion(&executor);
    assert_eq!(waiter.take().unwrap(), 42);
}

#[test]
fn test_test_async_executor_yield() {
    use crate::asynchronous::YieldNow;

    let executor = TestAsyncExecutor::new();
    let waiter = TestAsyncExecutor::spawn(&executor, async {
        let mut n = 0;
        for _ in 0..3 {
            YieldNow::new().await;
            n += 1;
        }
        n
    });
    TestAsyncExecutor::run_to_completion(&executor);
    assert_eq!(waiter.take().unwrap(), 3);
}
