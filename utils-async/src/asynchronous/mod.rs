// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Rust `async` related [`Future`](core::future::Future) executors and
//! adaptors.

mod abort;
pub use abort::{AbortHandle, AbortSignal, abort_pair};
mod message_loop;
pub use message_loop::{MessageLoop, MessageLoopTaskWaiter, TaskId};
mod yield_now;
pub use yield_now::YieldNow;
