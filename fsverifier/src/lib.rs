// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Verification of the partitions written by an OTA update.

pub mod action;
pub mod error;
pub mod hasher;
pub mod install_plan;
pub mod io_source;
pub mod layout;
pub mod verifier;

pub use action::FilesystemVerifierAction;
pub use error::{ErrorCode, VerifierError};
pub use install_plan::{InstallPlan, Partition};
pub use verifier::{FilesystemVerifierDelegate, FilesystemVerifierFuture, VerifierStep};
