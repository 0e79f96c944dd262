// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Definitions of [`VerifierError`] and [`ErrorCode`].

use crate::layout::LayoutError;
use crate::verifier::VerifierStep;
use base64::Engine as _;
use otaverify_storage::{blkdev::PartitionIoError, verity::VerityError};
use std::fmt;

/// Result codes reported to the update pipeline.
///
/// The numeric values are part of the pipeline's external interface and
/// must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Error = 1,
    NewRootfsVerificationError = 15,
    DownloadStateInitializationError = 20,
    FilesystemVerifierError = 47,
    UserCanceled = 48,
    VerityCalculationError = 56,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The code describing the outcome of a verifier run.
    pub fn from_result<T>(result: &Result<T, VerifierError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => e.error_code(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::NewRootfsVerificationError => "NewRootfsVerificationError",
            Self::DownloadStateInitializationError => "DownloadStateInitializationError",
            Self::FilesystemVerifierError => "FilesystemVerifierError",
            Self::UserCanceled => "UserCanceled",
            Self::VerityCalculationError => "VerityCalculationError",
        };
        write!(f, "{} ({})", s, self.as_u32())
    }
}

fn base64_display(digest: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Terminal failure of a verifier run.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("internal error")]
    Internal,

    #[error("no install plan given")]
    MissingInputObject,

    #[error("partition {partition}: no {step} device path resolved")]
    UnresolvedDevicePath { partition: String, step: VerifierStep },

    #[error("partition {partition}: invalid verity layout: {source}")]
    InvalidVerityLayout {
        partition: String,
        #[source]
        source: LayoutError,
    },

    #[error("partition {partition}: failed to open {path}: {source}")]
    Open {
        partition: String,
        path: String,
        #[source]
        source: PartitionIoError,
    },

    #[error("partition {partition}: read at offset {offset} failed: {source}")]
    Read {
        partition: String,
        offset: u64,
        #[source]
        source: PartitionIoError,
    },

    #[error("partition {partition}: unexpected end of device at offset {offset}")]
    UnexpectedEof { partition: String, offset: u64 },

    #[error("partition {partition}: verity computation failed: {source}")]
    VerityComputation {
        partition: String,
        #[source]
        source: VerityError,
    },

    #[error(
        "partition {partition}: target hash mismatch, expected {}, calculated {}",
        base64_display(.expected),
        base64_display(.calculated)
    )]
    TargetVerification {
        partition: String,
        expected: Vec<u8>,
        calculated: Vec<u8>,
    },

    #[error(
        "partition {partition}: source hash mismatch, expected {}, calculated {}",
        base64_display(.expected),
        base64_display(.calculated)
    )]
    SourceVerification {
        partition: String,
        expected: Vec<u8>,
        calculated: Vec<u8>,
    },

    #[error("extents of untouched dynamic partitions differ between slots")]
    UntouchedPartitionExtentsMismatch,

    #[error("verification cancelled")]
    Cancelled,
}

impl VerifierError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Internal | Self::MissingInputObject => ErrorCode::Error,
            Self::UnresolvedDevicePath { .. }
            | Self::InvalidVerityLayout { .. }
            | Self::Open { .. }
            | Self::Read { .. }
            | Self::UnexpectedEof { .. }
            | Self::UntouchedPartitionExtentsMismatch => ErrorCode::FilesystemVerifierError,
            Self::VerityComputation { .. } => ErrorCode::VerityCalculationError,
            Self::TargetVerification { .. } => ErrorCode::NewRootfsVerificationError,
            Self::SourceVerification { .. } => ErrorCode::DownloadStateInitializationError,
            Self::Cancelled => ErrorCode::UserCanceled,
        }
    }

    /// Whether the failure is a content verification failure, as opposed to
    /// an operational one.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Self::TargetVerification { .. } | Self::SourceVerification { .. })
    }
}

/// Return a [`VerifierError::Internal`], or panic in debug builds.
#[macro_export]
macro_rules! verifier_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("VerifierError::Internal");
        } else {
            $crate::error::VerifierError::Internal
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::Success.as_u32(), 0);
        assert_eq!(ErrorCode::FilesystemVerifierError.as_u32(), 47);
        assert_eq!(VerifierError::Cancelled.error_code(), ErrorCode::UserCanceled);
        assert!(!VerifierError::Cancelled.is_verification_failure());
        assert_eq!(
            VerifierError::UntouchedPartitionExtentsMismatch.error_code(),
            ErrorCode::FilesystemVerifierError
        );
        assert!(!VerifierError::UntouchedPartitionExtentsMismatch.is_verification_failure());
        assert_eq!(
            VerifierError::SourceVerification {
                partition: "system".to_owned(),
                expected: vec![],
                calculated: vec![],
            }
            .error_code(),
            ErrorCode::DownloadStateInitializationError
        );
        assert_eq!(
            ErrorCode::from_result::<()>(&Err(VerifierError::MissingInputObject)),
            ErrorCode::Error
        );
        assert_eq!(ErrorCode::from_result(&Ok(())), ErrorCode::Success);
    }

    #[test]
    fn test_digest_display() {
        let e = VerifierError::TargetVerification {
            partition: "system".to_owned(),
            expected: vec![0xde, 0xad, 0xbe, 0xef],
            calculated: vec![0x00],
        };
        assert_eq!(
            e.to_string(),
            "partition system: target hash mismatch, expected 3q2+7w==, calculated AA=="
        );
    }
}
