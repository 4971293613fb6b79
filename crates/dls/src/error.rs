//! Error and Result types for DLS storage operations.
//!
//! Every error belongs to exactly one [`ErrorClass`], which tells the caller
//! how far a failure reaches:
//!
//! - [`ErrorClass::Invalid`]: the caller passed something unusable. Only the
//!   affected channel is skipped.
//! - [`ErrorClass::Degraded`]: the environment is degraded (missing file,
//!   corrupt index, undecodable block). The affected chunk or channel is
//!   skipped and discovery continues.
//! - [`ErrorClass::Fatal`]: samples were or will be lost. Must be escalated.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for DLS operations.
pub type Result<T> = std::result::Result<T, DlsError>;

/// How far the consequences of an error reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller must fix the input.
    Invalid,
    /// Environment degraded; skip the affected item and continue.
    Degraded,
    /// Irrecoverable data loss.
    Fatal,
}

/// The error type for DLS operations.
#[derive(Debug, Error)]
pub enum DlsError {
    /// The named channel is not part of the live hardware enumeration.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Channel parameters failed validation.
    #[error("Invalid parameters for channel {channel}: {reason}")]
    InvalidParams {
        /// Channel name.
        channel: String,
        /// Why the parameters were rejected.
        reason: String,
    },

    /// Unknown compression format or format/type combination.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file exists but its contents cannot be interpreted.
    #[error("Corrupt file {path}: {reason}")]
    Corrupt {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A data file ends partway through a record.
    #[error("Partial record in {path} at {position}")]
    PartialRecord {
        /// Data file.
        path: PathBuf,
        /// Offset where the incomplete record begins.
        position: u64,
    },

    /// An index file needed for the operation is missing.
    #[error("Missing index: {0}")]
    MissingIndex(PathBuf),

    /// A block payload could not be decompressed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Remote directory request failed.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Flushing the encoder failed; buffered samples are lost.
    #[error("Flush failed for channel {channel}: {source}")]
    FlushFailed {
        /// Channel name.
        channel: String,
        /// Underlying cause.
        #[source]
        source: Box<DlsError>,
    },

    /// Sample blocks arrived with a time gap outside the allowed tolerance.
    #[error("Time tolerance exceeded on channel {channel}: diff {actual_us}us, expected {expected_us}us ({error_percent:.1}%)")]
    TimeTolerance {
        /// Channel name.
        channel: String,
        /// Measured gap between the last buffered and the first new sample.
        actual_us: i64,
        /// Expected gap (one sample period).
        expected_us: i64,
        /// Relative error in percent.
        error_percent: f64,
    },
}

impl DlsError {
    /// Returns the escalation class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DlsError::ChannelNotFound(_)
            | DlsError::InvalidParams { .. }
            | DlsError::UnsupportedFormat(_) => ErrorClass::Invalid,
            DlsError::Io(_)
            | DlsError::Corrupt { .. }
            | DlsError::PartialRecord { .. }
            | DlsError::MissingIndex(_)
            | DlsError::Decode(_)
            | DlsError::Remote(_) => ErrorClass::Degraded,
            DlsError::FlushFailed { .. } | DlsError::TimeTolerance { .. } => ErrorClass::Fatal,
        }
    }

    /// Returns `true` if the error must be escalated rather than logged.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DlsError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        DlsError::InvalidParams {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}
