//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;

/// Customized error type for duplica.
///
/// Most variants are specific protocol-level conditions that callers match
/// on to decide between retrying, rerouting, and deregistering; everything
/// else folds into the `Msg` catch-all.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DuplicaError {
    /// Handler (or a sub-manager) has not been brought online yet.
    NotInitialized,

    /// Operation requires the leader role on this log stream.
    NotLeader,

    /// Operation requires the follower role on this log stream.
    NotFollower,

    /// Caller passed an argument outside the accepted domain.
    InvalidArgument(String),

    /// Global timestamp fetch did not complete within its bounded wait.
    GtsTimeout,

    /// A role transition or offlining is in progress; retry later.
    Offline,

    /// A combined snapshot log submission is currently in flight; the
    /// requested operation must be retried once it completes.
    InFlightLogging,

    /// Target was already registered; callers treat this as success.
    AlreadyRegistered,

    /// The log stream no longer exists on this replica.
    LsGone,

    /// The log stream currently hosts no duplicate tablets.
    NoDupTablets,

    /// Anything else, described by a message string.
    Msg(String),
}

impl DuplicaError {
    pub fn msg(msg: impl ToString) -> Self {
        DuplicaError::Msg(msg.to_string())
    }

    /// True for conditions the caller is expected to resolve by retrying
    /// the same operation later.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DuplicaError::GtsTimeout
                | DuplicaError::Offline
                | DuplicaError::InFlightLogging
        )
    }
}

impl fmt::Display for DuplicaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DuplicaError::NotInitialized => write!(f, "not initialized"),
            DuplicaError::NotLeader => write!(f, "not the leader of this LS"),
            DuplicaError::NotFollower => {
                write!(f, "not a follower of this LS")
            }
            DuplicaError::InvalidArgument(s) => {
                write!(f, "invalid argument: {}", s)
            }
            DuplicaError::GtsTimeout => write!(f, "global timestamp timeout"),
            DuplicaError::Offline => write!(f, "offline or transitioning"),
            DuplicaError::InFlightLogging => {
                write!(f, "snapshot log submission in flight")
            }
            DuplicaError::AlreadyRegistered => {
                write!(f, "already registered")
            }
            DuplicaError::LsGone => write!(f, "log stream gone"),
            DuplicaError::NoDupTablets => {
                write!(f, "no duplicate tablets on this LS")
            }
            DuplicaError::Msg(s) => write!(f, "{}", s), // no literal quotes
        }
    }
}

impl error::Error for DuplicaError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `DuplicaError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for DuplicaError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                DuplicaError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `DuplicaError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for DuplicaError {
            fn from(e: $error) -> DuplicaError {
                DuplicaError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
