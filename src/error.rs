//! The standard `ucl` error type.
//!
//! Fallible operations throughout the crate return [`Result`]. The
//! crate-wide [`Error`] aggregates the per-subsystem error enums, each of
//! which lives next to the types it describes ([`CompilationError`] in
//! `backend`, [`DeviceError`] in `standard::accelerator`, and so on).

use std::result;

use crate::backend::CompilationError;
use crate::sched::SchedulingError;
use crate::standard::{DeviceError, LaunchError, MemoryError};

pub type Result<T> = result::Result<T, Error>;

/// An enum aggregating the error kinds of every subsystem.
///
/// Implements the usual error traits. `Cancelled` is an observable control
/// outcome for plans and long-running operations rather than a failure; use
/// [`Error::is_cancelled`] to distinguish it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Compilation(#[from] CompilationError),
    #[error("{0}")]
    Device(#[from] DeviceError),
    #[error("{0}")]
    Launch(#[from] LaunchError),
    #[error("{0}")]
    Memory(#[from] MemoryError),
    #[error("{0}")]
    Scheduling(#[from] SchedulingError),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` if this is the cooperative-cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self, Error::Cancelled)
    }

    /// Returns the compilation error kind, if this is one.
    pub fn compilation(&self) -> Option<&CompilationError> {
        match *self {
            Error::Compilation(ref err) => Some(err),
            _ => None,
        }
    }

    /// Returns the device error kind, if this is one.
    pub fn device(&self) -> Option<&DeviceError> {
        match *self {
            Error::Device(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<Error> for String {
    fn from(err: Error) -> String {
        err.to_string()
    }
}
