//! Out-of-band failure reporting.
//!
//! Stream elements never carry error values. Stages that can fail (file
//! sources, subprocess bridges) take a caller-supplied [`Status`] handle and
//! record a nonzero code into it, then return early; their output closes
//! through the normal end-of-stream path so downstream stages drain
//! naturally. Callers inspect the handle after the pipeline has been
//! consumed.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

/// A shared atomic status slot, zero while no fault has been recorded.
///
/// Clones share the same slot. Any thread may set it; stages record the
/// code of the last fault they hit.
#[derive(Clone, Debug, Default)]
pub struct Status(Arc<AtomicI32>);

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_ok(&self) -> bool {
        self.get() == 0
    }

    /// Set the status code directly. Custom stage bodies use this for their
    /// own failure conventions.
    pub fn set(&self, code: i32) {
        self.0.store(code, Ordering::Release);
    }

    pub(crate) fn record(&self, fault: StageFault) {
        tracing::warn!("stage fault: {fault}");
        self.set(fault.code());
    }
}

/// The faults built-in stages can hit, each with a fixed status code.
#[derive(Debug, Error)]
pub enum StageFault {
    #[error("cannot open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("i/o with `{command}` failed: {source}")]
    ChildIo { command: String, source: io::Error },

    #[error("`{command}` exited with {status}")]
    Exit { command: String, status: ExitStatus },
}

impl StageFault {
    pub fn code(&self) -> i32 {
        match self {
            StageFault::Open { .. } => 1,
            StageFault::Spawn { .. } => 2,
            StageFault::ChildIo { .. } => 3,
            StageFault::Exit { .. } => 4,
            StageFault::Read { .. } => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_starts_ok_and_shares_the_slot() {
        let status = Status::new();
        assert!(status.is_ok());
        let clone = status.clone();
        clone.set(3);
        assert_eq!(status.get(), 3);
        assert!(!status.is_ok());
    }

    #[test]
    fn fault_codes_are_stable() {
        let fault = StageFault::Open {
            path: PathBuf::from("/no/such/file"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(fault.code(), 1);
        assert!(fault.to_string().contains("/no/such/file"));
    }

    #[test]
    fn read_faults_are_not_reported_as_open_faults() {
        let fault = StageFault::Read {
            path: PathBuf::from("/some/file"),
            source: io::Error::from(io::ErrorKind::InvalidData),
        };
        assert_eq!(fault.code(), 5);
        assert!(fault.to_string().starts_with("cannot read"));
    }
}
