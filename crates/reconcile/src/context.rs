//! Per-run context threaded through every handler call

use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Address of one version of one service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionRef {
    pub service_id: String,
    pub number: u32,
}

impl VersionRef {
    pub fn new(service_id: impl Into<String>, number: u32) -> Self {
        Self {
            service_id: service_id.into(),
            number,
        }
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.service_id, self.number)
    }
}

/// The version a handler works on, plus the transport to reach it
#[derive(Clone, Copy)]
pub struct VersionContext<'a> {
    pub target: &'a VersionRef,
    pub transport: &'a dyn Transport,
}

impl<'a> VersionContext<'a> {
    pub fn new(target: &'a VersionRef, transport: &'a dyn Transport) -> Self {
        Self { target, transport }
    }

    /// Number of the target version
    pub fn version(&self) -> u32 {
        self.target.number
    }
}

impl fmt::Debug for VersionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionContext")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Cancellation flag checked between handler invocations
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
