//! The corruption notifier (§6): a one-shot channel/topic the core posts to
//! whenever a blob transitions to `Errored` due to an integrity failure at
//! read time. Modeled as an injected trait object per §9's no-global-state
//! rule, rather than a broadcast the core owns and multiplexes itself.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::format::DIGEST_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    MerkleMismatch,
    BadNodeLinkage,
    DecompressionFailure,
}

pub trait CorruptionNotifier: Send + Sync {
    fn notify(&self, digest: [u8; DIGEST_LEN], kind: FailureKind);
}

/// Default notifier: drops reports. A host that cares wires its own.
pub struct NullNotifier;

impl CorruptionNotifier for NullNotifier {
    fn notify(&self, _digest: [u8; DIGEST_LEN], _kind: FailureKind) {}
}

/// Test/host helper that records every report for later inspection.
pub struct RecordingNotifier {
    events: spin::Mutex<Vec<([u8; DIGEST_LEN], FailureKind)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingNotifier { events: spin::Mutex::new(Vec::new()) })
    }

    pub fn events(&self) -> Vec<([u8; DIGEST_LEN], FailureKind)> {
        self.events.lock().clone()
    }
}

impl CorruptionNotifier for RecordingNotifier {
    fn notify(&self, digest: [u8; DIGEST_LEN], kind: FailureKind) {
        self.events.lock().push((digest, kind));
    }
}
