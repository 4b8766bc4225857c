//! The blob lifecycle state machine (§3, §4.9).
//!
//! Production code never publishes a `Writing`-state `Blob`: `writer.rs`
//! buffers and verifies a blob's whole payload before constructing one at
//! all, via `new_readable`, so no reader can ever observe the
//! `Writing`/`Writing`→`Errored` transitions described in §3. `new_writing`
//! and `mark_error` exist only to exercise that part of the state machine
//! directly in tests.

use spin::Mutex;

use crate::config::BlobLayout;
use crate::format::node::NodeIndex;
use crate::format::DIGEST_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Empty,
    Writing,
    Readable,
    MarkedForDeletion,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Uncompressed,
    Chunked,
}

pub struct Blob {
    pub digest: [u8; DIGEST_LEN],
    pub head_node: NodeIndex,
    state: Mutex<BlobState>,
    pub uncompressed_size: u64,
    pub stored_size: Mutex<u64>,
    pub layout_kind: BlobLayout,
    pub compression_kind: Mutex<CompressionKind>,
}

impl Blob {
    #[cfg(test)]
    pub(crate) fn new_writing(digest: [u8; DIGEST_LEN], head_node: NodeIndex, declared_size: u64, layout_kind: BlobLayout) -> Blob {
        Blob {
            digest,
            head_node,
            state: Mutex::new(BlobState::Writing),
            uncompressed_size: declared_size,
            stored_size: Mutex::new(0),
            layout_kind,
            compression_kind: Mutex::new(CompressionKind::Uncompressed),
        }
    }

    /// Builds a `Blob` that is already `Readable`, for the case where no
    /// reader could ever have observed it mid-write: the writer assembles
    /// the whole payload, verifies it, and commits before any `Blob` value
    /// for this digest is published to the cache or directory.
    pub fn new_readable(
        digest: [u8; DIGEST_LEN],
        head_node: NodeIndex,
        uncompressed_size: u64,
        stored_size: u64,
        layout_kind: BlobLayout,
        compression_kind: CompressionKind,
    ) -> Blob {
        Blob {
            digest,
            head_node,
            state: Mutex::new(BlobState::Readable),
            uncompressed_size,
            stored_size: Mutex::new(stored_size),
            layout_kind,
            compression_kind: Mutex::new(compression_kind),
        }
    }

    pub fn state(&self) -> BlobState {
        *self.state.lock()
    }

    /// Writing --final-byte-written+verify-ok--> Readable
    pub fn mark_readable(&self, stored_size: u64, compression_kind: CompressionKind) -> Result<(), &'static str> {
        let mut state = self.state.lock();
        if *state != BlobState::Writing {
            return Err("mark_readable from a non-Writing state");
        }
        *state = BlobState::Readable;
        *self.stored_size.lock() = stored_size;
        *self.compression_kind.lock() = compression_kind;
        Ok(())
    }

    /// Writing --any-error--> Errored (terminal)
    #[cfg(test)]
    pub(crate) fn mark_error(&self) {
        let mut state = self.state.lock();
        *state = BlobState::Errored;
    }

    /// Readable --unlink--> MarkedForDeletion
    pub fn mark_for_deletion(&self) -> Result<(), &'static str> {
        let mut state = self.state.lock();
        if *state != BlobState::Readable {
            return Err("unlink of a blob that is not Readable");
        }
        *state = BlobState::MarkedForDeletion;
        Ok(())
    }

    /// Readable --corruption-detected-on-read--> Errored; the blob is also
    /// scheduled for deletion (the caller is expected to unlink it as part
    /// of handling this transition).
    pub fn mark_corrupt(&self) {
        let mut state = self.state.lock();
        *state = BlobState::Errored;
    }

    pub fn is_readable(&self) -> bool {
        self.state() == BlobState::Readable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Blob {
        Blob::new_writing([0u8; DIGEST_LEN], NodeIndex(0), 1024, BlobLayout::CompactAtEnd)
    }

    #[test]
    fn writing_to_readable() {
        let blob = fresh();
        blob.mark_readable(1024, CompressionKind::Uncompressed).unwrap();
        assert!(blob.is_readable());
    }

    #[test]
    fn errored_is_terminal_for_reads() {
        let blob = fresh();
        blob.mark_error();
        assert_eq!(blob.state(), BlobState::Errored);
        assert!(blob.mark_readable(0, CompressionKind::Uncompressed).is_err());
    }

    #[test]
    fn readable_then_unlink_then_corruption_has_no_effect_on_already_marked() {
        let blob = fresh();
        blob.mark_readable(1024, CompressionKind::Uncompressed).unwrap();
        blob.mark_for_deletion().unwrap();
        assert_eq!(blob.state(), BlobState::MarkedForDeletion);
        assert!(blob.mark_for_deletion().is_err());
    }
}
