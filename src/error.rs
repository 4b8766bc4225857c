//! The store's error hierarchy.
//!
//! A single enum plays the role `thiserror` would generate for a `std`
//! crate; derive macros that require `std` are avoided so the error type
//! stays usable from `no_std` hosts.

use core::fmt;

use crate::format::node::NodeIndex;

pub type Result<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    InvalidArgument(&'static str),
    NotFound,
    AlreadyExists,
    NoSpace { requested_blocks: u32 },
    IoError(&'static str),
    IntegrityError { chunk: u32 },
    BadState(&'static str),
    Unsupported(&'static str),
    AccessDenied,
    CorruptNode(NodeIndex),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            StoreError::NotFound => write!(f, "not found"),
            StoreError::AlreadyExists => write!(f, "already exists"),
            StoreError::NoSpace { requested_blocks } => {
                write!(f, "no space: requested {requested_blocks} blocks")
            }
            StoreError::IoError(what) => write!(f, "io error: {what}"),
            StoreError::IntegrityError { chunk } => {
                write!(f, "integrity error at chunk {chunk}")
            }
            StoreError::BadState(what) => write!(f, "bad state: {what}"),
            StoreError::Unsupported(what) => write!(f, "unsupported: {what}"),
            StoreError::AccessDenied => write!(f, "access denied"),
            StoreError::CorruptNode(idx) => write!(f, "corrupt node at index {}", idx.0),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StoreError {}

impl From<postcard::Error> for StoreError {
    fn from(_: postcard::Error) -> Self {
        StoreError::IoError("postcard encode/decode failure")
    }
}
