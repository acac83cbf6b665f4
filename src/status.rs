//! Message status information.
//!
//! This module provides the [`Status`] struct returned by receive and probe
//! operations, containing metadata about a message.

/// Information about a probed or received message.
///
/// Returned by receive operations and by
/// [`Substrate::probe`](crate::Substrate::probe) /
/// [`Substrate::iprobe`](crate::Substrate::iprobe) to describe an incoming
/// message without consuming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of wire elements in the message.
    pub count: usize,
}

impl Status {
    /// Status for operations that carry no incoming message (e.g. completed sends).
    pub fn empty() -> Self {
        Status {
            source: -1,
            tag: -1,
            count: 0,
        }
    }
}
