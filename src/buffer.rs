//! Buffer lifecycle management for replay handles.
//!
//! Three buffer kinds back the record/replay engine: index buffers (tape
//! identifiers of the elements a call touched), primal buffers (captured
//! values, needed when a reduction operator must compare contributions), and
//! adjoint buffers (reverse-derivative staging, scaled by the tape's vector
//! width). Ownership rules:
//!
//! - index and primal buffers are created while a handle is assembled and
//!   live until the handle is dropped;
//! - adjoint buffers are created inside a single sweep invocation and dropped
//!   before it returns — they never outlive one sweep call.
//!
//! Buffers are owned values released on drop; holding one behind an `Option`
//! and calling [`Option::take`] gives an idempotent delete. Every create and
//! drop is counted in thread-local [`stats`], which the test suite uses to
//! prove the no-leak and pass-through properties.

use std::ops::{Deref, DerefMut};

use crate::tape::Index;

/// Thread-local allocation accounting for buffers and replay handles.
pub mod stats {
    use std::cell::Cell;

    /// Allocation counters for one thread (one rank in the tests).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AllocStats {
        /// Index buffers created.
        pub index_created: usize,
        /// Index buffers dropped.
        pub index_dropped: usize,
        /// Primal buffers created.
        pub primal_created: usize,
        /// Primal buffers dropped.
        pub primal_dropped: usize,
        /// Adjoint buffers created.
        pub adjoint_created: usize,
        /// Adjoint buffers dropped.
        pub adjoint_dropped: usize,
        /// Replay handles (including asynchronous continuations) created.
        pub handles_created: usize,
    }

    impl AllocStats {
        /// True when every created buffer has been dropped.
        pub fn balanced(&self) -> bool {
            self.index_created == self.index_dropped
                && self.primal_created == self.primal_dropped
                && self.adjoint_created == self.adjoint_dropped
        }

        /// Total number of buffers created, any kind.
        pub fn buffers_created(&self) -> usize {
            self.index_created + self.primal_created + self.adjoint_created
        }
    }

    thread_local! {
        static STATS: Cell<AllocStats> = Cell::new(AllocStats::default());
    }

    fn update(f: impl FnOnce(&mut AllocStats)) {
        STATS.with(|s| {
            let mut v = s.get();
            f(&mut v);
            s.set(v);
        });
    }

    pub(super) fn index_created() {
        update(|s| s.index_created += 1);
    }
    pub(super) fn index_dropped() {
        update(|s| s.index_dropped += 1);
    }
    pub(super) fn primal_created() {
        update(|s| s.primal_created += 1);
    }
    pub(super) fn primal_dropped() {
        update(|s| s.primal_dropped += 1);
    }
    pub(super) fn adjoint_created() {
        update(|s| s.adjoint_created += 1);
    }
    pub(super) fn adjoint_dropped() {
        update(|s| s.adjoint_dropped += 1);
    }

    pub(crate) fn handle_created() {
        update(|s| s.handles_created += 1);
    }

    /// Current counters for this thread.
    pub fn snapshot() -> AllocStats {
        STATS.with(|s| s.get())
    }

    /// Reset this thread's counters to zero and return the previous values.
    pub fn take() -> AllocStats {
        STATS.with(|s| s.replace(AllocStats::default()))
    }
}

/// Tape identifiers of the elements one communication call touched.
#[derive(Debug)]
pub struct IndexBuffer {
    data: Vec<Index>,
}

impl IndexBuffer {
    /// Allocate a buffer of `len` passive indices.
    pub fn new(len: usize) -> Self {
        stats::index_created();
        IndexBuffer {
            data: vec![Index::PASSIVE; len],
        }
    }

    /// Take ownership of already-collected indices.
    pub fn from_vec(data: Vec<Index>) -> Self {
        stats::index_created();
        IndexBuffer { data }
    }
}

impl Drop for IndexBuffer {
    fn drop(&mut self) {
        stats::index_dropped();
    }
}

impl Deref for IndexBuffer {
    type Target = [Index];
    fn deref(&self) -> &[Index] {
        &self.data
    }
}

impl DerefMut for IndexBuffer {
    fn deref_mut(&mut self) -> &mut [Index] {
        &mut self.data
    }
}

/// Captured primal (or old-primal) values, in wire layout.
#[derive(Debug)]
pub struct PrimalBuffer {
    data: Vec<f64>,
}

impl PrimalBuffer {
    /// Allocate a zeroed buffer of `len` wire elements.
    pub fn new(len: usize) -> Self {
        stats::primal_created();
        PrimalBuffer {
            data: vec![0.0; len],
        }
    }

    /// Take ownership of already-captured values.
    pub fn from_vec(data: Vec<f64>) -> Self {
        stats::primal_created();
        PrimalBuffer { data }
    }
}

impl Drop for PrimalBuffer {
    fn drop(&mut self) {
        stats::primal_dropped();
    }
}

impl Deref for PrimalBuffer {
    type Target = [f64];
    fn deref(&self) -> &[f64] {
        &self.data
    }
}

impl DerefMut for PrimalBuffer {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// Adjoint staging for one sweep invocation, `len * vector_width` slots laid
/// out element-major (all directions of element 0, then element 1, ...).
#[derive(Debug)]
pub struct AdjointBuffer {
    data: Vec<f64>,
    vector_width: usize,
}

impl AdjointBuffer {
    /// Allocate a zeroed buffer for `len` elements times `vector_width`
    /// derivative directions.
    pub fn new(len: usize, vector_width: usize) -> Self {
        stats::adjoint_created();
        AdjointBuffer {
            data: vec![0.0; len * vector_width],
            vector_width,
        }
    }

    /// Number of derivative directions per element.
    pub fn vector_width(&self) -> usize {
        self.vector_width
    }

    /// Slots for one element, all directions.
    pub fn element(&self, i: usize) -> &[f64] {
        &self.data[i * self.vector_width..(i + 1) * self.vector_width]
    }

    /// Mutable slots for one element, all directions.
    pub fn element_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.vector_width..(i + 1) * self.vector_width]
    }
}

impl Drop for AdjointBuffer {
    fn drop(&mut self) {
        stats::adjoint_dropped();
    }
}

impl Deref for AdjointBuffer {
    type Target = [f64];
    fn deref(&self) -> &[f64] {
        &self.data
    }
}

impl DerefMut for AdjointBuffer {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_drop_are_counted() {
        let before = stats::snapshot();
        {
            let _ix = IndexBuffer::new(4);
            let _p = PrimalBuffer::new(4);
            let _a = AdjointBuffer::new(4, 2);
        }
        let after = stats::snapshot();
        assert_eq!(after.index_created, before.index_created + 1);
        assert_eq!(after.index_dropped, before.index_dropped + 1);
        assert_eq!(after.primal_created, before.primal_created + 1);
        assert_eq!(after.adjoint_created, before.adjoint_created + 1);
        assert_eq!(after.adjoint_dropped, before.adjoint_dropped + 1);
    }

    #[test]
    fn adjoint_buffer_scales_with_vector_width() {
        let buf = AdjointBuffer::new(3, 4);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.element(2).len(), 4);
    }

    #[test]
    fn option_take_is_an_idempotent_delete() {
        let mut slot = Some(PrimalBuffer::new(2));
        assert!(slot.take().is_some());
        assert!(slot.take().is_none());
        assert!(slot.take().is_none());
    }
}
