//! The differentiation-aware communicator and point-to-point operations.
//!
//! [`AdComm`] wraps a [`Substrate`] endpoint and mirrors its operations with
//! tape recording. Passive payloads pass straight through; active payloads
//! additionally allocate a replay handle holding the tape identifiers the
//! call touched, pushed onto the [`CommTape`] so the three sweeps can
//! re-execute or transpose the call.
//!
//! Derivative messages exchanged during forward and reverse sweeps carry
//! `count * vector_width` wire elements, element-major.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::{stats, AdjointBuffer, IndexBuffer, PrimalBuffer};
use crate::datatype::CommDatatype;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::substrate::{Capabilities, Substrate};
use crate::tape::{CommTape, Index, ReplayAction};

/// A communicator endpoint with record/replay support.
///
/// Cloning gives another endpoint for the same rank, sharing the substrate.
#[derive(Clone)]
pub struct AdComm<S: Substrate> {
    substrate: S,
}

impl<S: Substrate> AdComm<S> {
    /// Wrap a substrate endpoint.
    pub fn new(substrate: S) -> Self {
        AdComm { substrate }
    }

    /// Rank of the calling process.
    pub fn rank(&self) -> i32 {
        self.substrate.rank()
    }

    /// Number of processes in the communicator.
    pub fn size(&self) -> i32 {
        self.substrate.size()
    }

    /// Feature set of the wrapped substrate.
    pub fn capabilities(&self) -> Capabilities {
        self.substrate.capabilities()
    }

    /// The wrapped substrate endpoint.
    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    /// Barrier synchronization. Not recorded; a barrier carries no values.
    pub fn barrier(&self) -> Result<()> {
        self.substrate.barrier()
    }

    /// Block until a matching message is available, without consuming it.
    pub fn probe(&self, source: i32, tag: i32) -> Result<Status> {
        self.require(self.capabilities().probe, "probe")?;
        self.substrate.probe(source, tag)
    }

    /// Check for a matching message without blocking or consuming it.
    pub fn iprobe(&self, source: i32, tag: i32) -> Result<Option<Status>> {
        self.require(self.capabilities().probe, "probe")?;
        self.substrate.iprobe(source, tag)
    }

    pub(crate) fn require(&self, available: bool, what: &str) -> Result<()> {
        if available {
            Ok(())
        } else {
            Err(Error::NotSupported(what.to_string()))
        }
    }

    /// Blocking send of `buf` to `dest`.
    ///
    /// For active payloads under a recording tape this pushes a replay handle
    /// capturing the elements' tape identifiers.
    pub fn send<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        buf: &[T],
        dest: i32,
        tag: i32,
    ) -> Result<()> {
        let wire = wire_values(buf);
        tracing::trace!(dest, tag, count = buf.len(), "send");
        self.substrate.send(&wire, dest, tag)?;
        if needs_handle::<T>(tape) {
            let handle = SendHandle {
                substrate: self.substrate.clone(),
                indices: capture_indices(buf),
                dest,
                tag,
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        }
        Ok(())
    }

    /// Blocking receive into `buf`. Wildcards from
    /// [`ANY_SOURCE`](crate::ANY_SOURCE)/[`ANY_TAG`](crate::ANY_TAG) are
    /// pinned to the matched envelope for replay.
    pub fn recv<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        buf: &mut [T],
        source: i32,
        tag: i32,
    ) -> Result<Status> {
        let mut wire = vec![0.0; buf.len()];
        let status = self.substrate.recv(&mut wire, source, tag)?;
        tracing::trace!(source = status.source, tag = status.tag, count = status.count, "recv");
        if needs_handle::<T>(tape) {
            let indices = register_received(tape, buf, &wire);
            let handle = RecvHandle {
                substrate: self.substrate.clone(),
                indices,
                old_primals: None,
                source: status.source,
                tag: status.tag,
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else {
            write_wire(buf, &wire);
        }
        Ok(status)
    }
}

/// True when a call with payload type `T` must be recorded.
pub(crate) fn needs_handle<T: CommDatatype>(tape: &CommTape) -> bool {
    T::ACTIVE && tape.is_recording()
}

/// Wire representation of a payload slice.
pub(crate) fn wire_values<T: CommDatatype>(buf: &[T]) -> Vec<f64> {
    buf.iter().map(|x| x.to_wire()).collect()
}

/// Write received wire values back into the payload slice.
pub(crate) fn write_wire<T: CommDatatype>(buf: &mut [T], wire: &[f64]) {
    for (x, &v) in buf.iter_mut().zip(wire) {
        x.from_wire(v);
    }
}

/// Tape identifiers of an outgoing payload.
pub(crate) fn capture_indices<T: CommDatatype>(buf: &[T]) -> IndexBuffer {
    IndexBuffer::from_vec(buf.iter().map(|x| x.index()).collect())
}

/// Write received wire values into the payload and the tape, assigning a
/// fresh identifier to every element.
pub(crate) fn register_received<T: CommDatatype>(
    tape: &mut CommTape,
    buf: &mut [T],
    wire: &[f64],
) -> IndexBuffer {
    let mut indices = IndexBuffer::new(buf.len());
    for (i, (x, &v)) in buf.iter_mut().zip(wire).enumerate() {
        x.from_wire(v);
        let index = tape.register_value(v);
        x.set_index(index);
        indices[i] = index;
    }
    indices
}

/// Tape primal values of the recorded indices, in wire layout.
pub(crate) fn gather_primals(tape: &CommTape, indices: &[Index]) -> Vec<f64> {
    indices.iter().map(|&i| tape.primal(i)).collect()
}

/// Tangent values of the recorded indices, element-major over all directions.
pub(crate) fn gather_tangents(tape: &CommTape, indices: &[Index]) -> Vec<f64> {
    let w = tape.vector_width();
    let mut out = Vec::with_capacity(indices.len() * w);
    for &i in indices {
        for dir in 0..w {
            out.push(tape.tangent(i, dir));
        }
    }
    out
}

/// Adjoint values of the recorded indices, staged through an
/// [`AdjointBuffer`]. The tape slots are zeroed on extraction: the recorded
/// call overwrote these values, so their adjoints are consumed here.
pub(crate) fn take_adjoints(tape: &mut CommTape, indices: &[Index]) -> AdjointBuffer {
    let w = tape.vector_width();
    let mut buf = AdjointBuffer::new(indices.len(), w);
    for (e, &i) in indices.iter().enumerate() {
        for dir in 0..w {
            buf.element_mut(e)[dir] = tape.adjoint(i, dir);
            tape.set_adjoint(i, dir, 0.0);
        }
    }
    buf
}

/// Accumulate incoming adjoints into the recorded indices.
pub(crate) fn scatter_adjoints(tape: &mut CommTape, indices: &[Index], adjoints: &[f64]) {
    let w = tape.vector_width();
    for (e, &i) in indices.iter().enumerate() {
        for dir in 0..w {
            tape.update_adjoint(i, dir, adjoints[e * w + dir]);
        }
    }
}

/// Write received primal values into the tape, capturing the overwritten
/// values first when the tape asks for them.
pub(crate) fn replay_received(
    tape: &mut CommTape,
    indices: &[Index],
    wire: &[f64],
    old_primals: &mut Option<PrimalBuffer>,
) {
    if tape.old_primals_required() {
        *old_primals = Some(PrimalBuffer::from_vec(gather_primals(tape, indices)));
    }
    for (&i, &v) in indices.iter().zip(wire) {
        tape.set_primal(i, v);
    }
}

/// Restore primal values overwritten by a replayed receive.
pub(crate) fn restore_old_primals(
    tape: &mut CommTape,
    indices: &[Index],
    old_primals: &mut Option<PrimalBuffer>,
) {
    if let Some(old) = old_primals.take() {
        for (&i, &v) in indices.iter().zip(old.iter()) {
            tape.set_primal(i, v);
        }
    }
}

/// Recorded blocking send.
pub(crate) struct SendHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) indices: IndexBuffer,
    pub(crate) dest: i32,
    pub(crate) tag: i32,
}

impl<S: Substrate> ReplayAction for SendHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let wire = gather_primals(tape, &self.indices);
        self.substrate.send(&wire, self.dest, self.tag)
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        let wire = gather_tangents(tape, &self.indices);
        self.substrate.send(&wire, self.dest, self.tag)
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let mut incoming = vec![0.0; self.indices.len() * w];
        self.substrate.recv(&mut incoming, self.dest, self.tag)?;
        scatter_adjoints(tape, &self.indices, &incoming);
        Ok(())
    }
}

/// Recorded blocking receive. `source` and `tag` are the matched envelope's,
/// never wildcards.
pub(crate) struct RecvHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) source: i32,
    pub(crate) tag: i32,
}

impl<S: Substrate> ReplayAction for RecvHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let mut wire = vec![0.0; self.indices.len()];
        self.substrate.recv(&mut wire, self.source, self.tag)?;
        replay_received(tape, &self.indices, &wire, &mut self.old_primals);
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let mut wire = vec![0.0; self.indices.len() * w];
        self.substrate.recv(&mut wire, self.source, self.tag)?;
        for (e, &i) in self.indices.iter().enumerate() {
            for dir in 0..w {
                tape.set_tangent(i, dir, wire[e * w + dir]);
            }
        }
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let adjoints = take_adjoints(tape, &self.indices);
        self.substrate.send(&adjoints, self.source, self.tag)?;
        restore_old_primals(tape, &self.indices, &mut self.old_primals);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::ActiveReal;
    use crate::tape::EntryKind;

    #[derive(Clone)]
    struct NullSubstrate;

    impl Substrate for NullSubstrate {
        fn rank(&self) -> i32 {
            0
        }
        fn size(&self) -> i32 {
            1
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                nonblocking: false,
                cancel: false,
                probe: false,
            }
        }
        fn barrier(&self) -> Result<()> {
            Ok(())
        }
        fn send(&self, _: &[f64], _: i32, _: i32) -> Result<()> {
            Ok(())
        }
        fn recv(&self, _: &mut [f64], _: i32, _: i32) -> Result<Status> {
            Ok(Status::empty())
        }
        fn probe(&self, _: i32, _: i32) -> Result<Status> {
            Err(Error::NotSupported("probe".into()))
        }
        fn iprobe(&self, _: i32, _: i32) -> Result<Option<Status>> {
            Err(Error::NotSupported("probe".into()))
        }
        fn bcast(&self, _: &mut [f64], _: i32) -> Result<()> {
            Ok(())
        }
        fn gather(&self, _: &[f64], _: &mut [f64], _: i32) -> Result<()> {
            Ok(())
        }
        fn gatherv(&self, _: &[f64], _: &mut [f64], _: &[i32], _: &[i32], _: i32) -> Result<()> {
            Ok(())
        }
        fn scatter(&self, _: &[f64], _: &mut [f64], _: i32) -> Result<()> {
            Ok(())
        }
        fn scatterv(&self, _: &[f64], _: &[i32], _: &[i32], _: &mut [f64], _: i32) -> Result<()> {
            Ok(())
        }
        fn allgather(&self, _: &[f64], _: &mut [f64]) -> Result<()> {
            Ok(())
        }
        fn reduce(
            &self,
            _: &[f64],
            _: &mut [f64],
            _: &crate::substrate::CombineFn,
            _: &[f64],
            _: i32,
        ) -> Result<()> {
            Ok(())
        }
        fn allreduce(
            &self,
            _: &[f64],
            _: &mut [f64],
            _: &crate::substrate::CombineFn,
            _: &[f64],
        ) -> Result<()> {
            Ok(())
        }
        fn isend(&self, _: &[f64], _: i32, _: i32) -> Result<crate::substrate::RequestId> {
            Err(Error::NotSupported("nonblocking".into()))
        }
        fn irecv(&self, _: usize, _: i32, _: i32) -> Result<crate::substrate::RequestId> {
            Err(Error::NotSupported("nonblocking".into()))
        }
        fn ibcast(
            &self,
            _: Option<&[f64]>,
            _: usize,
            _: i32,
        ) -> Result<crate::substrate::RequestId> {
            Err(Error::NotSupported("nonblocking".into()))
        }
        fn iallreduce(
            &self,
            _: &[f64],
            _: &crate::substrate::CombineFn,
            _: &[f64],
        ) -> Result<crate::substrate::RequestId> {
            Err(Error::NotSupported("nonblocking".into()))
        }
        fn wait(&self, _: crate::substrate::RequestId, _: &mut [f64]) -> Result<Status> {
            Err(Error::InvalidRequest)
        }
        fn ready(&self, _: crate::substrate::RequestId) -> Result<bool> {
            Err(Error::InvalidRequest)
        }
        fn cancel(&self, _: crate::substrate::RequestId) -> Result<()> {
            Err(Error::NotSupported("cancel".into()))
        }
    }

    #[test]
    fn passive_send_records_nothing() {
        let comm = AdComm::new(NullSubstrate);
        let mut tape = CommTape::new();
        tape.start_recording();
        let before = stats::snapshot();
        comm.send(&mut tape, &[1.0f64, 2.0], 0, 0).unwrap();
        let after = stats::snapshot();
        assert!(tape.entry_kinds().is_empty());
        assert_eq!(after.handles_created, before.handles_created);
        assert_eq!(after.buffers_created(), before.buffers_created());
    }

    #[test]
    fn active_send_records_one_op_entry() {
        let comm = AdComm::new(NullSubstrate);
        let mut tape = CommTape::new();
        tape.start_recording();
        let payload = [tape.register_input(1.0), tape.register_input(2.0)];
        comm.send(&mut tape, &payload, 0, 0).unwrap();
        assert_eq!(tape.entry_kinds(), vec![EntryKind::Op]);
    }

    #[test]
    fn recording_off_means_pass_through_even_for_active_payloads() {
        let comm = AdComm::new(NullSubstrate);
        let mut tape = CommTape::new();
        let payload = [tape.register_input(1.0)];
        let before = stats::snapshot();
        comm.send(&mut tape, &payload, 0, 0).unwrap();
        let after = stats::snapshot();
        assert!(tape.entry_kinds().is_empty());
        assert_eq!(after.handles_created, before.handles_created);
    }

    #[test]
    fn probe_without_capability_is_not_supported() {
        let comm = AdComm::new(NullSubstrate);
        assert!(matches!(comm.probe(0, 0), Err(Error::NotSupported(_))));
    }

    #[test]
    fn adjoint_extraction_zeroes_the_store() {
        let mut tape = CommTape::new();
        let x = tape.register_input(1.0);
        tape.set_adjoint(x.index(), 0, 5.0);
        let buf = take_adjoints(&mut tape, &[x.index()]);
        assert_eq!(buf.element(0), &[5.0]);
        assert_eq!(tape.adjoint(x.index(), 0), 0.0);
    }
}
