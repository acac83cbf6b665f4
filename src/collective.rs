//! Collective operations and their replay handles.
//!
//! Every collective transposes into its mirror image for the reverse sweep:
//! a broadcast becomes a sum-reduction of the receivers' adjoints back to the
//! root, a gather becomes a scatter of the root's adjoints, a scatter becomes
//! a gather, and an allgather becomes an allreduce followed by each rank
//! slicing out the adjoints of its own contribution.
//!
//! Rooted collectives record a handle on every participating rank; the root's
//! handle additionally owns the root-side index buffer and the per-rank
//! counts, mirroring which arguments are significant where.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::{stats, IndexBuffer, PrimalBuffer};
use crate::comm::{
    capture_indices, gather_primals, gather_tangents, needs_handle, register_received,
    replay_received, restore_old_primals, scatter_adjoints, take_adjoints, wire_values, write_wire,
    AdComm,
};
use crate::datatype::{ActiveReal, CommDatatype};
use crate::displacements::{
    create_linear_displacements, create_linear_displacements_and_count, create_linear_index_counts,
};
use crate::error::Result;
use crate::op::sum_op;
use crate::substrate::Substrate;
use crate::tape::{CommTape, ReplayAction};

/// Per-rank tape-element counts and displacements scaled by `factor`.
/// Handles store counts already converted to tape elements, so the payload
/// type here is the identity [`ActiveReal`] transform.
fn scaled_layout(counts: &[i32], factor: usize) -> (Vec<i32>, Vec<i32>) {
    let (lin, _) = create_linear_displacements_and_count::<ActiveReal>(counts, factor);
    (lin.counts, lin.displs)
}

impl<S: Substrate> AdComm<S> {
    /// Broadcast `buf` from `root` to every rank.
    pub fn bcast<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        buf: &mut [T],
        root: i32,
    ) -> Result<()> {
        let is_root = self.rank() == root;
        let mut wire = if is_root {
            wire_values(buf)
        } else {
            vec![0.0; buf.len()]
        };
        tracing::trace!(root, count = buf.len(), "bcast");
        self.substrate().bcast(&mut wire, root)?;
        if needs_handle::<T>(tape) {
            let indices = if is_root {
                capture_indices(buf)
            } else {
                register_received(tape, buf, &wire)
            };
            let handle = BcastHandle {
                substrate: self.substrate().clone(),
                indices,
                old_primals: None,
                root,
                is_root,
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else if !is_root {
            write_wire(buf, &wire);
        }
        Ok(())
    }

    /// Gather equal-size contributions to `root`. `recv` is significant only
    /// on the root, where it must hold `size * send.len()` elements.
    pub fn gather<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        recv: &mut [T],
        root: i32,
    ) -> Result<()> {
        let counts = vec![send.len() as i32; self.size() as usize];
        self.gatherv(tape, send, recv, &counts, root)
    }

    /// Gather variable-size contributions to `root`. `counts` holds each
    /// rank's contribution size and is significant only on the root;
    /// displacements are dense prefix sums.
    pub fn gatherv<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        recv: &mut [T],
        counts: &[i32],
        root: i32,
    ) -> Result<()> {
        let is_root = self.rank() == root;
        let send_wire = wire_values(send);
        let mut recv_wire = vec![0.0; recv.len()];
        let lin = create_linear_displacements(counts);
        tracing::trace!(root, count = send.len(), "gatherv");
        self.substrate()
            .gatherv(&send_wire, &mut recv_wire, &lin.counts, &lin.displs, root)?;
        if needs_handle::<T>(tape) {
            let recv_indices = if is_root {
                Some(register_received(tape, recv, &recv_wire))
            } else {
                None
            };
            let handle = GatherHandle {
                substrate: self.substrate().clone(),
                send_indices: capture_indices(send),
                recv_indices,
                old_primals: None,
                counts: is_root.then(|| create_linear_index_counts::<T>(counts)),
                root,
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else if is_root {
            write_wire(recv, &recv_wire);
        }
        Ok(())
    }

    /// Scatter equal-size slices from `root`. `send` is significant only on
    /// the root, where it must hold `size * recv.len()` elements.
    pub fn scatter<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        recv: &mut [T],
        root: i32,
    ) -> Result<()> {
        let counts = vec![recv.len() as i32; self.size() as usize];
        self.scatterv(tape, send, &counts, recv, root)
    }

    /// Scatter variable-size slices from `root`. `counts` is significant
    /// only on the root; each rank's `recv` must match its own count.
    pub fn scatterv<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        counts: &[i32],
        recv: &mut [T],
        root: i32,
    ) -> Result<()> {
        let is_root = self.rank() == root;
        let send_wire = wire_values(send);
        let mut recv_wire = vec![0.0; recv.len()];
        let lin = create_linear_displacements(counts);
        tracing::trace!(root, count = recv.len(), "scatterv");
        self.substrate()
            .scatterv(&send_wire, &lin.counts, &lin.displs, &mut recv_wire, root)?;
        if needs_handle::<T>(tape) {
            let handle = ScatterHandle {
                substrate: self.substrate().clone(),
                send_indices: is_root.then(|| capture_indices(send)),
                recv_indices: register_received(tape, recv, &recv_wire),
                old_primals: None,
                counts: is_root.then(|| create_linear_index_counts::<T>(counts)),
                root,
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else {
            write_wire(recv, &recv_wire);
        }
        Ok(())
    }

    /// Gather equal-size contributions to every rank. `recv` must hold
    /// `size * send.len()` elements on each rank.
    pub fn allgather<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        recv: &mut [T],
    ) -> Result<()> {
        let send_wire = wire_values(send);
        let mut recv_wire = vec![0.0; recv.len()];
        tracing::trace!(count = send.len(), "allgather");
        self.substrate().allgather(&send_wire, &mut recv_wire)?;
        if needs_handle::<T>(tape) {
            let handle = AllgatherHandle {
                substrate: self.substrate().clone(),
                send_indices: capture_indices(send),
                recv_indices: register_received(tape, recv, &recv_wire),
                old_primals: None,
                rank: self.rank(),
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else {
            write_wire(recv, &recv_wire);
        }
        Ok(())
    }
}

/// Recorded broadcast. Receivers' adjoints are sum-reduced back to the root.
pub(crate) struct BcastHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) root: i32,
    pub(crate) is_root: bool,
}

impl<S: Substrate> ReplayAction for BcastHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let mut wire = if self.is_root {
            gather_primals(tape, &self.indices)
        } else {
            vec![0.0; self.indices.len()]
        };
        self.substrate.bcast(&mut wire, self.root)?;
        if !self.is_root {
            replay_received(tape, &self.indices, &wire, &mut self.old_primals);
        }
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let mut wire = if self.is_root {
            gather_tangents(tape, &self.indices)
        } else {
            vec![0.0; self.indices.len() * w]
        };
        self.substrate.bcast(&mut wire, self.root)?;
        if !self.is_root {
            for (e, &i) in self.indices.iter().enumerate() {
                for dir in 0..w {
                    tape.set_tangent(i, dir, wire[e * w + dir]);
                }
            }
        }
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        // The root's copy was not overwritten, so its adjoints stay in the
        // store and the receivers' contributions accumulate on top.
        let contrib = if self.is_root {
            crate::buffer::AdjointBuffer::new(self.indices.len(), w)
        } else {
            take_adjoints(tape, &self.indices)
        };
        let mut reduced = vec![0.0; self.indices.len() * w];
        self.substrate
            .reduce(&contrib, &mut reduced, &sum_op(), &[0.0], self.root)?;
        if self.is_root {
            scatter_adjoints(tape, &self.indices, &reduced);
        } else {
            restore_old_primals(tape, &self.indices, &mut self.old_primals);
        }
        Ok(())
    }
}

/// Recorded gather (equal or variable counts). The transpose is a scatter of
/// the root's result adjoints back to the contributors.
pub(crate) struct GatherHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) send_indices: IndexBuffer,
    pub(crate) recv_indices: Option<IndexBuffer>,
    pub(crate) old_primals: Option<PrimalBuffer>,
    /// Per-rank tape-element counts, root only.
    pub(crate) counts: Option<Vec<i32>>,
    pub(crate) root: i32,
}

impl<S: Substrate> GatherHandle<S> {
    fn layout(&self, factor: usize) -> (Vec<i32>, Vec<i32>) {
        match &self.counts {
            Some(counts) => scaled_layout(counts, factor),
            None => (Vec::new(), Vec::new()),
        }
    }
}

impl<S: Substrate> ReplayAction for GatherHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let send = gather_primals(tape, &self.send_indices);
        let (counts, displs) = self.layout(1);
        let mut recv =
            vec![0.0; self.recv_indices.as_ref().map_or(0, |ix| ix.len())];
        self.substrate
            .gatherv(&send, &mut recv, &counts, &displs, self.root)?;
        if let Some(recv_indices) = &self.recv_indices {
            replay_received(tape, recv_indices, &recv, &mut self.old_primals);
        }
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let send = gather_tangents(tape, &self.send_indices);
        let (counts, displs) = self.layout(w);
        let mut recv =
            vec![0.0; self.recv_indices.as_ref().map_or(0, |ix| ix.len()) * w];
        self.substrate
            .gatherv(&send, &mut recv, &counts, &displs, self.root)?;
        if let Some(recv_indices) = &self.recv_indices {
            for (e, &i) in recv_indices.iter().enumerate() {
                for dir in 0..w {
                    tape.set_tangent(i, dir, recv[e * w + dir]);
                }
            }
        }
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let (counts, displs) = self.layout(w);
        let mut incoming = vec![0.0; self.send_indices.len() * w];
        match &self.recv_indices {
            Some(recv_indices) => {
                let adj = take_adjoints(tape, recv_indices);
                self.substrate
                    .scatterv(&adj, &counts, &displs, &mut incoming, self.root)?;
                restore_old_primals(tape, recv_indices, &mut self.old_primals);
            }
            None => {
                self.substrate
                    .scatterv(&[], &counts, &displs, &mut incoming, self.root)?;
            }
        }
        scatter_adjoints(tape, &self.send_indices, &incoming);
        Ok(())
    }
}

/// Recorded scatter (equal or variable counts). The transpose is a gather of
/// the receivers' adjoints back to the root's send buffer.
pub(crate) struct ScatterHandle<S: Substrate> {
    pub(crate) substrate: S,
    /// Root-side source indices, root only.
    pub(crate) send_indices: Option<IndexBuffer>,
    pub(crate) recv_indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    /// Per-rank tape-element counts, root only.
    pub(crate) counts: Option<Vec<i32>>,
    pub(crate) root: i32,
}

impl<S: Substrate> ScatterHandle<S> {
    fn layout(&self, factor: usize) -> (Vec<i32>, Vec<i32>) {
        match &self.counts {
            Some(counts) => scaled_layout(counts, factor),
            None => (Vec::new(), Vec::new()),
        }
    }
}

impl<S: Substrate> ReplayAction for ScatterHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let send = match &self.send_indices {
            Some(ix) => gather_primals(tape, ix),
            None => Vec::new(),
        };
        let (counts, displs) = self.layout(1);
        let mut recv = vec![0.0; self.recv_indices.len()];
        self.substrate
            .scatterv(&send, &counts, &displs, &mut recv, self.root)?;
        replay_received(tape, &self.recv_indices, &recv, &mut self.old_primals);
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let send = match &self.send_indices {
            Some(ix) => gather_tangents(tape, ix),
            None => Vec::new(),
        };
        let (counts, displs) = self.layout(w);
        let mut recv = vec![0.0; self.recv_indices.len() * w];
        self.substrate
            .scatterv(&send, &counts, &displs, &mut recv, self.root)?;
        for (e, &i) in self.recv_indices.iter().enumerate() {
            for dir in 0..w {
                tape.set_tangent(i, dir, recv[e * w + dir]);
            }
        }
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let adj = take_adjoints(tape, &self.recv_indices);
        let (counts, displs) = self.layout(w);
        let mut collected =
            vec![0.0; self.send_indices.as_ref().map_or(0, |ix| ix.len()) * w];
        self.substrate
            .gatherv(&adj, &mut collected, &counts, &displs, self.root)?;
        if let Some(send_indices) = &self.send_indices {
            scatter_adjoints(tape, send_indices, &collected);
        }
        restore_old_primals(tape, &self.recv_indices, &mut self.old_primals);
        Ok(())
    }
}

/// Recorded allgather. Every rank holds a copy of every contribution, so the
/// transpose sums the per-copy adjoints across ranks and hands each rank the
/// slice belonging to its own contribution.
pub(crate) struct AllgatherHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) send_indices: IndexBuffer,
    pub(crate) recv_indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) rank: i32,
}

impl<S: Substrate> ReplayAction for AllgatherHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let send = gather_primals(tape, &self.send_indices);
        let mut recv = vec![0.0; self.recv_indices.len()];
        self.substrate.allgather(&send, &mut recv)?;
        replay_received(tape, &self.recv_indices, &recv, &mut self.old_primals);
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let send = gather_tangents(tape, &self.send_indices);
        let mut recv = vec![0.0; self.recv_indices.len() * w];
        self.substrate.allgather(&send, &mut recv)?;
        for (e, &i) in self.recv_indices.iter().enumerate() {
            for dir in 0..w {
                tape.set_tangent(i, dir, recv[e * w + dir]);
            }
        }
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let n = self.send_indices.len();
        let adj = take_adjoints(tape, &self.recv_indices);
        let mut summed = vec![0.0; adj.len()];
        self.substrate
            .allreduce(&adj, &mut summed, &sum_op(), &[0.0])?;
        let own = &summed[self.rank as usize * n * w..(self.rank as usize + 1) * n * w];
        scatter_adjoints(tape, &self.send_indices, own);
        restore_old_primals(tape, &self.recv_indices, &mut self.old_primals);
        Ok(())
    }
}
