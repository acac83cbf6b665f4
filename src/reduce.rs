//! Reduction operations and their replay handles.
//!
//! The reverse of a rooted reduce distributes the result's adjoints from the
//! root back to every contributor, then each contributor's post-adjoint hook
//! decides how much of that adjoint its own contribution earned (all of it
//! for sum, a rescaled share for prod, winner-takes-all for max/min).
//!
//! An allreduce leaves the reduced result replicated on every rank, so its
//! reverse needs no communication at all: each rank consumes the adjoints of
//! its own copy of the result and filters them against its own contribution.
//! Ranks seed the adjoints of the value they actually used; a rank that never
//! touches its copy contributes nothing.
//!
//! Forward-mode (tangent) propagation through reductions is not implemented.
//! Tangents of reduction results are left untouched and a warning is logged,
//! matching the record-side data captured here, which is sufficient for
//! primal and reverse replay only.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::{stats, IndexBuffer, PrimalBuffer};
use crate::comm::{
    capture_indices, gather_primals, needs_handle, register_received, replay_received,
    restore_old_primals, scatter_adjoints, take_adjoints, wire_values, write_wire, AdComm,
};
use crate::datatype::CommDatatype;
use crate::error::Result;
use crate::op::AdOp;
use crate::substrate::Substrate;
use crate::tape::{CommTape, ReplayAction};

impl<S: Substrate> AdComm<S> {
    /// Reduce every rank's `send` contribution to `root` with `op`. `recv` is
    /// significant only on the root.
    pub fn reduce<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        recv: &mut [T],
        op: &AdOp,
        root: i32,
    ) -> Result<()> {
        let is_root = self.rank() == root;
        let wire = wire_values(send);
        tracing::trace!(root, op = op.name(), count = send.len(), "reduce");
        let (send_mod, recv_mod) = self.wire_reduce(&wire, op, is_root, Some(root))?;
        if needs_handle::<T>(tape) {
            let recv_indices = if is_root {
                let values = op.values_from_modified(&recv_mod);
                Some(register_received(tape, recv, &values))
            } else {
                None
            };
            let handle = ReduceHandle {
                substrate: self.substrate().clone(),
                op: Rc::clone(op),
                send_indices: capture_indices(send),
                recv_indices,
                old_primals: None,
                send_primals: op
                    .requires_primal()
                    .then(|| PrimalBuffer::from_vec(send_mod)),
                reduced_primals: (is_root && op.requires_primal())
                    .then(|| PrimalBuffer::from_vec(recv_mod)),
                root,
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else if is_root {
            let values = op.values_from_modified(&recv_mod);
            write_wire(recv, &values);
        }
        Ok(())
    }

    /// Reduce every rank's `send` contribution with `op` and deliver the
    /// result to every rank.
    pub fn allreduce<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        recv: &mut [T],
        op: &AdOp,
    ) -> Result<()> {
        let wire = wire_values(send);
        tracing::trace!(op = op.name(), count = send.len(), "allreduce");
        let (send_mod, recv_mod) = self.wire_reduce(&wire, op, true, None)?;
        let values = op.values_from_modified(&recv_mod);
        if needs_handle::<T>(tape) {
            let recv_indices = register_received(tape, recv, &values);
            let handle = AllreduceHandle {
                substrate: self.substrate().clone(),
                op: Rc::clone(op),
                send_indices: capture_indices(send),
                recv_indices,
                old_primals: None,
                send_primals: op
                    .requires_primal()
                    .then(|| PrimalBuffer::from_vec(send_mod)),
                reduced_primals: op
                    .requires_primal()
                    .then(|| PrimalBuffer::from_vec(recv_mod)),
            };
            stats::handle_created();
            tape.push_op(Rc::new(RefCell::new(handle)));
        } else {
            write_wire(recv, &values);
        }
        Ok(())
    }

    /// Run `op` over wire values, in the modified representation when the
    /// operator captures locations. Returns the (possibly modified) sent
    /// contribution and the reduced result, the latter sized zero on
    /// non-receiving ranks. `root` of `None` means allreduce.
    fn wire_reduce(
        &self,
        wire: &[f64],
        op: &AdOp,
        receives: bool,
        root: Option<i32>,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let send_mod = op.to_modified(wire, self.rank());
        let mut recv_mod = vec![0.0; if receives { send_mod.len() } else { 0 }];
        let combine = if op.requires_primal() {
            op.combine_modified()
        } else {
            op.combine()
        };
        match root {
            Some(root) => self.substrate().reduce(
                &send_mod,
                &mut recv_mod,
                combine,
                op.modified_identity(),
                root,
            )?,
            None => self.substrate().allreduce(
                &send_mod,
                &mut recv_mod,
                combine,
                op.modified_identity(),
            )?,
        }
        Ok((send_mod, recv_mod))
    }
}

/// Apply the operator's adjoint hooks and accumulate into the send indices.
fn hand_back(
    tape: &mut CommTape,
    op: &AdOp,
    send_indices: &IndexBuffer,
    send_primals: Option<&PrimalBuffer>,
    reduced_primals: &[f64],
    mut adjoints: Vec<f64>,
) {
    let w = tape.vector_width();
    let count = send_indices.len();
    if let (Some(post), Some(own)) = (op.post_adjoint(), send_primals) {
        post(&mut adjoints, own, reduced_primals, count, w);
    }
    scatter_adjoints(tape, send_indices, &adjoints);
}

/// Recorded rooted reduce.
pub(crate) struct ReduceHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) op: AdOp,
    pub(crate) send_indices: IndexBuffer,
    pub(crate) recv_indices: Option<IndexBuffer>,
    pub(crate) old_primals: Option<PrimalBuffer>,
    /// Own contribution in modified wire layout, selective operators only.
    pub(crate) send_primals: Option<PrimalBuffer>,
    /// Reduced result in modified wire layout, root and selective only.
    pub(crate) reduced_primals: Option<PrimalBuffer>,
    pub(crate) root: i32,
}

impl<S: Substrate> ReplayAction for ReduceHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let wire = gather_primals(tape, &self.send_indices);
        let is_root = self.recv_indices.is_some();
        let send_mod = self.op.to_modified(&wire, self.substrate.rank());
        let mut recv_mod = vec![0.0; if is_root { send_mod.len() } else { 0 }];
        let combine = if self.op.requires_primal() {
            self.op.combine_modified()
        } else {
            self.op.combine()
        };
        self.substrate.reduce(
            &send_mod,
            &mut recv_mod,
            combine,
            self.op.modified_identity(),
            self.root,
        )?;
        if let Some(recv_indices) = &self.recv_indices {
            let values = self.op.values_from_modified(&recv_mod);
            replay_received(tape, recv_indices, &values, &mut self.old_primals);
        }
        if self.op.requires_primal() {
            self.send_primals = Some(PrimalBuffer::from_vec(send_mod));
            if is_root {
                self.reduced_primals = Some(PrimalBuffer::from_vec(recv_mod));
            }
        }
        Ok(())
    }

    fn forward(&mut self, _tape: &mut CommTape) -> Result<()> {
        tracing::warn!(
            op = self.op.name(),
            "tangent propagation through reductions is not implemented; \
             tangents of the result are left unchanged"
        );
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let count = self.send_indices.len();
        let mut adjoints = vec![0.0; count * w];
        let mut reduced = vec![0.0; count * self.op.wire_factor()];
        if let Some(recv_indices) = &self.recv_indices {
            let adj = take_adjoints(tape, recv_indices);
            adjoints.copy_from_slice(&adj);
            if let (Some(pre), Some(result)) = (self.op.pre_adjoint(), &self.reduced_primals) {
                pre(&mut adjoints, result, count, w);
            }
            if let Some(result) = &self.reduced_primals {
                reduced.copy_from_slice(result);
            }
        }
        self.substrate.bcast(&mut adjoints, self.root)?;
        if self.op.requires_primal() {
            self.substrate.bcast(&mut reduced, self.root)?;
        }
        hand_back(
            tape,
            &self.op,
            &self.send_indices,
            self.send_primals.as_ref(),
            &reduced,
            adjoints,
        );
        if let Some(recv_indices) = &self.recv_indices {
            restore_old_primals(tape, recv_indices, &mut self.old_primals);
        }
        Ok(())
    }
}

/// Recorded allreduce. The result is replicated, so the reverse sweep is
/// local to each rank.
pub(crate) struct AllreduceHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) op: AdOp,
    pub(crate) send_indices: IndexBuffer,
    pub(crate) recv_indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) send_primals: Option<PrimalBuffer>,
    pub(crate) reduced_primals: Option<PrimalBuffer>,
}

impl<S: Substrate> ReplayAction for AllreduceHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        let wire = gather_primals(tape, &self.send_indices);
        let send_mod = self.op.to_modified(&wire, self.substrate.rank());
        let mut recv_mod = vec![0.0; send_mod.len()];
        let combine = if self.op.requires_primal() {
            self.op.combine_modified()
        } else {
            self.op.combine()
        };
        self.substrate.allreduce(
            &send_mod,
            &mut recv_mod,
            combine,
            self.op.modified_identity(),
        )?;
        let values = self.op.values_from_modified(&recv_mod);
        replay_received(tape, &self.recv_indices, &values, &mut self.old_primals);
        if self.op.requires_primal() {
            self.send_primals = Some(PrimalBuffer::from_vec(send_mod));
            self.reduced_primals = Some(PrimalBuffer::from_vec(recv_mod));
        }
        Ok(())
    }

    fn forward(&mut self, _tape: &mut CommTape) -> Result<()> {
        tracing::warn!(
            op = self.op.name(),
            "tangent propagation through reductions is not implemented; \
             tangents of the result are left unchanged"
        );
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        let w = tape.vector_width();
        let count = self.send_indices.len();
        let adj = take_adjoints(tape, &self.recv_indices);
        let mut adjoints = adj.to_vec();
        if let (Some(pre), Some(result)) = (self.op.pre_adjoint(), &self.reduced_primals) {
            pre(&mut adjoints, result, count, w);
        }
        let reduced: Vec<f64> = match &self.reduced_primals {
            Some(result) => result.to_vec(),
            None => Vec::new(),
        };
        hand_back(
            tape,
            &self.op,
            &self.send_indices,
            self.send_primals.as_ref(),
            &reduced,
            adjoints,
        );
        restore_old_primals(tape, &self.recv_indices, &mut self.old_primals);
        Ok(())
    }
}
