//! Nonblocking operations, requests and continuations.
//!
//! A nonblocking call records two tape entries sharing one handle: an *op*
//! entry at the issue point and a *wait* entry at the completion point. The
//! forward-direction sweeps (primal, tangent) re-issue the substrate call at
//! the op entry and complete it at the wait entry; the reverse sweep meets
//! the wait entry first, starts the transposed transfer there and stores the
//! nested request in the handle, then blocks on it when it reaches the op
//! entry. Replayed communication is as overlapped as the recorded program.
//!
//! [`AsyncRequest`] is consumed by the matching `wait_*` call or by
//! [`AdComm::cancel`], so a request is completed exactly once. Cancelling
//! marks the shared handle, and a cancelled handle is skipped by every sweep.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::{stats, IndexBuffer, PrimalBuffer};
use crate::comm::{
    capture_indices, gather_primals, gather_tangents, needs_handle, register_received,
    replay_received, restore_old_primals, scatter_adjoints, take_adjoints, wire_values, write_wire,
    AdComm,
};
use crate::datatype::CommDatatype;
use crate::error::{Error, Result};
use crate::op::AdOp;
use crate::status::Status;
use crate::substrate::{RequestId, Substrate};
use crate::tape::{CommTape, ReplayAction};

enum Payload<S: Substrate> {
    /// Tracked handles; `None` when the payload was passive or recording was off.
    Send(Option<Rc<RefCell<IsendHandle<S>>>>),
    Recv(Option<Rc<RefCell<IrecvHandle<S>>>>),
    Bcast(Option<Rc<RefCell<IbcastHandle<S>>>>),
    Allreduce(Option<Rc<RefCell<IallreduceHandle<S>>>>),
}

/// An in-flight nonblocking operation.
///
/// Consumed exactly once, by the matching `wait_*` method or by
/// [`AdComm::cancel`]. Dropping an unconsumed request leaks the substrate
/// request but nothing else.
pub struct AsyncRequest<S: Substrate> {
    id: RequestId,
    payload: Payload<S>,
}

impl<S: Substrate> AsyncRequest<S> {
    /// Substrate-level identifier, for diagnostics.
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl<S: Substrate> std::fmt::Debug for AsyncRequest<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.payload {
            Payload::Send(_) => "send",
            Payload::Recv(_) => "recv",
            Payload::Bcast(_) => "bcast",
            Payload::Allreduce(_) => "allreduce",
        };
        f.debug_struct("AsyncRequest")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

impl<S: Substrate> AdComm<S> {
    /// Nonblocking send of `buf` to `dest`. Complete with
    /// [`wait_send`](Self::wait_send).
    pub fn isend<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        buf: &[T],
        dest: i32,
        tag: i32,
    ) -> Result<AsyncRequest<S>> {
        self.require(self.capabilities().nonblocking, "nonblocking")?;
        let wire = wire_values(buf);
        tracing::trace!(dest, tag, count = buf.len(), "isend");
        let id = self.substrate().isend(&wire, dest, tag)?;
        let handle = if needs_handle::<T>(tape) {
            let handle = Rc::new(RefCell::new(IsendHandle {
                substrate: self.substrate().clone(),
                indices: capture_indices(buf),
                dest,
                tag,
                cancelled: false,
                request_replay: None,
                request_reverse: None,
            }));
            stats::handle_created();
            tape.push_op(handle.clone() as Rc<RefCell<dyn ReplayAction>>);
            Some(handle)
        } else {
            None
        };
        Ok(AsyncRequest {
            id,
            payload: Payload::Send(handle),
        })
    }

    /// Complete a nonblocking send.
    pub fn wait_send(&self, tape: &mut CommTape, req: AsyncRequest<S>) -> Result<Status> {
        let handle = match req.payload {
            Payload::Send(handle) => handle,
            _ => return Err(Error::InvalidRequest),
        };
        let status = self.substrate().wait(req.id, &mut [])?;
        if let Some(handle) = handle {
            tape.push_wait(handle as Rc<RefCell<dyn ReplayAction>>);
        }
        Ok(status)
    }

    /// Post a nonblocking receive for `count` elements of type `T`. Complete
    /// with [`wait_recv`](Self::wait_recv), which delivers the data.
    pub fn irecv<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        count: usize,
        source: i32,
        tag: i32,
    ) -> Result<AsyncRequest<S>> {
        self.require(self.capabilities().nonblocking, "nonblocking")?;
        tracing::trace!(source, tag, count, "irecv");
        let id = self.substrate().irecv(count, source, tag)?;
        let handle = if needs_handle::<T>(tape) {
            let handle = Rc::new(RefCell::new(IrecvHandle {
                substrate: self.substrate().clone(),
                indices: IndexBuffer::new(count),
                old_primals: None,
                source,
                tag,
                cancelled: false,
                request_replay: None,
                request_reverse: None,
            }));
            stats::handle_created();
            tape.push_op(handle.clone() as Rc<RefCell<dyn ReplayAction>>);
            Some(handle)
        } else {
            None
        };
        Ok(AsyncRequest {
            id,
            payload: Payload::Recv(handle),
        })
    }

    /// Complete a nonblocking receive into `buf`, which must hold the posted
    /// count.
    pub fn wait_recv<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        req: AsyncRequest<S>,
        buf: &mut [T],
    ) -> Result<Status> {
        let handle = match req.payload {
            Payload::Recv(handle) => handle,
            _ => return Err(Error::InvalidRequest),
        };
        let mut wire = vec![0.0; buf.len()];
        let status = self.substrate().wait(req.id, &mut wire)?;
        match handle {
            Some(handle) => {
                {
                    let mut h = handle.borrow_mut();
                    h.indices = register_received(tape, buf, &wire);
                    // Wildcards are pinned to the matched envelope.
                    h.source = status.source;
                    h.tag = status.tag;
                }
                tape.push_wait(handle as Rc<RefCell<dyn ReplayAction>>);
            }
            None => write_wire(buf, &wire),
        }
        Ok(status)
    }

    /// Nonblocking broadcast from `root`. The root passes its payload in
    /// `root_buf`; other ranks pass `None` and receive the data from
    /// [`wait_bcast`](Self::wait_bcast).
    pub fn ibcast<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        root_buf: Option<&[T]>,
        count: usize,
        root: i32,
    ) -> Result<AsyncRequest<S>> {
        self.require(self.capabilities().nonblocking, "nonblocking")?;
        let is_root = self.rank() == root;
        let wire = root_buf.map(wire_values);
        tracing::trace!(root, count, "ibcast");
        let id = self.substrate().ibcast(wire.as_deref(), count, root)?;
        let handle = if needs_handle::<T>(tape) {
            let indices = match root_buf {
                Some(buf) => capture_indices(buf),
                None => IndexBuffer::new(count),
            };
            let handle = Rc::new(RefCell::new(IbcastHandle {
                substrate: self.substrate().clone(),
                indices,
                old_primals: None,
                root,
                is_root,
                cancelled: false,
                request_replay: None,
            }));
            stats::handle_created();
            tape.push_op(handle.clone() as Rc<RefCell<dyn ReplayAction>>);
            Some(handle)
        } else {
            None
        };
        Ok(AsyncRequest {
            id,
            payload: Payload::Bcast(handle),
        })
    }

    /// Complete a nonblocking broadcast. Non-root ranks receive the payload
    /// into `buf`; the root's buffer is left untouched and may be empty.
    pub fn wait_bcast<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        req: AsyncRequest<S>,
        buf: &mut [T],
    ) -> Result<Status> {
        let handle = match req.payload {
            Payload::Bcast(handle) => handle,
            _ => return Err(Error::InvalidRequest),
        };
        let mut wire = vec![0.0; buf.len()];
        let status = self.substrate().wait(req.id, &mut wire)?;
        match handle {
            Some(handle) => {
                let is_root = handle.borrow().is_root;
                if !is_root {
                    handle.borrow_mut().indices = register_received(tape, buf, &wire);
                }
                tape.push_wait(handle as Rc<RefCell<dyn ReplayAction>>);
            }
            None => {
                // The root's completion carries no data; leave its buffer alone.
                if status.count > 0 {
                    write_wire(buf, &wire);
                }
            }
        }
        Ok(status)
    }

    /// Nonblocking allreduce of `send` with `op`. Complete with
    /// [`wait_allreduce`](Self::wait_allreduce), which delivers the result.
    pub fn iallreduce<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        send: &[T],
        op: &AdOp,
    ) -> Result<AsyncRequest<S>> {
        self.require(self.capabilities().nonblocking, "nonblocking")?;
        let wire = wire_values(send);
        let send_mod = op.to_modified(&wire, self.rank());
        tracing::trace!(op = op.name(), count = send.len(), "iallreduce");
        let combine = if op.requires_primal() {
            op.combine_modified()
        } else {
            op.combine()
        };
        let id = self
            .substrate()
            .iallreduce(&send_mod, combine, op.modified_identity())?;
        let handle = if needs_handle::<T>(tape) {
            let handle = Rc::new(RefCell::new(IallreduceHandle {
                substrate: self.substrate().clone(),
                op: Rc::clone(op),
                send_indices: capture_indices(send),
                recv_indices: IndexBuffer::new(0),
                old_primals: None,
                send_primals: op
                    .requires_primal()
                    .then(|| PrimalBuffer::from_vec(send_mod)),
                reduced_primals: None,
                cancelled: false,
                request_replay: None,
            }));
            stats::handle_created();
            tape.push_op(handle.clone() as Rc<RefCell<dyn ReplayAction>>);
            Some(handle)
        } else {
            None
        };
        Ok(AsyncRequest {
            id,
            payload: Payload::Allreduce(handle),
        })
    }

    /// Complete a nonblocking allreduce into `recv`, which must match the
    /// contribution length.
    pub fn wait_allreduce<T: CommDatatype>(
        &self,
        tape: &mut CommTape,
        req: AsyncRequest<S>,
        recv: &mut [T],
    ) -> Result<Status> {
        let handle = match req.payload {
            Payload::Allreduce(handle) => handle,
            _ => return Err(Error::InvalidRequest),
        };
        match handle {
            Some(handle) => {
                let (factor, op) = {
                    let h = handle.borrow();
                    (h.op.wire_factor(), Rc::clone(&h.op))
                };
                let mut recv_mod = vec![0.0; recv.len() * factor];
                let status = self.substrate().wait(req.id, &mut recv_mod)?;
                let values = op.values_from_modified(&recv_mod);
                {
                    let mut h = handle.borrow_mut();
                    h.recv_indices = register_received(tape, recv, &values);
                    if op.requires_primal() {
                        h.reduced_primals = Some(PrimalBuffer::from_vec(recv_mod));
                    }
                }
                tape.push_wait(handle as Rc<RefCell<dyn ReplayAction>>);
                Ok(status)
            }
            None => {
                let mut wire = vec![0.0; recv.len()];
                let status = self.substrate().wait(req.id, &mut wire)?;
                write_wire(recv, &wire);
                Ok(status)
            }
        }
    }

    /// Check whether a request could complete without blocking.
    pub fn is_ready(&self, req: &AsyncRequest<S>) -> Result<bool> {
        self.substrate().ready(req.id)
    }

    /// Cancel an in-flight request.
    ///
    /// The request is consumed and its recorded entries become no-ops in
    /// every sweep: a cancelled operation transported no values, so it has
    /// no derivative either.
    pub fn cancel(&self, req: AsyncRequest<S>) -> Result<()> {
        self.require(self.capabilities().cancel, "cancel")?;
        self.substrate().cancel(req.id)?;
        match req.payload {
            Payload::Send(Some(handle)) => handle.borrow_mut().cancelled = true,
            Payload::Recv(Some(handle)) => handle.borrow_mut().cancelled = true,
            Payload::Bcast(Some(handle)) => handle.borrow_mut().cancelled = true,
            Payload::Allreduce(Some(handle)) => handle.borrow_mut().cancelled = true,
            _ => {}
        }
        Ok(())
    }
}

/// Recorded nonblocking send.
pub(crate) struct IsendHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) indices: IndexBuffer,
    pub(crate) dest: i32,
    pub(crate) tag: i32,
    pub(crate) cancelled: bool,
    /// Nested request of a forward-direction sweep, issue to wait.
    pub(crate) request_replay: Option<RequestId>,
    /// Nested request of the reverse sweep, wait to issue.
    pub(crate) request_reverse: Option<RequestId>,
}

impl<S: Substrate> ReplayAction for IsendHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let wire = gather_primals(tape, &self.indices);
        self.request_replay = Some(self.substrate.isend(&wire, self.dest, self.tag)?);
        Ok(())
    }

    fn primal_wait(&mut self, _tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            self.substrate.wait(req, &mut [])?;
        }
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let wire = gather_tangents(tape, &self.indices);
        self.request_replay = Some(self.substrate.isend(&wire, self.dest, self.tag)?);
        Ok(())
    }

    fn forward_wait(&mut self, _tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            self.substrate.wait(req, &mut [])?;
        }
        Ok(())
    }

    fn reverse_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let count = self.indices.len() * tape.vector_width();
        self.request_reverse = Some(self.substrate.irecv(count, self.dest, self.tag)?);
        Ok(())
    }

    fn reverse(&mut self, tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_reverse.take() {
            let mut incoming = vec![0.0; self.indices.len() * tape.vector_width()];
            self.substrate.wait(req, &mut incoming)?;
            scatter_adjoints(tape, &self.indices, &incoming);
        }
        Ok(())
    }
}

/// Recorded nonblocking receive. Indices are assigned at the completion
/// point, where the data arrived.
pub(crate) struct IrecvHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) source: i32,
    pub(crate) tag: i32,
    pub(crate) cancelled: bool,
    pub(crate) request_replay: Option<RequestId>,
    pub(crate) request_reverse: Option<RequestId>,
}

impl<S: Substrate> ReplayAction for IrecvHandle<S> {
    fn primal(&mut self, _tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        self.request_replay = Some(self.substrate.irecv(
            self.indices.len(),
            self.source,
            self.tag,
        )?);
        Ok(())
    }

    fn primal_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            let mut wire = vec![0.0; self.indices.len()];
            self.substrate.wait(req, &mut wire)?;
            replay_received(tape, &self.indices, &wire, &mut self.old_primals);
        }
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let count = self.indices.len() * tape.vector_width();
        self.request_replay = Some(self.substrate.irecv(count, self.source, self.tag)?);
        Ok(())
    }

    fn forward_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            let w = tape.vector_width();
            let mut wire = vec![0.0; self.indices.len() * w];
            self.substrate.wait(req, &mut wire)?;
            for (e, &i) in self.indices.iter().enumerate() {
                for dir in 0..w {
                    tape.set_tangent(i, dir, wire[e * w + dir]);
                }
            }
        }
        Ok(())
    }

    fn reverse_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let adjoints = take_adjoints(tape, &self.indices);
        self.request_reverse = Some(self.substrate.isend(&adjoints, self.source, self.tag)?);
        restore_old_primals(tape, &self.indices, &mut self.old_primals);
        Ok(())
    }

    fn reverse(&mut self, _tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_reverse.take() {
            self.substrate.wait(req, &mut [])?;
        }
        Ok(())
    }
}

/// Recorded nonblocking broadcast. The reverse transpose is a sum-reduction
/// of the receivers' adjoints, run at the completion point.
pub(crate) struct IbcastHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) root: i32,
    pub(crate) is_root: bool,
    pub(crate) cancelled: bool,
    pub(crate) request_replay: Option<RequestId>,
}

impl<S: Substrate> ReplayAction for IbcastHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let count = self.indices.len();
        let req = if self.is_root {
            let wire = gather_primals(tape, &self.indices);
            self.substrate.ibcast(Some(&wire), count, self.root)?
        } else {
            self.substrate.ibcast(None, count, self.root)?
        };
        self.request_replay = Some(req);
        Ok(())
    }

    fn primal_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            let mut wire = vec![0.0; self.indices.len()];
            self.substrate.wait(req, &mut wire)?;
            if !self.is_root {
                replay_received(tape, &self.indices, &wire, &mut self.old_primals);
            }
        }
        Ok(())
    }

    fn forward(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let count = self.indices.len() * tape.vector_width();
        let req = if self.is_root {
            let wire = gather_tangents(tape, &self.indices);
            self.substrate.ibcast(Some(&wire), count, self.root)?
        } else {
            self.substrate.ibcast(None, count, self.root)?
        };
        self.request_replay = Some(req);
        Ok(())
    }

    fn forward_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            let w = tape.vector_width();
            let mut wire = vec![0.0; self.indices.len() * w];
            self.substrate.wait(req, &mut wire)?;
            if !self.is_root {
                for (e, &i) in self.indices.iter().enumerate() {
                    for dir in 0..w {
                        tape.set_tangent(i, dir, wire[e * w + dir]);
                    }
                }
            }
        }
        Ok(())
    }

    fn reverse_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        // The transposed reduction runs blocking here; the substrate has no
        // nonblocking reduce with a caller-supplied combine function.
        let w = tape.vector_width();
        let contrib = if self.is_root {
            crate::buffer::AdjointBuffer::new(self.indices.len(), w)
        } else {
            take_adjoints(tape, &self.indices)
        };
        let mut reduced = vec![0.0; self.indices.len() * w];
        self.substrate.reduce(
            &contrib,
            &mut reduced,
            &crate::op::sum_op(),
            &[0.0],
            self.root,
        )?;
        if self.is_root {
            scatter_adjoints(tape, &self.indices, &reduced);
        } else {
            restore_old_primals(tape, &self.indices, &mut self.old_primals);
        }
        Ok(())
    }

    fn reverse(&mut self, _tape: &mut CommTape) -> Result<()> {
        Ok(())
    }
}

/// Recorded nonblocking allreduce. The reverse sweep is local to each rank,
/// run at the completion point.
pub(crate) struct IallreduceHandle<S: Substrate> {
    pub(crate) substrate: S,
    pub(crate) op: AdOp,
    pub(crate) send_indices: IndexBuffer,
    pub(crate) recv_indices: IndexBuffer,
    pub(crate) old_primals: Option<PrimalBuffer>,
    pub(crate) send_primals: Option<PrimalBuffer>,
    pub(crate) reduced_primals: Option<PrimalBuffer>,
    pub(crate) cancelled: bool,
    pub(crate) request_replay: Option<RequestId>,
}

impl<S: Substrate> ReplayAction for IallreduceHandle<S> {
    fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let wire = gather_primals(tape, &self.send_indices);
        let send_mod = self.op.to_modified(&wire, self.substrate.rank());
        let combine = if self.op.requires_primal() {
            self.op.combine_modified()
        } else {
            self.op.combine()
        };
        self.request_replay = Some(self.substrate.iallreduce(
            &send_mod,
            combine,
            self.op.modified_identity(),
        )?);
        if self.op.requires_primal() {
            self.send_primals = Some(PrimalBuffer::from_vec(send_mod));
        }
        Ok(())
    }

    fn primal_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if let Some(req) = self.request_replay.take() {
            let factor = self.op.wire_factor();
            let mut recv_mod = vec![0.0; self.recv_indices.len() * factor];
            self.substrate.wait(req, &mut recv_mod)?;
            let values = self.op.values_from_modified(&recv_mod);
            replay_received(tape, &self.recv_indices, &values, &mut self.old_primals);
            if self.op.requires_primal() {
                self.reduced_primals = Some(PrimalBuffer::from_vec(recv_mod));
            }
        }
        Ok(())
    }

    fn forward(&mut self, _tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        tracing::warn!(
            op = self.op.name(),
            "tangent propagation through reductions is not implemented; \
             tangents of the result are left unchanged"
        );
        Ok(())
    }

    fn reverse_wait(&mut self, tape: &mut CommTape) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let w = tape.vector_width();
        let count = self.send_indices.len();
        let adj = take_adjoints(tape, &self.recv_indices);
        let mut adjoints = adj.to_vec();
        if let (Some(pre), Some(result)) = (self.op.pre_adjoint(), &self.reduced_primals) {
            pre(&mut adjoints, result, count, w);
        }
        if let (Some(post), Some(own)) = (self.op.post_adjoint(), &self.send_primals) {
            let reduced: &[f64] = match &self.reduced_primals {
                Some(result) => result,
                None => &[],
            };
            post(&mut adjoints, own, reduced, count, w);
        }
        scatter_adjoints(tape, &self.send_indices, &adjoints);
        restore_old_primals(tape, &self.recv_indices, &mut self.old_primals);
        Ok(())
    }

    fn reverse(&mut self, _tape: &mut CommTape) -> Result<()> {
        Ok(())
    }
}
