//! The messaging substrate abstraction.
//!
//! The differentiation layer never talks to a concrete message-passing
//! library directly. Everything goes through the [`Substrate`] trait, which
//! exposes the wire-level operations the record/replay engine needs: blocking
//! and nonblocking point-to-point transfers, the collective patterns, and
//! request completion. Wire buffers are `f64` slices; payload datatypes are
//! converted to and from this representation by the
//! [`CommDatatype`](crate::CommDatatype) layer before a substrate call is
//! issued.
//!
//! Feature availability is described by a [`Capabilities`] value resolved once
//! per substrate instead of conditional compilation; wrappers consult it and
//! return [`Error::NotSupported`](crate::Error::NotSupported) for absent
//! features. Implementations over a library that reports numeric return
//! codes should map them with [`Error::check`](crate::Error::check).

use std::sync::Arc;

use crate::error::Result;
use crate::status::Status;

/// Wildcard source rank for receive and probe operations.
pub const ANY_SOURCE: i32 = -1;

/// Wildcard message tag for receive and probe operations.
pub const ANY_TAG: i32 = -1;

/// Elementwise combine function for reductions.
///
/// Called as `combine(incoming, accumulator)`; the accumulator holds the
/// partial result and must be updated in place. Both slices are in wire
/// layout, so an operator with a modified wire representation (value/location
/// pairs) sees `wire_factor` slots per logical element.
pub type CombineFn = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;

/// Identifier for an in-flight nonblocking substrate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Feature set of a substrate, resolved once at startup.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Nonblocking point-to-point and collective operations are available.
    pub nonblocking: bool,
    /// In-flight requests can be cancelled.
    pub cancel: bool,
    /// Blocking and nonblocking probe are available.
    pub probe: bool,
}

/// Wire-level communication operations.
///
/// Implementations are cloneable endpoints: each clone refers to the same
/// rank within the same communicator, so replay handles can keep their own
/// copy. Rooted collectives interpret `recv`-side buffers as significant only
/// on the root rank.
pub trait Substrate: Clone + 'static {
    /// Rank of the calling process.
    fn rank(&self) -> i32;

    /// Number of processes in the communicator.
    fn size(&self) -> i32;

    /// Feature set of this substrate.
    fn capabilities(&self) -> Capabilities;

    /// Barrier synchronization.
    fn barrier(&self) -> Result<()>;

    /// Blocking send to `dest`.
    fn send(&self, buf: &[f64], dest: i32, tag: i32) -> Result<()>;

    /// Blocking receive. `source` and `tag` accept [`ANY_SOURCE`]/[`ANY_TAG`].
    fn recv(&self, buf: &mut [f64], source: i32, tag: i32) -> Result<Status>;

    /// Block until a matching message is available, without consuming it.
    fn probe(&self, source: i32, tag: i32) -> Result<Status>;

    /// Check for a matching message without blocking or consuming it.
    fn iprobe(&self, source: i32, tag: i32) -> Result<Option<Status>>;

    /// Broadcast `buf` from `root` to all ranks.
    fn bcast(&self, buf: &mut [f64], root: i32) -> Result<()>;

    /// Gather equal-size contributions to `root`.
    fn gather(&self, send: &[f64], recv: &mut [f64], root: i32) -> Result<()>;

    /// Gather variable-size contributions to `root`. `counts` and `displs`
    /// are in wire elements and significant only on the root.
    fn gatherv(
        &self,
        send: &[f64],
        recv: &mut [f64],
        counts: &[i32],
        displs: &[i32],
        root: i32,
    ) -> Result<()>;

    /// Scatter equal-size slices from `root`.
    fn scatter(&self, send: &[f64], recv: &mut [f64], root: i32) -> Result<()>;

    /// Scatter variable-size slices from `root`.
    fn scatterv(
        &self,
        send: &[f64],
        counts: &[i32],
        displs: &[i32],
        recv: &mut [f64],
        root: i32,
    ) -> Result<()>;

    /// Gather equal-size contributions to every rank.
    fn allgather(&self, send: &[f64], recv: &mut [f64]) -> Result<()>;

    /// Reduce contributions to `root` with `op`.
    ///
    /// `identity` is the operator's native identity pattern, one wire element
    /// long; the substrate tiles it across the accumulator before combining
    /// contributions in rank order.
    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: &CombineFn,
        identity: &[f64],
        root: i32,
    ) -> Result<()>;

    /// Reduce contributions and deliver the result to every rank.
    fn allreduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: &CombineFn,
        identity: &[f64],
    ) -> Result<()>;

    /// Nonblocking send. The buffer is captured at issue time.
    fn isend(&self, buf: &[f64], dest: i32, tag: i32) -> Result<RequestId>;

    /// Post a nonblocking receive for `count` wire elements.
    fn irecv(&self, count: usize, source: i32, tag: i32) -> Result<RequestId>;

    /// Nonblocking broadcast. The root passes its data in `root_buf`; other
    /// ranks pass `None` and obtain the data from [`Substrate::wait`].
    fn ibcast(&self, root_buf: Option<&[f64]>, count: usize, root: i32) -> Result<RequestId>;

    /// Nonblocking allreduce of this rank's contribution.
    fn iallreduce(
        &self,
        send: &[f64],
        op: &CombineFn,
        identity: &[f64],
    ) -> Result<RequestId>;

    /// Complete a request, writing any incoming data into `out`.
    ///
    /// `out` must be sized for the operation's result: the posted count for
    /// receives and broadcasts, the contribution length for allreduce, and
    /// empty for sends. A request id is consumed exactly once.
    fn wait(&self, req: RequestId, out: &mut [f64]) -> Result<Status>;

    /// Check whether a request could complete without blocking.
    ///
    /// Does not consume the request; call [`Substrate::wait`] to complete it.
    fn ready(&self, req: RequestId) -> Result<bool>;

    /// Cancel an in-flight request. The request id is consumed.
    fn cancel(&self, req: RequestId) -> Result<()>;
}
