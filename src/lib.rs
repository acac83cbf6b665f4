//! # adcomm
//!
//! Record/replay middleware for differentiating message-passing programs.
//!
//! This crate sits between an algorithmic-differentiation tape and a
//! message-passing substrate, providing:
//! - Communication wrappers that mirror the substrate's operations and are
//!   transparent for passive payloads
//! - Replay handles that re-execute recorded calls in primal form or
//!   transpose them for the reverse (adjoint) sweep
//! - Nonblocking operations whose replays keep the recorded overlap
//! - Differentiable reduction operators, including winner-selective max/min
//!   with a deterministic tie policy
//! - An in-process multi-rank substrate ([`LocalComm`]) for tests and
//!   single-process experiments
//!
//! ## Supported Types
//!
//! All communication operations are generic over [`CommDatatype`]:
//! [`ActiveReal`] (tracked), `f64`, `f32`, `i32` (passive).
//!
//! ## Quick Start
//!
//! ```no_run
//! use adcomm::{AdComm, CommTape, LocalComm, OpRegistry};
//!
//! fn main() -> Result<(), adcomm::Error> {
//!     let comm = AdComm::new(LocalComm::ring(1).remove(0));
//!     let mut tape = CommTape::new();
//!     let ops = OpRegistry::default();
//!     tape.start_recording();
//!
//!     let send = [tape.register_input(2.0)];
//!     let mut recv = [adcomm::ActiveReal::new(0.0)];
//!     comm.allreduce(&mut tape, &send, &mut recv, &ops.sum())?;
//!
//!     tape.stop_recording();
//!     tape.set_adjoint(recv[0].index(), 0, 1.0);
//!     tape.evaluate_reverse()?;
//!     println!("d(result)/d(input) = {}", tape.adjoint(send[0].index(), 0));
//!     Ok(())
//! }
//! ```
//!
//! ## Capabilities
//!
//! - **Point-to-point**: send/recv with wildcard sources and tags, probe
//! - **Collectives**: bcast, gather(v), scatter(v), allgather, reduce,
//!   allreduce
//! - **Nonblocking**: isend, irecv, ibcast, iallreduce with [`AsyncRequest`]
//!   handles, readiness checks and cancellation
//! - **Replay sweeps**: primal re-evaluation, reverse (adjoint) propagation,
//!   and forward (tangent) propagation outside the reduction family
//! - **Vector mode**: any number of simultaneous derivative directions per
//!   tape

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod buffer;
mod collective;
mod comm;
mod datatype;
mod displacements;
mod error;
mod local;
mod op;
mod reduce;
mod request;
mod status;
mod substrate;
mod tape;

pub use buffer::{stats, AdjointBuffer, IndexBuffer, PrimalBuffer};
pub use comm::AdComm;
pub use datatype::{ActiveReal, CommDatatype};
pub use displacements::{
    compute_total_size, create_linear_displacements, create_linear_displacements_and_count,
    create_linear_index_counts, LinearDisplacements,
};
pub use error::{Error, Result};
pub use local::LocalComm;
pub use op::{AdOp, AdOperator, OpRegistry, PostAdjointFn, PreAdjointFn};
pub use request::AsyncRequest;
pub use status::Status;
pub use substrate::{Capabilities, CombineFn, RequestId, Substrate, ANY_SOURCE, ANY_TAG};
pub use tape::{ActionRef, CommTape, EntryKind, Index, ReplayAction};
