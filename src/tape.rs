//! The communication tape: recording and the three replay sweeps.
//!
//! [`CommTape`] is the differentiation record the wrappers register their
//! handles with. It owns the per-identifier primal, tangent and adjoint
//! stores (tangent and adjoint scaled by the vector width, the number of
//! simultaneous derivative directions) and the append-only entry list.
//!
//! Nonblocking operations appear on the tape twice: an *op* entry pushed when
//! the call is issued and a *wait* entry pushed when it completes, sharing one
//! handle. Keeping the two points separate is what lets a reverse sweep start
//! the transposed communication at the completion point and block on it at
//! the issue point, mirroring the nonblocking structure of the recorded
//! program instead of serializing the whole sweep behind every round trip.
//!
//! The tape is single-threaded by design (one tape per rank); entries are
//! `Rc<RefCell<_>>` so an op entry and its wait entry can share a handle.

use std::cell::RefCell;
use std::rc::Rc;

use crate::datatype::ActiveReal;
use crate::error::Result;

/// Identifier of one value in the tape's stores.
///
/// Slot 0 is the passive sentinel: reads yield zero, writes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index(u32);

impl Index {
    /// The passive sentinel index.
    pub const PASSIVE: Index = Index(0);

    /// True for the passive sentinel.
    pub fn is_passive(self) -> bool {
        self.0 == 0
    }

    /// Raw slot number.
    pub fn raw(self) -> u32 {
        self.0
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

/// Replay callbacks of one recorded communication call.
///
/// Blocking operations implement the first three methods and do the whole
/// transposed exchange inside them. Asynchronous operations split each sweep
/// across the op entry (`primal`/`forward`/`reverse`) and the wait entry
/// (`*_wait`): in a forward-direction sweep the op entry starts the exchange
/// and the wait entry completes it, while in the reverse sweep the wait entry
/// (visited first) starts the transposed exchange and the op entry blocks on
/// the nested reverse request.
pub trait ReplayAction {
    /// Re-execute the wire call from buffered primal values and update the
    /// primal store.
    fn primal(&mut self, tape: &mut CommTape) -> Result<()>;

    /// Propagate tangent values through the same call shape.
    fn forward(&mut self, tape: &mut CommTape) -> Result<()>;

    /// Propagate adjoint values through the transposed call shape,
    /// accumulating into the origin side.
    fn reverse(&mut self, tape: &mut CommTape) -> Result<()>;

    /// Completion half of [`primal`](Self::primal) for asynchronous handles.
    fn primal_wait(&mut self, _tape: &mut CommTape) -> Result<()> {
        Ok(())
    }

    /// Completion half of [`forward`](Self::forward) for asynchronous handles.
    fn forward_wait(&mut self, _tape: &mut CommTape) -> Result<()> {
        Ok(())
    }

    /// Start of the transposed exchange for asynchronous handles.
    fn reverse_wait(&mut self, _tape: &mut CommTape) -> Result<()> {
        Ok(())
    }
}

/// Shared handle reference stored in tape entries.
pub type ActionRef = Rc<RefCell<dyn ReplayAction>>;

#[derive(Clone)]
enum TapeEntry {
    Op(ActionRef),
    Wait(ActionRef),
}

/// Kind of one tape entry, for introspection in tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A communication call (issue point for nonblocking calls).
    Op,
    /// The completion point of a nonblocking call.
    Wait,
}

/// The per-rank differentiation record.
pub struct CommTape {
    recording: bool,
    vector_width: usize,
    old_primals_required: bool,
    /// Primal store; slot 0 is the passive sentinel.
    primals: Vec<f64>,
    /// Tangent store, `vector_width` slots per index.
    tangents: Vec<f64>,
    /// Adjoint store, `vector_width` slots per index.
    adjoints: Vec<f64>,
    entries: Vec<TapeEntry>,
}

impl CommTape {
    /// Empty tape tracking one derivative direction. Recording starts off.
    pub fn new() -> Self {
        Self::with_vector_width(1)
    }

    /// Empty tape tracking `vector_width` simultaneous derivative directions.
    pub fn with_vector_width(vector_width: usize) -> Self {
        let vector_width = vector_width.max(1);
        CommTape {
            recording: false,
            vector_width,
            old_primals_required: false,
            primals: vec![0.0],
            tangents: vec![0.0; vector_width],
            adjoints: vec![0.0; vector_width],
            entries: Vec::new(),
        }
    }

    /// Number of simultaneous derivative directions.
    pub fn vector_width(&self) -> usize {
        self.vector_width
    }

    /// Begin recording communication calls.
    pub fn start_recording(&mut self) {
        self.recording = true;
    }

    /// Stop recording; subsequent calls pass through untracked.
    pub fn stop_recording(&mut self) {
        self.recording = false;
    }

    /// True while communication calls are being recorded.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Request capture of overwritten primal values so reverse sweeps restore
    /// the primal store, keeping repeated evaluations of one tape consistent.
    pub fn set_old_primals_required(&mut self, required: bool) {
        self.old_primals_required = required;
    }

    /// True when handles must capture old primal values.
    pub fn old_primals_required(&self) -> bool {
        self.old_primals_required
    }

    /// Register an independent differentiable input.
    pub fn register_input(&mut self, value: f64) -> ActiveReal {
        let index = self.register_value(value);
        ActiveReal::from_parts(value, index)
    }

    /// Register a value produced by a communication call (receive side) and
    /// return its fresh identifier.
    pub fn register_value(&mut self, value: f64) -> Index {
        let index = Index(self.primals.len() as u32);
        self.primals.push(value);
        self.tangents.extend(std::iter::repeat(0.0).take(self.vector_width));
        self.adjoints.extend(std::iter::repeat(0.0).take(self.vector_width));
        index
    }

    /// Number of registered values (excluding the passive sentinel).
    pub fn num_registered(&self) -> usize {
        self.primals.len() - 1
    }

    /// Primal value of `index`; zero for the passive sentinel.
    pub fn primal(&self, index: Index) -> f64 {
        self.primals[index.slot()]
    }

    /// Overwrite the primal value of `index`; ignored for the sentinel.
    pub fn set_primal(&mut self, index: Index, value: f64) {
        if !index.is_passive() {
            self.primals[index.slot()] = value;
        }
    }

    /// Tangent of `index` in derivative direction `dir`.
    pub fn tangent(&self, index: Index, dir: usize) -> f64 {
        self.tangents[index.slot() * self.vector_width + dir]
    }

    /// Seed or overwrite the tangent of `index` in direction `dir`.
    pub fn set_tangent(&mut self, index: Index, dir: usize, value: f64) {
        if !index.is_passive() {
            self.tangents[index.slot() * self.vector_width + dir] = value;
        }
    }

    /// Adjoint of `index` in derivative direction `dir`.
    pub fn adjoint(&self, index: Index, dir: usize) -> f64 {
        self.adjoints[index.slot() * self.vector_width + dir]
    }

    /// Seed or overwrite the adjoint of `index` in direction `dir`.
    pub fn set_adjoint(&mut self, index: Index, dir: usize, value: f64) {
        if !index.is_passive() {
            self.adjoints[index.slot() * self.vector_width + dir] = value;
        }
    }

    /// Accumulate into the adjoint of `index` in direction `dir`.
    pub fn update_adjoint(&mut self, index: Index, dir: usize, delta: f64) {
        if !index.is_passive() {
            self.adjoints[index.slot() * self.vector_width + dir] += delta;
        }
    }

    /// Zero the whole adjoint store (between reverse evaluations).
    pub fn clear_adjoints(&mut self) {
        self.adjoints.fill(0.0);
    }

    /// Zero the whole tangent store (between forward evaluations).
    pub fn clear_tangents(&mut self) {
        self.tangents.fill(0.0);
    }

    /// Append a communication handle at its issue point.
    pub fn push_op(&mut self, action: ActionRef) {
        self.entries.push(TapeEntry::Op(action));
    }

    /// Append the completion point of a nonblocking call.
    pub fn push_wait(&mut self, action: ActionRef) {
        self.entries.push(TapeEntry::Wait(action));
    }

    /// Kinds of the recorded entries, in record order.
    pub fn entry_kinds(&self) -> Vec<EntryKind> {
        self.entries
            .iter()
            .map(|e| match e {
                TapeEntry::Op(_) => EntryKind::Op,
                TapeEntry::Wait(_) => EntryKind::Wait,
            })
            .collect()
    }

    /// Discard all recorded entries, keeping the value stores.
    pub fn clear_entries(&mut self) {
        self.entries.clear();
    }

    /// Re-execute the recorded communication from the primal store.
    pub fn evaluate_primal(&mut self) -> Result<()> {
        self.sweep(false, |action, entry, tape| match entry {
            EntryKind::Op => action.primal(tape),
            EntryKind::Wait => action.primal_wait(tape),
        })
    }

    /// Propagate seeded tangents through the recorded communication.
    pub fn evaluate_forward(&mut self) -> Result<()> {
        self.sweep(false, |action, entry, tape| match entry {
            EntryKind::Op => action.forward(tape),
            EntryKind::Wait => action.forward_wait(tape),
        })
    }

    /// Propagate seeded adjoints through the transposed communication, in
    /// exact reverse of record order.
    pub fn evaluate_reverse(&mut self) -> Result<()> {
        self.sweep(true, |action, entry, tape| match entry {
            EntryKind::Op => action.reverse(tape),
            EntryKind::Wait => action.reverse_wait(tape),
        })
    }

    fn sweep(
        &mut self,
        reversed: bool,
        visit: impl Fn(&mut dyn ReplayAction, EntryKind, &mut CommTape) -> Result<()>,
    ) -> Result<()> {
        let was_recording = std::mem::replace(&mut self.recording, false);
        let entries = self.entries.clone();
        let order: Box<dyn Iterator<Item = &TapeEntry>> = if reversed {
            Box::new(entries.iter().rev())
        } else {
            Box::new(entries.iter())
        };
        let mut outcome = Ok(());
        for entry in order {
            let (action, kind) = match entry {
                TapeEntry::Op(a) => (a, EntryKind::Op),
                TapeEntry::Wait(a) => (a, EntryKind::Wait),
            };
            outcome = visit(&mut *action.borrow_mut(), kind, self);
            if outcome.is_err() {
                break;
            }
        }
        self.recording = was_recording;
        outcome
    }
}

impl Default for CommTape {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommTape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommTape")
            .field("recording", &self.recording)
            .field("vector_width", &self.vector_width)
            .field("num_registered", &self.num_registered())
            .field("num_entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_input_assigns_fresh_indices() {
        let mut tape = CommTape::new();
        let a = tape.register_input(1.5);
        let b = tape.register_input(2.5);
        assert_ne!(a.index(), b.index());
        assert_eq!(tape.primal(a.index()), 1.5);
        assert_eq!(tape.primal(b.index()), 2.5);
        assert_eq!(tape.num_registered(), 2);
    }

    #[test]
    fn passive_sentinel_reads_zero_and_ignores_writes() {
        let mut tape = CommTape::new();
        tape.set_primal(Index::PASSIVE, 9.0);
        tape.update_adjoint(Index::PASSIVE, 0, 9.0);
        assert_eq!(tape.primal(Index::PASSIVE), 0.0);
        assert_eq!(tape.adjoint(Index::PASSIVE, 0), 0.0);
    }

    #[test]
    fn adjoint_store_tracks_vector_width() {
        let mut tape = CommTape::with_vector_width(3);
        let x = tape.register_input(1.0);
        tape.set_adjoint(x.index(), 2, 4.0);
        tape.update_adjoint(x.index(), 2, 1.0);
        assert_eq!(tape.adjoint(x.index(), 0), 0.0);
        assert_eq!(tape.adjoint(x.index(), 2), 5.0);
    }

    struct CountingAction {
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl ReplayAction for CountingAction {
        fn primal(&mut self, _: &mut CommTape) -> Result<()> {
            self.log.borrow_mut().push("primal");
            Ok(())
        }
        fn forward(&mut self, _: &mut CommTape) -> Result<()> {
            self.log.borrow_mut().push("forward");
            Ok(())
        }
        fn reverse(&mut self, _: &mut CommTape) -> Result<()> {
            self.log.borrow_mut().push("reverse");
            Ok(())
        }
        fn reverse_wait(&mut self, _: &mut CommTape) -> Result<()> {
            self.log.borrow_mut().push("reverse_wait");
            Ok(())
        }
    }

    #[test]
    fn reverse_sweep_visits_wait_entries_before_their_op() {
        let mut tape = CommTape::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let action: ActionRef = Rc::new(RefCell::new(CountingAction {
            log: Rc::clone(&log),
        }));
        tape.push_op(Rc::clone(&action));
        tape.push_wait(action);
        tape.evaluate_reverse().unwrap();
        assert_eq!(*log.borrow(), vec!["reverse_wait", "reverse"]);
        assert_eq!(tape.entry_kinds(), vec![EntryKind::Op, EntryKind::Wait]);
    }

    #[test]
    fn recording_is_suspended_during_sweeps() {
        struct Check;
        impl ReplayAction for Check {
            fn primal(&mut self, tape: &mut CommTape) -> Result<()> {
                assert!(!tape.is_recording());
                Ok(())
            }
            fn forward(&mut self, _: &mut CommTape) -> Result<()> {
                Ok(())
            }
            fn reverse(&mut self, _: &mut CommTape) -> Result<()> {
                Ok(())
            }
        }
        let mut tape = CommTape::new();
        tape.start_recording();
        tape.push_op(Rc::new(RefCell::new(Check)));
        tape.evaluate_primal().unwrap();
        assert!(tape.is_recording());
    }
}
