//! Differentiable reduction operators.
//!
//! A reduction that is a plain elementwise sum needs no value information to
//! propagate adjoints: the result's adjoint is handed back to every
//! contributor unchanged. Anything else (max, min, product, user operators)
//! must know which contribution survived, so an [`AdOperator`] wraps the
//! combine function together with optional pre-/post-adjoint hooks and a
//! `requires_primal` flag that makes the record path capture value buffers.
//!
//! Selective operators use a *modified* wire representation of
//! (value, contributor-rank) pairs, so every rank learns which rank won the
//! reduction. Tie policy for the builtin `max`/`min`: the lowest contributing
//! rank holding the winning value receives the full adjoint; every other
//! contributor receives zero.

use std::rc::Rc;
use std::sync::Arc;

use crate::substrate::CombineFn;

/// Hook run on the reduced result's adjoints before they are handed back to
/// the contributors. `primals` is the reduced result in modified wire layout.
pub type PreAdjointFn = fn(adjoints: &mut [f64], primals: &[f64], count: usize, vector_width: usize);

/// Hook run on each contributor after it received the result's adjoints.
/// `primals` is the contributor's own captured contribution and
/// `root_primals` the reduced result, both in modified wire layout; the hook
/// zeroes (or rescales) the adjoint of elements this contributor did not
/// produce.
pub type PostAdjointFn = fn(
    adjoints: &mut [f64],
    primals: &[f64],
    root_primals: &[f64],
    count: usize,
    vector_width: usize,
);

/// Shared reference to a registered reduction operator.
pub type AdOp = Rc<AdOperator>;

/// A reduction operator wrapped for record/replay.
pub struct AdOperator {
    name: String,
    requires_primal: bool,
    wire_factor: usize,
    identity: f64,
    modified_identity: Vec<f64>,
    combine: CombineFn,
    combine_modified: CombineFn,
    pre_adjoint: Option<PreAdjointFn>,
    post_adjoint: Option<PostAdjointFn>,
}

impl std::fmt::Debug for AdOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdOperator")
            .field("name", &self.name)
            .field("requires_primal", &self.requires_primal)
            .field("wire_factor", &self.wire_factor)
            .finish()
    }
}

impl AdOperator {
    /// Wrap an additive-style operator: adjoints pass through the reverse
    /// un-reduction unchanged, no value buffers are captured.
    pub fn additive(
        name: impl Into<String>,
        identity: f64,
        combine: CombineFn,
    ) -> Self {
        AdOperator {
            name: name.into(),
            requires_primal: false,
            wire_factor: 1,
            identity,
            modified_identity: vec![identity],
            combine_modified: Arc::clone(&combine),
            combine,
            pre_adjoint: None,
            post_adjoint: None,
        }
    }

    /// Wrap a selective operator with value capture and adjoint hooks.
    ///
    /// `wire_factor` is the number of wire slots one logical element occupies
    /// in the modified representation; `modified_identity` must have exactly
    /// that length.
    #[allow(clippy::too_many_arguments)]
    pub fn with_hooks(
        name: impl Into<String>,
        identity: f64,
        modified_identity: Vec<f64>,
        combine: CombineFn,
        combine_modified: CombineFn,
        pre_adjoint: Option<PreAdjointFn>,
        post_adjoint: Option<PostAdjointFn>,
    ) -> Self {
        let wire_factor = modified_identity.len();
        AdOperator {
            name: name.into(),
            requires_primal: true,
            wire_factor,
            identity,
            modified_identity,
            combine,
            combine_modified,
            pre_adjoint,
            post_adjoint,
        }
    }

    /// Operator name, unique within one registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the reverse sweep needs captured primal values, not just
    /// adjoints, to decide which contributor's derivative survives.
    pub fn requires_primal(&self) -> bool {
        self.requires_primal
    }

    /// Wire slots per logical element in the modified representation.
    pub fn wire_factor(&self) -> usize {
        self.wire_factor
    }

    /// The operator's native identity element.
    pub fn identity(&self) -> f64 {
        self.identity
    }

    /// Identity pattern in modified wire layout, [`wire_factor`](Self::wire_factor) long.
    pub fn modified_identity(&self) -> &[f64] {
        &self.modified_identity
    }

    /// Combine function over plain wire values.
    pub fn combine(&self) -> &CombineFn {
        &self.combine
    }

    /// Combine function over the modified wire representation.
    pub fn combine_modified(&self) -> &CombineFn {
        &self.combine_modified
    }

    /// Pre-adjoint hook, if the operator has one.
    pub fn pre_adjoint(&self) -> Option<PreAdjointFn> {
        self.pre_adjoint
    }

    /// Post-adjoint hook, if the operator has one.
    pub fn post_adjoint(&self) -> Option<PostAdjointFn> {
        self.post_adjoint
    }

    /// Expand plain wire values into the modified representation for a
    /// contribution made by `rank`.
    pub fn to_modified(&self, values: &[f64], rank: i32) -> Vec<f64> {
        match self.wire_factor {
            1 => values.to_vec(),
            2 => {
                let mut out = Vec::with_capacity(values.len() * 2);
                for &v in values {
                    out.push(v);
                    out.push(rank as f64);
                }
                out
            }
            f => {
                let mut out = Vec::with_capacity(values.len() * f);
                for &v in values {
                    out.push(v);
                    out.extend_from_slice(&self.modified_identity[1..]);
                }
                out
            }
        }
    }

    /// Extract the plain values (first slot of each element) from a buffer in
    /// modified representation.
    pub fn values_from_modified(&self, modified: &[f64]) -> Vec<f64> {
        modified
            .chunks(self.wire_factor)
            .map(|chunk| chunk[0])
            .collect()
    }
}

/// The sum combine boxed as a [`CombineFn`], used internally to merge
/// adjoint contributions in the transposed collectives.
pub(crate) fn sum_op() -> CombineFn {
    Arc::new(sum_combine)
}

fn sum_combine(incoming: &[f64], acc: &mut [f64]) {
    for (a, x) in acc.iter_mut().zip(incoming) {
        *a += x;
    }
}

fn prod_combine(incoming: &[f64], acc: &mut [f64]) {
    for (a, x) in acc.iter_mut().zip(incoming) {
        *a *= x;
    }
}

fn max_combine(incoming: &[f64], acc: &mut [f64]) {
    for (a, x) in acc.iter_mut().zip(incoming) {
        if *x > *a {
            *a = *x;
        }
    }
}

fn min_combine(incoming: &[f64], acc: &mut [f64]) {
    for (a, x) in acc.iter_mut().zip(incoming) {
        if *x < *a {
            *a = *x;
        }
    }
}

/// Combine (value, rank) pairs, keeping the incoming pair when its value wins
/// or when it ties with a lower rank. Contributions arrive in rank order, so
/// the accumulator's pair always carries the lowest winning rank.
fn maxloc_combine(incoming: &[f64], acc: &mut [f64]) {
    for (a, x) in acc.chunks_mut(2).zip(incoming.chunks(2)) {
        if x[0] > a[0] || (x[0] == a[0] && x[1] < a[1]) {
            a.copy_from_slice(x);
        }
    }
}

fn minloc_combine(incoming: &[f64], acc: &mut [f64]) {
    for (a, x) in acc.chunks_mut(2).zip(incoming.chunks(2)) {
        if x[0] < a[0] || (x[0] == a[0] && x[1] < a[1]) {
            a.copy_from_slice(x);
        }
    }
}

/// Zero the adjoint of every element this contributor did not produce.
fn select_post(
    adjoints: &mut [f64],
    primals: &[f64],
    root_primals: &[f64],
    count: usize,
    vector_width: usize,
) {
    for e in 0..count {
        let own = &primals[2 * e..2 * e + 2];
        let reduced = &root_primals[2 * e..2 * e + 2];
        if own[0] != reduced[0] || own[1] != reduced[1] {
            for slot in &mut adjoints[e * vector_width..(e + 1) * vector_width] {
                *slot = 0.0;
            }
        }
    }
}

/// Rescale each contributor's adjoint by the product of the other
/// contributions, `result / own`. A zero contribution gets a zero adjoint.
fn prod_post(
    adjoints: &mut [f64],
    primals: &[f64],
    root_primals: &[f64],
    count: usize,
    vector_width: usize,
) {
    for e in 0..count {
        let own = primals[e];
        let scale = if own != 0.0 { root_primals[e] / own } else { 0.0 };
        for slot in &mut adjoints[e * vector_width..(e + 1) * vector_width] {
            *slot *= scale;
        }
    }
}

/// Explicit process-wide registry of reduction operators.
///
/// Construct once at program start with [`OpRegistry::default`] (or
/// [`OpRegistry::with_builtins`]) and pass it by reference; teardown is a
/// plain drop. The builtin operators are `sum`, `prod`, `max` and `min`.
pub struct OpRegistry {
    builtins: Vec<AdOp>,
    custom: Vec<AdOp>,
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl OpRegistry {
    /// Registry holding the builtin operators.
    pub fn with_builtins() -> Self {
        let builtins = vec![
            Rc::new(AdOperator::additive("sum", 0.0, Arc::new(sum_combine))),
            Rc::new(AdOperator::with_hooks(
                "prod",
                1.0,
                vec![1.0],
                Arc::new(prod_combine),
                Arc::new(prod_combine),
                None,
                Some(prod_post),
            )),
            Rc::new(AdOperator::with_hooks(
                "max",
                f64::NEG_INFINITY,
                vec![f64::NEG_INFINITY, f64::INFINITY],
                Arc::new(max_combine),
                Arc::new(maxloc_combine),
                None,
                Some(select_post),
            )),
            Rc::new(AdOperator::with_hooks(
                "min",
                f64::INFINITY,
                vec![f64::INFINITY, f64::INFINITY],
                Arc::new(min_combine),
                Arc::new(minloc_combine),
                None,
                Some(select_post),
            )),
        ];
        OpRegistry {
            builtins,
            custom: Vec::new(),
        }
    }

    /// Register a user operator and return the shared reference used in
    /// reduction calls.
    pub fn register(&mut self, op: AdOperator) -> AdOp {
        let op = Rc::new(op);
        self.custom.push(Rc::clone(&op));
        op
    }

    /// Look up an operator by name.
    pub fn get(&self, name: &str) -> Option<AdOp> {
        self.builtins
            .iter()
            .chain(self.custom.iter())
            .find(|op| op.name() == name)
            .map(Rc::clone)
    }

    /// The builtin sum operator.
    pub fn sum(&self) -> AdOp {
        Rc::clone(&self.builtins[0])
    }

    /// The builtin product operator.
    pub fn prod(&self) -> AdOp {
        Rc::clone(&self.builtins[1])
    }

    /// The builtin max operator (lowest-rank tie policy).
    pub fn max(&self) -> AdOp {
        Rc::clone(&self.builtins[2])
    }

    /// The builtin min operator (lowest-rank tie policy).
    pub fn min(&self) -> AdOp {
        Rc::clone(&self.builtins[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_is_additive_and_needs_no_primals() {
        let reg = OpRegistry::with_builtins();
        let sum = reg.sum();
        assert!(!sum.requires_primal());
        assert_eq!(sum.wire_factor(), 1);
        let mut acc = vec![0.0, 0.0];
        (sum.combine())(&[1.0, 2.0], &mut acc);
        (sum.combine())(&[3.0, 4.0], &mut acc);
        assert_eq!(acc, vec![4.0, 6.0]);
    }

    #[test]
    fn maxloc_keeps_lowest_rank_on_tie() {
        let reg = OpRegistry::with_builtins();
        let max = reg.max();
        let mut acc = max.modified_identity().to_vec();
        (max.combine_modified())(&max.to_modified(&[7.0], 1), &mut acc);
        (max.combine_modified())(&max.to_modified(&[7.0], 2), &mut acc);
        assert_eq!(acc, vec![7.0, 1.0]);
        (max.combine_modified())(&max.to_modified(&[9.0], 2), &mut acc);
        assert_eq!(acc, vec![9.0, 2.0]);
    }

    #[test]
    fn select_post_zeroes_losers_per_direction() {
        let own = [3.0, 0.0, 8.0, 0.0];
        let reduced = [7.0, 1.0, 8.0, 0.0];
        let mut adj = vec![1.0, 2.0, 3.0, 4.0]; // two elements, width 2
        select_post(&mut adj, &own, &reduced, 2, 2);
        assert_eq!(adj, vec![0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn prod_post_scales_by_remaining_product() {
        let own = [2.0, 0.0];
        let reduced = [24.0, 0.0];
        let mut adj = vec![1.0, 1.0];
        prod_post(&mut adj, &own, &reduced, 2, 1);
        assert_eq!(adj, vec![12.0, 0.0]);
    }

    #[test]
    fn registry_finds_custom_operators() {
        let mut reg = OpRegistry::with_builtins();
        let op = reg.register(AdOperator::additive(
            "xor-ish",
            0.0,
            Arc::new(|incoming: &[f64], acc: &mut [f64]| {
                for (a, x) in acc.iter_mut().zip(incoming) {
                    *a = (*a as i64 ^ *x as i64) as f64;
                }
            }),
        ));
        assert_eq!(reg.get("xor-ish").map(|o| o.name().to_string()),
                   Some(op.name().to_string()));
        assert!(reg.get("nope").is_none());
    }
}
