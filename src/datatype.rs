//! Payload datatype trait and the active scalar type.
//!
//! This module provides the [`CommDatatype`] trait, a sealed trait describing
//! how payload elements map onto the `f64` wire representation and onto tape
//! identifiers, for use in generic communication operations.
//!
//! # Supported Types
//!
//! | Rust Type      | Tracked | Wire form     |
//! |----------------|---------|---------------|
//! | [`ActiveReal`] | yes     | primal value  |
//! | `f64`          | no      | value         |
//! | `f32`          | no      | value as f64  |
//! | `i32`          | no      | value as f64  |

use crate::tape::Index;

/// Internal module to seal the trait — prevents external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Trait for element types that can travel through the wrapped communication
/// operations.
///
/// This is a **sealed trait** — it cannot be implemented outside this crate.
/// Active types carry a tape [`Index`] next to their value; passive types
/// report the sentinel index and are forwarded without any recording.
pub trait CommDatatype: sealed::Sealed + Copy + Send + 'static {
    /// Whether elements of this type are tracked on the tape.
    const ACTIVE: bool;

    /// Value of this element on the `f64` wire.
    fn to_wire(&self) -> f64;

    /// Overwrite this element's value from a received wire value.
    fn from_wire(&mut self, value: f64);

    /// Tape identifier of this element ([`Index::PASSIVE`] for passive types).
    fn index(&self) -> Index;

    /// Attach a tape identifier to this element (no-op for passive types).
    fn set_index(&mut self, index: Index);

    /// Number of tracked elements in a payload of `count` elements.
    fn active_elements(count: usize) -> usize {
        if Self::ACTIVE {
            count
        } else {
            0
        }
    }
}

/// A differentiable scalar: an `f64` value paired with its tape identifier.
///
/// Freshly constructed values are passive;
/// [`register_input`](crate::CommTape::register_input) produces tracked ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveReal {
    value: f64,
    index: Index,
}

impl ActiveReal {
    /// Passive value, not yet registered on any tape.
    pub fn new(value: f64) -> Self {
        ActiveReal {
            value,
            index: Index::PASSIVE,
        }
    }

    pub(crate) fn from_parts(value: f64, index: Index) -> Self {
        ActiveReal { value, index }
    }

    /// Current primal value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Tape identifier.
    pub fn index(&self) -> Index {
        self.index
    }
}

impl Default for ActiveReal {
    fn default() -> Self {
        ActiveReal::new(0.0)
    }
}

impl std::fmt::Display for ActiveReal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl sealed::Sealed for ActiveReal {}
impl CommDatatype for ActiveReal {
    const ACTIVE: bool = true;

    fn to_wire(&self) -> f64 {
        self.value
    }

    fn from_wire(&mut self, value: f64) {
        self.value = value;
    }

    fn index(&self) -> Index {
        self.index
    }

    fn set_index(&mut self, index: Index) {
        self.index = index;
    }
}

macro_rules! impl_passive_datatype {
    ($ty:ty) => {
        impl sealed::Sealed for $ty {}
        impl CommDatatype for $ty {
            const ACTIVE: bool = false;

            fn to_wire(&self) -> f64 {
                *self as f64
            }

            fn from_wire(&mut self, value: f64) {
                *self = value as $ty;
            }

            fn index(&self) -> Index {
                Index::PASSIVE
            }

            fn set_index(&mut self, _index: Index) {}
        }
    };
}

impl_passive_datatype!(f64);
impl_passive_datatype!(f32);
impl_passive_datatype!(i32);
