//! Per-rank count/displacement helpers for variable-size collectives.
//!
//! Variable-count collectives take per-rank counts in wire elements; the
//! differentiation layer needs parallel layouts in tape elements, where each
//! logical element occupies `vector_width` derivative slots and passive
//! sub-elements of a structured payload consume no space. These helpers are
//! pure functions over small integer arrays.

use crate::datatype::CommDatatype;

/// An owned pair of per-rank count and displacement arrays.
///
/// Displacements are the prefix sums of the counts, so the layout is dense:
/// rank `r`'s slice is `[displs[r] .. displs[r] + counts[r])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearDisplacements {
    /// Elements contributed per rank.
    pub counts: Vec<i32>,
    /// Offset of each rank's slice in the flattened buffer.
    pub displs: Vec<i32>,
}

impl LinearDisplacements {
    /// Total number of elements across all ranks.
    pub fn total(&self) -> usize {
        compute_total_size(&self.counts)
    }
}

/// Sum of per-rank counts.
pub fn compute_total_size(counts: &[i32]) -> usize {
    counts.iter().map(|&c| c as usize).sum()
}

/// Dense prefix-sum displacements for the given counts:
/// `0, counts[0], counts[0] + counts[1], ...`.
pub fn create_linear_displacements(counts: &[i32]) -> LinearDisplacements {
    let mut displs = Vec::with_capacity(counts.len());
    let mut offset = 0i32;
    for &c in counts {
        displs.push(offset);
        offset += c;
    }
    LinearDisplacements {
        counts: counts.to_vec(),
        displs,
    }
}

/// Per-rank counts transformed to active tape elements for payload type `T`.
///
/// Passive payloads contribute nothing, so their counts collapse to zero.
pub fn create_linear_index_counts<T: CommDatatype>(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .map(|&c| T::active_elements(c as usize) as i32)
        .collect()
}

/// Active-element counts scaled by `factor` (the tape's vector width, or the
/// operator's wire factor), with matching dense displacements and the total.
pub fn create_linear_displacements_and_count<T: CommDatatype>(
    counts: &[i32],
    factor: usize,
) -> (LinearDisplacements, usize) {
    let scaled: Vec<i32> = create_linear_index_counts::<T>(counts)
        .into_iter()
        .map(|c| c * factor as i32)
        .collect();
    let lin = create_linear_displacements(&scaled);
    let total = lin.total();
    (lin, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::ActiveReal;

    #[test]
    fn total_size_sums_counts() {
        assert_eq!(compute_total_size(&[2, 0, 5, 1]), 8);
        assert_eq!(compute_total_size(&[]), 0);
    }

    #[test]
    fn displacements_are_prefix_sums() {
        let lin = create_linear_displacements(&[3, 1, 4]);
        assert_eq!(lin.displs, vec![0, 3, 4]);
        assert_eq!(lin.counts, vec![3, 1, 4]);
        assert_eq!(lin.total(), 8);
    }

    #[test]
    fn index_counts_collapse_for_passive_payloads() {
        assert_eq!(create_linear_index_counts::<f64>(&[3, 1]), vec![0, 0]);
        assert_eq!(create_linear_index_counts::<ActiveReal>(&[3, 1]), vec![3, 1]);
    }

    #[test]
    fn scaled_displacements_track_vector_width() {
        let (lin, total) = create_linear_displacements_and_count::<ActiveReal>(&[2, 3], 4);
        assert_eq!(lin.counts, vec![8, 12]);
        assert_eq!(lin.displs, vec![0, 8]);
        assert_eq!(total, 20);
    }
}
