//! Least-loaded SFU selection.
//!
//! Picks the candidate with the smallest `current_load / capacity`. Ratios
//! are compared by cross-multiplication in `u64`, so equal ratios such as
//! 1/2 and 50/100 tie exactly, and ties go to the lexicographically smallest
//! `server_id`. Identical snapshots always produce the same selection.

use std::cmp::Ordering;

/// An instance eligible for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfuCandidate {
    pub server_id: String,
    pub current_load: u32,
    pub capacity: u32,
}

impl SfuCandidate {
    /// Load ratio as a float, for logging only.
    #[must_use]
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.capacity)
    }
}

/// Compare two candidates by load ratio, then by `server_id`.
fn by_load_then_id(a: &SfuCandidate, b: &SfuCandidate) -> Ordering {
    let lhs = u64::from(a.current_load) * u64::from(b.capacity);
    let rhs = u64::from(b.current_load) * u64::from(a.capacity);
    lhs.cmp(&rhs).then_with(|| a.server_id.cmp(&b.server_id))
}

/// Select the least-loaded candidate with spare capacity.
///
/// Returns `None` when no candidate has room.
#[must_use]
pub fn select_least_loaded(candidates: &[SfuCandidate]) -> Option<&SfuCandidate> {
    candidates
        .iter()
        .filter(|c| c.capacity > 0 && c.current_load < c.capacity)
        .min_by(|a, b| by_load_then_id(a, b))
}
