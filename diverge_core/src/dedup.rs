use crate::coverage::InstrumentationView;
use crate::input::{sha1_digest, UnitHash};
use std::collections::HashSet;

/// Verdict of the coverage deduplicator for one diverging execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Novelty {
    Novel,
    Duplicate,
}

/// Decides whether a differential execution is novel with respect to the
/// diffs archived so far.
///
/// The discriminator is a fingerprint over the PC slices of exactly those
/// targets whose return code strayed from their canonical value: each
/// slice is serialized as little-endian u64 words, the concatenation is
/// hashed, and the 20-byte digest is checked against a process-lifetime,
/// monotonically growing set.
#[derive(Debug, Default)]
pub struct DiffDeduper {
    seen: HashSet<UnitHash>,
}

impl DiffDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies the current execution. `outputs[j]` and `canonical[j]`
    /// are target j's observed and canonical return codes.
    pub fn classify(
        &mut self,
        outputs: &[i32],
        canonical: &[i32],
        view: &InstrumentationView,
    ) -> Novelty {
        debug_assert_eq!(outputs.len(), canonical.len());
        debug_assert_eq!(outputs.len(), view.table().num_modules());

        let fingerprint = sha1_digest(&coverage_fingerprint_bytes(outputs, canonical, view));
        if self.seen.insert(fingerprint) {
            Novelty::Novel
        } else {
            Novelty::Duplicate
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Serialization of the concatenated PC slices of the diverging targets.
fn coverage_fingerprint_bytes(
    outputs: &[i32],
    canonical: &[i32],
    view: &InstrumentationView,
) -> Vec<u8> {
    let mut coverage = Vec::new();
    for (j, (&out, &base)) in outputs.iter().zip(canonical).enumerate() {
        if out != base {
            for &pc in view.table().pc_slice(j) {
                coverage.extend_from_slice(&pc.to_le_bytes());
            }
        }
    }
    coverage
}

/// Rejects re-execution of byte-identical mutated bodies: the set holds
/// the hash of every buffer ever submitted for execution, pre-filter.
#[derive(Debug, Default)]
pub struct MutationDeduper {
    seen: HashSet<UnitHash>,
}

impl MutationDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `bytes` was never submitted before (and records
    /// it); `false` means a duplicate mutation.
    pub fn check_and_insert(&mut self, bytes: &[u8]) -> bool {
        self.seen.insert(sha1_digest(bytes))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::InstrumentationView;

    fn paired_view() -> InstrumentationView {
        let mut view = InstrumentationView::new();
        view.register_module("left", &[0xAAAA]);
        view.register_module("right", &[0xBBBB]);
        view
    }

    #[test]
    fn fingerprint_covers_only_diverging_targets() {
        let view = paired_view();
        let bytes = coverage_fingerprint_bytes(&[0, 1], &[0, 0], &view);
        assert_eq!(bytes, 0xBBBBu64.to_le_bytes().to_vec());

        let bytes = coverage_fingerprint_bytes(&[2, 0], &[0, 0], &view);
        assert_eq!(bytes, 0xAAAAu64.to_le_bytes().to_vec());
    }

    #[test]
    fn canonical_return_is_per_target() {
        let view = paired_view();
        // target 0 returns its own canonical 5: not diverging.
        let bytes = coverage_fingerprint_bytes(&[5, 1], &[5, 0], &view);
        assert_eq!(bytes, 0xBBBBu64.to_le_bytes().to_vec());
    }

    #[test]
    fn second_identical_execution_is_duplicate() {
        let view = paired_view();
        let mut dedup = DiffDeduper::new();
        assert_eq!(dedup.classify(&[0, 1], &[0, 0], &view), Novelty::Novel);
        assert_eq!(dedup.classify(&[0, 1], &[0, 0], &view), Novelty::Duplicate);
        assert_eq!(dedup.len(), 1);

        // a different diverging subset yields a different fingerprint
        assert_eq!(dedup.classify(&[1, 0], &[0, 0], &view), Novelty::Novel);
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn mutation_dedup_rejects_resubmitted_bytes() {
        let mut dedup = MutationDeduper::new();
        assert!(dedup.check_and_insert(b"abc"));
        assert!(!dedup.check_and_insert(b"abc"));
        assert!(dedup.check_and_insert(b"abd"));
        assert_eq!(dedup.len(), 2);
    }
}
