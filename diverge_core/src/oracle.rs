use crate::input::sha1_digest;
use std::collections::HashSet;

/// Decides whether an output vector constitutes a divergence.
///
/// Each target declares the return code of its canonical path (0 unless
/// configured otherwise); an input diverges when at least one target is on
/// its canonical path and at least one is off it. A vector that is all
/// canonical or all off-canonical is not a divergence.
#[derive(Debug, Clone)]
pub struct DivergenceOracle {
    canonical: Vec<i32>,
}

impl DivergenceOracle {
    pub fn new(canonical: Vec<i32>) -> Self {
        Self { canonical }
    }

    pub fn canonical(&self) -> &[i32] {
        &self.canonical
    }

    pub fn diverged(&self, outputs: &[i32]) -> bool {
        debug_assert_eq!(outputs.len(), self.canonical.len());
        let mut has_canonical = false;
        let mut has_off_canonical = false;
        for (&out, &base) in outputs.iter().zip(&self.canonical) {
            if out == base {
                has_canonical = true;
            } else {
                has_off_canonical = true;
            }
        }
        has_canonical && has_off_canonical
    }

    /// `"0_1"`-style rendering of an output vector for diff artifact names.
    pub fn dashed_outputs(outputs: &[i32]) -> String {
        outputs
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Tracks which per-target "reported a new corpus feature" patterns have
/// been seen; a fresh pattern counts as a valid case in the progress log.
#[derive(Debug, Default)]
pub struct FeaturePatternTracker {
    seen: HashSet<[u8; 20]>,
}

impl FeaturePatternTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new_pattern(&mut self, pattern: &[bool]) -> bool {
        let bytes: Vec<u8> = pattern.iter().map(|&b| b as u8).collect();
        self.seen.insert(sha1_digest(&bytes))
    }
}
