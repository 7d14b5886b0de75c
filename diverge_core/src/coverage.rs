use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

/// Value-profile features live in an id space disjoint from edge features,
/// which use the global PC index directly.
pub const VALUE_FEATURE_BASE: u64 = 1 << 32;

/// The PC topology of all registered targets: two parallel arrays, a flat
/// PC value table and a per-target length table. Target `j`'s PCs span
/// `pcs[offset(j) .. offset(j) + module_len[j]]` where `offset(j)` is the
/// sum of the lengths before `j`.
#[derive(Debug, Default)]
pub struct PcTable {
    pcs: Vec<u64>,
    module_len: Vec<usize>,
    module_name: Vec<String>,
}

impl PcTable {
    pub fn num_modules(&self) -> usize {
        self.module_len.len()
    }

    pub fn num_pcs(&self) -> usize {
        self.pcs.len()
    }

    pub fn pc(&self, index: usize) -> u64 {
        self.pcs[index]
    }

    /// Number of PCs contributed by target `module`.
    pub fn module_num(&self, module: usize) -> usize {
        self.module_len[module]
    }

    /// Byte-free offset arithmetic: start of target `module`'s slice in
    /// the flat table.
    pub fn module_offset(&self, module: usize) -> usize {
        self.module_len[..module].iter().sum()
    }

    pub fn pc_slice(&self, module: usize) -> &[u64] {
        let start = self.module_offset(module);
        &self.pcs[start..start + self.module_len[module]]
    }

    /// Human-readable location of a PC, `"<module>+<offset>"`. Used by the
    /// source-position exit probe and new-PC reporting.
    pub fn describe_pc(&self, index: usize) -> String {
        let mut start = 0;
        for (module, &len) in self.module_len.iter().enumerate() {
            if index < start + len {
                return format!("{}+{}", self.module_name[module], index - start);
            }
            start += len;
        }
        format!("?+{index}")
    }
}

/// Read model over one execution's instrumentation, plus the
/// process-lifetime coverage bitmap. Targets write through a [`Probe`];
/// the engine only reads.
#[derive(Debug, Default)]
pub struct InstrumentationView {
    table: PcTable,
    covered: Vec<bool>,
    total_covered: usize,
    features: BTreeSet<u64>,
    collected: bool,
    frozen: bool,
    new_pcs: Vec<usize>,
    /// Per-target return code for the current input, written by the runner.
    pub output_diff_vec: Vec<i32>,
}

impl InstrumentationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target's PC list. Only legal before the first feature
    /// collection; after that the table length is stable for the process.
    pub fn register_module(&mut self, name: &str, pcs: &[u64]) -> usize {
        debug_assert!(!self.frozen, "PC table registration after first use");
        let module = self.table.module_len.len();
        self.table.pcs.extend_from_slice(pcs);
        self.table.module_len.push(pcs.len());
        self.table.module_name.push(name.to_string());
        self.covered.resize(self.table.pcs.len(), false);
        self.output_diff_vec.push(0);
        module
    }

    pub fn table(&self) -> &PcTable {
        &self.table
    }

    /// Clears the feature accumulator and the output slot of the target
    /// about to run. Called by the envelope before every callback.
    pub fn reset_maps(&mut self, target: usize) {
        self.features.clear();
        self.collected = false;
        self.output_diff_vec[target] = 0;
    }

    /// Clears the whole output vector at the start of a differential round.
    pub fn reset_round(&mut self) {
        for slot in &mut self.output_diff_vec {
            *slot = 0;
        }
    }

    /// Yields each distinct feature of the most recent callback exactly
    /// once, in ascending id order. Calling this twice for the same
    /// execution is a programming error.
    pub fn collect_features(&mut self, mut visitor: impl FnMut(u64)) {
        debug_assert!(!self.collected, "collect_features called twice per execution");
        self.collected = true;
        self.frozen = true;
        for &feature in &self.features {
            visitor(feature);
        }
    }

    /// Count of PCs ever marked covered. Nondecreasing for the process.
    pub fn total_pc_coverage(&self) -> usize {
        self.total_covered
    }

    pub fn is_covered(&self, index: usize) -> bool {
        self.covered[index]
    }

    /// Drains the global indices covered for the first time since the
    /// previous drain.
    pub fn take_new_pcs(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.new_pcs)
    }

    /// The write half handed to target `module` for one callback.
    pub fn probe(&mut self, module: usize) -> Probe<'_> {
        let offset = self.table.module_offset(module);
        let len = self.table.module_len[module];
        Probe {
            view: self,
            offset,
            len,
        }
    }

    pub fn print_coverage(&self) {
        for (index, &hit) in self.covered.iter().enumerate() {
            if hit {
                tracing::info!(
                    "COVERED: 0x{:x} {}",
                    self.table.pc(index),
                    self.table.describe_pc(index)
                );
            }
        }
    }

    /// Writes every covered PC value as little-endian u64.
    pub fn dump_coverage(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        for (index, &hit) in self.covered.iter().enumerate() {
            if hit {
                file.write_all(&self.table.pc(index).to_le_bytes())?;
            }
        }
        Ok(())
    }
}

/// Per-callback recording surface for one target. `hit` marks edge
/// coverage; `feature` emits a value-profile event.
pub struct Probe<'a> {
    view: &'a mut InstrumentationView,
    offset: usize,
    len: usize,
}

impl Probe<'_> {
    pub fn hit(&mut self, local_index: usize) {
        debug_assert!(local_index < self.len, "PC index outside target's module");
        let global = self.offset + local_index;
        if !self.view.covered[global] {
            self.view.covered[global] = true;
            self.view.total_covered += 1;
            self.view.new_pcs.push(global);
        }
        self.view.features.insert(global as u64);
    }

    pub fn feature(&mut self, id: u64) {
        self.view.features.insert(VALUE_FEATURE_BASE + id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_module_view() -> InstrumentationView {
        let mut view = InstrumentationView::new();
        view.register_module("alpha", &[0x1000, 0x1004, 0x1008]);
        view.register_module("beta", &[0x2000, 0x2004]);
        view
    }

    #[test]
    fn topology_accessors() {
        let view = two_module_view();
        assert_eq!(view.table().num_modules(), 2);
        assert_eq!(view.table().num_pcs(), 5);
        assert_eq!(view.table().module_num(0), 3);
        assert_eq!(view.table().module_num(1), 2);
        assert_eq!(view.table().module_offset(1), 3);
        assert_eq!(view.table().pc_slice(1), &[0x2000, 0x2004]);
        assert_eq!(view.table().describe_pc(4), "beta+1");
        assert_eq!(view.output_diff_vec.len(), 2);
    }

    #[test]
    fn coverage_is_monotonic_and_deduplicated() {
        let mut view = two_module_view();
        view.reset_maps(0);
        {
            let mut probe = view.probe(0);
            probe.hit(1);
            probe.hit(1);
            probe.hit(2);
        }
        assert_eq!(view.total_pc_coverage(), 2);

        view.reset_maps(1);
        {
            let mut probe = view.probe(1);
            probe.hit(0);
        }
        // earlier coverage survives later resets
        assert_eq!(view.total_pc_coverage(), 3);
        assert_eq!(view.take_new_pcs(), vec![1, 2, 3]);
        assert!(view.take_new_pcs().is_empty());
    }

    #[test]
    fn features_are_distinct_and_ordered() {
        let mut view = two_module_view();
        view.reset_maps(1);
        {
            let mut probe = view.probe(1);
            probe.hit(1);
            probe.hit(0);
            probe.feature(7);
            probe.feature(7);
        }
        let mut seen = Vec::new();
        view.collect_features(|f| seen.push(f));
        assert_eq!(seen, vec![3, 4, VALUE_FEATURE_BASE + 7]);

        view.reset_maps(1);
        let mut seen = Vec::new();
        view.collect_features(|f| seen.push(f));
        assert!(seen.is_empty());
    }

    #[test]
    fn reset_round_clears_every_output_slot() {
        let mut view = two_module_view();
        view.output_diff_vec[0] = 3;
        view.output_diff_vec[1] = -1;
        view.reset_round();
        assert_eq!(view.output_diff_vec, vec![0, 0]);
    }

    #[test]
    fn dump_coverage_writes_le_words() {
        let mut view = two_module_view();
        view.reset_maps(0);
        view.probe(0).hit(0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.dump");
        view.dump_coverage(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, 0x1000u64.to_le_bytes().to_vec());
    }
}
