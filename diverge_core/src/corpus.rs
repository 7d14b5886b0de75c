use crate::input::{hex_digest, sha1_digest, Unit, UnitHash};
use rand_core::RngCore;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An operation could not be performed because the corpus holds no
    /// active units (e.g., selecting a unit to mutate).
    #[error("Corpus is empty, cannot select a unit")]
    Empty,

    /// The requested entry index does not exist.
    #[error("Entry index {0} not found in corpus")]
    EntryNotFound(usize),
}

/// One admitted input together with the engine's per-unit bookkeeping.
#[derive(Debug)]
pub struct CorpusEntry {
    pub unit: Unit,
    /// The distinct features this entry was admitted for, ascending.
    pub unique_features: Vec<u64>,
    /// How many features currently credit this entry. Decremented when a
    /// smaller unit takes over a feature; at zero the entry may be
    /// retired.
    pub num_features: usize,
    pub num_executed_mutations: usize,
    pub num_successful_mutations: usize,
    pub may_delete_file: bool,
    deleted: bool,
}

impl CorpusEntry {
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

#[derive(Debug)]
struct FeatureInfo {
    smallest_size: usize,
    /// Entry currently credited with the smallest unit for this feature.
    owner: Option<usize>,
}

/// The ordered collection of interesting inputs, indexed by feature.
///
/// Admission is feature-driven: `add_feature` is fed every feature of an
/// execution and reports (via the update counter) whether anything new or
/// smaller was seen; the runner then admits the unit with
/// `add_to_corpus`. Selection for mutation weights entries by how many
/// features they still own, favoring later entries.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
    hashes: HashSet<UnitHash>,
    features: HashMap<u64, FeatureInfo>,
    num_feature_updates: usize,
    num_active: usize,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a unit. `num_new_features` is the feature-update tally the
    /// execution produced; `unique_features` the distinct features
    /// collected for it (empty when input reduction is off).
    pub fn add_to_corpus(
        &mut self,
        unit: Unit,
        num_new_features: usize,
        may_delete_file: bool,
        unique_features: Vec<u64>,
    ) -> usize {
        let index = self.entries.len();
        self.hashes.insert(*unit.hash());
        for feature in &unique_features {
            if let Some(info) = self.features.get_mut(feature) {
                if info.owner.is_none() {
                    info.owner = Some(index);
                }
            }
        }
        tracing::debug!(
            "corpus: added {} ({} bytes, {} new features)",
            unit.hex_id(),
            unit.len(),
            num_new_features
        );
        self.entries.push(CorpusEntry {
            unit,
            unique_features,
            num_features: num_new_features,
            num_executed_mutations: 0,
            num_successful_mutations: 0,
            may_delete_file,
            deleted: false,
        });
        self.num_active += 1;
        index
    }

    /// Records that `feature` was observed on a unit of `new_size` bytes.
    /// Returns true (and bumps the update counter) when the feature is new,
    /// or when shrinking is on and a strictly smaller witness appeared.
    pub fn add_feature(&mut self, feature: u64, new_size: usize, shrink: bool) -> bool {
        let displaced_owner = match self.features.get_mut(&feature) {
            None => {
                self.features.insert(
                    feature,
                    FeatureInfo {
                        smallest_size: new_size,
                        owner: None,
                    },
                );
                None
            }
            Some(info) => {
                if shrink && new_size < info.smallest_size {
                    info.smallest_size = new_size;
                    info.owner.take()
                } else {
                    return false;
                }
            }
        };
        if let Some(owner) = displaced_owner {
            self.deduct_feature(owner);
        }
        self.num_feature_updates += 1;
        true
    }

    fn deduct_feature(&mut self, owner: usize) {
        let entry = &mut self.entries[owner];
        entry.num_features = entry.num_features.saturating_sub(1);
        if entry.num_features == 0 && entry.may_delete_file && !entry.deleted {
            entry.deleted = true;
            entry.unit = Unit::new(Vec::new());
            self.num_active = self.num_active.saturating_sub(1);
            tracing::debug!("corpus: retired starved entry {owner}");
        }
    }

    /// Monotonic counter of `add_feature` updates; the runner diffs it
    /// around an execution to learn whether anything new was reported.
    pub fn num_feature_updates(&self) -> usize {
        self.num_feature_updates
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Picks the next base unit for mutation: weighted random over active
    /// entries, weight `num_features * (index + 1)` so feature-rich and
    /// recent entries are favored. Falls back to uniform when no entry
    /// owns features.
    pub fn choose_unit_to_mutate(&self, rng: &mut dyn RngCore) -> Result<usize, CorpusError> {
        if self.num_active == 0 {
            return Err(CorpusError::Empty);
        }
        let weights: Vec<(usize, u64)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .map(|(i, e)| (i, (e.num_features as u64) * (i as u64 + 1)))
            .collect();
        let total: u64 = weights.iter().map(|(_, w)| w).sum();
        if total == 0 {
            let pick = rng.next_u64() as usize % weights.len();
            return Ok(weights[pick].0);
        }
        let mut point = rng.next_u64() % total;
        for (index, weight) in &weights {
            if point < *weight {
                return Ok(*index);
            }
            point -= weight;
        }
        Ok(weights[weights.len() - 1].0)
    }

    /// Replaces `index`'s unit with a strictly smaller byte sequence that
    /// reproduces exactly the same unique feature set.
    pub fn try_to_replace(&mut self, index: usize, bytes: &[u8], features: &[u64]) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        if entry.deleted || bytes.len() >= entry.unit.len() {
            return false;
        }
        if entry.unique_features != features {
            return false;
        }
        let replacement = Unit::new(bytes.to_vec());
        tracing::debug!(
            "corpus: reduced entry {} from {} to {} bytes",
            index,
            entry.unit.len(),
            replacement.len()
        );
        self.hashes.insert(*replacement.hash());
        entry.unit = replacement;
        true
    }

    /// True if a byte-identical unit was ever admitted.
    pub fn has_unit(&self, bytes: &[u8]) -> bool {
        self.hashes.contains(&sha1_digest(bytes))
    }

    /// True if some admitted unit renders to this hex hash
    /// (the `exit-on-item` probe).
    pub fn has_unit_with_hex_id(&self, hex: &str) -> bool {
        self.hashes.iter().any(|h| hex_digest(h) == hex)
    }

    pub fn entry(&self, index: usize) -> Result<&CorpusEntry, CorpusError> {
        self.entries
            .get(index)
            .ok_or(CorpusError::EntryNotFound(index))
    }

    pub fn entry_mut(&mut self, index: usize) -> Result<&mut CorpusEntry, CorpusError> {
        self.entries
            .get_mut(index)
            .ok_or(CorpusError::EntryNotFound(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_active_units(&self) -> usize {
        self.num_active
    }

    pub fn size_in_bytes(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.unit.len())
            .sum()
    }

    /// Largest active unit, the base for experimental length control.
    pub fn max_input_size(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.unit.len())
            .max()
            .unwrap_or(0)
    }

    pub fn print_stats(&self) {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.deleted {
                continue;
            }
            tracing::info!(
                "corpus[{index}]: sz {} ft {} exec_mut {} succ_mut {} id {}",
                entry.unit.len(),
                entry.num_features,
                entry.num_executed_mutations,
                entry.num_successful_mutations,
                entry.unit.hex_id()
            );
        }
    }
}
