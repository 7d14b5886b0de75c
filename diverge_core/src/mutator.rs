use crate::corpus::Corpus;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

/// Ceiling on harvested dictionary entries.
const MAX_DICTIONARY_ENTRIES: usize = 100;
/// Attempts per `mutate` call before giving up on producing a change.
const MAX_MUTATE_ATTEMPTS: usize = 16;

/// The mutation engine as consumed by the fuzz loop: sequences of basic
/// operators applied to a base unit, with success feedback and a
/// recommended dictionary distilled from sequences that found coverage.
pub trait MutationDispatcher {
    /// Opens a fresh operator sequence for one corpus round.
    fn start_mutation_sequence(&mut self);

    /// Mutates `data` in place, possibly splicing from `corpus`. Returns
    /// the new size; never exceeds `max_size`.
    fn mutate(&mut self, data: &mut Vec<u8>, max_size: usize, corpus: Option<&Corpus>) -> usize;

    /// A single uniformly chosen basic operator, outside any sequence.
    fn default_mutate(&mut self, data: &mut Vec<u8>, max_size: usize) -> usize;

    /// Marks the current sequence as having produced new coverage.
    fn record_successful_mutation_sequence(&mut self);

    /// Renders the operators applied since `start_mutation_sequence`.
    fn mutation_sequence(&self) -> String;

    /// Byte strings worth keeping, harvested from successful sequences.
    fn recommended_dictionary(&self) -> Vec<Vec<u8>>;

    fn rng(&mut self) -> &mut ChaCha8Rng;
}

/// Byte-level mutator: erase, insert, flip, shuffle, copy, crossover.
pub struct StackedMutator {
    rng: ChaCha8Rng,
    current_sequence: Vec<&'static str>,
    /// Byte strings introduced by the current sequence, candidates for the
    /// dictionary if the sequence succeeds.
    candidate_words: Vec<Vec<u8>>,
    dictionary: Vec<Vec<u8>>,
}

impl StackedMutator {
    pub fn new(seed: u64) -> Self {
        let mut seed_bytes = [0u8; 32];
        seed_bytes[..8].copy_from_slice(&seed.to_le_bytes());
        Self {
            rng: ChaCha8Rng::from_seed(seed_bytes),
            current_sequence: Vec::new(),
            candidate_words: Vec::new(),
            dictionary: Vec::new(),
        }
    }

    fn erase_bytes(&mut self, data: &mut Vec<u8>) -> bool {
        if data.len() <= 1 {
            return false;
        }
        let span = self.rng.random_range(1..=(data.len() / 2).max(1));
        let start = self.rng.random_range(0..=data.len() - span);
        data.drain(start..start + span);
        true
    }

    fn insert_byte(&mut self, data: &mut Vec<u8>, max_size: usize) -> bool {
        if data.len() >= max_size {
            return false;
        }
        let position = self.rng.random_range(0..=data.len());
        let byte: u8 = self.rng.random();
        data.insert(position, byte);
        self.candidate_words.push(vec![byte]);
        true
    }

    fn change_byte(&mut self, data: &mut Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let index = self.rng.random_range(0..data.len());
        data[index] = self.rng.random();
        true
    }

    fn change_bit(&mut self, data: &mut Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let index = self.rng.random_range(0..data.len());
        let bit = self.rng.random_range(0..8);
        data[index] ^= 1 << bit;
        true
    }

    fn shuffle_bytes(&mut self, data: &mut Vec<u8>) -> bool {
        if data.len() < 2 {
            return false;
        }
        let span = self.rng.random_range(2..=data.len().min(8));
        let start = self.rng.random_range(0..=data.len() - span);
        // Fisher-Yates over the chosen window.
        for i in (1..span).rev() {
            let j = self.rng.random_range(0..=i);
            data.swap(start + i, start + j);
        }
        true
    }

    fn copy_part(&mut self, data: &mut Vec<u8>) -> bool {
        if data.len() < 2 {
            return false;
        }
        let span = self.rng.random_range(1..=data.len() / 2);
        let src = self.rng.random_range(0..=data.len() - span);
        let dst = self.rng.random_range(0..=data.len() - span);
        let part: Vec<u8> = data[src..src + span].to_vec();
        data[dst..dst + span].copy_from_slice(&part);
        if part.len() <= 8 {
            self.candidate_words.push(part);
        }
        true
    }

    fn cross_over(&mut self, data: &mut Vec<u8>, max_size: usize, corpus: &Corpus) -> bool {
        if corpus.num_active_units() == 0 {
            return false;
        }
        let Ok(index) = corpus.choose_unit_to_mutate(&mut self.rng) else {
            return false;
        };
        let Ok(entry) = corpus.entry(index) else {
            return false;
        };
        let other = entry.unit.as_bytes();
        if other.is_empty() {
            return false;
        }
        let keep = self.rng.random_range(0..=data.len());
        let take = self.rng.random_range(1..=other.len());
        data.truncate(keep);
        data.extend_from_slice(&other[other.len() - take..]);
        data.truncate(max_size);
        !data.is_empty()
    }

    fn apply_random_op(
        &mut self,
        data: &mut Vec<u8>,
        max_size: usize,
        corpus: Option<&Corpus>,
    ) -> Option<&'static str> {
        let num_ops = if corpus.is_some() { 7 } else { 6 };
        let op = self.rng.random_range(0..num_ops);
        let (applied, name) = match op {
            0 => (self.erase_bytes(data), "EraseBytes"),
            1 => (self.insert_byte(data, max_size), "InsertByte"),
            2 => (self.change_byte(data), "ChangeByte"),
            3 => (self.change_bit(data), "ChangeBit"),
            4 => (self.shuffle_bytes(data), "ShuffleBytes"),
            5 => (self.copy_part(data), "CopyPart"),
            _ => (
                self.cross_over(data, max_size, corpus.expect("op gated on corpus")),
                "CrossOver",
            ),
        };
        applied.then_some(name)
    }
}

impl MutationDispatcher for StackedMutator {
    fn start_mutation_sequence(&mut self) {
        self.current_sequence.clear();
        self.candidate_words.clear();
    }

    fn mutate(&mut self, data: &mut Vec<u8>, max_size: usize, corpus: Option<&Corpus>) -> usize {
        debug_assert!(max_size > 0, "mutation size ceiling must be positive");
        if data.is_empty() {
            data.push(0);
        }
        for _ in 0..MAX_MUTATE_ATTEMPTS {
            if let Some(name) = self.apply_random_op(data, max_size, corpus) {
                data.truncate(max_size);
                if data.is_empty() {
                    data.push(0);
                }
                self.current_sequence.push(name);
                return data.len();
            }
        }
        // Every operator refused (e.g. single byte at the size ceiling);
        // hand the unit back unchanged.
        data.truncate(max_size);
        data.len()
    }

    fn default_mutate(&mut self, data: &mut Vec<u8>, max_size: usize) -> usize {
        if data.is_empty() {
            data.push(0);
        }
        let _ = match self.rng.random_range(0..6) {
            0 => self.erase_bytes(data),
            1 => self.insert_byte(data, max_size),
            2 => self.change_byte(data),
            3 => self.change_bit(data),
            4 => self.shuffle_bytes(data),
            _ => self.copy_part(data),
        };
        data.truncate(max_size);
        if data.is_empty() {
            data.push(0);
        }
        data.len()
    }

    fn record_successful_mutation_sequence(&mut self) {
        for word in self.candidate_words.drain(..) {
            if self.dictionary.len() >= MAX_DICTIONARY_ENTRIES {
                break;
            }
            if !self.dictionary.contains(&word) {
                self.dictionary.push(word);
            }
        }
    }

    fn mutation_sequence(&self) -> String {
        self.current_sequence.join("-")
    }

    fn recommended_dictionary(&self) -> Vec<Vec<u8>> {
        self.dictionary.clone()
    }

    fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}
