pub mod artifacts;
pub mod channel;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod dedup;
pub mod executor;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod stats;

pub use artifacts::{read_dir_to_units, ArtifactWriter};
pub use channel::{EquivalenceChannel, PairedChannel};
pub use config::{FuzzOptions, DEFAULT_MAX_LEN};
pub use corpus::{Corpus, CorpusEntry, CorpusError};
pub use coverage::{InstrumentationView, PcTable, Probe};
pub use dedup::{DiffDeduper, MutationDeduper, Novelty};
pub use executor::{
    loose_memeq, CountingAlloc, ExecutionEnvelope, ExecutionStatus, HarnessFn, Target,
};
pub use fuzzer::{compute_mutation_len, Fuzzer};
pub use input::{hex_digest, is_ascii, sha1_digest, Unit, UnitHash, UNIT_HASH_LEN};
pub use mutator::{MutationDispatcher, StackedMutator};
pub use oracle::{DivergenceOracle, FeaturePatternTracker};
pub use stats::{peak_rss_mb, FuzzStats, StatsContext};
