use diverge_core::executor::Target;
use diverge_core::{read_dir_to_units, CountingAlloc, FuzzOptions, Fuzzer, StackedMutator};

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// Arms malloc/free accounting and the single-allocation OOM check.
#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "diverge: coverage-guided differential fuzzing", long_about = None)]
struct Cli {
    /// Seed corpus directories.
    #[clap(value_parser)]
    corpus_dirs: Vec<PathBuf>,

    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// Override max-number-of-runs from the config.
    #[clap(long)]
    runs: Option<u64>,

    /// Override max-len from the config.
    #[clap(long)]
    max_len: Option<usize>,

    /// Run every built-in target per input and archive divergences.
    #[clap(long)]
    differential: bool,

    /// Override output-corpus from the config.
    #[clap(long)]
    output_corpus: Option<PathBuf>,

    /// Override artifact-prefix from the config.
    #[clap(long)]
    artifact_prefix: Option<String>,

    /// Mutation RNG seed.
    #[clap(long)]
    seed: Option<u64>,

    /// Log filter when RUST_LOG is unset.
    #[clap(long, default_value = "info")]
    log: String,
}

/// Reference varint decoder: rejects overlong encodings and values wider
/// than 64 bits. Returns 0 when the whole input is one valid varint.
fn strict_varint_harness() -> Target {
    let pcs: Vec<u64> = (0..8u64).map(|i| 0x4000 + i * 4).collect();
    Target::new(
        "varint-strict",
        pcs,
        Box::new(|probe, data| {
            probe.hit(0);
            let mut value: u64 = 0;
            let mut shift = 0u32;
            for (index, &byte) in data.iter().enumerate() {
                probe.hit(1);
                if shift >= 64 {
                    probe.hit(2);
                    return 1;
                }
                value |= u64::from(byte & 0x7f) << shift;
                if byte & 0x80 == 0 {
                    if index + 1 != data.len() {
                        probe.hit(3);
                        return 1;
                    }
                    // overlong: a trailing zero group that adds nothing
                    if byte == 0 && index > 0 {
                        probe.hit(4);
                        return 1;
                    }
                    probe.hit(5);
                    probe.feature(value % 251);
                    return 0;
                }
                shift += 7;
            }
            probe.hit(6);
            1
        }),
    )
}

/// Permissive varint decoder, the kind shipped in many protocol stacks:
/// accepts overlong encodings and silently truncates at 64 bits.
fn lenient_varint_harness() -> Target {
    let pcs: Vec<u64> = (0..6u64).map(|i| 0x8000 + i * 4).collect();
    Target::new(
        "varint-lenient",
        pcs,
        Box::new(|probe, data| {
            probe.hit(0);
            let mut value: u64 = 0;
            let mut shift = 0u32;
            for (index, &byte) in data.iter().enumerate() {
                probe.hit(1);
                if shift < 64 {
                    value |= u64::from(byte & 0x7f) << shift;
                }
                if byte & 0x80 == 0 {
                    if index + 1 != data.len() {
                        probe.hit(2);
                        return 1;
                    }
                    probe.hit(3);
                    probe.feature(value % 251);
                    return 0;
                }
                shift += 7;
            }
            probe.hit(4);
            1
        }),
    )
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let mut options = match &cli.config_file {
        Some(config_path) => {
            tracing::info!("Loading configuration from {config_path:?}");
            FuzzOptions::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("diverge.toml");
            if default_config_path.exists() {
                tracing::info!("Loading default configuration {default_config_path:?}");
                FuzzOptions::load_from_file(&default_config_path)?
            } else {
                FuzzOptions::default()
            }
        }
    };

    if let Some(runs) = cli.runs {
        options.max_number_of_runs = runs;
    }
    if let Some(max_len) = cli.max_len {
        options.max_len = max_len;
    }
    if cli.differential {
        options.differential_mode = true;
    }
    if let Some(output_corpus) = cli.output_corpus {
        options.output_corpus = Some(output_corpus);
    }
    if let Some(artifact_prefix) = cli.artifact_prefix {
        options.artifact_prefix = artifact_prefix;
    }
    if let Some(seed) = cli.seed {
        options.seed = seed;
    }

    let rng_seed = if options.seed != 0 {
        options.seed
    } else {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    };

    let targets = if options.differential_mode {
        vec![strict_varint_harness(), lenient_varint_harness()]
    } else {
        vec![strict_varint_harness()]
    };

    let max_len = if options.max_len == 0 {
        diverge_core::DEFAULT_MAX_LEN
    } else {
        options.max_len
    };
    let mut initial_corpus: Vec<Vec<u8>> = Vec::new();
    for dir in &cli.corpus_dirs {
        let (units, _) = read_dir_to_units(dir, max_len, None);
        tracing::info!("Loaded {} seed units from {}", units.len(), dir.display());
        initial_corpus.extend(units);
    }
    if initial_corpus.is_empty() {
        // minimal varint seeds so uninstrumented first runs still find work
        initial_corpus.push(vec![0x00]);
        initial_corpus.push(vec![0x7f]);
        initial_corpus.push(vec![0xac, 0x02]);
    }

    let mutator = Box::new(StackedMutator::new(rng_seed));
    let mut fuzzer = Fuzzer::new(options, targets, mutator);
    fuzzer.shuffle_and_minimize(initial_corpus);
    fuzzer.run_loop();

    Ok(())
}
