use serde::Deserialize;
use std::path::PathBuf;

/// Input length ceiling used when the configuration leaves `max-len` at 0.
pub const DEFAULT_MAX_LEN: usize = 4096;

fn default_runs() -> u64 {
    u64::MAX
}
fn default_unit_timeout_sec() -> u64 {
    300
}
fn default_rss_limit_mb() -> usize {
    2048
}
fn default_reload_interval_sec() -> u64 {
    1
}
fn default_mutate_depth() -> usize {
    5
}
fn default_report_slow_units() -> u64 {
    10
}
fn default_error_exitcode() -> i32 {
    77
}
fn default_timeout_exitcode() -> i32 {
    70
}
fn default_verbosity() -> u8 {
    1
}
fn default_true() -> bool {
    true
}
fn default_progress_log() -> Option<PathBuf> {
    Some(PathBuf::from("log"))
}

/// Everything that shapes a fuzzing run.
///
/// Loaded from a TOML file (kebab-case keys) and/or assembled by the CLI;
/// every field has a standalone default so partial files work.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzOptions {
    /// Caps both the unit size and the mutation size. 0 means "pick the
    /// built-in default at engine construction".
    #[serde(default)]
    pub max_len: usize,
    /// Stop after this many executions.
    #[serde(default = "default_runs")]
    pub max_number_of_runs: u64,
    /// Stop after this many wall-clock seconds. 0 disables the deadline.
    #[serde(default)]
    pub max_total_time_sec: u64,
    /// Wall-clock ceiling for a single callback; exceeding it terminates
    /// the process with `timeout-exitcode`.
    #[serde(default = "default_unit_timeout_sec")]
    pub unit_timeout_sec: u64,
    /// Peak-RSS ceiling in megabytes; exceeded means out-of-memory exit.
    /// 0 disables the check.
    #[serde(default = "default_rss_limit_mb")]
    pub rss_limit_mb: usize,
    /// Single-allocation ceiling in megabytes. 0 falls back to
    /// `rss-limit-mb`.
    #[serde(default)]
    pub malloc_limit_mb: usize,
    /// Run every registered target per input and archive divergences.
    #[serde(default)]
    pub differential_mode: bool,
    /// How often the output corpus directory is re-read, in seconds.
    /// 0 disables reloading.
    #[serde(default = "default_reload_interval_sec")]
    pub reload_interval_sec: u64,
    /// Directory that receives interesting units; also the reload source.
    #[serde(default)]
    pub output_corpus: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub detect_leaks: bool,
    /// Malloc/free trace verbosity for the envelope: 0 off, 1 counts.
    #[serde(default)]
    pub trace_malloc: u8,
    #[serde(default = "default_true")]
    pub print_new: bool,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
    #[serde(default)]
    pub print_coverage: bool,
    /// Write covered PC values (LE u64) to `coverage.dump` on exit.
    #[serde(default)]
    pub dump_coverage: bool,
    #[serde(default)]
    pub print_corpus_stats: bool,
    #[serde(default)]
    pub print_final_stats: bool,
    #[serde(default)]
    pub print_new_cov_pcs: bool,
    /// Prefer smaller units when a feature is re-observed on shorter input.
    #[serde(default)]
    pub shrink: bool,
    /// Track per-unit feature sets so a smaller equivalent can replace a
    /// corpus entry.
    #[serde(default = "default_true")]
    pub reduce_inputs: bool,
    #[serde(default = "default_true")]
    pub prefer_small: bool,
    #[serde(default = "default_true")]
    pub shuffle_at_startup: bool,
    #[serde(default = "default_true")]
    pub do_cross_over: bool,
    #[serde(default)]
    pub experimental_len_control: bool,
    #[serde(default = "default_mutate_depth")]
    pub mutate_depth: usize,
    /// Exit 0 as soon as a covered PC description contains this substring.
    #[serde(default)]
    pub exit_on_src_pos: Option<String>,
    /// Exit 0 as soon as the corpus holds a unit with this hex hash.
    #[serde(default)]
    pub exit_on_item: Option<String>,
    /// String prepended to every artifact filename (may be a directory
    /// ending in '/').
    #[serde(default)]
    pub artifact_prefix: String,
    /// When set, every artifact lands at exactly this path.
    #[serde(default)]
    pub exact_artifact_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub save_artifacts: bool,
    #[serde(default)]
    pub only_ascii: bool,
    /// Threshold in seconds past which a unit is archived as `slow-unit-`.
    #[serde(default = "default_report_slow_units")]
    pub report_slow_units: u64,
    #[serde(default = "default_error_exitcode")]
    pub error_exitcode: i32,
    #[serde(default = "default_timeout_exitcode")]
    pub timeout_exitcode: i32,
    /// Sink for the tab-separated differential progress line appended
    /// every 20 runs. `None` disables it.
    #[serde(default = "default_progress_log")]
    pub progress_log: Option<PathBuf>,
    /// RNG seed for the mutation engine. 0 derives one from the clock.
    #[serde(default)]
    pub seed: u64,
}

impl FuzzOptions {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let options: FuzzOptions = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(options)
    }

    /// Single-allocation limit with the documented fallback to the RSS cap.
    pub fn effective_malloc_limit_mb(&self) -> usize {
        if self.malloc_limit_mb != 0 {
            self.malloc_limit_mb
        } else {
            self.rss_limit_mb
        }
    }
}

impl Default for FuzzOptions {
    fn default() -> Self {
        // Deserializing an empty document applies every field default.
        toml::from_str("").expect("empty options must deserialize")
    }
}
