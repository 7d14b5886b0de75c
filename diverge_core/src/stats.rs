use crate::config::FuzzOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Corpus- and coverage-side numbers a status line needs; the loop
/// assembles one per report since the watchdog cannot reach those
/// structures.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsContext {
    pub coverage: usize,
    pub features: usize,
    pub corpus_units: usize,
    pub corpus_bytes: usize,
    pub units: Option<usize>,
}

/// Run counters, shared between the fuzzing thread and the watchdog.
/// Everything is atomic so a fatal path on either side can print a
/// consistent final block.
#[derive(Debug)]
pub struct FuzzStats {
    start: Instant,
    verbosity: u8,
    pub total_number_of_runs: AtomicU64,
    pub number_of_new_units_added: AtomicU64,
    pub number_of_diff_units_added: AtomicU64,
    /// Coverage-fingerprint duplicates (differential dedup).
    pub duplicate: AtomicU64,
    /// Duplicate mutations rejected before execution.
    pub number_of_duplicate: AtomicU64,
    pub number_of_valid_cases: AtomicU64,
    pub time_of_longest_unit_sec: AtomicU64,
}

impl FuzzStats {
    pub fn new(verbosity: u8) -> Self {
        Self {
            start: Instant::now(),
            verbosity,
            total_number_of_runs: AtomicU64::new(0),
            number_of_new_units_added: AtomicU64::new(0),
            number_of_diff_units_added: AtomicU64::new(0),
            duplicate: AtomicU64::new(0),
            number_of_duplicate: AtomicU64::new(0),
            number_of_valid_cases: AtomicU64::new(0),
            time_of_longest_unit_sec: AtomicU64::new(0),
        }
    }

    pub fn runs(&self) -> u64 {
        self.total_number_of_runs.load(Ordering::Relaxed)
    }

    pub fn seconds_since_start(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn exec_per_sec(&self) -> u64 {
        let seconds = self.start.elapsed().as_secs();
        if seconds == 0 {
            return 0;
        }
        self.runs() / seconds
    }

    /// One status line: `#<runs> <WHERE> cov: .. ft: .. corp: .. exec/s: ..`.
    pub fn print_stats(&self, where_: &str, context: StatsContext) {
        if self.verbosity == 0 {
            return;
        }
        let mut line = format!("#{}\t{}", self.runs(), where_);
        if context.coverage > 0 {
            line.push_str(&format!(" cov: {}", context.coverage));
        }
        if context.features > 0 {
            line.push_str(&format!(" ft: {}", context.features));
        }
        if context.corpus_units > 0 {
            line.push_str(&format!(" corp: {}", context.corpus_units));
            let bytes = context.corpus_bytes;
            if bytes > 0 {
                if bytes < (1 << 14) {
                    line.push_str(&format!("/{bytes}b"));
                } else if bytes < (1 << 24) {
                    line.push_str(&format!("/{}Kb", bytes >> 10));
                } else {
                    line.push_str(&format!("/{}Mb", bytes >> 20));
                }
            }
        }
        if let Some(units) = context.units {
            line.push_str(&format!(" units: {units}"));
        }
        line.push_str(&format!(" exec/s: {}", self.exec_per_sec()));
        line.push_str(&format!(" rss: {}Mb", peak_rss_mb()));
        tracing::info!("{line}");
    }

    /// The `stat::` block printed on every exit path.
    pub fn print_final_stats(&self, options: &FuzzOptions, coverage: usize) {
        if !options.print_final_stats {
            return;
        }
        tracing::info!(
            "stat::number_of_executed_units: {}",
            self.runs()
        );
        tracing::info!("stat::average_exec_per_sec:     {}", self.exec_per_sec());
        tracing::info!(
            "stat::new_units_added:          {}",
            self.number_of_new_units_added.load(Ordering::Relaxed)
        );
        if options.differential_mode {
            tracing::info!(
                "stat::number_of_diffs:          {}",
                self.number_of_diff_units_added.load(Ordering::Relaxed)
            );
        }
        tracing::info!(
            "stat::slowest_unit_time_sec:    {}",
            self.time_of_longest_unit_sec.load(Ordering::Relaxed)
        );
        tracing::info!("stat::peak_rss_mb:              {}", peak_rss_mb());
        tracing::info!(
            "stat::number_of_duplicates:     {}",
            self.number_of_duplicate.load(Ordering::Relaxed)
        );
        tracing::info!("stat::coverage:                 {coverage}");
        tracing::info!(
            "stat::duplicate_diffs:          {}",
            self.duplicate.load(Ordering::Relaxed)
        );
    }
}

/// Peak resident set size in megabytes, from `/proc/self/status` (VmHWM).
/// Returns 0 where that is unavailable.
pub fn peak_rss_mb() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmHWM:") {
                    let kb: usize = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb / 1024;
                }
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn counters_start_at_zero() {
        let stats = FuzzStats::new(1);
        assert_eq!(stats.runs(), 0);
        assert_eq!(stats.exec_per_sec(), 0);
        stats.total_number_of_runs.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stats.runs(), 3);
    }

    #[test]
    fn peak_rss_is_sane() {
        // On Linux the process certainly uses some memory; elsewhere the
        // probe reports 0.
        let rss = peak_rss_mb();
        if cfg!(target_os = "linux") {
            assert!(rss > 0);
        }
    }

    #[test]
    fn printing_does_not_panic_without_subscriber() {
        let stats = FuzzStats::new(1);
        stats.print_stats(
            "pulse ",
            StatsContext {
                coverage: 5,
                features: 7,
                corpus_units: 2,
                corpus_bytes: 1 << 20,
                units: Some(4),
            },
        );
        let options = FuzzOptions::default();
        stats.print_final_stats(&options, 5);
    }
}
