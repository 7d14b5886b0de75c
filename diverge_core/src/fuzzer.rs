use crate::artifacts::{print_unit, read_dir_to_units, ArtifactWriter};
use crate::channel::EquivalenceChannel;
use crate::config::{FuzzOptions, DEFAULT_MAX_LEN};
use crate::corpus::Corpus;
use crate::dedup::{DiffDeduper, MutationDeduper, Novelty};
use crate::executor::{ExecutionEnvelope, ExecutionStatus, Target, WatchdogConfig};
use crate::input::{hex_digest, sha1_digest, to_ascii, Unit};
use crate::mutator::MutationDispatcher;
use crate::oracle::{DivergenceOracle, FeaturePatternTracker};
use crate::stats::{FuzzStats, StatsContext};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::RngCore;
use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Bounded retries for the decomposed mutation loop: oversize results and
/// duplicate bodies each get this many attempts per depth step.
const MAX_OVERSIZE_RETRIES: usize = 8;
const MAX_DUPLICATE_RETRIES: usize = 8;
/// The leak probe disables itself after this many inconclusive attempts.
const MAX_LEAK_DETECTION_ATTEMPTS: u64 = 1000;

// Exactly one engine per process: allocator counters and the watchdog are
// process-scoped, a second instance would corrupt both.
static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

thread_local! {
    // Survives out-of-band reentry without synchronization; only the
    // fuzzing thread ever observes these.
    static IS_FUZZING_THREAD: Cell<bool> = const { Cell::new(false) };
    static UNIT_HAD_OUTPUT_DIFF: Cell<bool> = const { Cell::new(false) };
}

fn set_unit_had_output_diff(value: bool) {
    UNIT_HAD_OUTPUT_DIFF.with(|cell| cell.set(value));
}

fn unit_had_output_diff() -> bool {
    UNIT_HAD_OUTPUT_DIFF.with(|cell| cell.get())
}

/// Mutation length for one round under experimental length control.
pub fn compute_mutation_len(
    max_input_size: usize,
    max_mutation_len: usize,
    rng: &mut ChaCha8Rng,
) -> usize {
    debug_assert!(max_input_size <= max_mutation_len);
    if max_input_size == max_mutation_len {
        return max_mutation_len;
    }
    let mut result = max_input_size;
    let r = rng.next_u64();
    if r % (1 << 7) == 0 {
        result += 1;
    }
    if r % (1 << 15) == 0 {
        result += 10 + result / 2;
    }
    result.min(max_mutation_len).max(1)
}

/// The engine: owns the corpus handle, mutation dispatcher, envelope,
/// oracles and dedup sets, and drives the differential runner and the
/// main loop.
pub struct Fuzzer {
    options: FuzzOptions,
    envelope: ExecutionEnvelope,
    corpus: Corpus,
    mutator: Box<dyn MutationDispatcher>,
    oracle: DivergenceOracle,
    pattern_tracker: FeaturePatternTracker,
    diff_dedup: DiffDeduper,
    mutation_dedup: MutationDeduper,
    stats: Arc<FuzzStats>,
    artifacts: Arc<ArtifactWriter>,
    max_input_len: usize,
    max_mutation_len: usize,
    epoch_of_last_read: SystemTime,
    leak_detection_attempts: u64,
    leak_detection_enabled: bool,
    /// External leak oracle (e.g. a sanitizer pass); without one the probe
    /// only counts inconclusive imbalances.
    leak_check: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl Fuzzer {
    /// Builds the engine around a set of targets. Panics if another engine
    /// is live in this process.
    pub fn new(
        options: FuzzOptions,
        targets: Vec<Target>,
        mutator: Box<dyn MutationDispatcher>,
    ) -> Self {
        assert!(
            !ENGINE_LIVE.swap(true, Ordering::SeqCst),
            "only one fuzzing engine may exist per process"
        );
        IS_FUZZING_THREAD.with(|cell| cell.set(true));
        assert!(!targets.is_empty(), "at least one target is required");
        if options.differential_mode {
            assert!(targets.len() >= 2, "differential mode requires two or more targets");
        }

        let envelope = ExecutionEnvelope::new(targets, options.trace_malloc);
        let oracle = DivergenceOracle::new(envelope.canonical_returns());

        let max_input_len = if options.max_len == 0 {
            tracing::info!(
                "INFO: max-len is not provided; the engine will not generate inputs larger than {DEFAULT_MAX_LEN} bytes"
            );
            DEFAULT_MAX_LEN
        } else {
            options.max_len
        };

        let stats = Arc::new(FuzzStats::new(options.verbosity));
        let artifacts = Arc::new(ArtifactWriter::from_options(&options));

        let epoch_of_last_read = options
            .output_corpus
            .as_ref()
            .map(|dir| directory_epoch(dir))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        if options.unit_timeout_sec > 0 || options.rss_limit_mb > 0 {
            crate::executor::spawn_watchdog(
                envelope.watchdog_shared(),
                envelope.current_unit(),
                stats.clone(),
                artifacts.clone(),
                WatchdogConfig {
                    options: options.clone(),
                    poll_interval: Duration::from_millis(200),
                },
            );
        }

        Self {
            options,
            envelope,
            corpus: Corpus::new(),
            mutator,
            oracle,
            pattern_tracker: FeaturePatternTracker::new(),
            diff_dedup: DiffDeduper::new(),
            mutation_dedup: MutationDeduper::new(),
            stats,
            artifacts,
            max_input_len,
            max_mutation_len: max_input_len,
            epoch_of_last_read,
            leak_detection_attempts: 0,
            leak_detection_enabled: true,
            leak_check: None,
        }
    }

    pub fn in_fuzzing_thread() -> bool {
        IS_FUZZING_THREAD.with(|cell| cell.get())
    }

    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn options(&self) -> &FuzzOptions {
        &self.options
    }

    pub fn total_pc_coverage(&self) -> usize {
        self.envelope.view().total_pc_coverage()
    }

    pub fn set_leak_check(&mut self, check: Box<dyn FnMut() -> bool + Send>) {
        self.leak_check = Some(check);
    }

    /// Attaches the shared channel to a paired engine process; every
    /// callback's input is then published and compared via
    /// [`Fuzzer::announce_output`].
    pub fn set_equivalence_channel(&mut self, channel: Box<dyn EquivalenceChannel>) {
        self.envelope.set_channel(channel);
    }

    /// Caps the mutation size below the input size ceiling.
    pub fn set_max_mutation_len(&mut self, max_mutation_len: usize) {
        assert!(max_mutation_len > 0 && max_mutation_len <= self.max_input_len);
        self.max_mutation_len = max_mutation_len;
    }

    /// Clean-interrupt path: final stats, exit 0. The embedder wires this
    /// to its signal handling.
    pub fn interrupt_exit(&self) -> ! {
        tracing::info!("run interrupted; exiting");
        self.print_final_stats();
        std::process::exit(0);
    }

    // ---- C4: differential runner -------------------------------------

    /// Runs one input through every target (index order, each completing
    /// before the next), updating corpus, archive and statistics. Returns
    /// whether the input produced features or a divergence.
    pub fn run_one(&mut self, data: &[u8], may_delete_file: bool, entry: Option<usize>) -> bool {
        if !self.options.differential_mode {
            let result = self.run_one_callback(data, 0, may_delete_file, entry);
            self.finish_run();
            return result;
        }

        self.envelope.view_mut().reset_round();
        let coverage_before = self.envelope.view().total_pc_coverage();
        set_unit_had_output_diff(false);

        let num_targets = self.envelope.num_targets();
        let mut pattern = Vec::with_capacity(num_targets);
        let mut any_features = false;
        for index in 0..num_targets {
            let had_features = self.run_one_callback(data, index, may_delete_file, entry);
            any_features |= had_features;
            pattern.push(had_features);
        }

        let coverage_new = self.envelope.view().total_pc_coverage() - coverage_before;
        let outputs = self.envelope.view().output_diff_vec.clone();
        let diverged = self.oracle.diverged(&outputs);

        if self.pattern_tracker.is_new_pattern(&pattern) {
            self.stats
                .number_of_valid_cases
                .fetch_add(1, Ordering::Relaxed);
        }

        if diverged {
            self.archive_if_diff(data, &outputs);
            if unit_had_output_diff() {
                self.corpus.add_to_corpus(
                    Unit::new(data.to_vec()),
                    coverage_new,
                    may_delete_file,
                    Vec::new(),
                );
            }
        }

        self.finish_run();
        let runs = self.stats.runs();
        if runs % 20 == 0 {
            self.artifacts.append_progress(&format!(
                "{}\t{}\t{}\t{}",
                runs,
                self.stats.duplicate.load(Ordering::Relaxed),
                self.stats.number_of_diff_units_added.load(Ordering::Relaxed),
                self.stats.number_of_valid_cases.load(Ordering::Relaxed),
            ));
        }

        any_features || diverged
    }

    fn finish_run(&mut self) {
        self.stats
            .total_number_of_runs
            .fetch_add(1, Ordering::Relaxed);
        self.envelope
            .watchdog_shared()
            .coverage
            .store(self.total_pc_coverage() as u64, Ordering::Relaxed);
    }

    /// One target against one input: execute under the envelope, feed the
    /// features to the corpus, admit or reduce. The non-differential
    /// engine is exactly this at index 0.
    fn run_one_callback(
        &mut self,
        data: &[u8],
        index: usize,
        may_delete_file: bool,
        entry: Option<usize>,
    ) -> bool {
        if data.is_empty() {
            return false;
        }

        let code = self.execute_or_die(index, data);
        self.announce_output(data);
        if self.options.differential_mode {
            self.envelope.view_mut().output_diff_vec[index] = code;
        }

        let updates_before = self.corpus.num_feature_updates();
        let mut features = Vec::new();
        {
            let size = data.len();
            let shrink = self.options.shrink;
            let reduce = self.options.reduce_inputs;
            let corpus = &mut self.corpus;
            let view = self.envelope.view_mut();
            view.collect_features(|feature| {
                corpus.add_feature(feature, size, shrink);
                if reduce {
                    features.push(feature);
                }
            });
        }
        self.print_pulse_and_report_slow(data);

        let num_new_features = self.corpus.num_feature_updates() - updates_before;
        if num_new_features > 0 {
            self.corpus.add_to_corpus(
                Unit::new(data.to_vec()),
                num_new_features,
                may_delete_file,
                features,
            );
            self.check_exit_on_src_pos_or_item();
            return true;
        }
        if let Some(entry_index) = entry {
            if self.corpus.try_to_replace(entry_index, data, &features) {
                self.check_exit_on_src_pos_or_item();
                return true;
            }
        }
        false
    }

    /// Classifies a diverging execution against the archive; novel diffs
    /// are written as `diff_<dashed-outputs>_<hash>` artifacts.
    fn archive_if_diff(&mut self, data: &[u8], outputs: &[i32]) {
        match self
            .diff_dedup
            .classify(outputs, self.oracle.canonical(), self.envelope.view())
        {
            Novelty::Duplicate => {
                self.stats.duplicate.fetch_add(1, Ordering::Relaxed);
            }
            Novelty::Novel => {
                set_unit_had_output_diff(true);
                self.stats
                    .number_of_diff_units_added
                    .fetch_add(1, Ordering::Relaxed);
                let prefix = format!("diff_{}_", DivergenceOracle::dashed_outputs(outputs));
                self.artifacts.write_unit_to_file_with_prefix(data, &prefix);
            }
        }
    }

    /// Envelope execution with the fatal hooks applied: crash, input
    /// overwrite and single-allocation OOM all terminate the process.
    fn execute_or_die(&mut self, index: usize, data: &[u8]) -> i32 {
        match self.envelope.execute_callback(index, data) {
            ExecutionStatus::Ok(code) => {
                let limit_mb = self.options.effective_malloc_limit_mb();
                let largest = self.envelope.largest_alloc_bytes();
                if limit_mb > 0 && largest >> 20 >= limit_mb {
                    tracing::error!("ERROR: out-of-memory (malloc({largest}))");
                    tracing::error!("   To change the out-of-memory limit use malloc-limit-mb=<N>");
                    self.fatal_exit("oom-", self.options.error_exitcode);
                }
                code
            }
            ExecutionStatus::Crash(message) => {
                tracing::error!(
                    "ERROR: deadly signal in target '{}': {message}",
                    self.envelope.target_name(index)
                );
                self.fatal_exit("crash-", self.options.error_exitcode);
            }
            ExecutionStatus::OverwroteInput => {
                tracing::error!("ERROR: fuzz target overwrites its const input");
                self.fatal_exit("crash-", self.options.error_exitcode);
            }
        }
    }

    fn print_pulse_and_report_slow(&self, data: &[u8]) {
        let runs = self.stats.runs();
        if runs & runs.wrapping_sub(1) == 0 && self.stats.seconds_since_start() >= 2 {
            self.print_stats("pulse ", None);
        }

        let unit_seconds = self.envelope.unit_time().as_secs();
        let longest = self
            .stats
            .time_of_longest_unit_sec
            .load(Ordering::Relaxed);
        if unit_seconds as f64 > longest as f64 * 1.1
            && unit_seconds >= self.options.report_slow_units
        {
            self.stats
                .time_of_longest_unit_sec
                .store(unit_seconds, Ordering::Relaxed);
            tracing::info!("Slowest unit: {unit_seconds} s:");
            self.artifacts
                .write_unit_to_file_with_prefix(data, "slow-unit-");
        }
    }

    // ---- C5: fuzz loop ------------------------------------------------

    /// Seeds the engine: optional shuffle and size sort, the one-time
    /// empty-input warm-up, then one run per seed. Fails fast when nothing
    /// produced features.
    pub fn shuffle_and_minimize(&mut self, initial_corpus: Vec<Vec<u8>>) {
        tracing::info!("#0\tREAD units: {}", initial_corpus.len());
        let mut units = initial_corpus;
        for unit in &mut units {
            unit.truncate(self.max_input_len);
        }
        if self.options.shuffle_at_startup {
            units.shuffle(self.mutator.rng());
        }
        if self.options.prefer_small {
            units.sort_by_key(Vec::len);
        }

        // The callback sees the empty input here and never again.
        self.execute_or_die(0, &[]);

        for unit in &units {
            if self.run_one(unit, false, None) {
                self.mutator.record_successful_mutation_sequence();
                self.print_status_for_new_unit(unit);
                self.stats
                    .number_of_new_units_added
                    .fetch_add(1, Ordering::Relaxed);
                self.print_new_pcs();
            }
            if self.stats.runs() >= self.options.max_number_of_runs {
                break;
            }
            self.try_detecting_a_memory_leak(unit, true);
        }

        self.print_stats("INITED", None);
        if self.corpus.is_empty() {
            tracing::error!(
                "ERROR: no interesting inputs were found. \
                 Is the code instrumented for coverage? Exiting."
            );
            std::process::exit(1);
        }
    }

    /// The main loop: periodic output-corpus reload, then one
    /// mutate-and-test round per iteration, until the run budget or the
    /// wall-clock deadline.
    pub fn run_loop(&mut self) {
        let mut last_corpus_reload = Instant::now();
        loop {
            if self.options.output_corpus.is_some()
                && self.options.reload_interval_sec > 0
                && last_corpus_reload.elapsed().as_secs() >= self.options.reload_interval_sec
            {
                self.reread_output_corpus();
                last_corpus_reload = Instant::now();
            }
            if self.stats.runs() >= self.options.max_number_of_runs {
                break;
            }
            if self.timed_out() {
                break;
            }
            self.mutate_and_test_one();
        }

        self.print_stats("DONE  ", None);
        let dictionary = self.mutator.recommended_dictionary();
        if !dictionary.is_empty() {
            tracing::info!("###### Recommended dictionary. ######");
            for word in &dictionary {
                let rendered: String = word.iter().map(|b| format!("\\x{b:02x}")).collect();
                tracing::info!("\"{rendered}\"");
            }
            tracing::info!("###### End of recommended dictionary. ######");
        }
        self.print_final_stats();
    }

    /// One round of the mutation state machine:
    /// selected -> mutated -> deduped -> executed -> covered/diverged/inert.
    pub fn mutate_and_test_one(&mut self) {
        self.mutator.start_mutation_sequence();

        let Ok(index) = self.corpus.choose_unit_to_mutate(self.mutator.rng()) else {
            return;
        };
        let base = match self.corpus.entry(index) {
            Ok(entry) => entry.unit.clone(),
            Err(_) => return,
        };
        *self.envelope.current_unit().base_hash.lock().unwrap() = *base.hash();
        debug_assert!(base.len() <= self.max_input_len, "oversized unit");
        let mut current = base.as_bytes().to_vec();

        let current_max_mutation_len = if self.options.experimental_len_control {
            compute_mutation_len(
                self.corpus.max_input_size(),
                self.max_mutation_len,
                self.mutator.rng(),
            )
        } else {
            self.max_mutation_len
        };

        for _ in 0..self.options.mutate_depth {
            if self.stats.runs() >= self.options.max_number_of_runs {
                break;
            }
            let previous = current.clone();

            let mut accepted = None;
            for _ in 0..MAX_DUPLICATE_RETRIES {
                let mut candidate = current.clone();
                let mut fits = false;
                for _ in 0..MAX_OVERSIZE_RETRIES {
                    let corpus = self.options.do_cross_over.then_some(&self.corpus);
                    let new_size =
                        self.mutator
                            .mutate(&mut candidate, current_max_mutation_len, corpus);
                    if new_size > 0 && new_size <= current_max_mutation_len {
                        candidate.truncate(new_size);
                        fits = true;
                        break;
                    }
                }
                if !fits {
                    continue;
                }
                if self.options.only_ascii {
                    to_ascii(&mut candidate);
                }
                if !self.mutation_dedup.check_and_insert(&candidate) {
                    self.stats
                        .number_of_duplicate
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                accepted = Some(candidate);
                break;
            }
            let Some(next) = accepted else {
                continue;
            };
            current = next;

            if let Ok(entry) = self.corpus.entry_mut(index) {
                entry.num_executed_mutations += 1;
            }
            if self.run_one(&current, true, Some(index)) {
                self.report_new_coverage(index, &current);
                if unit_had_output_diff() {
                    // Preserve the mutation edge: the pre-mutation unit,
                    // named after both endpoints.
                    let prefix = format!(
                        "{}_BeforeMutationWas_",
                        hex_digest(&sha1_digest(&current))
                    );
                    self.artifacts
                        .write_unit_to_file_with_prefix(&previous, &prefix);
                }
            }

            self.try_detecting_a_memory_leak(&current, false);
        }
    }

    fn report_new_coverage(&mut self, index: usize, data: &[u8]) {
        if let Ok(entry) = self.corpus.entry_mut(index) {
            entry.num_successful_mutations += 1;
        }
        self.mutator.record_successful_mutation_sequence();
        self.print_status_for_new_unit(data);
        self.artifacts.write_to_output_corpus(data);
        self.stats
            .number_of_new_units_added
            .fetch_add(1, Ordering::Relaxed);
        self.print_new_pcs();
    }

    /// Re-reads the output corpus directory: every file modified since the
    /// last read is clamped and, if unknown, executed once.
    pub fn reread_output_corpus(&mut self) {
        let Some(dir) = self.options.output_corpus.clone() else {
            return;
        };
        if self.options.reload_interval_sec == 0 {
            return;
        }
        let (units, newest) =
            read_dir_to_units(&dir, self.max_input_len, Some(self.epoch_of_last_read));
        self.epoch_of_last_read = newest;
        if self.options.verbosity >= 2 {
            tracing::info!("Reload: read {} new units.", units.len());
        }
        let mut reloaded = false;
        for bytes in units {
            if bytes.is_empty() || self.corpus.has_unit(&bytes) {
                continue;
            }
            if self.run_one(&bytes, false, None) {
                reloaded = true;
            }
        }
        if reloaded {
            self.print_stats("RELOAD", None);
        }
    }

    /// The documented minimize loop: mutate the given unit in place and
    /// execute, nothing else, until the budget runs out.
    pub fn minimize_crash_loop(&mut self, unit: &[u8]) {
        if unit.len() <= 1 {
            return;
        }
        while !self.timed_out() && self.stats.runs() < self.options.max_number_of_runs {
            self.mutator.start_mutation_sequence();
            let mut data = unit.to_vec();
            for _ in 0..self.options.mutate_depth {
                let new_size = self.mutator.mutate(&mut data, self.max_mutation_len, None);
                data.truncate(new_size);
                self.execute_or_die(0, &data);
                self.finish_run();
                self.print_pulse_and_report_slow(&data);
                self.try_detecting_a_memory_leak(&data, false);
            }
        }
    }

    /// Compares observable output with the paired process, when an
    /// equivalence channel is attached. A mismatch is fatal.
    pub fn announce_output(&mut self, data: &[u8]) {
        let Some(channel) = self.envelope.channel_mut() else {
            return;
        };
        if channel.is_server() {
            channel.write_bytes(data);
        } else if channel.is_client() {
            channel.post_client();
            channel.wait_server();
            let other = channel.read_bytes();
            if other != data {
                let offset = data
                    .iter()
                    .zip(&other)
                    .position(|(a, b)| a != b)
                    .unwrap_or(data.len().min(other.len()));
                tracing::error!(
                    "ERROR: equivalence-mismatch. Sizes: {} {}; offset {offset}",
                    data.len(),
                    other.len()
                );
                self.fatal_exit("mismatch-", self.options.error_exitcode);
            }
        }
    }

    // ---- leak probe ----------------------------------------------------

    /// Leak probe for the input just executed. An execution with more
    /// mallocs than frees is re-run once; if the imbalance persists the
    /// configured leak oracle decides. NOTE: after 1000 inconclusive
    /// probes the detector disables itself for the rest of the run.
    fn try_detecting_a_memory_leak(&mut self, data: &[u8], during_initial_corpus: bool) {
        if !self.envelope.has_more_mallocs_than_frees {
            return;
        }
        if !self.options.detect_leaks || !self.leak_detection_enabled {
            return;
        }
        // Run once more so one-off imbalances do not count.
        self.execute_or_die(0, data);
        if !self.envelope.has_more_mallocs_than_frees {
            return;
        }
        self.leak_detection_attempts += 1;
        if self.leak_detection_attempts > MAX_LEAK_DETECTION_ATTEMPTS {
            self.leak_detection_enabled = false;
            tracing::warn!(
                "INFO: leak detection disabled after every mutation.\n\
                 Most likely the target accumulates allocated memory in a \
                 global state without actually leaking it.\n\
                 You may try trace-malloc=1 to get a trace of mallocs and frees."
            );
            return;
        }
        let confirmed = self.leak_check.as_mut().map(|check| check()).unwrap_or(false);
        if confirmed {
            if during_initial_corpus {
                tracing::info!("INFO: a leak has been found in the initial corpus.");
            }
            tracing::info!("INFO: to ignore leaks on the engine side use detect-leaks=false.");
            self.fatal_exit("leak-", self.options.error_exitcode);
        }
    }

    // ---- probes, reporting, exits --------------------------------------

    fn check_exit_on_src_pos_or_item(&self) {
        if let Some(needle) = &self.options.exit_on_src_pos {
            let view = self.envelope.view();
            for index in 0..view.table().num_pcs() {
                if view.is_covered(index) && view.table().describe_pc(index).contains(needle) {
                    tracing::info!("INFO: found line matching '{needle}', exiting.");
                    std::process::exit(0);
                }
            }
        }
        if let Some(hex) = &self.options.exit_on_item {
            if self.corpus.has_unit_with_hex_id(hex) {
                tracing::info!("INFO: found item with checksum '{hex}', exiting.");
                std::process::exit(0);
            }
        }
    }

    fn timed_out(&self) -> bool {
        self.options.max_total_time_sec > 0
            && self.stats.seconds_since_start() >= self.options.max_total_time_sec
    }

    fn print_status_for_new_unit(&self, data: &[u8]) {
        if !self.options.print_new {
            return;
        }
        self.print_stats("NEW   ", None);
        if self.options.verbosity > 0 {
            tracing::info!(" L: {} MS: {}", data.len(), self.mutator.mutation_sequence());
        }
    }

    fn print_new_pcs(&mut self) {
        let new_pcs = self.envelope.view_mut().take_new_pcs();
        if !self.options.print_new_cov_pcs {
            return;
        }
        for index in new_pcs {
            let view = self.envelope.view();
            tracing::info!(
                "NEW_PC: 0x{:x} {}",
                view.table().pc(index),
                view.table().describe_pc(index)
            );
        }
    }

    fn print_stats(&self, where_: &str, units: Option<usize>) {
        self.stats.print_stats(
            where_,
            StatsContext {
                coverage: self.total_pc_coverage(),
                features: self.corpus.num_features(),
                corpus_units: self.corpus.num_active_units(),
                corpus_bytes: self.corpus.size_in_bytes(),
                units,
            },
        );
    }

    fn print_final_stats(&self) {
        if self.options.print_coverage {
            self.envelope.view().print_coverage();
        }
        if self.options.dump_coverage {
            if let Err(err) = self.envelope.view().dump_coverage(Path::new("coverage.dump")) {
                tracing::warn!("failed to dump coverage: {err}");
            }
        }
        if self.options.print_corpus_stats {
            self.corpus.print_stats();
        }
        self.stats
            .print_final_stats(&self.options, self.total_pc_coverage());
    }

    /// The single fatal finalizer: dump the current unit under `prefix`,
    /// print final stats, terminate the process.
    fn fatal_exit(&self, prefix: &str, code: i32) -> ! {
        self.dump_current_unit(prefix);
        self.print_final_stats();
        std::process::exit(code);
    }

    fn dump_current_unit(&self, prefix: &str) {
        let current = self.envelope.current_unit();
        tracing::info!("MS: {}", self.mutator.mutation_sequence());
        tracing::info!(
            "; base unit: {}",
            hex_digest(&current.base_hash.lock().unwrap())
        );
        let unit = current.data.lock().unwrap().clone();
        print_unit(&unit);
        self.artifacts.write_unit_to_file_with_prefix(&unit, prefix);
    }
}

impl Drop for Fuzzer {
    fn drop(&mut self) {
        self.envelope
            .watchdog_shared()
            .shutdown
            .store(true, Ordering::Relaxed);
        ENGINE_LIVE.store(false, Ordering::SeqCst);
    }
}

/// Newest modification time under `dir`, for the reload epoch.
fn directory_epoch(dir: &Path) -> SystemTime {
    let mut newest = SystemTime::UNIX_EPOCH;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified > newest {
                    newest = modified;
                }
            }
        }
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PairedChannel;
    use crate::mutator::StackedMutator;
    use rand_core::SeedableRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // The engine is one-per-process; tests take turns.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_lock() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn test_options() -> FuzzOptions {
        let mut options = FuzzOptions::default();
        // no watchdog in tests: the process must outlive assertions
        options.unit_timeout_sec = 0;
        options.rss_limit_mb = 0;
        options.reload_interval_sec = 0;
        options.progress_log = None;
        options.verbosity = 0;
        options
    }

    /// Target hitting one PC per input byte value bucket; returns `code`.
    fn bucket_target(name: &str, buckets: usize, code: i32) -> Target {
        let pcs: Vec<u64> = (0..buckets as u64).map(|i| 0x1000 + i * 4).collect();
        Target::new(
            name,
            pcs,
            Box::new(move |probe, data| {
                for &byte in data {
                    probe.hit(byte as usize % buckets);
                }
                code
            }),
        )
    }

    #[test]
    fn no_divergence_no_coverage_is_inert() {
        let _guard = test_lock();
        let mut options = test_options();
        options.differential_mode = true;
        options.save_artifacts = false;
        let silent = |name: &str| {
            Target::new(name, vec![0x10], Box::new(|_probe, _data| 0))
        };
        let mut fuzzer = Fuzzer::new(
            options,
            vec![silent("a"), silent("b")],
            Box::new(StackedMutator::new(1)),
        );

        let data = vec![1u8, 2, 3];
        assert!(!fuzzer.run_one(&data, false, None));
        assert!(fuzzer.corpus().is_empty());
        assert_eq!(
            fuzzer.stats().number_of_diff_units_added.load(Ordering::Relaxed),
            0
        );
        // caller-owned buffer is bitwise unchanged
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn novel_divergence_archives_then_duplicates() {
        let _guard = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut options = test_options();
        options.differential_mode = true;
        options.artifact_prefix = format!("{}/", dir.path().display());

        let agree = Target::new(
            "agree",
            vec![0xAAAA],
            Box::new(|probe, _data| {
                probe.hit(0);
                0
            }),
        );
        let disagree = Target::new(
            "disagree",
            vec![0xBBBB],
            Box::new(|probe, _data| {
                probe.hit(0);
                1
            }),
        );
        let mut fuzzer = Fuzzer::new(
            options,
            vec![agree, disagree],
            Box::new(StackedMutator::new(1)),
        );

        let data = b"divergent".to_vec();
        assert!(fuzzer.run_one(&data, false, None));
        assert_eq!(
            fuzzer.stats().number_of_diff_units_added.load(Ordering::Relaxed),
            1
        );
        let expected = dir
            .path()
            .join(format!("diff_0_1_{}", hex_digest(&sha1_digest(&data))));
        assert!(expected.exists(), "missing diff artifact {expected:?}");

        // identical rerun: same fingerprint, no second artifact
        let files_before = std::fs::read_dir(dir.path()).unwrap().count();
        fuzzer.run_one(&data, false, None);
        assert_eq!(fuzzer.stats().duplicate.load(Ordering::Relaxed), 1);
        assert_eq!(
            fuzzer.stats().number_of_diff_units_added.load(Ordering::Relaxed),
            1
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), files_before);
    }

    #[test]
    fn targets_run_in_index_order() {
        let _guard = test_lock();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut options = test_options();
        options.differential_mode = true;
        options.save_artifacts = false;

        let recorder = |tag: usize, order: Arc<Mutex<Vec<usize>>>| -> Target {
            Target::new(
                format!("t{tag}"),
                vec![0x1],
                Box::new(move |_probe, _data| {
                    order.lock().unwrap().push(tag);
                    0
                }),
            )
        };
        let mut fuzzer = Fuzzer::new(
            options,
            vec![
                recorder(0, order.clone()),
                recorder(1, order.clone()),
                recorder(2, order.clone()),
            ],
            Box::new(StackedMutator::new(1)),
        );
        fuzzer.run_one(b"x", false, None);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn warmup_executes_empty_input_exactly_once() {
        let _guard = test_lock();
        let empty_calls = Arc::new(Mutex::new(0usize));
        let options = test_options();

        let counter = empty_calls.clone();
        let target = Target::new(
            "warm",
            (0..64u64).collect::<Vec<_>>(),
            Box::new(move |probe, data| {
                if data.is_empty() {
                    *counter.lock().unwrap() += 1;
                }
                for &b in data {
                    probe.hit(b as usize % 64);
                }
                0
            }),
        );
        let mut fuzzer = Fuzzer::new(options, vec![target], Box::new(StackedMutator::new(1)));
        fuzzer.shuffle_and_minimize(vec![vec![1, 2], vec![3]]);
        assert_eq!(*empty_calls.lock().unwrap(), 1);
        assert!(!fuzzer.corpus().is_empty());

        // a few rounds keep the engine moving without re-running empty
        for _ in 0..5 {
            fuzzer.mutate_and_test_one();
        }
        assert_eq!(*empty_calls.lock().unwrap(), 1);
    }

    #[test]
    fn reload_of_known_unit_is_a_noop() {
        let _guard = test_lock();
        let corpus_dir = tempfile::tempdir().unwrap();
        let mut options = test_options();
        options.output_corpus = Some(corpus_dir.path().to_path_buf());
        options.reload_interval_sec = 1;

        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 64, 0)],
            Box::new(StackedMutator::new(1)),
        );
        fuzzer.shuffle_and_minimize(vec![vec![7, 8, 9]]);
        let new_units_before = fuzzer
            .stats()
            .number_of_new_units_added
            .load(Ordering::Relaxed);
        let corpus_len_before = fuzzer.corpus().len();

        // the admitted unit reappears in the output directory
        std::fs::write(corpus_dir.path().join("seed-copy"), [7, 8, 9]).unwrap();
        fuzzer.epoch_of_last_read = SystemTime::UNIX_EPOCH;
        fuzzer.reread_output_corpus();

        assert_eq!(
            fuzzer
                .stats()
                .number_of_new_units_added
                .load(Ordering::Relaxed),
            new_units_before
        );
        assert_eq!(fuzzer.corpus().len(), corpus_len_before);
    }

    #[test]
    fn reload_of_fresh_unit_executes_it() {
        let _guard = test_lock();
        let corpus_dir = tempfile::tempdir().unwrap();
        let mut options = test_options();
        options.output_corpus = Some(corpus_dir.path().to_path_buf());
        options.reload_interval_sec = 1;

        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 64, 0)],
            Box::new(StackedMutator::new(1)),
        );
        fuzzer.shuffle_and_minimize(vec![vec![1]]);
        let corpus_len_before = fuzzer.corpus().len();

        std::fs::write(corpus_dir.path().join("fresh"), [42, 43, 44]).unwrap();
        fuzzer.epoch_of_last_read = SystemTime::UNIX_EPOCH;
        fuzzer.reread_output_corpus();
        assert!(fuzzer.corpus().len() > corpus_len_before);
    }

    #[test]
    fn compute_mutation_len_is_identity_at_the_ceiling() {
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        for max in [1usize, 5, 100, 4096] {
            assert_eq!(compute_mutation_len(max, max, &mut rng), max);
        }
        for _ in 0..1000 {
            let len = compute_mutation_len(10, 100, &mut rng);
            assert!(len >= 1 && len <= 100);
        }
    }

    #[test]
    fn zero_run_budget_exits_loop_immediately() {
        let _guard = test_lock();
        let mut options = test_options();
        options.max_number_of_runs = 0;
        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 8, 0)],
            Box::new(StackedMutator::new(1)),
        );
        fuzzer.run_loop();
        assert_eq!(fuzzer.stats().runs(), 0);
    }

    /// Dispatcher that replays a fixed script of mutation results.
    struct ScriptedMutator {
        script: VecDeque<Vec<u8>>,
        rng: ChaCha8Rng,
    }

    impl ScriptedMutator {
        fn new(script: Vec<Vec<u8>>) -> Self {
            Self {
                script: script.into(),
                rng: ChaCha8Rng::from_seed([9; 32]),
            }
        }
    }

    impl MutationDispatcher for ScriptedMutator {
        fn start_mutation_sequence(&mut self) {}
        fn mutate(
            &mut self,
            data: &mut Vec<u8>,
            _max_size: usize,
            _corpus: Option<&Corpus>,
        ) -> usize {
            if let Some(next) = self.script.pop_front() {
                *data = next;
            }
            data.len()
        }
        fn default_mutate(&mut self, data: &mut Vec<u8>, max_size: usize) -> usize {
            self.mutate(data, max_size, None)
        }
        fn record_successful_mutation_sequence(&mut self) {}
        fn mutation_sequence(&self) -> String {
            String::new()
        }
        fn recommended_dictionary(&self) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn rng(&mut self) -> &mut ChaCha8Rng {
            &mut self.rng
        }
    }

    #[test]
    fn oversize_results_retry_and_duplicates_are_counted() {
        let _guard = test_lock();
        let mut options = test_options();
        options.max_len = 8;
        options.mutate_depth = 2;
        options.save_artifacts = false;

        // round 1: oversize result, then a fresh fit; round 2: the same
        // body again, which must be rejected as a duplicate.
        let script = vec![
            vec![0u8; 100],
            vec![1, 2, 3],
            vec![1, 2, 3],
        ];
        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 8, 0)],
            Box::new(ScriptedMutator::new(script)),
        );
        fuzzer.shuffle_and_minimize(vec![vec![5]]);
        fuzzer.mutate_and_test_one();

        assert!(
            fuzzer
                .stats()
                .number_of_duplicate
                .load(Ordering::Relaxed)
                >= 1,
            "duplicate mutation was not counted"
        );
        // the oversize body never reached execution
        assert!(!fuzzer.corpus().has_unit(&vec![0u8; 100]));
        assert!(fuzzer.corpus().has_unit(&[1, 2, 3]));
    }

    #[test]
    fn matching_equivalence_peer_is_transparent() {
        let _guard = test_lock();
        let mut options = test_options();
        options.save_artifacts = false;

        let (client, mut server) = PairedChannel::pair();
        let data = b"agreed bytes".to_vec();
        // the peer publishes the same observable output up front
        server.write_bytes(&data);

        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 64, 0)],
            Box::new(StackedMutator::new(1)),
        );
        fuzzer.set_equivalence_channel(Box::new(client));

        assert!(fuzzer.run_one(&data, false, None));
        // the run published the input to the peer on the way through
        assert_eq!(server.read_bytes(), data);
        assert_eq!(fuzzer.stats().runs(), 1);
    }

    /// Entry point of the re-executed child for the mismatch test: builds
    /// an engine whose peer disagrees, runs one unit, and must die on the
    /// `mismatch-` fatal path before reaching the trailing exit.
    fn run_mismatch_child() -> ! {
        let artifact_dir = std::env::var("DIVERGE_MISMATCH_DIR").unwrap();
        let mut options = test_options();
        options.artifact_prefix = format!("{artifact_dir}/");
        options.error_exitcode = 77;

        let (client, mut server) = PairedChannel::pair();
        server.write_bytes(b"peer disagrees");

        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 64, 0)],
            Box::new(StackedMutator::new(1)),
        );
        fuzzer.set_equivalence_channel(Box::new(client));
        fuzzer.run_one(b"local bytes", false, None);
        std::process::exit(3);
    }

    #[test]
    fn equivalence_mismatch_exits_through_the_fatal_path() {
        if std::env::var_os("DIVERGE_MISMATCH_CHILD").is_some() {
            run_mismatch_child();
        }

        let dir = tempfile::tempdir().unwrap();
        let exe = std::env::current_exe().unwrap();
        let output = std::process::Command::new(exe)
            .args([
                "fuzzer::tests::equivalence_mismatch_exits_through_the_fatal_path",
                "--exact",
                "--nocapture",
            ])
            .env("DIVERGE_MISMATCH_CHILD", "1")
            .env("DIVERGE_MISMATCH_DIR", dir.path())
            .output()
            .unwrap();

        assert_eq!(
            output.status.code(),
            Some(77),
            "child stdout: {}\nchild stderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let wrote_mismatch_artifact = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().starts_with("mismatch-"));
        assert!(
            wrote_mismatch_artifact,
            "no mismatch- artifact under {:?}",
            dir.path()
        );
    }

    #[test]
    fn mutation_rounds_grow_the_corpus() {
        let _guard = test_lock();
        let mut options = test_options();
        options.max_len = 16;
        options.save_artifacts = false;
        let mut fuzzer = Fuzzer::new(
            options,
            vec![bucket_target("t", 256, 0)],
            Box::new(StackedMutator::new(7)),
        );
        fuzzer.shuffle_and_minimize(vec![vec![0], vec![1, 2]]);
        let before = fuzzer.corpus().len();
        for _ in 0..50 {
            fuzzer.mutate_and_test_one();
        }
        assert!(fuzzer.corpus().len() > before, "no new units discovered");
    }
}
