use crate::artifacts::ArtifactWriter;
use crate::channel::EquivalenceChannel;
use crate::config::FuzzOptions;
use crate::coverage::{InstrumentationView, Probe};
use crate::input::{UnitHash, UNIT_HASH_LEN};
use crate::stats::{peak_rss_mb, FuzzStats};
use std::alloc::{GlobalAlloc, Layout, System};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A target callback: records coverage through the probe, reads the input,
/// returns its observable output code.
pub type HarnessFn = Box<dyn FnMut(&mut Probe<'_>, &[u8]) -> i32 + Send>;

/// One implementation under differential test: a callable plus its
/// instrumentation topology and the return code of its canonical path.
pub struct Target {
    name: String,
    canonical_return: i32,
    pcs: Vec<u64>,
    harness: HarnessFn,
}

impl Target {
    pub fn new(name: impl Into<String>, pcs: Vec<u64>, harness: HarnessFn) -> Self {
        Self {
            name: name.into(),
            canonical_return: 0,
            pcs,
            harness,
        }
    }

    /// Overrides the canonical return code (0 by default). Targets whose
    /// success path reports non-zero must declare it here so divergence
    /// detection and fingerprints stay clean.
    pub fn with_canonical_return(mut self, code: i32) -> Self {
        self.canonical_return = code;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn canonical_return(&self) -> i32 {
        self.canonical_return
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("canonical_return", &self.canonical_return)
            .field("pcs", &self.pcs.len())
            .finish()
    }
}

// Allocator hook counters. These are the only process-global mutable
// state: hook context is not under engine control, so they must be
// atomics.
static MALLOCS: AtomicU64 = AtomicU64::new(0);
static FREES: AtomicU64 = AtomicU64::new(0);
static LARGEST_ALLOC: AtomicUsize = AtomicUsize::new(0);

/// Counting wrapper over the system allocator. Install with
/// `#[global_allocator]` in the binary to arm malloc/free accounting and
/// the single-allocation OOM check.
pub struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        MALLOCS.fetch_add(1, Ordering::Relaxed);
        LARGEST_ALLOC.fetch_max(layout.size(), Ordering::Relaxed);
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        FREES.fetch_add(1, Ordering::Relaxed);
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// Window accounting over the global counters: `start` snapshots, `stop`
/// reports whether the callback allocated more than it freed.
#[derive(Debug, Default)]
pub struct AllocTracer {
    trace_level: u8,
    mallocs_at_start: u64,
    frees_at_start: u64,
}

impl AllocTracer {
    pub fn start(&mut self, trace_level: u8) {
        self.trace_level = trace_level;
        self.mallocs_at_start = MALLOCS.load(Ordering::Relaxed);
        self.frees_at_start = FREES.load(Ordering::Relaxed);
        LARGEST_ALLOC.store(0, Ordering::Relaxed);
        if trace_level > 0 {
            tracing::info!("MallocFreeTracer: START");
        }
    }

    pub fn stop(&mut self) -> bool {
        let mallocs = MALLOCS.load(Ordering::Relaxed) - self.mallocs_at_start;
        let frees = FREES.load(Ordering::Relaxed) - self.frees_at_start;
        if self.trace_level > 0 {
            tracing::info!(
                "MallocFreeTracer: STOP {mallocs} {frees} ({})",
                if mallocs == frees { "same" } else { "DIFFERENT" }
            );
        }
        self.trace_level = 0;
        mallocs > frees
    }

    /// Largest single allocation since `start`, in bytes.
    pub fn largest_alloc_bytes(&self) -> usize {
        LARGEST_ALLOC.load(Ordering::Relaxed)
    }
}

/// State the watchdog thread polls: written by the envelope around every
/// callback, read out-of-band.
#[derive(Debug, Default)]
pub struct WatchdogShared {
    pub running_callback: AtomicBool,
    pub unit_start_epoch_ms: AtomicU64,
    /// Last known total PC coverage, for the final stats block.
    pub coverage: AtomicU64,
    pub shutdown: AtomicBool,
}

/// The persistent current-unit buffer, kept identical to the input under
/// execution so fatal paths can dump it.
#[derive(Debug)]
pub struct CurrentUnit {
    pub data: Mutex<Vec<u8>>,
    pub base_hash: Mutex<UnitHash>,
}

impl Default for CurrentUnit {
    fn default() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            base_hash: Mutex::new([0; UNIT_HASH_LEN]),
        }
    }
}

/// Outcome of one enveloped callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok(i32),
    Crash(String),
    /// The target mutated the caller-owned input buffer.
    OverwroteInput,
}

/// Executes one (target, input) pair with the full safety envelope:
/// channel publish, hardened input copy, timing, alloc accounting,
/// instrumentation reset, overwrite verification.
pub struct ExecutionEnvelope {
    targets: Vec<Target>,
    view: InstrumentationView,
    tracer: AllocTracer,
    shared: Arc<WatchdogShared>,
    current: Arc<CurrentUnit>,
    channel: Option<Box<dyn EquivalenceChannel>>,
    trace_malloc: u8,
    unit_start: Instant,
    unit_stop: Instant,
    pub has_more_mallocs_than_frees: bool,
}

impl ExecutionEnvelope {
    pub fn new(targets: Vec<Target>, trace_malloc: u8) -> Self {
        let mut view = InstrumentationView::new();
        for target in &targets {
            view.register_module(&target.name, &target.pcs);
        }
        let now = Instant::now();
        Self {
            targets,
            view,
            tracer: AllocTracer::default(),
            shared: Arc::new(WatchdogShared::default()),
            current: Arc::new(CurrentUnit::default()),
            channel: None,
            trace_malloc,
            unit_start: now,
            unit_stop: now,
            has_more_mallocs_than_frees: false,
        }
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn target_name(&self, index: usize) -> &str {
        self.targets[index].name()
    }

    pub fn canonical_returns(&self) -> Vec<i32> {
        self.targets.iter().map(Target::canonical_return).collect()
    }

    pub fn view(&self) -> &InstrumentationView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut InstrumentationView {
        &mut self.view
    }

    pub fn set_channel(&mut self, channel: Box<dyn EquivalenceChannel>) {
        self.channel = Some(channel);
    }

    pub fn channel_mut(&mut self) -> Option<&mut Box<dyn EquivalenceChannel>> {
        self.channel.as_mut()
    }

    pub fn watchdog_shared(&self) -> Arc<WatchdogShared> {
        self.shared.clone()
    }

    pub fn current_unit(&self) -> Arc<CurrentUnit> {
        self.current.clone()
    }

    /// Runs target `index` on `data`. The caller-owned buffer is bitwise
    /// unchanged on return; the target only ever sees a fresh heap copy.
    pub fn execute_callback(&mut self, index: usize, data: &[u8]) -> ExecutionStatus {
        if let Some(channel) = &mut self.channel {
            if channel.is_client() {
                channel.write_bytes(data);
            }
        }

        // Fresh heap copy hardens against out-of-bounds reads in the
        // target.
        let copy = data.to_vec();

        {
            let mut current = self.current.data.lock().unwrap();
            if current.as_slice() != data {
                current.clear();
                current.extend_from_slice(data);
            }
        }

        self.shared
            .unit_start_epoch_ms
            .store(epoch_millis(), Ordering::Relaxed);
        self.unit_start = Instant::now();
        self.tracer.start(self.trace_malloc);
        self.view.reset_maps(index);

        self.shared.running_callback.store(true, Ordering::Relaxed);
        let result = {
            let mut probe = self.view.probe(index);
            let harness = &mut self.targets[index].harness;
            catch_unwind(AssertUnwindSafe(|| harness(&mut probe, &copy)))
        };
        self.shared.running_callback.store(false, Ordering::Relaxed);

        self.unit_stop = Instant::now();
        self.has_more_mallocs_than_frees = self.tracer.stop();

        match result {
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                ExecutionStatus::Crash(message)
            }
            Ok(code) => {
                if !loose_memeq(&copy, data) {
                    return ExecutionStatus::OverwroteInput;
                }
                ExecutionStatus::Ok(code)
            }
        }
    }

    pub fn unit_time(&self) -> Duration {
        self.unit_stop.saturating_duration_since(self.unit_start)
    }

    pub fn largest_alloc_bytes(&self) -> usize {
        self.tracer.largest_alloc_bytes()
    }
}

/// Sampled equality: full compare up to 64 bytes, first and last 32 bytes
/// above that.
pub fn loose_memeq(a: &[u8], b: &[u8]) -> bool {
    const LIMIT: usize = 64;
    if a.len() != b.len() {
        return false;
    }
    let size = a.len();
    if size <= LIMIT {
        return a == b;
    }
    a[..LIMIT / 2] == b[..LIMIT / 2] && a[size - LIMIT / 2..] == b[size - LIMIT / 2..]
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The watchdog's timeout decision: a callback that started at
/// `started_ms` has blown a `limit_sec` budget by `now_ms`.
fn unit_deadline_exceeded(started_ms: u64, now_ms: u64, limit_sec: u64) -> bool {
    started_ms > 0 && limit_sec > 0 && now_ms.saturating_sub(started_ms) / 1000 >= limit_sec
}

/// Everything the watchdog needs, detached from the engine proper.
pub struct WatchdogConfig {
    pub options: FuzzOptions,
    pub poll_interval: Duration,
}

/// Spawns the thread that enforces the unit timeout and the peak-RSS
/// ceiling. Both violations are process-terminating: dump the current
/// unit, print final stats, exit. Replaces the alarm/signal handlers of a
/// hook-based design with an explicit handle-holding thread.
pub fn spawn_watchdog(
    shared: Arc<WatchdogShared>,
    current: Arc<CurrentUnit>,
    stats: Arc<FuzzStats>,
    artifacts: Arc<ArtifactWriter>,
    config: WatchdogConfig,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(config.poll_interval);
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let options = &config.options;
        if shared.running_callback.load(Ordering::Relaxed) {
            let started = shared.unit_start_epoch_ms.load(Ordering::Relaxed);
            let now = epoch_millis();
            let seconds = now.saturating_sub(started) / 1000;
            if unit_deadline_exceeded(started, now, options.unit_timeout_sec) {
                tracing::error!("ALARM: working on the last Unit for {seconds} seconds");
                tracing::error!(
                    "       and the timeout value is {} (use unit-timeout-sec to change)",
                    options.unit_timeout_sec
                );
                let unit = current.data.lock().unwrap().clone();
                artifacts.write_unit_to_file_with_prefix(&unit, "timeout-");
                tracing::error!("ERROR: timeout after {seconds} seconds");
                stats.print_final_stats(options, shared.coverage.load(Ordering::Relaxed) as usize);
                std::process::exit(options.timeout_exitcode);
            }
        }

        if options.rss_limit_mb > 0 && peak_rss_mb() > options.rss_limit_mb {
            tracing::error!(
                "ERROR: out-of-memory (used: {}Mb; limit: {}Mb)",
                peak_rss_mb(),
                options.rss_limit_mb
            );
            tracing::error!("   To change the out-of-memory limit use rss-limit-mb=<N>");
            let unit = current.data.lock().unwrap().clone();
            artifacts.write_unit_to_file_with_prefix(&unit, "oom-");
            stats.print_final_stats(options, shared.coverage.load(Ordering::Relaxed) as usize);
            std::process::exit(options.error_exitcode);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PairedChannel;

    fn pass_through_target(name: &str, code: i32) -> Target {
        Target::new(
            name,
            vec![0x100, 0x104],
            Box::new(move |probe, data| {
                probe.hit(0);
                if !data.is_empty() {
                    probe.hit(1);
                }
                code
            }),
        )
    }

    #[test]
    fn envelope_runs_harness_and_reports_code() {
        let mut envelope = ExecutionEnvelope::new(vec![pass_through_target("t", 7)], 0);
        let data = vec![1u8, 2, 3];
        let status = envelope.execute_callback(0, &data);
        assert_eq!(status, ExecutionStatus::Ok(7));
        // caller-owned buffer unchanged
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(envelope.view().total_pc_coverage(), 2);
    }

    #[test]
    fn envelope_catches_panicking_target() {
        let boom = Target::new(
            "boom",
            vec![0x1],
            Box::new(|_probe, data| {
                if data.first() == Some(&0xFF) {
                    panic!("Boom!");
                }
                0
            }),
        );
        let mut envelope = ExecutionEnvelope::new(vec![boom], 0);
        match envelope.execute_callback(0, &[0xFF]) {
            ExecutionStatus::Crash(message) => assert!(message.contains("Boom!")),
            other => panic!("expected a crash, got {other:?}"),
        }
        assert!(!envelope
            .watchdog_shared()
            .running_callback
            .load(Ordering::Relaxed));
    }

    #[test]
    fn current_unit_buffer_tracks_input() {
        let mut envelope = ExecutionEnvelope::new(vec![pass_through_target("t", 0)], 0);
        envelope.execute_callback(0, &[9, 9, 9]);
        assert_eq!(*envelope.current_unit().data.lock().unwrap(), vec![9, 9, 9]);
    }

    #[test]
    fn client_session_publishes_input() {
        let (client, mut server) = PairedChannel::pair();
        let mut envelope = ExecutionEnvelope::new(vec![pass_through_target("t", 0)], 0);
        envelope.set_channel(Box::new(client));
        envelope.execute_callback(0, b"published");
        assert_eq!(server.read_bytes(), b"published");
    }

    #[test]
    fn loose_memeq_full_compare_up_to_64() {
        let a = vec![7u8; 64];
        let mut b = a.clone();
        assert!(loose_memeq(&a, &b));
        b[32] ^= 1;
        assert!(!loose_memeq(&a, &b));
    }

    #[test]
    fn loose_memeq_samples_above_64() {
        let a = vec![7u8; 100];
        let mut b = a.clone();
        assert!(loose_memeq(&a, &b));

        // an interior change between the sampled windows goes unseen
        b[50] ^= 1;
        assert!(loose_memeq(&a, &b));

        // changes inside the first or last 32 bytes are caught
        let mut c = a.clone();
        c[0] ^= 1;
        assert!(!loose_memeq(&a, &c));
        let mut d = a.clone();
        d[99] ^= 1;
        assert!(!loose_memeq(&a, &d));
    }

    #[test]
    fn alloc_tracer_window_is_balanced_without_hooks() {
        let mut tracer = AllocTracer::default();
        tracer.start(0);
        assert!(!tracer.stop());
    }

    #[test]
    fn unit_deadline_fires_only_past_the_budget() {
        // a callback 299s in, 300s budget: keep waiting
        assert!(!unit_deadline_exceeded(1_000, 1_000 + 299_000, 300));
        // 300s in: fire
        assert!(unit_deadline_exceeded(1_000, 1_000 + 300_000, 300));
        // no start recorded or no budget configured: never fire
        assert!(!unit_deadline_exceeded(0, 500_000, 300));
        assert!(!unit_deadline_exceeded(1_000, 900_000, 0));
    }
}
