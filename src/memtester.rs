//! Multi-threaded memtester.
//!
//! The requested memory is split into one locked region per worker thread.
//! Each worker runs the full memtester suite over its region, loop after
//! loop, and reports failures over a channel to a collector thread.

use crate::error::{MemoryFault, StressError};
use crate::memtests::{MemTest, TestOutcome};
use crate::region::{LockedRegion, MIN_REGION_BYTES};
use crate::stats::StressStats;
use bytesize::ByteSize;
use crossbeam::channel;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clean run.
pub const EXIT_OK: i32 = 0x00;
/// Bad arguments or memory could not be set up.
pub const EXIT_FAIL_NONSTARTER: i32 = 0x01;
/// The stuck address test failed.
pub const EXIT_FAIL_ADDRESSLINES: i32 = 0x02;
/// Any other test failed.
pub const EXIT_FAIL_OTHERTEST: i32 = 0x04;

/// Parses a memtester memory size: a number with an optional `B`, `K`, `M`
/// or `G` suffix. A bare number is megabytes.
pub fn parse_memory_size(arg: &str) -> Result<usize, StressError> {
    let arg = arg.trim();
    let split = arg
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(arg.len());
    let (digits, suffix) = arg.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| StressError::Config(format!("invalid memory size {:?}", arg)))?;
    let multiplier: u64 = match suffix {
        "" | "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        "K" | "k" => 1 << 10,
        "B" | "b" => 1,
        _ => {
            return Err(StressError::Config(format!(
                "invalid memory size suffix {:?} (expected B, K, M or G)",
                suffix
            )))
        }
    };

    let bytes = amount
        .checked_mul(multiplier)
        .and_then(|b| usize::try_from(b).ok())
        .ok_or_else(|| StressError::Config(format!("memory size {:?} too large", arg)))?;
    if bytes == 0 {
        return Err(StressError::Config("memory size must be non-zero".into()));
    }
    Ok(bytes)
}

/// Memtester configuration.
#[derive(Debug, Clone)]
pub struct MemTesterConfig {
    /// Total bytes to test across all threads.
    pub bytes: usize,
    /// Number of loops; 0 runs until stopped.
    pub loops: u64,
    /// Number of threads (defaults to CPU count if None).
    pub threads: Option<usize>,
    /// Optional wall-clock limit.
    pub timeout: Option<Duration>,
    /// Try to `mlock` the test memory.
    pub lock: bool,
    /// Log each fault as it is found.
    pub verbose: bool,
}

impl Default for MemTesterConfig {
    fn default() -> Self {
        Self {
            bytes: 1 << 30,
            loops: 0,
            threads: None,
            timeout: None,
            lock: true,
            verbose: false,
        }
    }
}

/// A test that saw at least one bad word.
#[derive(Debug, Clone)]
pub struct TestFailure {
    pub test: MemTest,
    pub thread_id: usize,
    pub loop_no: u64,
    /// Number of bad words seen by this run of the test.
    pub failures: u64,
    /// The first few bad words.
    pub faults: Vec<MemoryFault>,
}

impl TestFailure {
    fn from_outcome(test: MemTest, thread_id: usize, loop_no: u64, outcome: TestOutcome) -> Self {
        let faults = outcome
            .samples
            .into_iter()
            .map(|m| MemoryFault::new(test, thread_id, loop_no, m))
            .collect();
        Self {
            test,
            thread_id,
            loop_no,
            failures: outcome.failures,
            faults,
        }
    }
}

/// Summary of a memtester run.
#[derive(Debug, Clone, Default)]
pub struct MemTestReport {
    pub failures: Vec<TestFailure>,
    /// Loops finished by the slowest worker.
    pub loops_completed: u64,
    /// Bytes actually tested per loop, after allocation shrinkage.
    pub bytes: usize,
}

impl MemTestReport {
    /// Returns the memtester exit code for this run.
    pub fn exit_code(&self) -> i32 {
        self.failures.iter().fold(EXIT_OK, |code, failure| {
            code | if failure.test.is_address_test() {
                EXIT_FAIL_ADDRESSLINES
            } else {
                EXIT_FAIL_OTHERTEST
            }
        })
    }

    /// Total bad words across all failures.
    pub fn total_failures(&self) -> u64 {
        self.failures.iter().map(|f| f.failures).sum()
    }
}

/// RAM tester running the memtester suite on several threads.
pub struct MemTester {
    config: MemTesterConfig,
    num_threads: usize,
}

impl MemTester {
    /// Creates a new memtester with the given configuration.
    pub fn new(config: MemTesterConfig) -> Self {
        let num_threads = config.threads.unwrap_or_else(num_cpus::get).max(1);
        Self {
            config,
            num_threads,
        }
    }

    /// Returns the number of threads used for testing.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Returns the bytes each worker asks for.
    pub fn bytes_per_thread(&self) -> usize {
        let per_thread = self.config.bytes / self.num_threads;
        per_thread - per_thread % MIN_REGION_BYTES
    }

    /// Allocates one region per worker.
    fn allocate_regions(&self) -> Result<Vec<LockedRegion>, StressError> {
        let per_thread = self.bytes_per_thread();
        if per_thread < MIN_REGION_BYTES {
            return Err(StressError::Config(format!(
                "{} bytes is too little memory for {} threads",
                self.config.bytes, self.num_threads
            )));
        }
        (0..self.num_threads)
            .map(|_| LockedRegion::allocate(per_thread, self.config.lock))
            .collect()
    }

    /// Runs the memtester.
    ///
    /// Returns when every worker has finished its loops, or `should_stop`
    /// is raised by the caller, a timeout or Ctrl-C. On return
    /// `should_stop` is always set.
    ///
    /// # Errors
    ///
    /// Returns an error if the test memory cannot be set up.
    pub fn run(
        &self,
        stats: Arc<StressStats>,
        should_stop: Arc<AtomicBool>,
    ) -> Result<MemTestReport, StressError> {
        let regions = self.allocate_regions()?;
        let actual_bytes: usize = regions.iter().map(|r| r.len_bytes()).sum();
        let all_locked = regions.iter().all(|r| r.is_locked());

        println!("Memory Stress Test");
        println!("==================");
        println!(
            "Memory to test: {} (requested: {})",
            ByteSize::b(actual_bytes as u64).to_string_as(true),
            ByteSize::b(self.config.bytes as u64).to_string_as(true)
        );
        println!(
            "Threads: {} ({} each, {})",
            self.num_threads,
            ByteSize::b(self.bytes_per_thread() as u64).to_string_as(true),
            if all_locked { "locked" } else { "not locked" }
        );
        println!(
            "Loops: {}",
            if self.config.loops == 0 {
                "infinite".to_string()
            } else {
                self.config.loops.to_string()
            }
        );
        if let Some(timeout) = self.config.timeout {
            println!("Duration: {}", humantime::format_duration(timeout));
        }
        println!();

        let (failure_tx, failure_rx) = channel::unbounded::<TestFailure>();
        let multi_progress = MultiProgress::new();

        let start_time = Instant::now();
        let timeout = self.config.timeout;
        let loops = self.config.loops;
        let tests = MemTest::all();

        // Stats monitoring thread
        let stats_clone = Arc::clone(&stats);
        let should_stop_clone = Arc::clone(&should_stop);
        let stats_progress = multi_progress.add(ProgressBar::new_spinner());
        let stats_thread = std::thread::spawn(move || {
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                stats_progress.set_style(style);
            }

            while !should_stop_clone.load(Ordering::Relaxed) {
                let elapsed = start_time.elapsed();
                let bytes = stats_clone.get_bytes();
                let mb_per_sec = if elapsed.as_secs_f64() > 0.0 {
                    (bytes as f64 / (1024.0 * 1024.0)) / elapsed.as_secs_f64()
                } else {
                    0.0
                };

                stats_progress.set_message(format!(
                    "Elapsed: {:.1}s | Tested: {} MB | Speed: {:.2} MB/s | Tests: {} | Faults: {} | Frames: {} | Unblanks: {}",
                    elapsed.as_secs_f64(),
                    bytes / (1024 * 1024),
                    mb_per_sec,
                    stats_clone.get_tests(),
                    stats_clone.get_faults(),
                    stats_clone.get_frames(),
                    stats_clone.get_unblanks(),
                ));

                if let Some(timeout_duration) = timeout {
                    if elapsed >= timeout_duration {
                        should_stop_clone.store(true, Ordering::Relaxed);
                        break;
                    }
                }

                std::thread::sleep(Duration::from_millis(100));
            }
            stats_progress.finish_with_message("Statistics reporting complete");
        });

        // Worker threads
        let mut thread_handles = Vec::new();
        for (thread_id, region) in regions.into_iter().enumerate() {
            let stats = Arc::clone(&stats);
            let should_stop = Arc::clone(&should_stop);
            let failure_tx = failure_tx.clone();
            let tests = tests.clone();
            let progress = multi_progress.add(ProgressBar::new(tests.len() as u64));
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg}\n{bar:40.cyan/blue} {pos}/{len}")
            {
                progress.set_style(style.progress_chars("=>-"));
            }

            let handle = std::thread::spawn(move || {
                worker_thread(Worker {
                    thread_id,
                    region,
                    tests,
                    loops,
                    stats,
                    should_stop,
                    failure_tx,
                    progress,
                })
            });
            thread_handles.push(handle);
        }

        drop(failure_tx);

        // Failure collector thread
        let verbose = self.config.verbose;
        let collector_progress = multi_progress.clone();
        let failure_handler = std::thread::spawn(move || {
            let mut failures = Vec::new();
            while let Ok(failure) = failure_rx.recv() {
                if verbose {
                    for fault in &failure.faults {
                        collector_progress.println(fault.to_string()).ok();
                    }
                }
                failures.push(failure);
            }
            failures
        });

        // Wait for all worker threads
        let loops_completed = thread_handles
            .into_iter()
            .map(|handle| handle.join().expect("Worker thread panicked"))
            .min()
            .unwrap_or(0);

        should_stop.store(true, Ordering::Relaxed);
        stats_thread.join().expect("Stats thread panicked");

        let failures = failure_handler
            .join()
            .expect("Failure collector thread panicked");

        Ok(MemTestReport {
            failures,
            loops_completed,
            bytes: actual_bytes,
        })
    }
}

/// Everything a worker thread owns.
struct Worker {
    thread_id: usize,
    region: LockedRegion,
    tests: Vec<MemTest>,
    loops: u64,
    stats: Arc<StressStats>,
    should_stop: Arc<AtomicBool>,
    failure_tx: channel::Sender<TestFailure>,
    progress: ProgressBar,
}

/// Runs the test suite over one region. Returns the number of loops completed.
fn worker_thread(mut worker: Worker) -> u64 {
    let mut rng = StdRng::from_entropy();
    let region_bytes = worker.region.len_bytes() as u64;
    let loops_label = if worker.loops == 0 {
        "inf".to_string()
    } else {
        worker.loops.to_string()
    };

    let mut completed = 0u64;
    while worker.loops == 0 || completed < worker.loops {
        let loop_no = completed + 1;
        worker.progress.set_position(0);

        for &test in &worker.tests {
            if worker.should_stop.load(Ordering::Relaxed) {
                worker
                    .progress
                    .finish_with_message(format!("Thread {} stopped", worker.thread_id));
                return completed;
            }

            worker.progress.set_message(format!(
                "Thread {} - Loop {}/{} - {}",
                worker.thread_id,
                loop_no,
                loops_label,
                test.name()
            ));

            let outcome = test.run(worker.region.words_mut(), &mut rng, &worker.should_stop);
            let interrupted = outcome.interrupted;
            if !interrupted {
                worker.stats.add_bytes(region_bytes);
                worker.stats.add_test();
                worker.progress.inc(1);
            }

            if !outcome.is_ok() {
                worker.stats.add_faults(outcome.failures);
                let failure = TestFailure::from_outcome(test, worker.thread_id, loop_no, outcome);
                if worker.failure_tx.send(failure).is_err() {
                    return completed;
                }
            }

            if interrupted {
                worker
                    .progress
                    .finish_with_message(format!("Thread {} stopped", worker.thread_id));
                return completed;
            }
        }

        completed += 1;
    }

    worker
        .progress
        .finish_with_message(format!("Thread {} complete", worker.thread_id));
    completed
}
