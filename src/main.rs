mod error;
mod framebuffer;
#[cfg(feature = "gpu")]
mod gpu;
mod kmod;
mod memtester;
mod memtests;
mod region;
mod stats;
mod traits;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use clap::{CommandFactory, Parser};
use env_logger::Env;
use framebuffer::Unblanker;
use kmod::{LoadStatus, ModuleLoader};
use memtester::{MemTester, MemTesterConfig, EXIT_FAIL_NONSTARTER};
use stats::StressStats;
use traits::spawn_load;

#[cfg(feature = "gpu")]
use gpu::{GpuLoad, RenderConfig};

/// Faults printed in the final summary; the rest are only counted.
const MAX_REPORTED_FAULTS: usize = 32;

const BANNER_WIDTH: usize = 64;

/// Delay between starting the background loads and starting memtester.
const STARTUP_DELAY: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Test RAM while the GPU renders in the background",
    long_about = None
)]
struct Args {
    /// Memory to test, with optional B, K, M or G suffix (bare number: MB)
    memory: Option<String>,

    /// Number of test loops (0 or omitted: run until stopped)
    loops: Option<u64>,

    /// Kernel module providing the GPU driver
    #[arg(long, default_value = kmod::DEFAULT_MODULE)]
    kernel_module: String,

    /// Framebuffer device kept unblanked
    #[arg(long, default_value = framebuffer::DEFAULT_DEVICE)]
    framebuffer: PathBuf,

    /// Do not keep the display unblanked
    #[arg(long, default_value_t = false)]
    no_unblank: bool,

    /// Run memtester alone, without GPU load or unblanking
    #[arg(long, default_value_t = false)]
    no_gpu: bool,

    /// Select GPU by index (use --list-gpus to see available)
    #[arg(long)]
    gpu_index: Option<usize>,

    /// List available GPUs and exit
    #[arg(long, default_value_t = false)]
    list_gpus: bool,

    /// Timeout per GPU frame in seconds
    #[arg(long, default_value_t = 30)]
    gpu_timeout: u64,

    #[arg(short, long, help = "Number of threads (default: CPU count)")]
    threads: Option<usize>,

    #[arg(short, long, help = "Duration to run (e.g., '5m', '1h', 'infinite')")]
    duration: Option<String>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_duration(s: &str) -> Option<Duration> {
    if s.to_lowercase() == "infinite" {
        return None;
    }
    humantime::parse_duration(s).ok()
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("{}", banner());
    println!();

    if args.list_gpus {
        list_gpus();
        std::process::exit(0);
    }

    let Some(memory) = args.memory.as_deref() else {
        if let Err(e) = Args::command().print_help() {
            log::warn!("could not print usage: {}", e);
        }
        std::process::exit(EXIT_FAIL_NONSTARTER);
    };

    let bytes = match memtester::parse_memory_size(memory) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_FAIL_NONSTARTER);
        }
    };

    let timeout = match args.duration.as_deref() {
        Some(s) => {
            let parsed = parse_duration(s);
            if parsed.is_none() && !s.eq_ignore_ascii_case("infinite") {
                eprintln!("Error: invalid duration {:?}", s);
                std::process::exit(EXIT_FAIL_NONSTARTER);
            }
            parsed
        }
        None => None,
    };

    let stats = Arc::new(StressStats::new());
    let should_stop = Arc::new(AtomicBool::new(false));

    let ctrlc_stop = Arc::clone(&should_stop);
    if let Err(e) = ctrlc::set_handler(move || ctrlc_stop.store(true, Ordering::Relaxed)) {
        log::warn!("could not install Ctrl-C handler: {}", e);
    }

    if !args.no_gpu {
        start_background_loads(&args, &stats, &should_stop);
        std::thread::sleep(STARTUP_DELAY);
        println!();
    }

    let tester = MemTester::new(MemTesterConfig {
        bytes,
        loops: args.loops.unwrap_or(0),
        threads: args.threads,
        timeout,
        lock: true,
        verbose: args.verbose,
    });

    log::debug!("memtester running on {} threads", tester.num_threads());

    let start_time = Instant::now();
    let report = match tester.run(Arc::clone(&stats), Arc::clone(&should_stop)) {
        Ok(report) => report,
        Err(e) => {
            should_stop.store(true, Ordering::Relaxed);
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_FAIL_NONSTARTER);
        }
    };
    should_stop.store(true, Ordering::Relaxed);

    println!();
    println!("Test Complete");
    println!("=============");
    println!(
        "Memory tested: {} x {} loops",
        ByteSize::b(report.bytes as u64).to_string_as(true),
        report.loops_completed
    );
    println!(
        "Total bytes tested: {}",
        ByteSize::b(stats.get_bytes()).to_string_as(true)
    );
    println!("Total tests completed: {}", stats.get_tests());
    println!("Frames rendered: {}", stats.get_frames());
    println!("Unblank calls: {}", stats.get_unblanks());
    println!("Faults found: {}", report.total_failures());
    println!("Duration: {:.2}s", start_time.elapsed().as_secs_f64());

    if report.failures.is_empty() {
        println!();
        println!("SUCCESS: No memory errors detected!");
    } else {
        println!();
        println!("MEMORY ERRORS DETECTED:");
        println!("=======================");
        for failure in &report.failures {
            println!(
                "{}: {} bad words (thread {}, loop {})",
                failure.test.name(),
                failure.failures,
                failure.thread_id,
                failure.loop_no
            );
        }
        for fault in report
            .failures
            .iter()
            .flat_map(|f| &f.faults)
            .take(MAX_REPORTED_FAULTS)
        {
            println!("  {}", fault);
        }
    }

    std::process::exit(report.exit_code());
}

fn banner() -> String {
    [
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        "=".repeat(BANNER_WIDTH),
        "A triangle fan renderer on the GPU and a memtester, combined in".to_string(),
        "a single program. The GPU is only used to stress RAM in the".to_string(),
        "background, but this significantly increases the chances of".to_string(),
        "exposing memory stability problems.".to_string(),
    ]
    .join("\n")
}

/// Loads the GPU driver and starts the fire-and-forget GPU and unblank loads.
fn start_background_loads(args: &Args, stats: &Arc<StressStats>, should_stop: &Arc<AtomicBool>) {
    match ModuleLoader::default().ensure_loaded(&args.kernel_module) {
        Ok(LoadStatus::AlreadyLoaded) => {}
        Ok(LoadStatus::Loaded) => log::info!("loaded kernel module {}", args.kernel_module),
        Err(e) => log::warn!("{}", e),
    }

    #[cfg(feature = "gpu")]
    {
        let load = GpuLoad::new(
            args.gpu_index,
            RenderConfig {
                timeout_secs: args.gpu_timeout,
                ..Default::default()
            },
            args.verbose,
        );
        if let Err(e) = spawn_load(load, Arc::clone(stats), Arc::clone(should_stop)) {
            log::error!("could not start GPU load: {}", e);
            std::process::abort();
        }
    }
    #[cfg(not(feature = "gpu"))]
    {
        log::warn!("GPU support not compiled, running without GPU load");
    }

    if !args.no_unblank {
        let load = Unblanker::for_device(args.framebuffer.clone());
        if let Err(e) = spawn_load(load, Arc::clone(stats), Arc::clone(should_stop)) {
            log::error!("could not start unblank load: {}", e);
            std::process::abort();
        }
    }
}

fn list_gpus() {
    #[cfg(feature = "gpu")]
    {
        let gpus = gpu::enumerate_gpus();
        if gpus.is_empty() {
            println!("No GPUs found.");
        } else {
            println!("Available GPUs:");
            for gpu_info in &gpus {
                println!("  {}", gpu_info);
            }
            println!();
            println!("Use --gpu-index N to select a specific GPU");
        }
    }
    #[cfg(not(feature = "gpu"))]
    {
        println!("GPU support not compiled. Build with: cargo build --features gpu");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_minutes() {
        let duration = parse_duration("5m");
        assert!(duration.is_some());
        assert_eq!(duration.unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_hours() {
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_duration_infinite() {
        assert!(parse_duration("infinite").is_none());
        assert!(parse_duration("INFINITE").is_none());
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("invalid").is_none());
        assert!(parse_duration("").is_none());
    }

    #[test]
    fn test_memtester_positionals() {
        let args = Args::parse_from(["lima-memtester", "256M", "3"]);
        assert_eq!(args.memory.as_deref(), Some("256M"));
        assert_eq!(args.loops, Some(3));
    }

    #[test]
    fn test_no_arguments() {
        let args = Args::parse_from(["lima-memtester"]);
        assert!(args.memory.is_none());
        assert!(args.loops.is_none());
        assert!(!args.no_gpu);
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["lima-memtester", "64"]);
        assert_eq!(args.kernel_module, "mali");
        assert_eq!(args.framebuffer, PathBuf::from("/dev/fb0"));
        assert_eq!(args.gpu_timeout, 30);
        assert!(!args.no_unblank);
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "lima-memtester",
            "--kernel-module",
            "lima",
            "--framebuffer",
            "/dev/fb1",
            "--no-unblank",
            "--gpu-index",
            "1",
            "-t",
            "2",
            "-d",
            "10m",
            "1G",
        ]);
        assert_eq!(args.kernel_module, "lima");
        assert_eq!(args.framebuffer, PathBuf::from("/dev/fb1"));
        assert!(args.no_unblank);
        assert_eq!(args.gpu_index, Some(1));
        assert_eq!(args.threads, Some(2));
        assert_eq!(args.duration.as_deref(), Some("10m"));
        assert_eq!(args.memory.as_deref(), Some("1G"));
    }

    #[test]
    fn test_parse_list_gpus() {
        let args = Args::parse_from(["lima-memtester", "--list-gpus"]);
        assert!(args.list_gpus);
    }

    #[test]
    fn test_rejects_bad_loops() {
        assert!(Args::try_parse_from(["lima-memtester", "64", "many"]).is_err());
    }

    #[test]
    fn test_banner_explains_background_gpu() {
        let banner = banner();
        assert!(banner.starts_with("lima-memtester "));
        assert!(banner.contains("stress RAM in the\nbackground"));
        assert!(banner.lines().all(|line| line.len() <= BANNER_WIDTH));
    }

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }
}
