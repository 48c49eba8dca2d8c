use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ultra::config::Opts;
use ultra::run::{CancelToken, Profiler};

/// Sampling CPU profiler for .NET applications.
///
/// Attaches to running processes or launches one, samples every thread,
/// correlates with runtime events, and writes a gzipped trace for
/// https://profiler.firefox.com.
#[derive(Debug, Parser)]
#[command(name = "ultra", version)]
struct Cli {
    /// Process id to profile; repeatable.
    #[arg(long = "pid", value_name = "PID")]
    pids: Vec<u32>,

    /// Stop after this many seconds (default: until the target exits).
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,

    /// Wait this many seconds after starting before profiling.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.0)]
    delay: f64,

    /// Sampling interval in milliseconds.
    #[arg(long = "sampling-interval-ms", default_value_t = 1.0)]
    sampling_interval_ms: f64,

    /// Start paused; press Enter to begin profiling.
    #[arg(long)]
    paused: bool,

    /// Output base name (default: ultra_<process>_<timestamp>).
    #[arg(short = 'o', long = "output", value_name = "NAME")]
    output_base: Option<String>,

    /// Directory for the trace and intermediate files.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Extra symbol search path.
    #[arg(long, value_name = "DIR")]
    symbol_path: Option<PathBuf>,

    /// Keep the intermediate .nettrace files next to the trace.
    #[arg(long)]
    keep_intermediates: bool,

    /// Skip the end-of-session rundown.
    #[arg(long)]
    no_rundown: bool,

    /// Sampler library to preload into a launched program.
    #[arg(long, value_name = "PATH")]
    sampler_lib: Option<PathBuf>,

    /// Program to launch and profile, with its arguments.
    #[arg(trailing_var_arg = true, value_name = "PROGRAM [ARGS]...")]
    command: Vec<String>,
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_sigint(_: i32) {
    if let Some(cancel) = CANCEL.get() {
        cancel.cancel();
    }
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let filter = EnvFilter::try_from_env("ULTRA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let opts = Opts {
        pids: cli.pids,
        program: cli.command.first().map(PathBuf::from),
        program_args: cli.command.iter().skip(1).cloned().collect(),
        sampler_lib: cli.sampler_lib,
        duration: cli.duration.map(Duration::from_secs_f64),
        delay: Duration::from_secs_f64(cli.delay),
        sampling_interval_ms: cli.sampling_interval_ms,
        keep_intermediates: cli.keep_intermediates,
        rundown: !cli.no_rundown,
        output_base: cli.output_base,
        output_dir: cli.output_dir,
        symbol_path: cli.symbol_path,
        ..Opts::default()
    };
    let cancel = CancelToken::new();
    CANCEL.set(cancel.clone()).ok();
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_sigint as libc::sighandler_t);
    }

    let mut profiler = match Profiler::new(opts, cancel) {
        Ok(profiler) => profiler,
        Err(e) => {
            eprintln!("ultra: {e}");
            return e.exit_code();
        }
    };
    profiler.set_progress(Box::new(|msg| eprintln!("ultra: {msg}")));

    if cli.paused {
        let go = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&go);
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            flag.store(true, Ordering::Release);
        });
        eprintln!("ultra: paused, press Enter to start profiling");
        profiler.set_should_start(Box::new(move || go.load(Ordering::Acquire)));
    }

    match profiler.run() {
        Ok(outcome) => {
            if outcome.cancelled {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("ultra: {e}");
            e.exit_code()
        }
    }
}
