//! Whole-process sampling profiler for .NET applications.
//!
//! `ultra` attaches to (or spawns) a .NET process, samples the native call
//! stack of every thread at a fixed interval, correlates the samples with
//! runtime events (module/method loads, JIT compiles, GC phases, allocation
//! ticks) collected over the diagnostic port, and writes a single
//! gzip-compressed trace consumable by the [Firefox Profiler](https://profiler.firefox.com).
//!
//! ## Example
//!
//! Profile a running process for ten seconds:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ultra::config::Opts;
//! use ultra::run::{CancelToken, Profiler};
//!
//! let mut opts = Opts::default();
//! opts.pids = vec![12345];
//! opts.duration = Some(Duration::from_secs(10));
//!
//! let profiler = Profiler::new(opts, CancelToken::new()).unwrap();
//! let outcome = profiler.run().unwrap();
//! println!("wrote {}", outcome.output_path.unwrap().display());
//! ```
//!
//! ## Pipeline
//!
//! Two event streams leave the target process: the injected sampler library
//! emits [`CallStack`][record::CallStack] events over its private diagnostic
//! socket, and the runtime emits method/GC events over its own. Each stream
//! is copied verbatim to an intermediate file by a
//! [`Session`][session::Session]; after both sessions stop, the
//! [converter][convert] merges the files by timestamp and interns every
//! frame, stack, method and string into the columnar
//! [profile model][profile].

pub mod codec;
pub mod config;
pub mod convert;
mod error;
pub(crate) mod ffi;
pub mod profile;
pub mod record;
pub mod registry;
pub mod run;
pub mod sampler;
pub mod session;

pub use error::{Error, Result};
