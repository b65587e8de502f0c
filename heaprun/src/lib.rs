//! # heaprun
//!
//! Controlled, repeatable performance experiments for managed-language
//! runtimes.
//!
//! heaprun reads a YAML configuration describing benchmark suites, runtimes,
//! and command-line/environment modifiers, and drives subprocess experiments
//! over them:
//! - **runbms**: sweep benchmarks across heap factors derived from measured
//!   minimum heap sizes, writing self-describing compressed logs
//! - **minheap**: bisect the smallest heap each benchmark survives
//! - **fillin**: explore a parameter space extremes-and-midpoint first so an
//!   interrupted sweep still yields usable data
//!
//! Benchmarks run strictly sequentially (one subprocess at a time) so
//! measurements are not perturbed by contention; an optional companion
//! process (a profiler or similar) is the only concurrency.

// Re-export the models
pub use heaprun_core::{
    run as run_benchmark, Benchmark, BenchmarkKind, BenchmarkSpec, ExecContext, ExecError,
    ModelError, Modifier, ModifierKind, ProcessExit, Runtime, RunOutput, Suite, DEFAULT_MINHEAP,
};

// Re-export configuration handling
pub use heaprun_cli::{
    config_index_to_chr, config_str_encode, ConfigError, Configuration, ResolvedConfiguration,
    RunbmsPlugin,
};

/// Run the heaprun CLI. The binary's `main()` matches on the result and
/// maps it to an exit code.
pub use heaprun_cli::run;
