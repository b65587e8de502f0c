//! Core models for config-driven performance experiments on
//! managed-language runtimes.
//!
//! The pieces fit together like this: a [`suite::Suite`] turns configuration
//! entries into [`benchmark::Benchmark`]s; [`modifier::Modifier`]s specialize
//! a benchmark (copy-then-modify); a [`runtime::Runtime`] supplies the
//! executable, heap-size modifiers, and OOM detection; and [`exec::run`]
//! drives one invocation to completion with timeout and companion handling.

pub mod benchmark;
pub mod error;
pub mod exec;
pub mod modifier;
pub mod runtime;
pub mod suite;
pub mod util;

pub use benchmark::{Benchmark, BenchmarkKind};
pub use error::ModelError;
pub use exec::{run, ExecContext, ExecError, ProcessExit, RunOutput};
pub use modifier::{Modifier, ModifierKind};
pub use runtime::Runtime;
pub use suite::{BenchmarkSpec, Suite, DEFAULT_MINHEAP};
