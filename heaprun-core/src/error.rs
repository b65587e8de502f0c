//! Errors raised while constructing or applying the benchmark models.

use thiserror::Error;

/// Errors from the Modifier/Benchmark/Runtime/Suite model layer.
///
/// All of these are configuration-shaped problems: they surface at
/// construction or attachment time, never while a benchmark subprocess is
/// running.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("modifier '{0}' has '-' in its name; '-' is reserved for value options")]
    InvalidModifierName(String),

    #[error("{family} '{name}' is missing required field '{field}'")]
    MissingField {
        family: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("unknown {family} type '{tag}'")]
    UnknownType { family: &'static str, tag: String },

    #[error("{family} '{name}': {reason}")]
    BadField {
        family: &'static str,
        name: String,
        reason: String,
    },

    #[error("modifier set '{0}' must be flattened before being attached to a benchmark")]
    UnflattenedModifierSet(String),

    #[error("runtime '{runtime}' cannot drive {kind} benchmark '{benchmark}'")]
    IncompatibleRuntime {
        runtime: String,
        kind: &'static str,
        benchmark: String,
    },

    #[error("bad benchmark spec for suite '{suite}': {reason}")]
    BadBenchmarkSpec { suite: String, reason: String },

    #[error("malformed spec: {0}")]
    Spec(#[from] serde_yaml::Error),
}
