//! Benchmark suites: factories that turn suite-level configuration into
//! concrete [`Benchmark`]s, and the per-suite pass/minheap knowledge the
//! drivers need.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{info, warn};

use crate::benchmark::{Benchmark, BenchmarkKind};
use crate::error::ModelError;
use crate::util::split_quoted;

/// Used when a suite has no minheap profile (or entry) for a benchmark.
pub const DEFAULT_MINHEAP: u64 = 4096;

/// Number of timing iterations, or iterate-until-converged.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimingIteration {
    Iterations(u64),
    Keyword(String),
}

impl TimingIteration {
    fn validate(&self, suite: &str) -> Result<(), ModelError> {
        match self {
            TimingIteration::Iterations(_) => Ok(()),
            TimingIteration::Keyword(k) if k == "converge" => Ok(()),
            TimingIteration::Keyword(k) => Err(ModelError::BadField {
                family: "suite",
                name: suite.to_string(),
                reason: format!("timing_iteration '{}' is neither an integer nor 'converge'", k),
            }),
        }
    }

    fn as_int(&self, suite: &str) -> Result<u64, ModelError> {
        match self {
            TimingIteration::Iterations(n) => Ok(*n),
            TimingIteration::Keyword(_) => Err(ModelError::BadField {
                family: "suite",
                name: suite.to_string(),
                reason: "timing_iteration must be an integer for this suite".to_string(),
            }),
        }
    }
}

/// A benchmark entry under `benchmarks.<suite>`: either a bare name, or a
/// name plus per-benchmark overrides of suite defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BenchmarkSpec {
    Name(String),
    Detailed {
        name: String,
        bm_name: String,
        #[serde(default)]
        timing_iteration: Option<TimingIteration>,
        #[serde(default)]
        size: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

impl BenchmarkSpec {
    pub fn name(&self) -> &str {
        match self {
            BenchmarkSpec::Name(n) => n,
            BenchmarkSpec::Detailed { name, .. } => name,
        }
    }
}

/// A wrapper or companion selection: one command line for every benchmark,
/// or a per-benchmark table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PerBenchmark {
    All(String),
    Table(BTreeMap<String, String>),
}

impl PerBenchmark {
    fn get(&self, bm_name: &str) -> Option<Vec<String>> {
        match self {
            PerBenchmark::All(s) => Some(split_quoted(s)),
            PerBenchmark::Table(t) => t.get(bm_name).map(|s| split_quoted(s)),
        }
    }
}

fn per_benchmark(sel: &Option<PerBenchmark>, bm_name: &str) -> Vec<String> {
    sel.as_ref()
        .and_then(|s| s.get(bm_name))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
struct BinaryProgram {
    path: PathBuf,
    args: String,
}

#[derive(Debug, Deserialize)]
struct BinarySpec {
    programs: BTreeMap<String, BinaryProgram>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DaCapoSpec {
    release: String,
    path: PathBuf,
    timing_iteration: TimingIteration,
    #[serde(default)]
    minheap: Option<String>,
    #[serde(default)]
    minheap_values: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    callback: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    wrapper: Option<PerBenchmark>,
    #[serde(default)]
    companion: Option<PerBenchmark>,
    #[serde(default = "default_size")]
    size: String,
}

fn default_size() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
struct OctaneSpec {
    path: PathBuf,
    wrapper: PathBuf,
    timing_iteration: TimingIteration,
    #[serde(default)]
    minheap: Option<String>,
    #[serde(default)]
    minheap_values: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SpecJvm98Spec {
    release: String,
    path: PathBuf,
    timing_iteration: TimingIteration,
}

/// A declared benchmark suite.
#[derive(Debug)]
pub enum Suite {
    BinaryBenchmarkSuite { name: String, spec: BinarySpecOwned },
    DaCapo { name: String, spec: DaCapoSpecOwned },
    Octane { name: String, spec: OctaneSpecOwned },
    SpecJvm98 { name: String, spec: SpecJvm98Owned },
}

/// Validated fields of a `BinaryBenchmarkSuite` entry.
#[derive(Debug)]
pub struct BinarySpecOwned {
    programs: BTreeMap<String, (PathBuf, Vec<String>)>,
    timeout: Option<u64>,
}

/// Validated fields of a `DaCapo` entry.
#[derive(Debug)]
pub struct DaCapoSpecOwned {
    release: String,
    path: PathBuf,
    timing_iteration: TimingIteration,
    minheap: Option<String>,
    minheap_values: BTreeMap<String, BTreeMap<String, u64>>,
    callback: Option<String>,
    timeout: Option<u64>,
    wrapper: Option<PerBenchmark>,
    companion: Option<PerBenchmark>,
    size: String,
}

/// Validated fields of an `Octane` entry.
#[derive(Debug)]
pub struct OctaneSpecOwned {
    path: PathBuf,
    wrapper: PathBuf,
    timing_iteration: u64,
    minheap: Option<String>,
    minheap_values: BTreeMap<String, BTreeMap<String, u64>>,
    timeout: Option<u64>,
}

/// Validated fields of a `SPECjvm98` entry.
#[derive(Debug)]
pub struct SpecJvm98Owned {
    path: PathBuf,
    timing_iteration: u64,
}

type SuiteCtor = fn(&str, &serde_yaml::Value) -> Result<Suite, ModelError>;

static SUITE_TYPES: &[(&str, SuiteCtor)] = &[
    ("BinaryBenchmarkSuite", binary_ctor),
    ("DaCapo", dacapo_ctor),
    ("Octane", octane_ctor),
    ("SPECjvm98", specjvm98_ctor),
];

fn binary_ctor(name: &str, value: &serde_yaml::Value) -> Result<Suite, ModelError> {
    let spec: BinarySpec = serde_yaml::from_value(value.clone())?;
    Ok(Suite::BinaryBenchmarkSuite {
        name: name.to_string(),
        spec: BinarySpecOwned {
            programs: spec
                .programs
                .into_iter()
                .map(|(k, v)| (k, (v.path, split_quoted(&v.args))))
                .collect(),
            timeout: spec.timeout,
        },
    })
}

fn dacapo_ctor(name: &str, value: &serde_yaml::Value) -> Result<Suite, ModelError> {
    let spec: DaCapoSpec = serde_yaml::from_value(value.clone())?;
    if !["2006", "9.12", "evaluation"].contains(&spec.release.as_str()) {
        return Err(ModelError::BadField {
            family: "suite",
            name: name.to_string(),
            reason: format!("DaCapo release '{}' not recognized", spec.release),
        });
    }
    if !spec.path.exists() {
        warn!("DaCapo jar {} not found", spec.path.display());
    }
    spec.timing_iteration.validate(name)?;
    if let Some(profile) = &spec.minheap {
        if !spec.minheap_values.contains_key(profile) {
            return Err(ModelError::BadField {
                family: "suite",
                name: name.to_string(),
                reason: format!("'{}' is not an entry of minheap_values", profile),
            });
        }
    }
    Ok(Suite::DaCapo {
        name: name.to_string(),
        spec: DaCapoSpecOwned {
            release: spec.release,
            path: spec.path,
            timing_iteration: spec.timing_iteration,
            minheap: spec.minheap,
            minheap_values: spec.minheap_values,
            callback: spec.callback,
            timeout: spec.timeout,
            wrapper: spec.wrapper,
            companion: spec.companion,
            size: spec.size,
        },
    })
}

fn octane_ctor(name: &str, value: &serde_yaml::Value) -> Result<Suite, ModelError> {
    let spec: OctaneSpec = serde_yaml::from_value(value.clone())?;
    if !spec.path.exists() {
        info!("Octane folder {} not found", spec.path.display());
    }
    if !spec.wrapper.exists() {
        info!("Octane wrapper {} not found", spec.wrapper.display());
    }
    if let Some(profile) = &spec.minheap {
        if !spec.minheap_values.contains_key(profile) {
            return Err(ModelError::BadField {
                family: "suite",
                name: name.to_string(),
                reason: format!("'{}' is not an entry of minheap_values", profile),
            });
        }
    }
    Ok(Suite::Octane {
        name: name.to_string(),
        spec: OctaneSpecOwned {
            path: spec.path,
            wrapper: spec.wrapper,
            timing_iteration: spec.timing_iteration.as_int(name)?,
            minheap: spec.minheap,
            minheap_values: spec.minheap_values,
            timeout: spec.timeout,
        },
    })
}

fn specjvm98_ctor(name: &str, value: &serde_yaml::Value) -> Result<Suite, ModelError> {
    let spec: SpecJvm98Spec = serde_yaml::from_value(value.clone())?;
    if spec.release != "1.03_05" {
        return Err(ModelError::BadField {
            family: "suite",
            name: name.to_string(),
            reason: format!("SPECjvm98 release '{}' not recognized", spec.release),
        });
    }
    if !spec.path.join("SpecApplication.class").exists() {
        info!(
            "SpecApplication.class not found under {}",
            spec.path.display()
        );
    }
    Ok(Suite::SpecJvm98 {
        name: name.to_string(),
        spec: SpecJvm98Owned {
            path: spec.path,
            timing_iteration: spec.timing_iteration.as_int(name)?,
        },
    })
}

impl Suite {
    /// Instantiate a suite from its configuration entry.
    pub fn from_spec(name: &str, value: &serde_yaml::Value) -> Result<Suite, ModelError> {
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ModelError::MissingField {
                family: "suite",
                name: name.to_string(),
                field: "type",
            })?;
        let ctor = SUITE_TYPES
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| ModelError::UnknownType {
                family: "suite",
                tag: tag.to_string(),
            })?;
        ctor(name, value)
    }

    pub fn name(&self) -> &str {
        match self {
            Suite::BinaryBenchmarkSuite { name, .. }
            | Suite::DaCapo { name, .. }
            | Suite::Octane { name, .. }
            | Suite::SpecJvm98 { name, .. } => name,
        }
    }

    /// Produce the concrete benchmark for a `benchmarks` entry.
    pub fn get_benchmark(&self, bm_spec: &BenchmarkSpec) -> Result<Benchmark, ModelError> {
        match self {
            Suite::BinaryBenchmarkSuite { name, spec } => {
                let bm_name = only_plain_name(name, bm_spec)?;
                let (path, args) =
                    spec.programs
                        .get(bm_name)
                        .ok_or_else(|| ModelError::BadBenchmarkSpec {
                            suite: name.clone(),
                            reason: format!("no program named '{}'", bm_name),
                        })?;
                Ok(base_benchmark(
                    bm_name,
                    name,
                    spec.timeout,
                    None,
                    BenchmarkKind::Binary {
                        program: path.clone(),
                        program_args: args.clone(),
                    },
                ))
            }
            Suite::DaCapo { name, spec } => dacapo_benchmark(name, spec, bm_spec),
            Suite::Octane { name, spec } => {
                let bm_name = only_plain_name(name, bm_spec)?;
                Ok(base_benchmark(
                    bm_name,
                    name,
                    spec.timeout,
                    None,
                    BenchmarkKind::JavaScript {
                        js_args: Vec::new(),
                        program: spec.wrapper.clone(),
                        program_args: vec![
                            spec.path.to_string_lossy().into_owned(),
                            bm_name.to_string(),
                            spec.timing_iteration.to_string(),
                        ],
                    },
                ))
            }
            Suite::SpecJvm98 { name, spec } => {
                let bm_name = only_plain_name(name, bm_spec)?;
                Ok(base_benchmark(
                    bm_name,
                    name,
                    None,
                    Some(spec.path.clone()),
                    BenchmarkKind::Java {
                        jvm_args: Vec::new(),
                        classpath: vec![spec.path.to_string_lossy().into_owned()],
                        program_args: vec![
                            "SpecApplication".to_string(),
                            format!("-i{}", spec.timing_iteration),
                            bm_name.to_string(),
                        ],
                    },
                ))
            }
        }
    }

    /// The suite's measured minimum heap for a benchmark, in MB.
    pub fn get_minheap(&self, bm_name: &str) -> u64 {
        match self {
            Suite::BinaryBenchmarkSuite { .. } => {
                warn!("minheap is not respected for BinaryBenchmarkSuite");
                0
            }
            Suite::DaCapo { name, spec } => {
                minheap_lookup(name, &spec.minheap, &spec.minheap_values, bm_name)
            }
            Suite::Octane { name, spec } => {
                minheap_lookup(name, &spec.minheap, &spec.minheap_values, bm_name)
            }
            // SPEC recommends a minimum heap of 32 MB.
            Suite::SpecJvm98 { .. } => 32,
        }
    }

    /// Whether the captured output shows the benchmark validated its work.
    pub fn is_passed(&self, output: &[u8]) -> bool {
        match self {
            // No generic way to know for arbitrary binaries.
            Suite::BinaryBenchmarkSuite { .. } => true,
            Suite::DaCapo { .. } | Suite::Octane { .. } => {
                output.windows(6).any(|w| w == b"PASSED")
            }
            Suite::SpecJvm98 { .. } => !output.windows(13).any(|w| w == b"**NOT VALID**"),
        }
    }
}

fn only_plain_name<'a>(suite: &str, bm_spec: &'a BenchmarkSpec) -> Result<&'a str, ModelError> {
    match bm_spec {
        BenchmarkSpec::Name(n) => Ok(n),
        BenchmarkSpec::Detailed { .. } => Err(ModelError::BadBenchmarkSpec {
            suite: suite.to_string(),
            reason: "per-benchmark overrides are only supported for DaCapo".to_string(),
        }),
    }
}

fn base_benchmark(
    name: &str,
    suite_name: &str,
    timeout: Option<u64>,
    override_cwd: Option<PathBuf>,
    kind: BenchmarkKind,
) -> Benchmark {
    Benchmark {
        name: name.to_string(),
        suite_name: suite_name.to_string(),
        env_args: BTreeMap::new(),
        wrapper: Vec::new(),
        companion: Vec::new(),
        timeout,
        override_cwd,
        kind,
    }
}

fn dacapo_benchmark(
    suite_name: &str,
    spec: &DaCapoSpecOwned,
    bm_spec: &BenchmarkSpec,
) -> Result<Benchmark, ModelError> {
    let mut timing_iteration = spec.timing_iteration.clone();
    let mut timeout = spec.timeout;
    let mut size = spec.size.clone();
    let (name, bm_name) = match bm_spec {
        BenchmarkSpec::Name(n) => (n.as_str(), n.as_str()),
        BenchmarkSpec::Detailed {
            name,
            bm_name,
            timing_iteration: ti,
            size: s,
            timeout: t,
        } => {
            if let Some(ti) = ti {
                ti.validate(suite_name)?;
                timing_iteration = ti.clone();
            }
            if let Some(s) = s {
                size = s.clone();
            }
            if let Some(t) = t {
                timeout = Some(*t);
            }
            (name.as_str(), bm_name.as_str())
        }
    };

    // With a callback the harness class is loaded from the classpath; the
    // plain case just runs the jar.
    let jar = spec.path.to_string_lossy().into_owned();
    let (classpath, mut program_args) = match &spec.callback {
        Some(callback) => (
            vec![jar],
            vec![
                "Harness".to_string(),
                "-c".to_string(),
                callback.clone(),
            ],
        ),
        None => (Vec::new(), vec!["-jar".to_string(), jar]),
    };
    match &timing_iteration {
        TimingIteration::Iterations(n) => {
            program_args.push("-n".to_string());
            program_args.push(n.to_string());
        }
        // The 2006 release predates double-dash long options.
        TimingIteration::Keyword(_) if spec.release == "2006" => {
            program_args.push("-converge".to_string())
        }
        TimingIteration::Keyword(_) => program_args.push("--converge".to_string()),
    }
    program_args.push("-s".to_string());
    program_args.push(size);
    program_args.push(bm_name.to_string());

    let mut bm = base_benchmark(
        name,
        suite_name,
        timeout,
        None,
        BenchmarkKind::Java {
            jvm_args: Vec::new(),
            classpath,
            program_args,
        },
    );
    bm.wrapper = per_benchmark(&spec.wrapper, bm_name);
    bm.companion = per_benchmark(&spec.companion, bm_name);
    Ok(bm)
}

fn minheap_lookup(
    suite: &str,
    profile: &Option<String>,
    values: &BTreeMap<String, BTreeMap<String, u64>>,
    bm_name: &str,
) -> u64 {
    let Some(profile) = profile else {
        warn!("no minheap_values profile of {} is selected", suite);
        return DEFAULT_MINHEAP;
    };
    match values.get(profile).and_then(|m| m.get(bm_name)) {
        Some(v) => *v,
        None => {
            warn!("minheap for {} of {} not set", bm_name, suite);
            DEFAULT_MINHEAP
        }
    }
}

impl std::fmt::Display for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suite::BinaryBenchmarkSuite { name, .. } => {
                write!(f, "Benchmark Suite {} BinaryBenchmarkSuite", name)
            }
            Suite::DaCapo { name, spec } => write!(
                f,
                "Benchmark Suite {} DaCapo {} {}",
                name,
                spec.release,
                spec.path.display()
            ),
            Suite::Octane { name, spec } => {
                write!(f, "Benchmark Suite {} Octane {}", name, spec.path.display())
            }
            Suite::SpecJvm98 { name, spec } => write!(
                f,
                "Benchmark Suite {} SPECjvm98 {}",
                name,
                spec.path.display()
            ),
        }
    }
}
