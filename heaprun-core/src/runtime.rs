//! Runtimes that execute benchmarks: JVMs, JavaScript engines, a
//! MMTk-backed Julia build, and a degenerate native-executable runtime.
//!
//! A runtime knows where its executable lives, how to express a heap-size
//! limit as modifiers, and how to recognize an out-of-memory condition in
//! captured output. Construction only warns about missing executables so
//! configurations can be resolved (and dry-run) on machines without the
//! toolchains installed.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::ModelError;
use crate::modifier::Modifier;
use crate::util::expand_env;

/// A managed (or native) runtime under test.
#[derive(Debug, Clone)]
pub enum Runtime {
    /// OpenJDK-derived JVM; `release` drives module-system quirks.
    OpenJdk {
        name: String,
        release: i64,
        home: PathBuf,
        executable: PathBuf,
    },
    /// JikesRVM research JVM.
    JikesRvm {
        name: String,
        home: PathBuf,
        executable: PathBuf,
    },
    /// V8's d8 shell.
    D8 { name: String, executable: PathBuf },
    /// SpiderMonkey's js shell.
    SpiderMonkey { name: String, executable: PathBuf },
    /// JavaScriptCore's jsc shell.
    JavaScriptCore { name: String, executable: PathBuf },
    /// Julia built against MMTk; heap bounds are passed via environment.
    JuliaMmtk { name: String, executable: PathBuf },
    /// Plain native binaries; the benchmark itself is the executable.
    NativeExecutable { name: String },
}

#[derive(Debug, Deserialize)]
struct JvmSpec {
    release: serde_yaml::Value,
    home: String,
}

#[derive(Debug, Deserialize)]
struct HomeSpec {
    home: String,
}

#[derive(Debug, Deserialize)]
struct ExecutableSpec {
    executable: String,
}

type RuntimeCtor = fn(&str, &serde_yaml::Value) -> Result<Runtime, ModelError>;

/// Name-to-constructor table for runtime types accepted in configuration.
static RUNTIME_TYPES: &[(&str, RuntimeCtor)] = &[
    ("OpenJDK", openjdk_ctor),
    ("JikesRVM", jikesrvm_ctor),
    ("D8", |n, v| {
        Ok(Runtime::D8 {
            name: n.to_string(),
            executable: checked_executable(v)?,
        })
    }),
    ("SpiderMonkey", |n, v| {
        Ok(Runtime::SpiderMonkey {
            name: n.to_string(),
            executable: checked_executable(v)?,
        })
    }),
    ("JavaScriptCore", |n, v| {
        Ok(Runtime::JavaScriptCore {
            name: n.to_string(),
            executable: checked_executable(v)?,
        })
    }),
    ("JuliaMMTK", |n, v| {
        Ok(Runtime::JuliaMmtk {
            name: n.to_string(),
            executable: checked_executable(v)?,
        })
    }),
    ("NativeExecutable", |n, _| {
        Ok(Runtime::NativeExecutable {
            name: n.to_string(),
        })
    }),
];

fn openjdk_ctor(name: &str, value: &serde_yaml::Value) -> Result<Runtime, ModelError> {
    let spec: JvmSpec = serde_yaml::from_value(value.clone())?;
    let release = parse_release(name, &spec.release)?;
    let home = PathBuf::from(expand_env(&spec.home));
    if !home.exists() {
        warn!("OpenJDK home {} doesn't exist", home.display());
    }
    let executable = home.join("bin").join("java");
    if !executable.exists() {
        warn!("{} not found in OpenJDK home", executable.display());
    }
    Ok(Runtime::OpenJdk {
        name: name.to_string(),
        release,
        home,
        executable,
    })
}

fn jikesrvm_ctor(name: &str, value: &serde_yaml::Value) -> Result<Runtime, ModelError> {
    let spec: HomeSpec = serde_yaml::from_value(value.clone())?;
    let home = PathBuf::from(expand_env(&spec.home));
    if !home.exists() {
        warn!("JikesRVM home {} doesn't exist", home.display());
    }
    let executable = home.join("rvm");
    if !executable.exists() {
        warn!("{} not found in JikesRVM home", executable.display());
    }
    Ok(Runtime::JikesRvm {
        name: name.to_string(),
        home,
        executable,
    })
}

fn checked_executable(value: &serde_yaml::Value) -> Result<PathBuf, ModelError> {
    let spec: ExecutableSpec = serde_yaml::from_value(value.clone())?;
    let executable = PathBuf::from(expand_env(&spec.executable));
    if !executable.exists() {
        warn!("runtime executable {} doesn't exist", executable.display());
    }
    Ok(executable)
}

fn parse_release(name: &str, release: &serde_yaml::Value) -> Result<i64, ModelError> {
    match release {
        serde_yaml::Value::Number(n) if n.as_i64().is_some() => Ok(n.as_i64().unwrap_or(0)),
        serde_yaml::Value::String(s) => {
            s.parse::<i64>().map_err(|_| ModelError::BadField {
                family: "runtime",
                name: name.to_string(),
                reason: format!("release '{}' is not int-like", s),
            })
        }
        other => Err(ModelError::BadField {
            family: "runtime",
            name: name.to_string(),
            reason: format!("release {:?} is not int-like", other),
        }),
    }
}

const JVM_OOM_PATTERNS: &[&[u8]] = &[
    b"Allocation Failed",
    b"OutOfMemoryError",
    b"ran out of memory",
    b"panicked at 'Out of memory!'",
];

const JULIA_OOM_PATTERNS: &[&[u8]] = &[b"Out of memory", b"GC error (probable corruption)"];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

impl Runtime {
    /// Instantiate a runtime from its configuration entry.
    pub fn from_spec(name: &str, value: &serde_yaml::Value) -> Result<Runtime, ModelError> {
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ModelError::MissingField {
                family: "runtime",
                name: name.to_string(),
                field: "type",
            })?;
        let ctor = RUNTIME_TYPES
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| ModelError::UnknownType {
                family: "runtime",
                tag: tag.to_string(),
            })?;
        ctor(name, value)
    }

    pub fn name(&self) -> &str {
        match self {
            Runtime::OpenJdk { name, .. }
            | Runtime::JikesRvm { name, .. }
            | Runtime::D8 { name, .. }
            | Runtime::SpiderMonkey { name, .. }
            | Runtime::JavaScriptCore { name, .. }
            | Runtime::JuliaMmtk { name, .. }
            | Runtime::NativeExecutable { name } => name,
        }
    }

    /// Path of the runtime executable, if the runtime has one.
    pub fn executable(&self) -> Option<&Path> {
        match self {
            Runtime::OpenJdk { executable, .. }
            | Runtime::JikesRvm { executable, .. }
            | Runtime::D8 { executable, .. }
            | Runtime::SpiderMonkey { executable, .. }
            | Runtime::JavaScriptCore { executable, .. }
            | Runtime::JuliaMmtk { executable, .. } => Some(executable),
            Runtime::NativeExecutable { .. } => None,
        }
    }

    /// Modifiers that constrain this runtime to a heap of `size_mb` megabytes.
    ///
    /// Most runtimes need a single argument modifier; the Julia runtime sets
    /// a pair of environment variables, hence the list.
    pub fn heapsize_modifiers(&self, size_mb: u64) -> Vec<Modifier> {
        match self {
            Runtime::OpenJdk { .. } | Runtime::JikesRvm { .. } => {
                vec![Modifier::jvm_arg(
                    format!("heap{}M", size_mb),
                    format!("-Xms{}M -Xmx{}M", size_mb, size_mb),
                )]
            }
            Runtime::D8 { .. } => vec![Modifier::js_arg(
                format!("heap{}", size_mb),
                format!(
                    "--initial-heap-size={} --max-heap-size={}",
                    size_mb, size_mb
                ),
            )],
            Runtime::SpiderMonkey { .. } => vec![Modifier::js_arg(
                format!("heap{}", size_mb),
                format!("--available-memory={}", size_mb),
            )],
            Runtime::JavaScriptCore { .. } => vec![Modifier::js_arg(
                format!("heap{}", size_mb),
                format!("--gcMaxHeapSize={}", size_mb),
            )],
            Runtime::JuliaMmtk { .. } => vec![
                Modifier::env_var(
                    format!("minheap{}M", size_mb),
                    "MMTK_MIN_HSIZE",
                    format!("{}M", size_mb),
                ),
                Modifier::env_var(
                    format!("maxheap{}M", size_mb),
                    "MMTK_MAX_HSIZE",
                    format!("{}M", size_mb),
                ),
            ],
            Runtime::NativeExecutable { name } => {
                warn!("heap size not supported for NativeExecutable '{}'", name);
                Vec::new()
            }
        }
    }

    /// Whether the captured output indicates an out-of-memory condition.
    pub fn is_oom(&self, output: &[u8]) -> bool {
        match self {
            Runtime::OpenJdk { .. } | Runtime::JikesRvm { .. } => JVM_OOM_PATTERNS
                .iter()
                .any(|pat| contains(output, pat)),
            Runtime::D8 { .. } => contains(output, b"Fatal javascript OOM in"),
            Runtime::JuliaMmtk { .. } => JULIA_OOM_PATTERNS
                .iter()
                .any(|pat| contains(output, pat)),
            // No reliable OOM signature is known for these engines.
            Runtime::SpiderMonkey { .. }
            | Runtime::JavaScriptCore { .. }
            | Runtime::NativeExecutable { .. } => false,
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runtime::OpenJdk { name, release, home, .. } => {
                write!(f, "OpenJDK {} {} {}", name, release, home.display())
            }
            Runtime::JikesRvm { name, home, .. } => {
                write!(f, "JikesRVM {} {}", name, home.display())
            }
            Runtime::D8 { name, executable } => write!(f, "d8 {} {}", name, executable.display()),
            Runtime::SpiderMonkey { name, executable } => {
                write!(f, "SpiderMonkey {} {}", name, executable.display())
            }
            Runtime::JavaScriptCore { name, executable } => {
                write!(f, "JavaScriptCore {} {}", name, executable.display())
            }
            Runtime::JuliaMmtk { name, executable } => {
                write!(f, "JuliaMMTK {} {}", name, executable.display())
            }
            Runtime::NativeExecutable { name } => write!(f, "NativeExecutable {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::ModifierKind;

    fn from_yaml(name: &str, yaml: &str) -> Runtime {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        Runtime::from_spec(name, &value).unwrap()
    }

    #[test]
    fn openjdk_executable_under_home() {
        let jdk = from_yaml(
            "jdk8",
            "{type: OpenJDK, release: 8, home: /usr/lib/jvm/temurin-8-jdk-amd64}",
        );
        assert_eq!(
            jdk.executable().unwrap(),
            Path::new("/usr/lib/jvm/temurin-8-jdk-amd64/bin/java")
        );
    }

    #[test]
    fn openjdk_release_string_parsed() {
        let jdk = from_yaml("jdk11", "{type: OpenJDK, release: '11', home: /opt/jdk11}");
        match jdk {
            Runtime::OpenJdk { release, .. } => assert_eq!(release, 11),
            other => panic!("unexpected runtime {:?}", other),
        }
    }

    #[test]
    fn openjdk_release_not_int_like() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("{type: OpenJDK, release: banana, home: /opt/jdk}").unwrap();
        assert!(Runtime::from_spec("bad", &value).is_err());
    }

    #[test]
    fn unexpandable_home_left_verbatim() {
        let jdk = from_yaml(
            "bogus",
            "{type: OpenJDK, release: 21, home: $HEAPRUN_BOGUS_HOME_XYZ/jdk}",
        );
        match jdk {
            Runtime::OpenJdk { home, .. } => {
                assert!(home.to_string_lossy().contains("$HEAPRUN_BOGUS_HOME_XYZ"))
            }
            other => panic!("unexpected runtime {:?}", other),
        }
    }

    #[test]
    fn jvm_heapsize_modifier() {
        let jdk = from_yaml("jdk8", "{type: OpenJDK, release: 8, home: /opt/jdk}");
        let mods = jdk.heapsize_modifiers(100);
        assert_eq!(mods.len(), 1);
        assert_eq!(
            mods[0].kind(),
            &ModifierKind::JvmArg {
                args: vec!["-Xms100M".to_string(), "-Xmx100M".to_string()]
            }
        );
    }

    #[test]
    fn julia_heapsize_uses_env() {
        let julia = from_yaml("julia", "{type: JuliaMMTK, executable: /opt/julia/julia}");
        let mods = julia.heapsize_modifiers(256);
        assert_eq!(mods.len(), 2);
        assert!(matches!(
            mods[0].kind(),
            ModifierKind::EnvVar { var, val } if var == "MMTK_MIN_HSIZE" && val == "256M"
        ));
    }

    #[test]
    fn jvm_oom_patterns() {
        let jdk = from_yaml("jdk8", "{type: OpenJDK, release: 8, home: /opt/jdk}");
        assert!(jdk.is_oom(b"java.lang.OutOfMemoryError: Java heap space"));
        assert!(jdk.is_oom(b"thread panicked at 'Out of memory!'"));
        assert!(!jdk.is_oom(b"PASSED"));
    }

    #[test]
    fn d8_oom_pattern() {
        let d8 = from_yaml("v8", "{type: D8, executable: /opt/v8/d8}");
        assert!(d8.is_oom(b"Fatal javascript OOM in Reached heap limit"));
        assert!(!d8.is_oom(b"done"));
    }

    #[test]
    fn spidermonkey_never_oom() {
        let sm = from_yaml("sm", "{type: SpiderMonkey, executable: /opt/sm/js}");
        assert!(!sm.is_oom(b"out of memory"));
    }

    #[test]
    fn unknown_runtime_type() {
        let value: serde_yaml::Value = serde_yaml::from_str("{type: GraalVM}").unwrap();
        assert!(matches!(
            Runtime::from_spec("g", &value),
            Err(ModelError::UnknownType { .. })
        ));
    }
}
