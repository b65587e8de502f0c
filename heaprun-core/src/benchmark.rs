//! Concrete benchmark invocations and modifier attachment.
//!
//! A `Benchmark` is a fully specified program run minus the runtime: suites
//! produce them, modifiers are attached (copy-then-modify, never in place),
//! and the execution driver turns one plus a `Runtime` into an argv.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::warn;

use crate::error::ModelError;
use crate::modifier::{Modifier, ModifierKind};
use crate::runtime::Runtime;
use crate::util::smart_quote;

/// Variant-specific argv fragments of a benchmark.
#[derive(Debug, Clone)]
pub enum BenchmarkKind {
    /// A native binary; the program itself is the executable.
    Binary {
        program: PathBuf,
        program_args: Vec<String>,
    },
    /// A JVM program launched through `-cp` plus a main class in
    /// `program_args`.
    Java {
        jvm_args: Vec<String>,
        classpath: Vec<String>,
        program_args: Vec<String>,
    },
    /// A script fed to a JavaScript shell.
    JavaScript {
        js_args: Vec<String>,
        program: PathBuf,
        program_args: Vec<String>,
    },
    /// A Julia program.
    Julia {
        julia_args: Vec<String>,
        program_args: Vec<String>,
    },
}

impl BenchmarkKind {
    fn label(&self) -> &'static str {
        match self {
            BenchmarkKind::Binary { .. } => "Binary",
            BenchmarkKind::Java { .. } => "Java",
            BenchmarkKind::JavaScript { .. } => "JavaScript",
            BenchmarkKind::Julia { .. } => "Julia",
        }
    }

    fn program_args_mut(&mut self) -> &mut Vec<String> {
        match self {
            BenchmarkKind::Binary { program_args, .. }
            | BenchmarkKind::Java { program_args, .. }
            | BenchmarkKind::JavaScript { program_args, .. }
            | BenchmarkKind::Julia { program_args, .. } => program_args,
        }
    }
}

/// One benchmark invocation, produced by a suite and specialized by
/// modifiers.
#[derive(Debug, Clone)]
pub struct Benchmark {
    pub name: String,
    pub suite_name: String,
    /// Environment variables set for the benchmark process; these win over
    /// the inherited environment.
    pub env_args: BTreeMap<String, String>,
    /// Argv prefix placed before the runtime executable.
    pub wrapper: Vec<String>,
    /// Program run alongside the benchmark, if any.
    pub companion: Vec<String>,
    /// Per-run wall-clock limit in seconds.
    pub timeout: Option<u64>,
    /// Working directory forced by the benchmark, winning over the caller's.
    pub override_cwd: Option<PathBuf>,
    pub kind: BenchmarkKind,
}

impl Benchmark {
    /// Return a copy of this benchmark with `modifiers` applied in order.
    ///
    /// Modifiers scoped away from this (suite, benchmark) pair are skipped
    /// silently; modifier variants the benchmark variant cannot express are
    /// warned about and skipped, so one config line can drive heterogeneous
    /// suites. An unflattened `ModifierSet` is an internal-consistency error.
    pub fn attach_modifiers(&self, modifiers: &[Modifier]) -> Result<Benchmark, ModelError> {
        let mut bm = self.clone();
        for m in modifiers {
            if !m.should_attach(&self.suite_name, &self.name) {
                continue;
            }
            match m.kind() {
                ModifierKind::EnvVar { var, val } => {
                    bm.env_args.insert(var.clone(), val.clone());
                }
                ModifierKind::Wrapper { argv } => bm.wrapper.extend(argv.iter().cloned()),
                ModifierKind::Companion { argv } => bm.companion.extend(argv.iter().cloned()),
                ModifierKind::ProgramArg { args } => {
                    bm.kind.program_args_mut().extend(args.iter().cloned())
                }
                ModifierKind::JvmArg { args } => match &mut bm.kind {
                    BenchmarkKind::Java { jvm_args, .. } => jvm_args.extend(args.iter().cloned()),
                    other => skip(m, other),
                },
                ModifierKind::JvmClasspathAppend { entries } => match &mut bm.kind {
                    BenchmarkKind::Java { classpath, .. } => {
                        classpath.extend(entries.iter().cloned())
                    }
                    other => skip(m, other),
                },
                ModifierKind::JvmClasspathPrepend { entries } => match &mut bm.kind {
                    BenchmarkKind::Java { classpath, .. } => {
                        classpath.splice(0..0, entries.iter().cloned());
                    }
                    other => skip(m, other),
                },
                ModifierKind::JsArg { args } => match &mut bm.kind {
                    BenchmarkKind::JavaScript { js_args, .. } => {
                        js_args.extend(args.iter().cloned())
                    }
                    other => skip(m, other),
                },
                ModifierKind::JuliaArg { args } => match &mut bm.kind {
                    BenchmarkKind::Julia { julia_args, .. } => {
                        julia_args.extend(args.iter().cloned())
                    }
                    other => skip(m, other),
                },
                ModifierKind::ModifierSet { .. } => {
                    return Err(ModelError::UnflattenedModifierSet(m.name().to_string()))
                }
            }
        }
        Ok(bm)
    }

    /// The complete argv: wrapper, runtime executable, runtime flags,
    /// program, program arguments.
    pub fn full_argv(&self, runtime: &Runtime) -> Result<Vec<String>, ModelError> {
        let mut argv = self.wrapper.clone();
        match &self.kind {
            BenchmarkKind::Binary {
                program,
                program_args,
            } => {
                argv.push(program.to_string_lossy().into_owned());
                argv.extend(program_args.iter().cloned());
            }
            BenchmarkKind::Java {
                jvm_args,
                classpath,
                program_args,
            } => {
                let release = match runtime {
                    Runtime::OpenJdk { release, .. } => Some(*release),
                    Runtime::JikesRvm { .. } => None,
                    other => return Err(self.incompatible(other)),
                };
                argv.push(self.runtime_exe(runtime)?);
                argv.extend(jvm_args.iter().cloned());
                // jdk.internal.ref is sealed behind the module system from
                // release 9 on; harnesses that clean via Cleaner need it open.
                if release.map(|r| r >= 9).unwrap_or(false) {
                    argv.push("--add-exports".to_string());
                    argv.push("java.base/jdk.internal.ref=ALL-UNNAMED".to_string());
                }
                if !classpath.is_empty() {
                    argv.push("-cp".to_string());
                    argv.push(classpath.join(":"));
                }
                argv.extend(program_args.iter().cloned());
            }
            BenchmarkKind::JavaScript {
                js_args,
                program,
                program_args,
            } => {
                let needs_separator = match runtime {
                    Runtime::D8 { .. } | Runtime::JavaScriptCore { .. } => true,
                    Runtime::SpiderMonkey { .. } => false,
                    other => return Err(self.incompatible(other)),
                };
                argv.push(self.runtime_exe(runtime)?);
                argv.extend(js_args.iter().cloned());
                argv.push(program.to_string_lossy().into_owned());
                if needs_separator {
                    argv.push("--".to_string());
                }
                argv.extend(program_args.iter().cloned());
            }
            BenchmarkKind::Julia {
                julia_args,
                program_args,
            } => {
                if !matches!(runtime, Runtime::JuliaMmtk { .. }) {
                    return Err(self.incompatible(runtime));
                }
                argv.push(self.runtime_exe(runtime)?);
                argv.extend(julia_args.iter().cloned());
                argv.extend(program_args.iter().cloned());
            }
        }
        Ok(argv)
    }

    fn runtime_exe(&self, runtime: &Runtime) -> Result<String, ModelError> {
        runtime
            .executable()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| self.incompatible(runtime))
    }

    fn incompatible(&self, runtime: &Runtime) -> ModelError {
        ModelError::IncompatibleRuntime {
            runtime: runtime.name().to_string(),
            kind: self.kind.label(),
            benchmark: self.name.clone(),
        }
    }

    /// Render a reproducible single-line command for dry runs and log
    /// prologues: `VAR=val ... argv...`, quoting where necessary.
    pub fn to_command_line(&self, runtime: &Runtime) -> Result<String, ModelError> {
        let mut parts: Vec<String> = self
            .env_args
            .iter()
            .map(|(var, val)| format!("{}={}", var, smart_quote(val)))
            .collect();
        parts.extend(self.full_argv(runtime)?.iter().map(|a| smart_quote(a)));
        Ok(parts.join(" "))
    }
}

fn skip(m: &Modifier, kind: &BenchmarkKind) {
    warn!(
        "ignoring {} modifier '{}' on {} benchmark",
        m.kind().label(),
        m.name(),
        kind.label()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn java_bm() -> Benchmark {
        Benchmark {
            name: "fop".to_string(),
            suite_name: "dacapo".to_string(),
            env_args: BTreeMap::new(),
            wrapper: Vec::new(),
            companion: Vec::new(),
            timeout: Some(600),
            override_cwd: None,
            kind: BenchmarkKind::Java {
                jvm_args: Vec::new(),
                classpath: vec!["/opt/dacapo.jar".to_string()],
                program_args: vec!["Harness".to_string(), "fop".to_string()],
            },
        }
    }

    fn jdk(release: i64) -> Runtime {
        let yaml = format!("{{type: OpenJDK, release: {}, home: /opt/jdk}}", release);
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        Runtime::from_spec("jdk", &value).unwrap()
    }

    fn modifier(name: &str, yaml: &str) -> Modifier {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        Modifier::from_spec(name, &value).unwrap()
    }

    #[test]
    fn jvm_args_before_classpath() {
        let bm = java_bm()
            .attach_modifiers(&[modifier("ss", "{type: JVMArg, val: '-XX:+UseSerialGC'}")])
            .unwrap();
        let argv = bm.full_argv(&jdk(8)).unwrap();
        assert_eq!(
            argv,
            vec![
                "/opt/jdk/bin/java",
                "-XX:+UseSerialGC",
                "-cp",
                "/opt/dacapo.jar",
                "Harness",
                "fop"
            ]
        );
    }

    #[test]
    fn add_exports_for_jdk9_plus() {
        let argv = java_bm().full_argv(&jdk(11)).unwrap();
        assert!(argv.contains(&"--add-exports".to_string()));
        assert!(argv.contains(&"java.base/jdk.internal.ref=ALL-UNNAMED".to_string()));
        let argv = java_bm().full_argv(&jdk(8)).unwrap();
        assert!(!argv.contains(&"--add-exports".to_string()));
    }

    #[test]
    fn classpath_append_and_prepend() {
        let bm = java_bm()
            .attach_modifiers(&[
                modifier("probes", "{type: JVMClasspathAppend, val: /opt/probes.jar}"),
                modifier("agent", "{type: JVMClasspathPrepend, val: /opt/agent.jar}"),
            ])
            .unwrap();
        match &bm.kind {
            BenchmarkKind::Java { classpath, .. } => assert_eq!(
                classpath,
                &vec![
                    "/opt/agent.jar".to_string(),
                    "/opt/dacapo.jar".to_string(),
                    "/opt/probes.jar".to_string()
                ]
            ),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn attach_does_not_mutate_original() {
        let base = java_bm();
        let _modified = base
            .attach_modifiers(&[modifier("e", "{type: EnvVar, var: MMTK_PLAN, val: SemiSpace}")])
            .unwrap();
        assert!(base.env_args.is_empty());
    }

    #[test]
    fn env_var_overwrites() {
        let bm = java_bm()
            .attach_modifiers(&[
                modifier("a", "{type: EnvVar, var: MMTK_PLAN, val: SemiSpace}"),
                modifier("b", "{type: EnvVar, var: MMTK_PLAN, val: Immix}"),
            ])
            .unwrap();
        assert_eq!(bm.env_args.get("MMTK_PLAN").map(String::as_str), Some("Immix"));
    }

    #[test]
    fn unsupported_modifier_skipped() {
        let base = Benchmark {
            name: "lbm".to_string(),
            suite_name: "binaries".to_string(),
            env_args: BTreeMap::new(),
            wrapper: Vec::new(),
            companion: Vec::new(),
            timeout: None,
            override_cwd: None,
            kind: BenchmarkKind::Binary {
                program: PathBuf::from("/opt/lbm"),
                program_args: Vec::new(),
            },
        };
        let bm = base
            .attach_modifiers(&[modifier("ss", "{type: JVMArg, val: '-XX:+UseSerialGC'}")])
            .unwrap();
        match &bm.kind {
            BenchmarkKind::Binary { program_args, .. } => assert!(program_args.is_empty()),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn unflattened_set_is_fatal() {
        let err = java_bm()
            .attach_modifiers(&[modifier("s", "{type: ModifierSet, val: 'a|b'}")])
            .unwrap_err();
        assert!(matches!(err, ModelError::UnflattenedModifierSet(name) if name == "s"));
    }

    #[test]
    fn d8_separates_program_args() {
        let bm = Benchmark {
            name: "splay".to_string(),
            suite_name: "octane".to_string(),
            env_args: BTreeMap::new(),
            wrapper: Vec::new(),
            companion: Vec::new(),
            timeout: None,
            override_cwd: None,
            kind: BenchmarkKind::JavaScript {
                js_args: Vec::new(),
                program: PathBuf::from("/opt/octane/run.js"),
                program_args: vec!["splay".to_string()],
            },
        };
        let value: serde_yaml::Value =
            serde_yaml::from_str("{type: D8, executable: /opt/v8/d8}").unwrap();
        let d8 = Runtime::from_spec("v8", &value).unwrap();
        let argv = bm.full_argv(&d8).unwrap();
        assert_eq!(argv, vec!["/opt/v8/d8", "/opt/octane/run.js", "--", "splay"]);

        let value: serde_yaml::Value =
            serde_yaml::from_str("{type: SpiderMonkey, executable: /opt/sm/js}").unwrap();
        let sm = Runtime::from_spec("sm", &value).unwrap();
        let argv = bm.full_argv(&sm).unwrap();
        assert_eq!(argv, vec!["/opt/sm/js", "/opt/octane/run.js", "splay"]);
    }

    #[test]
    fn js_benchmark_needs_js_runtime() {
        let bm = Benchmark {
            name: "splay".to_string(),
            suite_name: "octane".to_string(),
            env_args: BTreeMap::new(),
            wrapper: Vec::new(),
            companion: Vec::new(),
            timeout: None,
            override_cwd: None,
            kind: BenchmarkKind::JavaScript {
                js_args: Vec::new(),
                program: PathBuf::from("/opt/octane/run.js"),
                program_args: Vec::new(),
            },
        };
        assert!(matches!(
            bm.full_argv(&jdk(11)),
            Err(ModelError::IncompatibleRuntime { .. })
        ));
    }

    #[test]
    fn command_line_quotes_env() {
        let bm = java_bm()
            .attach_modifiers(&[modifier(
                "opts",
                "{type: EnvVar, var: JAVA_OPTS, val: 'a b'}",
            )])
            .unwrap();
        let line = bm.to_command_line(&jdk(8)).unwrap();
        assert!(line.starts_with("JAVA_OPTS=\"a b\" /opt/jdk/bin/java"));
    }

    #[test]
    fn wrapper_precedes_runtime() {
        let bm = java_bm()
            .attach_modifiers(&[modifier("perf", "{type: Wrapper, val: 'perf stat'}")])
            .unwrap();
        let argv = bm.full_argv(&jdk(8)).unwrap();
        assert_eq!(&argv[..3], &["perf", "stat", "/opt/jdk/bin/java"]);
    }
}
