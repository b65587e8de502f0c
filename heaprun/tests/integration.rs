//! End-to-end tests: load a configuration, resolve it, and drive real
//! subprocesses through the execution path.

use std::collections::BTreeMap;
use std::path::PathBuf;

use heaprun::{
    run_benchmark, Benchmark, BenchmarkKind, Configuration, ExecContext, ModifierKind,
    ProcessExit, Runtime,
};

const CONFIG: &str = r#"
suites:
  dacapo2006:
    type: DaCapo
    release: "2006"
    path: /opt/dacapo-2006-10-MR2.jar
    timing_iteration: 3
    minheap: measured
    minheap_values:
      measured:
        fop: 14
        hsqldb: 126
benchmarks:
  dacapo2006:
    - fop
    - hsqldb
modifiers:
  ss:
    type: EnvVar
    var: MMTK_PLAN
    val: SemiSpace
  no_compressed_oops:
    type: JVMArg
    val: "-XX:-UseCompressedOops"
  common:
    type: ModifierSet
    val: "ss|no_compressed_oops"
runtimes:
  jdk8:
    type: OpenJDK
    release: 8
    home: /opt/jdk8
configs:
  - "jdk8|common"
invocations: 2
heap_range: 6
spread_factor: 1
minheap_multiplier: 1.0
maxheap: 1024
"#;

fn load(yaml: &str) -> heaprun::ResolvedConfiguration {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yml"), yaml).unwrap();
    Configuration::from_file(dir.path(), "config.yml")
        .unwrap()
        .resolve()
        .unwrap()
}

#[test]
fn config_to_command_line() {
    let resolved = load(CONFIG);
    let (runtime, mods) = resolved.parse_config_str("jdk8|common").unwrap();

    let (_, bms) = &resolved.benchmarks()[0];
    let fop = bms[0].attach_modifiers(&mods).unwrap();
    let line = fop.to_command_line(runtime).unwrap();
    assert!(line.contains("MMTK_PLAN=SemiSpace"));
    assert!(line.contains("/opt/jdk8/bin/java -XX:-UseCompressedOops"));
    assert!(line.ends_with("-jar /opt/dacapo-2006-10-MR2.jar -n 3 -s default fop"));
}

#[test]
fn minheap_profile_feeds_heap_sizing() {
    let resolved = load(CONFIG);
    let suite = resolved.suite("dacapo2006").unwrap();
    assert_eq!(suite.get_minheap("fop"), 14);
    assert_eq!(suite.get_minheap("hsqldb"), 126);
}

#[test]
fn heapsize_modifier_applies_to_resolved_benchmark() {
    let resolved = load(CONFIG);
    let (runtime, _) = resolved.parse_config_str("jdk8|common").unwrap();
    let (_, bms) = &resolved.benchmarks()[0];
    let sized = bms[0]
        .attach_modifiers(&runtime.heapsize_modifiers(42))
        .unwrap();
    let argv = sized.full_argv(runtime).unwrap();
    assert!(argv.contains(&"-Xms42M".to_string()));
    assert!(argv.contains(&"-Xmx42M".to_string()));
}

#[test]
fn dry_run_classification() {
    let resolved = load(CONFIG);
    let (runtime, mods) = resolved.parse_config_str("jdk8|common").unwrap();
    let (_, bms) = &resolved.benchmarks()[0];
    let bm = bms[0].attach_modifiers(&mods).unwrap();
    let out = run_benchmark(
        &bm,
        runtime,
        None,
        ExecContext {
            dry_run: true,
            verbose: false,
        },
    )
    .unwrap();
    assert_eq!(out.exit, ProcessExit::Dryrun);
}

#[test]
fn binary_suite_runs_for_real() {
    let config = r#"
suites:
  tools:
    type: BinaryBenchmarkSuite
    programs:
      hello:
        path: /bin/echo
        args: "hello world"
benchmarks:
  tools:
    - hello
modifiers:
  env:
    type: EnvVar
    var: HEAPRUN_IT
    val: "1"
runtimes:
  native:
    type: NativeExecutable
configs:
  - "native|env"
"#;
    let resolved = load(config);
    let (runtime, mods) = resolved.parse_config_str("native|env").unwrap();
    let (_, bms) = &resolved.benchmarks()[0];
    let bm = bms[0].attach_modifiers(&mods).unwrap();
    let out = run_benchmark(&bm, runtime, None, ExecContext::default()).unwrap();
    assert_eq!(out.exit, ProcessExit::Normal);
    assert_eq!(out.output, b"hello world\n");
}

#[test]
fn companion_output_captured_separately() {
    let mut bm = Benchmark {
        name: "main".to_string(),
        suite_name: "tools".to_string(),
        env_args: BTreeMap::new(),
        wrapper: Vec::new(),
        companion: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo companion-here; sleep 60".to_string(),
        ],
        timeout: None,
        override_cwd: None,
        kind: BenchmarkKind::Binary {
            program: PathBuf::from("/bin/echo"),
            program_args: vec!["main-done".to_string()],
        },
    };
    let value: serde_yaml::Value = serde_yaml::from_str("{type: NativeExecutable}").unwrap();
    let native = Runtime::from_spec("native", &value).unwrap();
    let out = run_benchmark(&bm, &native, None, ExecContext::default()).unwrap();
    assert_eq!(out.exit, ProcessExit::Normal);
    assert_eq!(out.output, b"main-done\n");
    assert!(String::from_utf8_lossy(&out.companion_output).contains("companion-here"));

    // Without a companion nothing extra is captured.
    bm.companion.clear();
    let out = run_benchmark(&bm, &native, None, ExecContext::default()).unwrap();
    assert!(out.companion_output.is_empty());
}

#[test]
fn modifier_value_opts_through_config() {
    let config = r#"
suites:
  tools:
    type: BinaryBenchmarkSuite
    programs:
      hello:
        path: /bin/echo
        args: ""
benchmarks:
  tools:
    - hello
modifiers:
  plan:
    type: EnvVar
    var: MMTK_PLAN
    val: "{0}"
runtimes:
  native:
    type: NativeExecutable
configs:
  - "native|plan-Immix"
"#;
    let resolved = load(config);
    let (_, mods) = resolved.parse_config_str("native|plan-Immix").unwrap();
    match mods[0].kind() {
        ModifierKind::EnvVar { var, val } => {
            assert_eq!(var, "MMTK_PLAN");
            assert_eq!(val, "Immix");
        }
        other => panic!("unexpected kind {:?}", other),
    }
}
