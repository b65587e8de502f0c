//! Minimum-heap-size search: per (config, suite, benchmark), bisect the
//! smallest heap that still passes, with bounded retries per probe and
//! incremental persistence so an interrupted search can resume.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use heaprun_core::exec::{run, ExecContext, ProcessExit};
use heaprun_core::{Benchmark, Runtime, Suite};

use crate::config::{config_str_encode, Configuration, ResolvedConfiguration};

/// What one probe (a heap size, with retries) told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Every retry crashed without passing or OOMing; stop the search.
    Abort,
    /// The benchmark passed, so this heap is big enough.
    HeapTooBig,
    /// OOM or timeout; this heap is too small.
    HeapTooSmall,
}

/// `config → suite → benchmark → minheap` (MB; infinity when the search
/// aborted).
pub type MinheapResult = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

fn glyph(s: &str) {
    print!("{}", s);
    let _ = std::io::stdout().flush();
}

/// Probe one heap size with up to `attempts` retries.
///
/// OOM is checked before the exit status: an OOMing JVM usually also exits
/// nonzero, and the OOM is the signal we want. A timeout counts as
/// too-small (back-to-back GCs), not as a retryable crash.
pub fn run_bm_with_retry(
    suite: &Suite,
    runtime: &Runtime,
    bm_with_heapsize: &Benchmark,
    minheap_dir: &Path,
    attempts: u64,
    ctx: ExecContext,
) -> Result<ProbeVerdict> {
    glyph(" ");
    for _ in 0..attempts {
        let result = run(bm_with_heapsize, runtime, Some(minheap_dir), ctx)?;
        if runtime.is_oom(&result.output) {
            glyph("x ");
            return Ok(ProbeVerdict::HeapTooSmall);
        }
        match result.exit {
            ProcessExit::Normal if suite.is_passed(&result.output) => {
                glyph("o ");
                return Ok(ProbeVerdict::HeapTooBig);
            }
            ProcessExit::Timeout => {
                glyph("t ");
                return Ok(ProbeVerdict::HeapTooSmall);
            }
            _ => {
                glyph(".");
            }
        }
    }
    glyph(" ");
    Ok(ProbeVerdict::Abort)
}

/// Bisect between 2 MB and `maxheap` MB. Returns the smallest passing heap,
/// or infinity if a probe aborted.
pub fn minheap_one_bm(
    suite: &Suite,
    runtime: &Runtime,
    bm: &Benchmark,
    maxheap: u64,
    minheap_dir: &Path,
    attempts: u64,
    ctx: ExecContext,
) -> Result<f64> {
    let mut lo = 2u64;
    let mut hi = maxheap;
    let mut mid = (lo + hi) / 2;
    let mut minh = f64::INFINITY;
    while hi - lo > 1 {
        glyph(&format!("{}M", mid));
        let bm_with_heapsize = bm.attach_modifiers(&runtime.heapsize_modifiers(mid))?;
        match run_bm_with_retry(suite, runtime, &bm_with_heapsize, minheap_dir, attempts, ctx)? {
            ProbeVerdict::Abort => return Ok(f64::INFINITY),
            ProbeVerdict::HeapTooBig => {
                minh = mid as f64;
                hi = mid;
            }
            ProbeVerdict::HeapTooSmall => {
                lo = mid;
            }
        }
        mid = (lo + hi) / 2;
    }
    Ok(minh)
}

/// Measure every (config, suite, benchmark), skipping keys already present
/// in `result` and rewriting `result_file` after each measured benchmark.
pub fn run_with_persistence(
    resolved: &ResolvedConfiguration,
    result: &mut MinheapResult,
    minheap_dir: &Path,
    result_file: Option<&Path>,
    attempts: u64,
    maxheap: u64,
    ctx: ExecContext,
) -> Result<()> {
    for c in resolved.configs()? {
        let c_encoded = config_str_encode(&c);
        result.entry(c_encoded.clone()).or_default();
        let (runtime, mods) = resolved.parse_config_str(&c)?;
        println!("{} ", c_encoded);
        if matches!(runtime, Runtime::NativeExecutable { .. }) {
            warn!("minheap measurement not supported for NativeExecutable");
            continue;
        }
        for (suite_name, bms) in resolved.benchmarks() {
            let suite = resolved
                .suite(suite_name)
                .with_context(|| format!("suite '{}' not resolved", suite_name))?;
            for bm in bms {
                let already = result
                    .get(&c_encoded)
                    .and_then(|m| m.get(suite_name))
                    .map(|m| m.contains_key(&bm.name))
                    .unwrap_or(false);
                if already {
                    continue;
                }
                glyph(&format!("\t {}-{} ", bm.suite_name, bm.name));
                let mod_bm = bm.attach_modifiers(&mods)?;
                let minheap =
                    minheap_one_bm(suite, runtime, &mod_bm, maxheap, minheap_dir, attempts, ctx)?;
                println!("minheap {}", minheap);
                result
                    .entry(c_encoded.clone())
                    .or_default()
                    .entry(suite_name.clone())
                    .or_default()
                    .insert(bm.name.clone(), minheap);
                if let Some(result_file) = result_file {
                    let file = File::create(result_file)?;
                    serde_yaml::to_writer(file, result)?;
                }
            }
        }
    }
    Ok(())
}

/// Report the config that won the most smallest-minheap comparisons and
/// dump its table, ready to paste into a suite's `minheap_values`.
pub fn print_best(result: &MinheapResult) {
    let mut best: BTreeMap<(&str, &str), (f64, &str)> = BTreeMap::new();
    for (config, suites) in result {
        for (suite, benchmarks) in suites {
            for (benchmark, heap_size) in benchmarks {
                let entry = best
                    .entry((suite.as_str(), benchmark.as_str()))
                    .or_insert((f64::INFINITY, "ALL_FAILED"));
                if *heap_size < entry.0 {
                    *entry = (*heap_size, config.as_str());
                }
            }
        }
    }

    let mut config_best_count: BTreeMap<&str, usize> = BTreeMap::new();
    for &(_, config) in best.values() {
        *config_best_count.entry(config).or_default() += 1;
    }

    let Some((config, count)) = config_best_count.into_iter().max_by_key(|(_, count)| *count)
    else {
        return;
    };
    println!(
        "{} obtained the most number of smallest minheap sizes: {}",
        config, count
    );
    if let Some(table) = result.get(config) {
        println!("Minheap configuration to be copied to runbms config files");
        match serde_yaml::to_string(table) {
            Ok(dump) => println!("{}", dump),
            Err(e) => warn!("failed to dump minheap table: {}", e),
        }
    }
}

/// The `minheap` subcommand.
pub fn run_command(
    config_path: &str,
    result_path: &Path,
    attempts_override: Option<u64>,
    ctx: ExecContext,
) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let resolved = Configuration::from_file(&cwd, config_path)?.resolve()?;

    let mut result: MinheapResult = if result_path.exists() {
        let file = File::open(result_path)?;
        serde_yaml::from_reader(file).unwrap_or_default()
    } else {
        MinheapResult::new()
    };

    let attempts = attempts_override.or(resolved.attempts()).unwrap_or(3);
    let maxheap = resolved
        .maxheap()
        .context("configuration must specify 'maxheap' for a minheap search")?;

    let minheap_dir = tempfile::Builder::new().prefix("minheap-").tempdir()?;
    info!("temporary directory: {}", minheap_dir.path().display());
    let result_file = if ctx.dry_run { None } else { Some(result_path) };
    run_with_persistence(
        &resolved,
        &mut result,
        minheap_dir.path(),
        result_file,
        attempts,
        maxheap,
        ctx,
    )?;
    print_best(&result);
    Ok(())
}
