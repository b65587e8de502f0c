//! The `runbms` sweep: every heap factor × suite × benchmark × invocation ×
//! config, with append-mode logs, resume support, and lifecycle plugins.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, info, warn};

use heaprun_core::exec::{run, ExecContext, ProcessExit};
use heaprun_core::{Benchmark, Suite};

use crate::config::{
    config_index_to_chr, config_str_encode, Configuration, ResolvedConfiguration,
};
use crate::plugin::{load_plugins, RunbmsPlugin};
use crate::schedule::{fillin, get_hfacs, hfac_str};

/// Command-line options of the `runbms` subcommand. Serialized as-is into
/// the run's `runbms_args.yml`.
#[derive(clap::Args, Debug, Serialize)]
pub struct RunbmsOptions {
    /// Directory under which a per-run log directory is created
    #[arg(name = "LOG_DIR")]
    pub log_dir: PathBuf,

    /// Configuration file
    #[arg(name = "CONFIG")]
    pub config: String,

    /// Number of heap-factor subdivisions (a power of two)
    #[arg(name = "N")]
    pub n_upper: Option<u64>,

    /// Explicit heap-factor indices out of N
    #[arg(name = "n")]
    pub ns: Vec<u64>,

    /// Invocations per benchmark per config (overrides the configuration)
    #[arg(short, long)]
    pub invocations: Option<u64>,

    /// Comma-separated explicit heap factors, bypassing N/n
    #[arg(short, long)]
    pub slice: Option<String>,

    /// Prefix for the generated run id
    #[arg(short = 'p', long)]
    pub id_prefix: Option<String>,

    /// Scale factor applied to suite minheaps (overrides the configuration)
    #[arg(short, long)]
    pub minheap_multiplier: Option<f64>,

    /// Stop running a config for a benchmark after this many OOMs
    #[arg(long)]
    pub skip_oom: Option<u64>,

    /// Stop running a config for a benchmark after this many timeouts
    #[arg(long)]
    pub skip_timeout: Option<u64>,

    /// Reuse an existing run id, skipping completed logs
    #[arg(long)]
    pub resume: Option<String>,

    /// Use this directory as the working directory instead of a temporary one
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

/// Run a shell command and capture its stdout, empty on failure.
fn system(cmd: &str) -> String {
    Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).into_owned())
        .unwrap_or_default()
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn getid() -> String {
    format!("{}-{}", hostname(), Local::now().format("%Y-%m-%d-%a-%H%M%S"))
}

fn get_logged_in_users() -> BTreeSet<String> {
    system("who")
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect()
}

fn glyph(s: &str) {
    print!("{}", s);
    let _ = std::io::stdout().flush();
}

/// Stable log-file naming: downstream analysis tools match
/// `{bm}.{hfac}.{size}.{config}.{suite}.log.gz`.
pub fn get_filename_no_ext(
    bm: &Benchmark,
    hfac: Option<f64>,
    size: Option<u64>,
    config: &str,
) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        bm.name,
        hfac.map(hfac_str).unwrap_or_else(|| "0".to_string()),
        size.map(|s| s.to_string()).unwrap_or_else(|| "0".to_string()),
        config_str_encode(config),
        bm.suite_name,
    )
}

fn get_filename(bm: &Benchmark, hfac: Option<f64>, size: Option<u64>, config: &str) -> String {
    format!("{}.log", get_filename_no_ext(bm, hfac, size, config))
}

fn get_filename_completed(
    bm: &Benchmark,
    hfac: Option<f64>,
    size: Option<u64>,
    config: &str,
) -> String {
    format!("{}.gz", get_filename(bm, hfac, size, config))
}

fn hz_to_ghz(hzstr: &str) -> Option<String> {
    let hz: u64 = hzstr.trim().parse().ok()?;
    Some(format!("{:.2} GHz", hz as f64 / 1_000_000.0))
}

fn cpu_model() -> String {
    fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split(':').nth(1))
                .map(|m| m.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn num_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Machine/environment facts written before each invocation's output so a
/// log is self-describing.
fn get_log_prologue(command_line: &str) -> String {
    let mut out = String::from("\n-----\n");
    out.push_str(command_line);
    out.push('\n');
    out.push_str(&format!("heaprun v{}\n", env!("CARGO_PKG_VERSION")));
    out.push_str(&format!("{}\n", Local::now().to_rfc2822()));
    out.push_str("Environment variables:\n");
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (k, v) in vars {
        out.push_str(&format!("\t{}={}\n", k, v));
    }
    out.push_str("OS: ");
    out.push_str(&system("uname -a"));
    out.push_str(&format!("CPU: {}\n", cpu_model()));
    let cores = num_cores();
    out.push_str(&format!("number of cores: {}\n", cores));
    if Path::new("/sys/devices/system/cpu/cpu0/cpufreq").is_dir() {
        for i in 0..cores {
            let base = format!("/sys/devices/system/cpu/cpu{}/cpufreq", i);
            if let Some(freq) =
                fs::read_to_string(format!("{}/scaling_cur_freq", base))
                    .ok()
                    .and_then(|s| hz_to_ghz(&s))
            {
                out.push_str(&format!("Frequency of cpu {}: {}\n", i, freq));
            }
            if let Ok(governor) = fs::read_to_string(format!("{}/scaling_governor", base)) {
                out.push_str(&format!("Governor of cpu {}: {}", i, governor));
            }
            if let Some(min) =
                fs::read_to_string(format!("{}/scaling_min_freq", base))
                    .ok()
                    .and_then(|s| hz_to_ghz(&s))
            {
                out.push_str(&format!("Scaling_min_freq of cpu {}: {}\n", i, min));
            }
        }
    }
    out
}

fn gzip_file(path: &Path) -> Result<()> {
    let contents = fs::read(path)?;
    let gz_path = path.with_extension(
        path.extension()
            .map(|e| format!("{}.gz", e.to_string_lossy()))
            .unwrap_or_else(|| "gz".to_string()),
    );
    let file = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

struct InvocationOutcome {
    oomed: bool,
    timed_out: bool,
    passed: bool,
}

/// One sweep over heap factors, benchmarks, invocations, and configs.
pub struct Sweep<'a> {
    resolved: &'a ResolvedConfiguration,
    configs: Vec<String>,
    invocations: u64,
    minheap_multiplier: f64,
    skip_oom: Option<u64>,
    skip_timeout: Option<u64>,
    remote_host: Option<String>,
    resume: bool,
    runbms_dir: PathBuf,
    log_dir: PathBuf,
    plugins: Vec<Box<dyn RunbmsPlugin>>,
    ctx: ExecContext,
}

impl<'a> Sweep<'a> {
    fn get_heapsize(&self, hfac: f64, minheap: u64) -> u64 {
        (minheap as f64 * hfac * self.minheap_multiplier).round() as u64
    }

    /// Attach the config's modifiers (and the heap-size modifiers, when a
    /// size is set), run once, and append prologue plus output to `fd`.
    fn run_benchmark_with_config(
        &self,
        c: &str,
        bm: &Benchmark,
        size: Option<u64>,
        fd: Option<&mut File>,
    ) -> Result<InvocationOutcome> {
        let (runtime, mods) = self.resolved.parse_config_str(c)?;
        let mut mod_bm = bm.attach_modifiers(&mods)?;
        if let Some(size) = size {
            mod_bm = mod_bm.attach_modifiers(&runtime.heapsize_modifiers(size))?;
        }
        if let Some(fd) = &fd {
            let mut fd = &**fd;
            let prologue = get_log_prologue(&mod_bm.to_command_line(runtime)?);
            fd.write_all(prologue.as_bytes())?;
        }
        let result = run(&mod_bm, runtime, Some(&self.runbms_dir), self.ctx)?;
        if let Some(fd) = fd {
            fd.write_all(&result.output)?;
            if !result.companion_output.is_empty() {
                fd.write_all(b"*****\n")?;
                fd.write_all(&result.companion_output)?;
            }
        }
        let suite = self
            .resolved
            .suite(&bm.suite_name)
            .with_context(|| format!("suite '{}' not resolved", bm.suite_name))?;
        Ok(InvocationOutcome {
            oomed: runtime.is_oom(&result.output),
            timed_out: result.exit == ProcessExit::Timeout,
            passed: result.exit == ProcessExit::Normal && suite.is_passed(&result.output),
        })
    }

    fn run_one_benchmark(
        &mut self,
        suite: &Suite,
        bm: &Benchmark,
        hfac: Option<f64>,
    ) -> Result<()> {
        glyph(&format!("{} ", bm.name));
        let size = hfac.map(|hfac| {
            glyph(&format!("{} ", hfac_str(hfac)));
            let size = self.get_heapsize(hfac, suite.get_minheap(&bm.name));
            glyph(&format!("{} ", size));
            size
        });
        for p in &mut self.plugins {
            p.start_benchmark(hfac, size, bm);
        }

        let configs = self.configs.clone();
        let mut oomed_count: BTreeMap<&str, u64> = BTreeMap::new();
        let mut timeout_count: BTreeMap<&str, u64> = BTreeMap::new();
        let mut ever_ran = vec![false; configs.len()];

        let logged_in = get_logged_in_users();
        if logged_in.len() > 1 {
            warn!(
                "more than one user logged in: {}",
                logged_in.into_iter().collect::<Vec<_>>().join(" ")
            );
        }

        for i in 0..self.invocations {
            for p in &mut self.plugins {
                p.start_invocation(hfac, size, bm, i);
            }
            glyph(&i.to_string());
            for (j, c) in configs.iter().enumerate() {
                for p in &mut self.plugins {
                    p.start_config(hfac, size, bm, i, c, j);
                }
                let mut config_passed = false;
                let skipped = self
                    .skip_oom
                    .map(|n| oomed_count.get(c.as_str()).copied().unwrap_or(0) >= n)
                    .unwrap_or(false)
                    || self
                        .skip_timeout
                        .map(|n| timeout_count.get(c.as_str()).copied().unwrap_or(0) >= n)
                        .unwrap_or(false);
                let completed = self.resume
                    && self
                        .log_dir
                        .join(get_filename_completed(bm, hfac, size, c))
                        .exists();
                if skipped {
                    glyph(".");
                } else if completed {
                    glyph(&config_index_to_chr(j).unwrap_or('?').to_string());
                } else {
                    let log_filename = get_filename(bm, hfac, size, c);
                    debug!("running with log filename {}", log_filename);
                    let outcome = if self.ctx.dry_run {
                        self.run_benchmark_with_config(c, bm, size, None)?
                    } else {
                        let mut fd = OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(self.log_dir.join(&log_filename))?;
                        let outcome =
                            self.run_benchmark_with_config(c, bm, size, Some(&mut fd))?;
                        ever_ran[j] = true;
                        outcome
                    };
                    if outcome.oomed {
                        *oomed_count.entry(c.as_str()).or_default() += 1;
                    }
                    if outcome.timed_out {
                        *timeout_count.entry(c.as_str()).or_default() += 1;
                    }
                    if outcome.passed {
                        config_passed = true;
                        glyph(&config_index_to_chr(j).unwrap_or('?').to_string());
                    } else {
                        glyph(".");
                    }
                }
                for p in &mut self.plugins {
                    p.end_config(hfac, size, bm, i, c, j, config_passed);
                }
            }
            for p in &mut self.plugins {
                p.end_invocation(hfac, size, bm, i);
            }
        }
        for p in &mut self.plugins {
            p.end_benchmark(hfac, size, bm);
        }

        if !self.ctx.dry_run {
            for (j, c) in configs.iter().enumerate() {
                if ever_ran[j] {
                    gzip_file(&self.log_dir.join(get_filename(bm, hfac, size, c)))?;
                }
            }
        }
        println!();
        Ok(())
    }

    fn run_one_hfac(&mut self, hfac: Option<f64>) -> Result<()> {
        for p in &mut self.plugins {
            p.start_hfac(hfac);
        }
        let resolved = self.resolved;
        for (suite_name, bms) in resolved.benchmarks() {
            let suite = resolved
                .suite(suite_name)
                .with_context(|| format!("suite '{}' not resolved", suite_name))?;
            for bm in bms {
                self.run_one_benchmark(suite, bm, hfac)?;
                self.rsync();
            }
        }
        for p in &mut self.plugins {
            p.end_hfac(hfac);
        }
        Ok(())
    }

    fn run_hfacs(&mut self, hfacs: &[f64]) -> Result<()> {
        info!(
            "hfacs: {}",
            hfacs.iter().map(|h| hfac_str(*h)).collect::<Vec<_>>().join(", ")
        );
        for &hfac in hfacs {
            self.run_one_hfac(Some(hfac))?;
            println!();
        }
        Ok(())
    }

    fn ensure_remote_dir(&self) {
        if !self.ctx.dry_run {
            if let Some(host) = &self.remote_host {
                let log_dir = self.log_dir.display();
                system(&format!("ssh {} mkdir -p {}", host, log_dir));
            }
        }
    }

    fn rsync(&self) {
        if !self.ctx.dry_run {
            if let Some(host) = &self.remote_host {
                let log_dir = self.log_dir.display();
                system(&format!("rsync -ae ssh {}/ {}:{}", log_dir, host, log_dir));
            }
        }
    }
}

/// The `runbms` subcommand.
pub fn run_command(opts: &RunbmsOptions, ctx: ExecContext) -> Result<()> {
    let tmp_dir;
    let runbms_dir = match &opts.workdir {
        Some(workdir) => {
            fs::create_dir_all(workdir)?;
            workdir.canonicalize()?
        }
        None => {
            tmp_dir = tempfile::Builder::new().prefix("runbms-").tempdir()?;
            tmp_dir.path().to_path_buf()
        }
    };
    info!("working directory: {}", runbms_dir.display());

    let run_id = match &opts.resume {
        Some(resume) => resume.clone(),
        None => match &opts.id_prefix {
            Some(prefix) => format!("{}-{}", prefix, getid()),
            None => getid(),
        },
    };
    println!("Run id: {}", run_id);
    let log_dir = opts.log_dir.join(&run_id);
    if !ctx.dry_run {
        fs::create_dir_all(&log_dir)?;
        let args_file = File::create(log_dir.join("runbms_args.yml"))?;
        serde_yaml::to_writer(args_file, opts)?;
    }

    let cwd = std::env::current_dir()?;
    let configuration = Configuration::from_file(&cwd, &opts.config)?;
    if !ctx.dry_run {
        configuration.save_to_file(&log_dir.join("runbms.yml"))?;
    }
    let resolved = configuration.resolve()?;

    let invocations = opts
        .invocations
        .or(resolved.invocations())
        .context("configuration must specify 'invocations'")?;
    let minheap_multiplier = opts
        .minheap_multiplier
        .or(resolved.minheap_multiplier())
        .unwrap_or(1.0);

    let plugins = load_plugins(resolved.plugins(), &run_id, &runbms_dir, &log_dir)?;
    let mut sweep = Sweep {
        configs: resolved.configs()?,
        resolved: &resolved,
        invocations,
        minheap_multiplier,
        skip_oom: opts.skip_oom,
        skip_timeout: opts.skip_timeout,
        remote_host: resolved.remote_host(),
        resume: opts.resume.is_some(),
        runbms_dir,
        log_dir,
        plugins,
        ctx,
    };
    sweep.ensure_remote_dir();

    if let Some(slice) = &opts.slice {
        let hfacs: Vec<f64> = slice
            .split(',')
            .map(|s| s.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .context("--slice must be comma-separated numbers")?;
        return sweep.run_hfacs(&hfacs);
    }

    let Some(n_upper) = opts.n_upper else {
        // Degenerate pass with no heap sizing at all.
        return sweep.run_one_hfac(None);
    };
    let heap_range = resolved
        .heap_range()
        .context("configuration must specify 'heap_range'")?;
    let spread_factor = resolved
        .spread_factor()
        .context("configuration must specify 'spread_factor'")?;

    if opts.ns.is_empty() {
        let levels = (n_upper as f64).log2().round() as u32;
        if levels == 0 || 1u64 << levels != n_upper {
            bail!("N must be a power of two greater than 1 to fill in the whole schedule");
        }
        fillin(
            |end, ns| sweep.run_hfacs(&get_hfacs(heap_range, spread_factor, end, ns)),
            levels,
            None,
        )
    } else {
        sweep.run_hfacs(&get_hfacs(heap_range, spread_factor, n_upper, &opts.ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heaprun_core::BenchmarkKind;

    fn bm(name: &str, suite: &str) -> Benchmark {
        Benchmark {
            name: name.to_string(),
            suite_name: suite.to_string(),
            env_args: BTreeMap::new(),
            wrapper: Vec::new(),
            companion: Vec::new(),
            timeout: None,
            override_cwd: None,
            kind: BenchmarkKind::Binary {
                program: PathBuf::from("/bin/true"),
                program_args: Vec::new(),
            },
        }
    }

    #[test]
    fn log_filename_layout() {
        let bm = bm("fop", "dacapo");
        assert_eq!(
            get_filename_completed(&bm, Some(1.3331), Some(27), "jdk8|ss|s-1"),
            "fop.1333.27.jdk8.ss.s-1.dacapo.log.gz"
        );
        assert_eq!(
            get_filename(&bm, None, None, "jdk8|ss"),
            "fop.0.0.jdk8.ss.dacapo.log"
        );
    }

    #[test]
    fn gzip_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.log");
        fs::write(&path, b"some output\n").unwrap();
        gzip_file(&path).unwrap();
        assert!(!path.exists());
        let gz = dir.path().join("x.log.gz");
        assert!(gz.exists());
        let mut decoder = flate2::read::GzDecoder::new(File::open(gz).unwrap());
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut contents).unwrap();
        assert_eq!(contents, "some output\n");
    }

    #[test]
    fn prologue_names_machine_facts() {
        let prologue = get_log_prologue("FOO=1 /opt/jdk/bin/java -jar d.jar fop");
        assert!(prologue.starts_with("\n-----\n"));
        assert!(prologue.contains("FOO=1 /opt/jdk/bin/java"));
        assert!(prologue.contains("heaprun v"));
        assert!(prologue.contains("number of cores:"));
        assert!(prologue.contains("Environment variables:"));
    }

    #[test]
    fn heapsize_rounds() {
        let resolved_yaml = "configs: ['x|']";
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.yml"), resolved_yaml).unwrap();
        let resolved = Configuration::from_file(dir.path(), "c.yml")
            .unwrap()
            .resolve()
            .unwrap();
        let sweep = Sweep {
            resolved: &resolved,
            configs: Vec::new(),
            invocations: 1,
            minheap_multiplier: 1.5,
            skip_oom: None,
            skip_timeout: None,
            remote_host: None,
            resume: false,
            runbms_dir: PathBuf::from("/tmp"),
            log_dir: PathBuf::from("/tmp"),
            plugins: Vec::new(),
            ctx: ExecContext::default(),
        };
        // 14 * 1.3331 * 1.5 = 27.99, rounds to 28
        assert_eq!(sweep.get_heapsize(1.3331, 14), 28);
    }
}
