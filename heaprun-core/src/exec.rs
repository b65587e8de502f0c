//! Execution driver: runs one benchmark subprocess to completion.
//!
//! Execution is strictly sequential; the only concurrent process is the
//! optional companion (a profiler or similar) which is spawned in its own
//! process group before the benchmark and torn down after it. Timeouts are
//! enforced with a `poll(2)` deadline loop on the child's merged
//! stdout/stderr pipe; on expiry the child is killed and partial output is
//! retained.

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::benchmark::Benchmark;
use crate::error::ModelError;
use crate::runtime::Runtime;
use crate::util::expand_env;

/// Time given to a companion process to attach before the benchmark starts.
const COMPANION_WAIT_START: Duration = Duration::from_secs(2);

/// Window for a companion to flush output after being interrupted.
const COMPANION_DRAIN: Duration = Duration::from_secs(2);

/// How the benchmark subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with status zero.
    Normal,
    /// Exited on its own with a nonzero status (or was signaled).
    Error,
    /// Killed because the configured timeout fired.
    Timeout,
    /// Nothing was spawned; the command line was printed instead.
    Dryrun,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("I/O error while supervising benchmark: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Per-invocation execution flags, threaded explicitly instead of being
/// process globals.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecContext {
    /// Print the command line instead of running anything.
    pub dry_run: bool,
    /// Log command lines and exit classifications as they happen.
    pub verbose: bool,
}

/// Captured result of one benchmark invocation.
#[derive(Debug)]
pub struct RunOutput {
    /// Merged stdout+stderr of the benchmark process.
    pub output: Vec<u8>,
    /// Merged stdout+stderr of the companion process, if one ran.
    pub companion_output: Vec<u8>,
    pub exit: ProcessExit,
}

/// Result of polling a file descriptor for readable data.
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait up to `timeout_ms` for data on `fd`.
fn wait_for_data(fd: i32, timeout_ms: i32) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(std::io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Data first: a closing pipe may still hold readable bytes.
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

fn send_signal(pid: libc::pid_t, signal: libc::c_int) {
    unsafe {
        libc::kill(pid, signal);
    }
}

/// Run `benchmark` on `runtime` under `cwd`.
///
/// The benchmark's `override_cwd` wins over the caller's `cwd`; env-var
/// references in argv tokens are expanded against the current environment
/// just before spawning.
pub fn run(
    benchmark: &Benchmark,
    runtime: &Runtime,
    cwd: Option<&Path>,
    ctx: ExecContext,
) -> Result<RunOutput, ExecError> {
    if ctx.dry_run {
        eprintln!("{}", benchmark.to_command_line(runtime)?);
        return Ok(RunOutput {
            output: Vec::new(),
            companion_output: Vec::new(),
            exit: ProcessExit::Dryrun,
        });
    }

    let argv: Vec<String> = benchmark
        .full_argv(runtime)?
        .iter()
        .map(|tok| expand_env(tok))
        .collect();
    if ctx.verbose {
        info!("running: {}", benchmark.to_command_line(runtime)?);
    }

    let cwd = benchmark.override_cwd.as_deref().or(cwd);

    let mut companion = if benchmark.companion.is_empty() {
        None
    } else {
        let child = spawn_companion(benchmark, cwd)?;
        std::thread::sleep(COMPANION_WAIT_START);
        Some(child)
    };

    let result = run_main(benchmark, &argv, cwd);

    let companion_output = match companion.take() {
        Some(child) => teardown_companion(child),
        None => Vec::new(),
    };

    let (output, exit) = result?;
    if ctx.verbose {
        info!("benchmark {} finished: {:?}", benchmark.name, exit);
    }
    Ok(RunOutput {
        output,
        companion_output,
        exit,
    })
}

fn build_command(benchmark: &Benchmark, argv: &[String], cwd: Option<&Path>) -> Command {
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    for (var, val) in &benchmark.env_args {
        command.env(var, expand_env(val));
    }
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    // Merge stderr into the stdout pipe inside the child; fd 1 is already
    // the pipe at this point.
    unsafe {
        command.pre_exec(|| {
            libc::dup2(1, 2);
            Ok(())
        });
    }
    command
}

fn run_main(
    benchmark: &Benchmark,
    argv: &[String],
    cwd: Option<&Path>,
) -> Result<(Vec<u8>, ProcessExit), ExecError> {
    let mut child =
        build_command(benchmark, argv, cwd)
            .spawn()
            .map_err(|source| ExecError::SpawnFailed {
                program: argv[0].clone(),
                source,
            })?;

    let deadline = benchmark
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut output = Vec::new();
    let timed_out = supervise(&mut child, deadline, &mut output)?;

    if timed_out {
        warn!("benchmark {} timed out, killing", benchmark.name);
        let _ = child.kill();
        let _ = child.wait();
        // Pick up anything the child flushed before dying.
        drain_remaining(&mut child, &mut output);
        return Ok((output, ProcessExit::Timeout));
    }

    let status = child.wait()?;
    let exit = if status.success() {
        ProcessExit::Normal
    } else {
        ProcessExit::Error
    };
    Ok((output, exit))
}

/// Read the child's output until EOF or the deadline. Returns true on
/// timeout.
fn supervise(
    child: &mut Child,
    deadline: Option<Instant>,
    output: &mut Vec<u8>,
) -> Result<bool, ExecError> {
    let Some(stdout) = child.stdout.as_mut() else {
        return Ok(false);
    };
    let fd = stdout.as_raw_fd();
    let mut chunk = [0u8; 8192];

    loop {
        let poll_ms = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(true);
                }
                remaining.min(Duration::from_millis(100)).as_millis() as i32
            }
            None => 100,
        };

        match wait_for_data(fd, poll_ms) {
            PollResult::DataAvailable => {
                let n = stdout.read(&mut chunk)?;
                if n == 0 {
                    return Ok(false);
                }
                output.extend_from_slice(&chunk[..n]);
            }
            PollResult::Timeout => continue,
            PollResult::PipeClosed => return Ok(false),
            PollResult::Error(e) => return Err(ExecError::Io(e)),
        }
    }
}

fn drain_remaining(child: &mut Child, output: &mut Vec<u8>) {
    if let Some(stdout) = child.stdout.as_mut() {
        let _ = stdout.read_to_end(output);
    }
}

fn spawn_companion(benchmark: &Benchmark, cwd: Option<&Path>) -> Result<Child, ExecError> {
    let argv: Vec<String> = benchmark.companion.iter().map(|t| expand_env(t)).collect();
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    // New process group so the interrupt at teardown reaches the whole
    // companion tree; stderr merged as for the benchmark itself.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            libc::dup2(1, 2);
            Ok(())
        });
    }
    command.spawn().map_err(|source| ExecError::SpawnFailed {
        program: argv[0].clone(),
        source,
    })
}

/// Interrupt the companion's process group, drain what it flushes, and
/// force-kill whatever survives.
fn teardown_companion(mut child: Child) -> Vec<u8> {
    let pid = child.id() as libc::pid_t;
    send_signal(-pid, libc::SIGINT);

    let mut output = Vec::new();
    if let Some(stdout) = child.stdout.as_mut() {
        let fd = stdout.as_raw_fd();
        let drain_deadline = Instant::now() + COMPANION_DRAIN;
        let mut chunk = [0u8; 8192];
        loop {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match wait_for_data(fd, remaining.as_millis() as i32) {
                PollResult::DataAvailable => match stdout.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.extend_from_slice(&chunk[..n]),
                },
                _ => break,
            }
        }
    }

    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            warn!("companion still alive after interrupt, killing");
            send_signal(-pid, libc::SIGKILL);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
    drain_remaining(&mut child, &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::BenchmarkKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn binary(program: &str, args: &[&str], timeout: Option<u64>) -> Benchmark {
        Benchmark {
            name: "probe".to_string(),
            suite_name: "binaries".to_string(),
            env_args: BTreeMap::new(),
            wrapper: Vec::new(),
            companion: Vec::new(),
            timeout,
            override_cwd: None,
            kind: BenchmarkKind::Binary {
                program: PathBuf::from(program),
                program_args: args.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    fn native() -> Runtime {
        let value: serde_yaml::Value = serde_yaml::from_str("{type: NativeExecutable}").unwrap();
        Runtime::from_spec("native", &value).unwrap()
    }

    #[test]
    fn normal_exit_captures_output() {
        let bm = binary("/bin/echo", &["hello"], None);
        let out = run(&bm, &native(), None, ExecContext::default()).unwrap();
        assert_eq!(out.exit, ProcessExit::Normal);
        assert_eq!(out.output, b"hello\n");
    }

    #[test]
    fn nonzero_exit_is_error() {
        let bm = binary("/bin/false", &[], None);
        let out = run(&bm, &native(), None, ExecContext::default()).unwrap();
        assert_eq!(out.exit, ProcessExit::Error);
    }

    #[test]
    fn stderr_merged_into_output() {
        let bm = binary("/bin/sh", &["-c", "echo oops >&2"], None);
        let out = run(&bm, &native(), None, ExecContext::default()).unwrap();
        assert_eq!(out.output, b"oops\n");
    }

    #[test]
    fn timeout_kills_and_keeps_partial_output() {
        let bm = binary("/bin/sh", &["-c", "echo started; sleep 30"], Some(1));
        let start = Instant::now();
        let out = run(&bm, &native(), None, ExecContext::default()).unwrap();
        assert_eq!(out.exit, ProcessExit::Timeout);
        assert_eq!(out.output, b"started\n");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn dry_run_spawns_nothing() {
        let bm = binary("/no/such/program", &[], None);
        let out = run(&bm, &native(), None, ExecContext { dry_run: true, verbose: false })
            .unwrap();
        assert_eq!(out.exit, ProcessExit::Dryrun);
        assert!(out.output.is_empty());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let bm = binary("/no/such/program", &[], None);
        assert!(matches!(
            run(&bm, &native(), None, ExecContext::default()),
            Err(ExecError::SpawnFailed { .. })
        ));
    }

    #[test]
    fn env_args_reach_child() {
        let mut bm = binary("/bin/sh", &["-c", "echo $HEAPRUN_PROBE"], None);
        bm.env_args
            .insert("HEAPRUN_PROBE".to_string(), "42".to_string());
        let out = run(&bm, &native(), None, ExecContext::default()).unwrap();
        assert_eq!(out.output, b"42\n");
    }

    #[test]
    fn override_cwd_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut bm = binary("/bin/pwd", &[], None);
        bm.override_cwd = Some(dir.path().to_path_buf());
        let other = tempfile::tempdir().unwrap();
        let out = run(&bm, &native(), Some(other.path()), ExecContext::default()).unwrap();
        let printed = String::from_utf8_lossy(&out.output);
        assert_eq!(
            PathBuf::from(printed.trim()).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
