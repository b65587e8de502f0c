//! Command-line driver for heaprun.
//!
//! Three subcommands: `runbms` (the heap-factor sweep), `minheap` (bisection
//! search for minimum heap sizes), and `fillin` (drive an external program
//! through the space-filling schedule).

pub mod config;
pub mod minheap;
pub mod plugin;
pub mod runbms;
pub mod schedule;

pub use config::{config_index_to_chr, config_str_encode, ConfigError, Configuration,
    ResolvedConfiguration};
pub use plugin::RunbmsPlugin;
pub use runbms::RunbmsOptions;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use heaprun_core::exec::ExecContext;

/// heaprun CLI arguments
#[derive(Parser, Debug)]
#[command(name = "heaprun")]
#[command(author, version, about = "Config-driven performance experiments for managed runtimes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log more; repeatable
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print command lines instead of running anything
    #[arg(short, long, global = true)]
    pub dry_run: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run benchmarks across heap factors and configs
    Runbms(RunbmsOptions),
    /// Bisect the minimum heap size of each (config, benchmark) pair
    Minheap {
        /// Configuration file
        #[arg(name = "CONFIG")]
        config: String,
        /// YAML file the measured sizes are persisted to (and resumed from)
        #[arg(name = "RESULT")]
        result: PathBuf,
        /// Retries per heap-size probe (overrides the configuration)
        #[arg(short, long)]
        attempts: Option<u64>,
    },
    /// Drive PROG through the space-filling schedule, one call per round
    Fillin {
        /// Program run with `PROG 2^LEVELS n...` for each round
        #[arg(name = "PROG")]
        prog: String,
        /// Log2 of the parameter space size
        #[arg(name = "LEVELS")]
        levels: u32,
        /// Resume from the round whose base equals this value
        #[arg(name = "START")]
        start: Option<u64>,
    },
}

/// Parse arguments and run the selected subcommand.
pub fn run() -> anyhow::Result<()> {
    run_with_cli(Cli::parse())
}

/// Run the CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("heaprun=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("heaprun=info")
            .init();
    }

    let ctx = ExecContext {
        dry_run: cli.dry_run,
        verbose: cli.verbose,
    };

    match &cli.command {
        Commands::Runbms(opts) => runbms::run_command(opts, ctx),
        Commands::Minheap {
            config,
            result,
            attempts,
        } => minheap::run_command(config, result, *attempts, ctx),
        Commands::Fillin {
            prog,
            levels,
            start,
        } => schedule::run_fillin_command(prog, *levels, *start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runbms_args() {
        let cli = Cli::parse_from([
            "heaprun", "runbms", "/var/log/heaprun", "runbms.yml", "8", "0", "4", "8", "-i", "20",
            "--skip-oom", "3",
        ]);
        match cli.command {
            Commands::Runbms(opts) => {
                assert_eq!(opts.log_dir, PathBuf::from("/var/log/heaprun"));
                assert_eq!(opts.n_upper, Some(8));
                assert_eq!(opts.ns, vec![0, 4, 8]);
                assert_eq!(opts.invocations, Some(20));
                assert_eq!(opts.skip_oom, Some(3));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_minheap_args() {
        let cli = Cli::parse_from(["heaprun", "-d", "minheap", "minheap.yml", "out.yml", "-a", "5"]);
        assert!(cli.dry_run);
        match cli.command {
            Commands::Minheap {
                config, attempts, ..
            } => {
                assert_eq!(config, "minheap.yml");
                assert_eq!(attempts, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_fillin_args() {
        let cli = Cli::parse_from(["heaprun", "fillin", "./probe.sh", "3", "2"]);
        match cli.command {
            Commands::Fillin { prog, levels, start } => {
                assert_eq!(prog, "./probe.sh");
                assert_eq!(levels, 3);
                assert_eq!(start, Some(2));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
