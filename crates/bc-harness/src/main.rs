#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bc_harness::{HarnessConfig, HarnessReport, run_workload};
use std::env;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Debug, Default)]
struct CliOptions {
    config: HarnessConfig,
    json: bool,
    log_json: bool,
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--help" | "-h" | "help") => {
            print_usage();
            Ok(())
        }
        Some("run") => run_cmd(&args[1..]),
        None => run_cmd(&[]),
        Some(flag) if flag.starts_with('-') => run_cmd(&args),
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn flag_value<'a>(args: &'a [String], index: usize, flag: &str) -> Result<&'a str> {
    args.get(index + 1)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires a value"))
}

fn parse_run_options(args: &[String]) -> Result<CliOptions> {
    let mut options = CliOptions::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let config = &mut options.config;
        let value = move || flag_value(args, index, flag);
        match flag {
            "--threads" => {
                config.threads = value()?.parse().context("invalid --threads value")?;
                index += 2;
            }
            "--ops" => {
                config.ops_per_thread = value()?.parse().context("invalid --ops value")?;
                index += 2;
            }
            "--capacity" => {
                config.capacity = value()?.parse().context("invalid --capacity value")?;
                index += 2;
            }
            "--blocks" => {
                config.block_count = value()?.parse().context("invalid --blocks value")?;
                index += 2;
            }
            "--block-size" => {
                config.block_size = value()?.parse().context("invalid --block-size value")?;
                index += 2;
            }
            "--latency-us" => {
                config.max_latency_us = value()?.parse().context("invalid --latency-us value")?;
                index += 2;
            }
            "--seed" => {
                config.seed = value()?.parse().context("invalid --seed value")?;
                index += 2;
            }
            "--write-percent" => {
                config.write_percent = value()?
                    .parse()
                    .context("invalid --write-percent value")?;
                index += 2;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
                index += 1;
            }
            "--json" => {
                options.json = true;
                index += 1;
            }
            "--log-json" => {
                options.log_json = true;
                index += 1;
            }
            other => bail!("unknown run option: {other}"),
        }
    }
    if options.json && options.config.verbose {
        bail!("--verbose and --json both write to stdout; pick one");
    }
    options.config.validate()?;
    Ok(options)
}

/// Logs go to stderr so stdout stays reserved for operation lines and the
/// report. `RUST_LOG` overrides the default `warn` level.
fn init_logging(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn run_cmd(args: &[String]) -> Result<()> {
    let options = parse_run_options(args)?;
    init_logging(options.log_json);
    let report = run_workload(&options.config)?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    if !report.passed {
        bail!("invariant check failed: {:?}", report.checks);
    }
    Ok(())
}

fn print_summary(report: &HarnessReport) {
    let config = &report.config;
    println!("Main thread done.");
    println!(
        "threads={} ops/thread={} capacity={} blocks={} block_size={} seed={}",
        config.threads,
        config.ops_per_thread,
        config.capacity,
        config.block_count,
        config.block_size,
        config.seed
    );
    println!(
        "reads={} writes={} hits={} misses={} hit_rate={:.3}",
        report.reads, report.writes, report.cache.hits, report.cache.misses, report.hit_rate
    );
    println!(
        "evictions={} writebacks={} final_writebacks={} disk_reads={} disk_writes={}",
        report.cache.evictions,
        report.cache.writebacks,
        report.final_writebacks,
        report.disk.reads,
        report.disk.writes
    );
    println!(
        "gate: concurrent={} exclusive={} concurrent_waits={} exclusive_waits={}",
        report.cache.gate.concurrent_entries,
        report.cache.gate.exclusive_entries,
        report.cache.gate.concurrent_waits,
        report.cache.gate.exclusive_waits
    );
    println!(
        "elapsed={}us invariants={}",
        report.duration_us,
        if report.passed { "ok" } else { "FAILED" }
    );
}

fn print_usage() {
    println!("bc-harness: multithreaded block cache workload driver");
    println!();
    println!("USAGE:");
    println!(
        "  bc-harness [run] [--threads N] [--ops N] [--capacity N] [--blocks N] [--block-size N]"
    );
    println!("                   [--latency-us N] [--seed S] [--write-percent P]");
    println!("                   [--verbose] [--json] [--log-json]");
    println!();
    println!("RUN:");
    println!("  Spawns N worker threads issuing Zipf-distributed reads and writes against a");
    println!("  write-back cache over a simulated disk, then checks the cache invariants.");
    println!("  Writes store thread * blocks + block. --verbose prints one line per operation.");
    println!("  Exits non-zero when an invariant check fails.");
    println!();
    println!("LOGGING:");
    println!("  RUST_LOG=bc::cache=debug enables per-miss logs on stderr.");
    println!();
    println!("EXAMPLES:");
    println!("  bc-harness --verbose");
    println!("  bc-harness run --threads 32 --ops 10000 --capacity 16 --latency-us 20 --json");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parses_all_flags() {
        let options = parse_run_options(&args(&[
            "--threads",
            "4",
            "--ops",
            "20",
            "--capacity",
            "3",
            "--blocks",
            "50",
            "--block-size",
            "8",
            "--latency-us",
            "0",
            "--seed",
            "9",
            "--write-percent",
            "25",
            "--log-json",
        ]))
        .expect("parse");
        let c = &options.config;
        assert_eq!(
            (c.threads, c.ops_per_thread, c.capacity, c.block_count),
            (4, 20, 3, 50)
        );
        assert_eq!((c.block_size, c.max_latency_us, c.seed, c.write_percent), (8, 0, 9, 25));
        assert!(options.log_json);
        assert!(!options.json);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_run_options(&args(&["--threads"])).is_err());
        assert!(parse_run_options(&args(&["--threads", "x"])).is_err());
        assert!(parse_run_options(&args(&["--capacity", "0"])).is_err());
        assert!(parse_run_options(&args(&["--bogus"])).is_err());
        assert!(parse_run_options(&args(&["--json", "--verbose"])).is_err());
    }
}
