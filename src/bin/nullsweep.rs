//! Command-line front end for the nullsweep engine.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use nullsweep::engine::Engine;
use nullsweep::format::ReportFormatter;
use nullsweep::{Architecture, BadByteSet, OutputFormat};

/// Rewrite shellcode so it contains no forbidden byte values.
#[derive(Parser, Debug)]
#[command(name = "nullsweep", version, about)]
struct Args {
    /// Input payload file (raw bytes)
    #[arg(short, long)]
    input: PathBuf,

    /// Output file for the rewritten payload
    #[arg(short, long)]
    output: PathBuf,

    /// Target architecture
    #[arg(short, long, value_enum, default_value = "x86")]
    arch: Architecture,

    /// Forbidden bytes as comma-separated hex (e.g. "00,0a,0d")
    #[arg(short, long, default_value = "00")]
    bad_bytes: String,

    /// Maximum fixed-point passes (default: on the order of the
    /// instruction count)
    #[arg(long)]
    max_passes: Option<usize>,

    /// Print a transform report to stdout in the given format
    #[arg(long, value_enum)]
    report: Option<OutputFormat>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let payload = fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    if payload.is_empty() {
        bail!("input payload is empty");
    }

    let bad = BadByteSet::parse(&args.bad_bytes)?;

    let mut engine = Engine::new(args.arch, bad)?;
    if let Some(bound) = args.max_passes {
        engine = engine.with_iteration_bound(bound);
    }

    let result = engine.run(&payload)?;

    fs::write(&args.output, &result.bytes)
        .with_context(|| format!("writing {}", args.output.display()))?;

    if let Some(format) = args.report {
        print!("{}", format.get_formatter().format(&result.report)?);
    } else {
        eprintln!(
            "{} -> {} bytes, {} instruction(s) rewritten",
            result.report.input_len,
            result.report.output_len,
            result.report.rewrites.len()
        );
    }

    Ok(())
}
