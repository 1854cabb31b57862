mod apply;
use apply::{cmd_apply, ApplyArgs};
mod crc32_cmd;
use crc32_cmd::{cmd_crc32, Crc32Args};
mod detect;
use detect::{cmd_detect, DetectArgs};
mod gen;
use gen::{cmd_gen, GenArgs};
mod match_cmd;
use match_cmd::{cmd_match, MatchArgs};
mod read;
use read::{cmd_read, ReadArgs};

use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Differential compression/patching tool for executables.
#[derive(Clone, Debug, Parser)]
struct Args {
    /// Suppress the resource-usage footer after `gen`/`apply`.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Generate a patch from an old image to a new image.
    Gen(GenArgs),
    /// Apply a patch to an old image, producing a new image.
    Apply(ApplyArgs),
    /// Parse a file and report what disassembler/references were found.
    Read(ReadArgs),
    /// Quick-detect the executable format of a file.
    Detect(DetectArgs),
    /// Run ensemble matching between two images and report the result.
    Match(MatchArgs),
    /// Print the CRC-32 of a file.
    Crc32(Crc32Args),
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let start = Instant::now();

    let result = match &args.operation {
        Operation::Gen(gen_args) => cmd_gen(gen_args, args.quiet),
        Operation::Apply(apply_args) => cmd_apply(apply_args, args.quiet),
        Operation::Read(read_args) => cmd_read(read_args),
        Operation::Detect(detect_args) => cmd_detect(detect_args),
        Operation::Match(match_args) => cmd_match(match_args),
        Operation::Crc32(crc32_args) => cmd_crc32(crc32_args),
    };

    if !args.quiet && !matches!(args.operation, Operation::Gen(_) | Operation::Apply(_)) {
        println!("done in {:.3}s", start.elapsed().as_secs_f64());
    }
    result
}
