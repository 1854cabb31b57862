use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use zucchini::patch::generator::{generate, GenerateOptions};

/// Generate a patch that transforms `old` into `new`.
#[derive(Clone, Debug, Parser)]
pub struct GenArgs {
    pub old: PathBuf,
    pub new: PathBuf,
    pub patch: PathBuf,
    /// Force a raw (non-ensemble, reference-unaware) patch.
    #[arg(long)]
    pub raw: bool,
    /// Impose element matches rather than detecting them: `off+len=off+len[,...]`.
    #[arg(long, default_value = "")]
    pub impose: String,
}

pub fn cmd_gen(args: &GenArgs, quiet: bool) -> Result<()> {
    let old_image = fs::read(&args.old)?;
    let new_image = fs::read(&args.new)?;

    let opts = GenerateOptions { force_raw: args.raw, imposed_matches: args.impose.clone() };
    let patch = generate(&opts, &old_image, &new_image)?;
    fs::write(&args.patch, &patch)?;

    if !quiet {
        println!(
            "patch: {} bytes ({:.1}% of naive copy, {} bytes)",
            patch.len(),
            100.0 * patch.len() as f64 / new_image.len().max(1) as f64,
            new_image.len()
        );
    }
    Ok(())
}
