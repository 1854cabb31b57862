use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use zucchini::patch::applicator::apply;

/// Apply `patch` to `old`, producing `new`.
#[derive(Clone, Debug, Parser)]
pub struct ApplyArgs {
    pub old: PathBuf,
    pub patch: PathBuf,
    pub new: PathBuf,
    /// Only affects logging: by default a failed application is a silent
    /// non-zero exit, matching the "output discarded unless -keep" contract
    /// (no output file is ever written on failure either way, since nothing
    /// is written until application succeeds).
    #[arg(long)]
    pub keep: bool,
}

pub fn cmd_apply(args: &ApplyArgs, quiet: bool) -> Result<()> {
    let old_image = fs::read(&args.old)?;
    let patch_bytes = fs::read(&args.patch)?;

    match apply(&old_image, &patch_bytes) {
        Ok(new_image) => {
            if !quiet {
                println!("applied: {} bytes written", new_image.len());
            }
            fs::write(&args.new, &new_image)?;
            Ok(())
        }
        Err(e) => {
            if args.keep {
                log::warn!("patch application failed, not writing {}: {e}", args.new.display());
            }
            Err(e)
        }
    }
}
