use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use zucchini::ensemble::EnsembleMatcher;

/// Run ensemble matching between two images and report the pairing found,
/// without generating a patch.
#[derive(Clone, Debug, Parser)]
pub struct MatchArgs {
    pub old: PathBuf,
    pub new: PathBuf,
    /// Impose element matches rather than detecting them: `off+len=off+len[,...]`.
    #[arg(long, default_value = "")]
    pub impose: String,
}

pub fn cmd_match(args: &MatchArgs) -> Result<()> {
    let old_image = fs::read(&args.old)?;
    let new_image = fs::read(&args.new)?;

    let mut matcher = EnsembleMatcher::new();
    matcher.run_match(&old_image, &new_image, &args.impose)?;

    println!("{} match(es), {} identical element(s)", matcher.matches.len(), matcher.num_identical);
    for (i, m) in matcher.matches.iter().enumerate() {
        println!(
            "  [{i}] old {:#x}+{:#x} ({}) -> new {:#x}+{:#x}",
            m.old.start,
            m.old.len(),
            m.old.exe_type.as_str(),
            m.new.start,
            m.new.len()
        );
    }
    for (i, (start, end)) in matcher.separators.iter().enumerate() {
        if end > start {
            println!("  separator [{i}]: new {:#x}..{:#x}", start, end);
        }
    }
    Ok(())
}
