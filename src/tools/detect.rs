use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use zucchini::disassembler::{dex, elf, pe, quick_detect};

/// Quick-detect the executable format of a file (magic check only, no full parse).
#[derive(Clone, Debug, Parser)]
pub struct DetectArgs {
    pub file: PathBuf,
    /// Only report whether the file quick-detects as this format
    /// (`pe32`, `pe32+`, `elf`, `dex`), exiting non-zero if it doesn't.
    #[arg(long)]
    pub dd: Option<String>,
}

pub fn cmd_detect(args: &DetectArgs) -> Result<()> {
    let image = fs::read(&args.file)?;

    if let Some(fmt) = &args.dd {
        let matched = match fmt.as_str() {
            "pe32" => pe::quick_detect_x86(&image),
            "pe32+" => pe::quick_detect_x64(&image),
            "elf" => elf::quick_detect(&image),
            "dex" => dex::quick_detect(&image),
            other => bail!("unknown -dd format {other:?} (expected pe32, pe32+, elf, dex)"),
        };
        println!("{fmt}: {}", if matched { "match" } else { "no match" });
        if !matched {
            std::process::exit(1);
        }
        return Ok(());
    }

    match quick_detect(&image) {
        Some((ty, len)) => println!("detected: {} ({len} bytes claimed)", ty.as_str()),
        None => println!("detected: no-op (no recognized format)"),
    }
    Ok(())
}
