use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use zucchini::crc32::crc32;

/// Print the CRC-32 of a file.
#[derive(Clone, Debug, Parser)]
pub struct Crc32Args {
    pub file: PathBuf,
}

pub fn cmd_crc32(args: &Crc32Args) -> Result<()> {
    let data = fs::read(&args.file)?;
    println!("{:#010x}", crc32(&data));
    Ok(())
}
