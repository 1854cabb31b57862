use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use zucchini::disassembler::detect_and_parse;

/// Parse a file and report its detected format and reference counts.
#[derive(Clone, Debug, Parser)]
pub struct ReadArgs {
    pub file: PathBuf,
    /// Dump every extracted reference (location, target) instead of just counts.
    #[arg(long)]
    pub dump: bool,
}

pub fn cmd_read(args: &ReadArgs) -> Result<()> {
    let image = fs::read(&args.file)?;
    let mut disasm = detect_and_parse(&image);
    let exe_type = disasm.exe_type();
    println!("format: {}", exe_type.as_str());
    println!("parsed length: {} of {} bytes", disasm.image().len(), image.len());

    let holder = disasm.build_reference_holder();
    println!("reference types: {}", holder.type_count());
    for ty in 0..holder.type_count() as u8 {
        let refs = holder.get(ty);
        println!("  type {ty}: {} references (pool {})", refs.len(), holder.pool(ty));
        if args.dump {
            for r in refs {
                println!("    {:#010x} -> {:#010x}", r.location, r.target);
            }
        }
    }
    Ok(())
}
