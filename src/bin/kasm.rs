//! Standalone host kernel assembler
//!
//! Produces the same image the CPU device returns from Compile.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use remote_device::device::host::{assemble, disassemble};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rdev-kasm")]
#[command(version)]
#[command(about = "Host kernel assembler")]
struct Args {
    /// Input file (use - for stdin)
    #[arg(default_value = "-")]
    input: String,

    /// Output file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show disassembly
    #[arg(short, long)]
    disasm: bool,

    /// Output as hex instead of binary
    #[arg(long)]
    hex: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let source = if args.input == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        debug!("reading {}", args.input);
        fs::read_to_string(&args.input)
            .with_context(|| format!("Failed to read {}", args.input))?
    };

    let image = assemble(&source).context("Assembly failed")?;
    let bytes = image.encode();
    info!(
        "assembled kernel {}: {} instructions, {} buffers ({} bytes)",
        image.name,
        image.instructions.len(),
        image.buffer_count(),
        bytes.len()
    );

    if args.disasm {
        eprintln!("\nDisassembly:");
        eprint!("{}", disassemble(&image));
    }

    match args.output {
        Some(output) => {
            if args.hex {
                fs::write(&output, hex::encode(&bytes))?;
            } else {
                fs::write(&output, &bytes)?;
            }
            info!("wrote {} bytes to {}", bytes.len(), output.display());
        }
        None if args.hex => println!("{}", hex::encode(&bytes)),
        None => io::stdout().write_all(&bytes)?,
    }

    Ok(())
}
