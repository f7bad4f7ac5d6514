use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

/// Fuzzily locates an extracted module binary inside other ROM images.
/// Zeroed module bytes (rewritten reference operands) match anything.
#[derive(Debug, Parser)]
#[command(name = "cmpoff", version)]
struct Args {
    /// Extracted module binary.
    #[arg(value_name = "MODULE")]
    module: PathBuf,

    /// ROM images to search.
    #[arg(value_name = "ROM", required = true)]
    roms: Vec<PathBuf>,

    /// Lowest match fraction worth reporting.
    #[arg(long, default_value_t = 0.85)]
    threshold: f64,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let module = std::fs::read(&args.module)
        .with_context(|| format!("failed to read {}", args.module.display()))?;
    if module.is_empty() || module.len() % 2 != 0 {
        anyhow::bail!("module must be a non-empty even number of bytes");
    }

    for rom_path in &args.roms {
        let rom = std::fs::read(rom_path)
            .with_context(|| format!("failed to read {}", rom_path.display()))?;
        match best_match(&module, &rom) {
            Some((offset, score)) if score >= args.threshold => {
                println!("{}: {offset:#x} ({:.1}%)", rom_path.display(), score * 100.0);
            }
            Some((offset, score)) => {
                println!(
                    "{}: no match above {:.1}% (best {offset:#x} at {:.1}%)",
                    rom_path.display(),
                    args.threshold * 100.0,
                    score * 100.0
                );
            }
            None => println!("{}: shorter than the module", rom_path.display()),
        }
    }
    Ok(())
}

/// Slides the module over the ROM at a 2-byte stride and scores each
/// position by the fraction of matching bytes.
fn best_match(module: &[u8], rom: &[u8]) -> Option<(usize, f64)> {
    if rom.len() < module.len() {
        return None;
    }
    let mut best = (0usize, -1.0f64);
    let mut offset = 0usize;
    while offset + module.len() <= rom.len() {
        let score = score_at(module, &rom[offset..offset + module.len()]);
        if score > best.1 {
            best = (offset, score);
        }
        offset += 2;
    }
    Some((best.0, best.1))
}

fn score_at(module: &[u8], window: &[u8]) -> f64 {
    let matching = module
        .iter()
        .zip(window)
        .filter(|&(&m, &w)| m == 0 || m == w)
        .count();
    matching as f64 / module.len() as f64
}
