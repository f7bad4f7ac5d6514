use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

use crate::asmscan::ascii_text;
use crate::cli::Args;
use crate::emit::{emit_files, Analysis, EmitOptions};
use crate::islands::{detect_islands, Island, IslandMode};
use crate::labels::LabelMap;
use crate::manual::load_annotation;
use crate::modules::compute_module_ranges;
use crate::refscan::{in_enabled_range, scan_references};
use crate::rom::RomImage;
use crate::traps::{extract_traps, TrapNames};
use crate::vectors::{extract_vector_tables, parse_vector_source, scan_glues, SourceVector};

/// Unlinks one ROM: recovers dispatch tables, infers module boundaries,
/// rewrites references, and emits the per-file objects.
///
/// # Errors
/// Fatal structural errors (`ManualOutOfOrder`, `MalformedVectorInit`,
/// `BadOffset`, misplaced `ISLANDGUESS`) and I/O failures.
pub fn run(args: Args) -> anyhow::Result<()> {
    let rom_path = args.rom_path().to_path_buf();
    let bytes = std::fs::read(&rom_path)
        .with_context(|| format!("failed to read {}", rom_path.display()))?;
    let total = bytes.len();
    let rom = RomImage::new(bytes)?;
    let trim = rom.trim();
    if args.verbose {
        println!("{}: {total} bytes, trimmed to {trim:#x}", rom_path.display());
    }

    let manual = load_annotation(&args.annotation_path())?;
    let island_mode = manual.island_mode()?;

    let source_vectors = read_source_file(args.src_root(), &["Make/VectorTable.a", "VectorTable.a"])
        .map(|text| parse_vector_source(&text))
        .unwrap_or_default();
    let mut trap_names = TrapNames::default();
    if let Some(text) = read_source_file(args.src_root(), &["OS/DispTable.a", "DispTable.a"]) {
        trap_names.apply_source(&text);
    }

    let vectors = extract_vector_tables(&rom)?;
    let glues = scan_glues(&rom, &vectors);
    let traps = extract_traps(&rom);
    let islands = if island_mode == IslandMode::Off {
        Vec::new()
    } else {
        detect_islands(&rom, &manual.non_islands())
    };

    let refguess = manual.toggle_ranges("REFGUESS", trim);
    let refs: Vec<_> = scan_references(&rom)
        .into_iter()
        .filter(|r| in_enabled_range(&refguess, r.site))
        .collect();

    let mut analysis = Analysis::default();
    analysis.island_mode = island_mode;
    analysis.refs = refs;

    let mut source_by_slot: HashMap<(u16, u16), &SourceVector> = HashMap::new();
    for vector in &source_vectors {
        source_by_slot
            .entry((vector.table, vector.voffset))
            .or_insert(vector);
    }
    let mut glue_by_slot: HashMap<(u16, u16), u32> = HashMap::new();
    for glue in &glues {
        glue_by_slot.entry((glue.table, glue.voffset)).or_insert(glue.offset);
        if let Some(&routine) = vectors.routines.get(&(glue.table, glue.voffset)) {
            analysis.glue_impls.insert(glue.offset, routine);
        }
    }

    for (&(table, voffset), &routine) in &vectors.routines {
        analysis.vector_impls.insert(routine);
        let (label, comment) = match source_by_slot.get(&(table, voffset)) {
            Some(v) => (v.label.clone(), v.comment.clone()),
            None => (format!("MGR{table:04X}_VEC{voffset:04X}"), String::new()),
        };
        analysis.labels.insert(routine, label.clone());
        if let Some(&stub) = glue_by_slot.get(&(table, voffset)) {
            analysis.glue_of_label.insert((routine, label.clone()), stub);
        }
        if !comment.is_empty() {
            analysis.label_comments.insert(label, comment);
        }
    }
    for (&trap, &offset) in &traps {
        if let Some(name) = trap_names.name(trap) {
            analysis.labels.insert(offset, name);
            if let Some(comment) = trap_names.comment(trap) {
                analysis
                    .label_comments
                    .insert(name.to_string(), comment.to_string());
            }
        }
    }
    for (offset, label) in manual.forced_modules() {
        analysis.labels.insert(offset, label);
    }
    for (offset, label) in manual.extra_entries() {
        analysis.labels.insert(offset, label);
    }
    for island in &islands {
        let label = island_label(&analysis.labels, &analysis.glue_impls, island);
        analysis.labels.replace(island.offset, label);
        analysis.islands_by_offset.insert(island.offset, *island);
    }

    let ranges = compute_module_ranges(
        &rom,
        &glues,
        &analysis.glue_impls,
        &islands,
        &analysis.labels,
        &manual,
    );
    let files = manual.file_ranges(trim);

    if args.verbose {
        println!(
            "{} vector slots, {} glues, {} traps, {} islands, {} modules, {} file ranges",
            vectors.routines.len(),
            glues.len(),
            traps.len(),
            islands.len(),
            ranges.len(),
            files.len()
        );
    }

    let opts = EmitOptions {
        out_root: args.out_root(),
        dry_run: args.dry_run,
        features: args.features.iter().cloned().collect(),
        verbose: args.verbose,
    };
    let summary = emit_files(&rom, &files, &ranges, &analysis, &opts)?;
    if args.verbose {
        println!(
            "built {} object(s) holding {} module(s), wrote {}",
            summary.files_built, summary.modules, summary.files_written
        );
    }
    Ok(())
}

/// An island is named after whatever its branch finally reaches, through one
/// level of glue.
fn island_label(labels: &LabelMap, glue_impls: &HashMap<u32, u32>, island: &Island) -> String {
    let target = glue_impls.get(&island.target).copied().unwrap_or(island.target);
    match labels.best(target) {
        Some(name) => format!("ISLAND_{:X}_{name}", island.offset),
        None => format!("ISLAND_{:X}_UNRESOLVED_{:X}", island.offset, island.target),
    }
}

fn read_source_file(root: Option<&Path>, candidates: &[&str]) -> Option<String> {
    let root = root?;
    for rel in candidates {
        if let Ok(bytes) = std::fs::read(root.join(rel)) {
            return Some(ascii_text(&bytes));
        }
    }
    None
}
