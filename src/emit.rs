use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;

use crate::islands::{Island, IslandMode};
use crate::labels::{name_module, LabelMap};
use crate::m68k::RefKind;
use crate::manual::FileRange;
use crate::modules::ModuleRange;
use crate::omf::{MpwObject, ObjectSink, DESCRIPTOR};
use crate::refscan::RefSite;
use crate::rewrite::{rewrite_module, RewriteOutcome};
use crate::rom::RomImage;

/// Everything the emitter consumes read-only, produced by the analysis
/// passes.
#[derive(Debug, Default)]
pub struct Analysis {
    pub labels: LabelMap,
    /// `(offset, label)` → glue address, for vector-bound labels.
    pub glue_of_label: HashMap<(u32, String), u32>,
    /// Glue stub offset → implementation offset.
    pub glue_impls: HashMap<u32, u32>,
    /// Implementation offsets reachable through a vector table.
    pub vector_impls: HashSet<u32>,
    pub islands_by_offset: HashMap<u32, Island>,
    pub island_mode: IslandMode,
    /// Reference sites already filtered by the `REFGUESS` intervals.
    pub refs: Vec<RefSite>,
    /// Label → inherited comment from the vector or trap source.
    pub label_comments: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub out_root: PathBuf,
    pub dry_run: bool,
    pub features: HashSet<String>,
    pub verbose: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub files_built: usize,
    pub files_written: usize,
    pub modules: usize,
}

/// Builds one object per file range and writes out the ones marked
/// `WRITEOUT` whose feature gates are all enabled.
///
/// # Errors
/// Propagates `BadOffset` from module byte reads; write failures are a
/// silent skip by design.
pub fn emit_files(
    rom: &RomImage,
    files: &[FileRange],
    ranges: &[ModuleRange],
    analysis: &Analysis,
    opts: &EmitOptions,
) -> Result<EmitSummary> {
    let mut summary = EmitSummary::default();
    for file in files {
        let mut sink = MpwObject::new();
        let emitted = emit_file_modules(&mut sink, rom, file, ranges, analysis)?;
        if emitted == 0 {
            continue;
        }
        summary.files_built += 1;
        summary.modules += emitted;

        let payload = sink.finish();
        match write_object(file, &payload, opts) {
            WriteOutcome::Written => {
                summary.files_written += 1;
                if opts.verbose {
                    println!("wrote {} ({} bytes)", file.relpath, payload.len());
                }
            }
            WriteOutcome::UpToDate => {
                if opts.verbose {
                    println!("{} is up to date ({} bytes)", file.relpath, payload.len());
                }
            }
            WriteOutcome::Skipped => {
                if opts.verbose {
                    println!("built {} ({} bytes, not written)", file.relpath, payload.len());
                }
            }
        }
    }
    Ok(summary)
}

/// Emits every module whose start lies in the file range. Returns the module
/// count; zero means the sink was never touched.
pub fn emit_file_modules(
    sink: &mut dyn ObjectSink,
    rom: &RomImage,
    file: &FileRange,
    ranges: &[ModuleRange],
    analysis: &Analysis,
) -> Result<usize> {
    let hide = analysis.island_mode == IslandMode::Hide;
    let mut emitted = 0usize;
    for range in ranges {
        if range.start < file.start || range.start >= file.stop {
            continue;
        }
        if hide && analysis.islands_by_offset.contains_key(&range.start) {
            continue;
        }
        if emitted == 0 {
            sink.putfirst();
        }
        emit_module(sink, rom, file, range, analysis)?;
        emitted += 1;
    }
    if emitted > 0 {
        sink.putlast();
    }
    Ok(emitted)
}

fn emit_module(
    sink: &mut dyn ObjectSink,
    rom: &RomImage,
    file: &FileRange,
    range: &ModuleRange,
    analysis: &Analysis,
) -> Result<()> {
    let mut buf = rom.slice(range.start, range.stop - range.start)?.to_vec();
    let names = name_module(
        &analysis.labels,
        &analysis.glue_of_label,
        range.start,
        range.stop,
    );
    let outcome = rewrite_module(
        &mut buf,
        range.start,
        range.stop,
        &analysis.refs,
        &analysis.labels,
        &analysis.glue_impls,
        &analysis.vector_impls,
        &analysis.islands_by_offset,
        analysis.island_mode == IslandMode::Hide,
    );

    sink.putcomment(&describe_module(rom, range, &names.name, &names.offset_entries, &outcome, analysis));

    let mut dict: Vec<String> = vec![names.name.clone()];
    for (_, label) in &names.chunk_entries {
        if !dict.contains(label) {
            dict.push(label.clone());
        }
    }
    for reference in &outcome.resolved {
        if !dict.contains(&reference.label) {
            dict.push(reference.label.clone());
        }
    }
    sink.putdict(&dict);

    let mut flags = 0x08;
    if !file.has_flag("NOFORCE") {
        flags |= 0x80;
    }
    sink.putmod(&names.name, flags);
    sink.putsize(buf.len() as u32);
    sink.putcontents(&buf);

    for reference in &outcome.resolved {
        let offset = reference.site - range.start;
        if reference.kind.is_branch() {
            sink.putweirdref(&reference.label, reference.width, offset);
        } else {
            sink.putsimpleref(&reference.label, reference.width, offset);
        }
    }
    for (offset, label) in &names.chunk_entries {
        sink.putentry(offset - range.start, label);
    }
    sink.putcomment(&format!("end of {}", names.name));
    Ok(())
}

fn describe_module(
    rom: &RomImage,
    range: &ModuleRange,
    name: &str,
    offset_entries: &[(u32, String)],
    outcome: &RewriteOutcome,
    analysis: &Analysis,
) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "{name} [{:#x}, {:#x})", range.start, range.stop);
    let _ = writeln!(text, "start: {}", range.start_reasons.join(", "));
    let _ = writeln!(text, "stop: {}", range.stop_reasons.join(", "));
    for r in &outcome.resolved {
        let offset = r.site - range.start;
        match r.kind {
            RefKind::Lea(reg) => {
                let _ = writeln!(text, "+{offset:04X} LEA {},A{reg}", r.label);
            }
            kind => {
                let _ = writeln!(text, "+{offset:04X} {} {}", kind.mnemonic(), r.label);
            }
        }
    }
    for u in &outcome.unresolved {
        let opcode = rom.u16be(u.site - 2).unwrap_or(0);
        let operand = match u.width {
            2 => format!("{:04X}", rom.u16be(u.site).unwrap_or(0)),
            _ => format!("{:08X}", rom.u32be(u.site).unwrap_or(0)),
        };
        let offset = u.site - range.start;
        let _ = writeln!(text, "+{offset:04X} {opcode:04X} {operand} -> {:#x}", u.target);
    }
    for label in std::iter::once(name).chain(offset_entries.iter().map(|(_, l)| l.as_str())) {
        if let Some(comment) = analysis.label_comments.get(label) {
            let _ = writeln!(text, "{label}: {comment}");
        }
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    UpToDate,
    Skipped,
}

/// Writes the object and its `"OBJ MPS "` descriptor companion. Directory
/// creation and write failures are silent skips; unchanged files are left
/// untouched and reported as up to date.
fn write_object(file: &FileRange, payload: &[u8], opts: &EmitOptions) -> WriteOutcome {
    if opts.dry_run || !file.has_flag("WRITEOUT") {
        return WriteOutcome::Skipped;
    }
    if !file.gate_flags().all(|g| opts.features.contains(g)) {
        return WriteOutcome::Skipped;
    }
    let path = opts.out_root.join(&file.relpath);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let unchanged = std::fs::read(&path).is_ok_and(|old| old == payload);
    if !unchanged && std::fs::write(&path, payload).is_err() {
        return WriteOutcome::Skipped;
    }
    let descriptor = opts.out_root.join(format!("{}.idump", file.relpath));
    let descriptor_unchanged =
        std::fs::read(&descriptor).is_ok_and(|old| old == DESCRIPTOR.as_slice());
    if !descriptor_unchanged {
        let _ = std::fs::write(&descriptor, DESCRIPTOR);
    }
    if unchanged {
        WriteOutcome::UpToDate
    } else {
        WriteOutcome::Written
    }
}
