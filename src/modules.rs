use std::collections::{HashMap, HashSet};

use crate::islands::Island;
use crate::labels::LabelMap;
use crate::m68k::{JMP_IND_BASE, JMP_IND_MASK, OP_BRA_L, OP_RTD, OP_RTS};
use crate::manual::Manual;
use crate::rom::RomImage;
use crate::vectors::Glue;

/// One inferred module: a contiguous `[start, stop)` byte range with the
/// human-readable reasons that produced each boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRange {
    pub start: u32,
    pub stop: u32,
    pub start_reasons: Vec<String>,
    pub stop_reasons: Vec<String>,
}

/// Glues at most 16 bytes apart belong to one run: packed tables stride by
/// 10, aligned tables by 16.
const GLUE_RUN_STRIDE: u32 = 16;
const GLUE_BYTES: u32 = 10;

#[must_use]
pub fn align16(value: u32) -> u32 {
    value.saturating_add(15) & !15
}

/// Fuses every boundary signal into the ordered module-range list.
#[must_use]
pub fn compute_module_ranges(
    rom: &RomImage,
    glues: &[Glue],
    glue_impls: &HashMap<u32, u32>,
    islands: &[Island],
    labels: &LabelMap,
    manual: &Manual,
) -> Vec<ModuleRange> {
    let trim = rom.trim();
    let runs = glue_runs(glues);
    let forbidden = forbidden_ranges(glues, &runs, glue_impls);

    let mut starts: Vec<(u32, String)> = vec![(0, "start of ROM".to_string())];
    for &(_, last) in &runs {
        starts.push((align16(glues[last].offset + GLUE_BYTES), "after glue run".to_string()));
    }
    for (offset, label) in manual.forced_modules() {
        starts.push((offset, format!("MOD {label}")));
    }
    for file in manual.file_ranges(trim) {
        starts.push((file.start, "FILE directive".to_string()));
    }
    for island in islands {
        starts.push((island.offset + 16, "after island".to_string()));
        starts.push((island.offset, "BRA.L island".to_string()));
    }
    for (offset, reasons) in
        modguess_starts(rom, &manual.toggle_ranges("MODGUESS", trim), &forbidden, labels)
    {
        for reason in reasons {
            starts.push((offset, reason));
        }
    }

    let mut stops: Vec<(u32, String)> = Vec::new();
    for glue in glues {
        stops.push((glue.offset, "glue".to_string()));
    }
    for island in islands {
        stops.push((island.offset, "island".to_string()));
        stops.push((island.offset + 16, "after island".to_string()));
    }
    for rec in manual.records("ENDF") {
        stops.push((rec.offset, "ENDF directive".to_string()));
    }
    stops.push((trim, "end of ROM".to_string()));

    starts.retain(|&(offset, _)| offset < trim);
    stops.retain(|&(offset, _)| offset <= trim);

    let starts = merge_marks(starts);
    let stops = merge_marks(stops);

    let mut ranges = Vec::new();
    for (i, (start, start_reasons)) in starts.iter().enumerate() {
        let next_start = starts.get(i + 1).map(|&(offset, _)| offset);
        let stop_index = stops.partition_point(|&(offset, _)| offset <= *start);
        let (stop, stop_reasons) = match (stops.get(stop_index), next_start) {
            (Some(&(stop, _)), Some(next)) if next < stop => {
                (next, vec!["next module".to_string()])
            }
            (Some((stop, reasons)), _) => (*stop, reasons.clone()),
            (None, Some(next)) => (next, vec!["next module".to_string()]),
            (None, None) => continue,
        };
        ranges.push(ModuleRange {
            start: *start,
            stop,
            start_reasons: start_reasons.clone(),
            stop_reasons,
        });
    }

    let glue_offsets: HashSet<u32> = glues.iter().map(|g| g.offset).collect();
    trim_trailing_nulls(rom, &glue_offsets, &mut ranges);
    ranges
}

/// Stable sort by offset, accumulating the reasons of equal offsets into one
/// record.
fn merge_marks(mut marks: Vec<(u32, String)>) -> Vec<(u32, Vec<String>)> {
    marks.sort_by_key(|&(offset, _)| offset);
    let mut out: Vec<(u32, Vec<String>)> = Vec::new();
    for (offset, reason) in marks {
        match out.last_mut() {
            Some((last, reasons)) if *last == offset => {
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
            _ => out.push((offset, vec![reason])),
        }
    }
    out
}

/// Maximal chains of glues, as index pairs into the sorted glue list.
fn glue_runs(glues: &[Glue]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut begin = 0usize;
    for i in 1..=glues.len() {
        let chained = i < glues.len()
            && glues[i].offset.saturating_sub(glues[i - 1].offset) <= GLUE_RUN_STRIDE;
        if !chained {
            if begin < i {
                out.push((begin, i - 1));
            }
            begin = i;
        }
    }
    out
}

/// A run of glues plus its pointed-at implementation must stay in one
/// module; these ranges veto modguess cuts.
fn forbidden_ranges(
    glues: &[Glue],
    runs: &[(usize, usize)],
    glue_impls: &HashMap<u32, u32>,
) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    for &(first, last) in runs {
        let mut lo = glues[first].offset;
        let hi = glues[last].offset + GLUE_BYTES;
        if let Some(&first_impl) = glue_impls.get(&glues[first].offset) {
            if first_impl < lo {
                lo = first_impl;
            }
            let min_impl = glues[first..=last]
                .iter()
                .filter_map(|g| glue_impls.get(&g.offset))
                .min()
                .copied();
            // Entry-point pattern: the first glue reaches past the run's
            // earliest implementation, so a cut on its immediate left is
            // forbidden too.
            if min_impl.is_some_and(|min| first_impl > min) {
                lo = lo.saturating_sub(2);
            }
        }
        out.push((lo, hi));
    }
    out
}

fn in_ranges(ranges: &[(u32, u32)], offset: u32) -> bool {
    ranges.iter().any(|&(lo, hi)| offset >= lo && offset < hi)
}

/// Heuristic module starts at a 16-byte stride inside the enabled intervals.
fn modguess_starts(
    rom: &RomImage,
    enabled: &[(u32, u32)],
    forbidden: &[(u32, u32)],
    labels: &LabelMap,
) -> Vec<(u32, Vec<String>)> {
    let mut out = Vec::new();
    for &(lo, hi) in enabled {
        let mut at = align16(lo);
        while at < hi {
            if let Some(reasons) = modguess_at(rom, forbidden, labels, at) {
                out.push((at, reasons));
            }
            at = match at.checked_add(16) {
                Some(next) => next,
                None => break,
            };
        }
    }
    out
}

fn modguess_at(
    rom: &RomImage,
    forbidden: &[(u32, u32)],
    labels: &LabelMap,
    at: u32,
) -> Option<Vec<String>> {
    if at < 16 {
        return None;
    }
    // All-zero predecessors are padding and already belong to someone.
    if rom.all_zero(at - 16, 16) {
        return None;
    }
    if in_ranges(forbidden, at) {
        return None;
    }
    let mut reasons = vec!["align".to_string()];
    if labels.contains(at) {
        reasons.push("labelled".to_string());
    }
    if let Some(reason) = return_then_padding(rom, at) {
        reasons.push(reason.to_string());
    }
    (reasons.len() > 1).then_some(reasons)
}

/// True when a return-class instruction ends just before an even run of 2-14
/// zero padding bytes that ends at `at`.
fn return_then_padding(rom: &RomImage, at: u32) -> Option<&'static str> {
    let mut pad = 0u32;
    while pad < 14 && at >= pad + 2 && rom.all_zero(at - pad - 2, 2) {
        pad += 2;
    }
    if pad == 0 {
        return None;
    }
    let end = at - pad;
    let word = |offset: u32| rom.u16be(offset).ok();
    if end >= 2 && word(end - 2) == Some(OP_RTS) {
        return Some("RTS then padding");
    }
    if end >= 2 && word(end - 2).is_some_and(|w| w & JMP_IND_MASK == JMP_IND_BASE) {
        return Some("JMP (An) then padding");
    }
    if end >= 4 && word(end - 4) == Some(OP_RTD) {
        return Some("RTD then padding");
    }
    if end >= 6 && word(end - 6) == Some(OP_BRA_L) {
        return Some("BRA.L then padding");
    }
    None
}

/// Walks trailing zero words off ranges that do not end at a glue.
fn trim_trailing_nulls(rom: &RomImage, glue_offsets: &HashSet<u32>, ranges: &mut [ModuleRange]) {
    for range in ranges {
        if glue_offsets.contains(&range.stop) {
            continue;
        }
        let (start, stop) = (range.start, range.stop);
        if stop - start < 16 {
            continue;
        }
        if rom.all_zero(stop - 16, 14) {
            continue;
        }
        if !rom.all_zero(stop - 2, 2) {
            continue;
        }
        let mut new_stop = stop;
        while new_stop >= start + 2 && rom.all_zero(new_stop - 2, 2) {
            new_stop -= 2;
        }
        range.stop = new_stop;
        range.stop_reasons.push("nulls trimmed".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{align16, compute_module_ranges, forbidden_ranges, glue_runs};
    use crate::islands::Island;
    use crate::labels::LabelMap;
    use crate::manual::Manual;
    use crate::rom::RomImage;
    use crate::vectors::Glue;
    use std::collections::HashMap;

    fn rom(total: usize, fill: &[(usize, &[u8])]) -> RomImage {
        let mut bytes = vec![0u8; total];
        bytes[0x1a..0x1e].copy_from_slice(&(total as u32).to_be_bytes());
        for (at, data) in fill {
            bytes[*at..*at + data.len()].copy_from_slice(data);
        }
        RomImage::new(bytes).expect("load")
    }

    fn glue_at(offset: u32) -> Glue {
        Glue {
            table: 0x2010,
            voffset: 0,
            areg: 7,
            offset,
        }
    }

    fn manual(text: &str) -> Manual {
        Manual::parse(text).expect("manual")
    }

    #[test]
    fn aligns_up_to_sixteen() {
        assert_eq!(align16(0x401a), 0x4020);
        assert_eq!(align16(0x4020), 0x4020);
        assert_eq!(align16(1), 16);
    }

    #[test]
    fn padded_glue_pair_is_one_run_with_one_boundary() {
        // Scenario: glues at 0x4000 and 0x4010 (10-byte stride plus 6 bytes
        // of padding); the boundary falls after the whole run.
        let glues = vec![glue_at(0x4000), glue_at(0x4010)];
        let runs = glue_runs(&glues);
        assert_eq!(runs, vec![(0, 1)]);
        assert_eq!(align16(glues[1].offset + 10), 0x4020);

        let forbidden = forbidden_ranges(&glues, &runs, &HashMap::new());
        assert_eq!(forbidden, vec![(0x4000, 0x401a)]);
    }

    #[test]
    fn distant_glues_split_into_runs() {
        let glues = vec![glue_at(0x4000), glue_at(0x400a), glue_at(0x5000)];
        let runs = glue_runs(&glues);
        assert_eq!(runs, vec![(0, 1), (2, 2)]);
    }

    #[test]
    fn forbidden_range_reaches_back_to_the_implementation() {
        let glues = vec![glue_at(0x4000), glue_at(0x400a)];
        let runs = glue_runs(&glues);
        let mut impls = HashMap::new();
        impls.insert(0x4000u32, 0x3f00u32);
        impls.insert(0x400au32, 0x3f80u32);
        let forbidden = forbidden_ranges(&glues, &runs, &impls);
        assert_eq!(forbidden, vec![(0x3f00, 0x4014)]);
    }

    #[test]
    fn entry_point_pattern_backs_off_two_more_bytes() {
        let glues = vec![glue_at(0x4000), glue_at(0x400a)];
        let runs = glue_runs(&glues);
        let mut impls = HashMap::new();
        // The first glue's implementation lies past the run's earliest one.
        impls.insert(0x4000u32, 0x3f80u32);
        impls.insert(0x400au32, 0x3f00u32);
        let forbidden = forbidden_ranges(&glues, &runs, &impls);
        assert_eq!(forbidden, vec![(0x3f7e, 0x4014)]);
    }

    #[test]
    fn rts_padding_yields_an_aligned_start() {
        // 4E 75 then 14 zero bytes ending at 0x1100.
        let rom = rom(0x2000, &[(0x10f0, &[0x4e, 0x75])]);
        let manual = manual("");
        let ranges = compute_module_ranges(
            &rom,
            &[],
            &HashMap::new(),
            &[],
            &LabelMap::default(),
            &manual,
        );
        let hit = ranges
            .iter()
            .find(|r| r.start == 0x1100)
            .expect("start at 0x1100");
        assert_eq!(
            hit.start_reasons,
            vec!["align".to_string(), "RTS then padding".to_string()]
        );
    }

    #[test]
    fn labelled_offset_is_a_candidate_without_padding() {
        let rom = rom(0x2000, &[(0x10fe, &[0x4e, 0x71])]);
        let mut labels = LabelMap::default();
        labels.insert(0x1100, "DoThing");
        let ranges = compute_module_ranges(
            &rom,
            &[],
            &HashMap::new(),
            &[],
            &labels,
            &manual(""),
        );
        let hit = ranges.iter().find(|r| r.start == 0x1100).expect("start");
        assert!(hit.start_reasons.contains(&"labelled".to_string()));
    }

    #[test]
    fn islands_are_their_own_modules() {
        let rom = rom(0x2000, &[(0x400, &[0x60, 0xff, 0x00, 0x00, 0x10, 0x00])]);
        let islands = vec![Island {
            offset: 0x400,
            target: 0x1404,
            index: 0,
        }];
        let ranges = compute_module_ranges(
            &rom,
            &[],
            &HashMap::new(),
            &islands,
            &LabelMap::default(),
            &manual("0 MODGUESS OFF\n"),
        );
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].start, ranges[0].stop), (0, 0x400));
        assert_eq!(ranges[0].stop_reasons, vec!["island".to_string()]);
        assert_eq!((ranges[1].start, ranges[1].stop), (0x400, 0x410));
        assert!(ranges[1].start_reasons.contains(&"BRA.L island".to_string()));
        assert!(ranges[1].stop_reasons.contains(&"after island".to_string()));
        assert_eq!((ranges[2].start, ranges[2].stop), (0x410, 0x2000));
    }

    #[test]
    fn mod_directives_cut_and_cap_ranges() {
        let rom = rom(0x2000, &[(0x0, &[0x4e, 0x71])]);
        let ranges = compute_module_ranges(
            &rom,
            &[],
            &HashMap::new(),
            &[],
            &LabelMap::default(),
            &manual("0 MODGUESS OFF\n800 MOD DoThing\n"),
        );
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].stop), (0, 0x800));
        assert_eq!(ranges[0].stop_reasons, vec!["next module".to_string()]);
        assert_eq!((ranges[1].start, ranges[1].stop), (0x800, 0x2000));
        assert_eq!(ranges[1].start_reasons, vec!["MOD DoThing".to_string()]);
    }

    #[test]
    fn trailing_nulls_are_trimmed() {
        // Code up to 0x87a, then six zero bytes to the ENDF at 0x880.
        let rom = rom(
            0x2000,
            &[(0x870, &[0x4e, 0x71, 0x4e, 0x71, 0x4e, 0x71, 0x4e, 0x71, 0x4e, 0x75])],
        );
        let ranges = compute_module_ranges(
            &rom,
            &[],
            &HashMap::new(),
            &[],
            &LabelMap::default(),
            &manual("0 MODGUESS OFF\n800 MOD Thing\n880 ENDF\n"),
        );
        let hit = ranges.iter().find(|r| r.start == 0x800).expect("module");
        assert_eq!(hit.stop, 0x87a);
        assert!(hit.stop_reasons.contains(&"nulls trimmed".to_string()));
    }

    #[test]
    fn an_all_zero_tail_is_left_alone() {
        // Eighteen zero bytes before the stop: the 16-byte window is pure
        // padding, so nothing is walked back.
        let rom = rom(0x2000, &[(0x840, &[0x4e, 0x75])]);
        let ranges = compute_module_ranges(
            &rom,
            &[],
            &HashMap::new(),
            &[],
            &LabelMap::default(),
            &manual("0 MODGUESS OFF\n800 MOD Thing\n880 ENDF\n"),
        );
        let hit = ranges.iter().find(|r| r.start == 0x800).expect("module");
        assert_eq!(hit.stop, 0x880);
        assert!(!hit.stop_reasons.contains(&"nulls trimmed".to_string()));
    }

    #[test]
    fn glue_stop_keeps_its_padding() {
        let rom = rom(0x2000, &[(0x400, &[0x4e, 0x75])]);
        let glues = vec![glue_at(0x440)];
        let ranges = compute_module_ranges(
            &rom,
            &glues,
            &HashMap::new(),
            &[],
            &LabelMap::default(),
            &manual("0 MODGUESS OFF\n"),
        );
        let first = &ranges[0];
        assert_eq!((first.start, first.stop), (0, 0x440));
        assert_eq!(first.stop_reasons, vec!["glue".to_string()]);
    }
}
