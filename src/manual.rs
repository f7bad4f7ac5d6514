use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use thiserror::Error;

use crate::asmscan::{ascii_text, scan};
use crate::islands::IslandMode;

#[derive(Debug, Error)]
pub enum ManualError {
    #[error("annotation offsets go backwards at {offset:#x}")]
    OutOfOrder { offset: u32 },
    #[error("ISLANDGUESS must appear at offset 0, found at {offset:#x}")]
    IslandGuessNotAtZero { offset: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRecord {
    pub offset: u32,
    pub args: Vec<String>,
}

/// A contiguous group of modules destined for one output object, from a
/// `FILE`/`ENDF` directive pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRange {
    pub start: u32,
    pub stop: u32,
    pub relpath: String,
    pub flags: Vec<String>,
}

impl FileRange {
    #[must_use]
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(name))
    }

    /// Flags that are neither `WRITEOUT` nor `NOFORCE` gate the file on a
    /// feature name supplied on the command line.
    pub fn gate_flags(&self) -> impl Iterator<Item = &str> {
        self.flags
            .iter()
            .map(String::as_str)
            .filter(|f| !f.eq_ignore_ascii_case("WRITEOUT") && !f.eq_ignore_ascii_case("NOFORCE"))
    }
}

/// The operator-maintained annotation map: directive name (uppercased) to
/// records in file order.
#[derive(Debug, Default)]
pub struct Manual {
    directives: IndexMap<String, Vec<ManualRecord>>,
}

impl Manual {
    /// Parses already self-edited annotation text.
    ///
    /// # Errors
    /// `OutOfOrder` when directive offsets decrease anywhere in the file.
    pub fn parse(text: &str) -> Result<Self, ManualError> {
        let mut directives: IndexMap<String, Vec<ManualRecord>> = IndexMap::new();
        let mut floor = 0u32;
        for rec in scan(text) {
            if rec.directive.is_empty() {
                continue;
            }
            let Some(offset) = parse_hex(&rec.label) else {
                continue;
            };
            if offset < floor {
                return Err(ManualError::OutOfOrder { offset });
            }
            floor = offset;
            directives
                .entry(rec.directive.to_ascii_uppercase())
                .or_default()
                .push(ManualRecord {
                    offset,
                    args: rec.args,
                });
        }
        Ok(Self { directives })
    }

    #[must_use]
    pub fn records(&self, name: &str) -> &[ManualRecord] {
        self.directives.get(name).map_or(&[], Vec::as_slice)
    }

    fn labelled_offsets(&self, name: &str) -> Vec<(u32, String)> {
        self.records(name)
            .iter()
            .filter_map(|r| Some((r.offset, r.args.first()?.clone())))
            .collect()
    }

    /// `MOD` directives: forced module starts with their labels.
    #[must_use]
    pub fn forced_modules(&self) -> Vec<(u32, String)> {
        self.labelled_offsets("MOD")
    }

    /// `ENTRY` directives: extra entry labels.
    #[must_use]
    pub fn extra_entries(&self) -> Vec<(u32, String)> {
        self.labelled_offsets("ENTRY")
    }

    /// Offsets excluded from island detection.
    #[must_use]
    pub fn non_islands(&self) -> HashSet<u32> {
        self.records("NONISLAND").iter().map(|r| r.offset).collect()
    }

    /// The global island mode. Last directive at offset 0 wins.
    ///
    /// # Errors
    /// `IslandGuessNotAtZero` for a directive anywhere else.
    pub fn island_mode(&self) -> Result<IslandMode, ManualError> {
        let mut mode = IslandMode::Off;
        for rec in self.records("ISLANDGUESS") {
            if rec.offset != 0 {
                return Err(ManualError::IslandGuessNotAtZero { offset: rec.offset });
            }
            mode = match rec.args.first().map(String::as_str) {
                Some(arg) if arg.eq_ignore_ascii_case("HIDE") => IslandMode::Hide,
                Some(arg) if arg.eq_ignore_ascii_case("OFF") => IslandMode::Off,
                _ => IslandMode::On,
            };
        }
        Ok(mode)
    }

    /// Pairs `FILE` directives with the next `ENDF`; an unpaired `FILE` runs
    /// to the trimmed length.
    #[must_use]
    pub fn file_ranges(&self, trim: u32) -> Vec<FileRange> {
        let mut endfs = self.records("ENDF").iter().map(|r| r.offset).peekable();
        let mut out = Vec::new();
        for rec in self.records("FILE") {
            let Some(relpath) = rec.args.first().filter(|p| !p.is_empty()) else {
                continue;
            };
            while endfs.peek().is_some_and(|&e| e < rec.offset) {
                endfs.next();
            }
            let stop = endfs.next().unwrap_or(trim);
            out.push(FileRange {
                start: rec.offset,
                stop,
                relpath: relpath.clone(),
                flags: rec.args[1..].to_vec(),
            });
        }
        out
    }

    /// Enabled intervals for a `MODGUESS`/`REFGUESS`-style toggle. The state
    /// starts enabled at offset 0; each directive flips it at its offset.
    #[must_use]
    pub fn toggle_ranges(&self, name: &str, trim: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut open = Some(0u32);
        for rec in self.records(name) {
            let turning_off = rec
                .args
                .first()
                .is_some_and(|a| a.eq_ignore_ascii_case("OFF"));
            match (open, turning_off) {
                (Some(start), true) => {
                    if rec.offset > start {
                        out.push((start, rec.offset));
                    }
                    open = None;
                }
                (None, false) => open = Some(rec.offset),
                _ => {}
            }
        }
        if let Some(start) = open {
            if trim > start {
                out.push((start, trim));
            }
        }
        out
    }
}

fn parse_hex(token: &str) -> Option<u32> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(token, 16).ok()
}

fn hex_token_len(line: &[u8]) -> usize {
    line.iter().take_while(|b| b.is_ascii_hexdigit()).count()
}

fn token_terminated(line: &[u8], len: usize) -> bool {
    len > 0 && len <= 8 && line.get(len).is_none_or(|&b| b == b' ' || b == b'\t')
}

/// The self-edit pass: absolute hex prefixes set the accumulator, `+hex`
/// prefixes are rewritten to `accumulator + value` at the recorded width.
/// Untouched lines and all line endings pass through byte-for-byte.
#[must_use]
pub fn self_edit(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut acc = 0u32;
    let mut width = 8usize;

    let mut pos = 0usize;
    while pos < text.len() {
        let line_end = text[pos..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
            .map_or(text.len(), |i| pos + i);
        let line = &text[pos..line_end];

        if line.first() == Some(&b'+') {
            let len = hex_token_len(&line[1..]);
            if token_terminated(&line[1..], len) {
                let token = std::str::from_utf8(&line[1..1 + len]).unwrap_or("");
                if let Some(value) = parse_hex(token) {
                    let replaced = format!("{:0width$X}", acc.wrapping_add(value), width = width);
                    out.extend_from_slice(replaced.as_bytes());
                    out.extend_from_slice(&line[1 + len..]);
                } else {
                    out.extend_from_slice(line);
                }
            } else {
                out.extend_from_slice(line);
            }
        } else {
            let len = hex_token_len(line);
            if token_terminated(line, len) {
                let token = std::str::from_utf8(&line[..len]).unwrap_or("");
                if let Some(value) = parse_hex(token) {
                    acc = value;
                    width = len;
                }
            }
            out.extend_from_slice(line);
        }

        pos = line_end;
        if pos < text.len() && text[pos] == b'\r' {
            out.push(b'\r');
            pos += 1;
        }
        if pos < text.len() && text[pos] == b'\n' {
            out.push(b'\n');
            pos += 1;
        }
    }
    out
}

/// Loads `ROMPATH-info.txt`: applies the self-edit pass, writes the file back
/// when it changed, and parses the result. A missing file is not an error.
///
/// # Errors
/// I/O failure on the rewrite, or a structural `ManualError`.
pub fn load_annotation(path: &Path) -> anyhow::Result<Manual> {
    let Ok(raw) = std::fs::read(path) else {
        return Ok(Manual::default());
    };
    let edited = self_edit(&raw);
    if edited != raw {
        std::fs::write(path, &edited)
            .with_context(|| format!("failed to rewrite {}", path.display()))?;
    }
    Ok(Manual::parse(&ascii_text(&edited))?)
}

#[cfg(test)]
mod tests {
    use super::{self_edit, Manual, ManualError};
    use crate::islands::IslandMode;

    #[test]
    fn buckets_directives_by_name_in_order() {
        let manual = Manual::parse(
            "1000 FILE OS/First.o, WRITEOUT\n1400 ENDF\n1400 FILE OS/Second.o\n2000 ENDF\n",
        )
        .expect("parse");
        let files = manual.file_ranges(0x4000);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].relpath, "OS/First.o");
        assert_eq!((files[0].start, files[0].stop), (0x1000, 0x1400));
        assert!(files[0].has_flag("WRITEOUT"));
        assert_eq!((files[1].start, files[1].stop), (0x1400, 0x2000));
        assert!(!files[1].has_flag("WRITEOUT"));
    }

    #[test]
    fn unpaired_file_runs_to_trim() {
        let manual = Manual::parse("1000 FILE Tail.o\n").expect("parse");
        let files = manual.file_ranges(0x2000);
        assert_eq!((files[0].start, files[0].stop), (0x1000, 0x2000));
    }

    #[test]
    fn rejects_backward_offsets() {
        let err = Manual::parse("2000 MOD A\n1000 MOD B\n").expect_err("must fail");
        assert!(matches!(err, ManualError::OutOfOrder { offset: 0x1000 }));
    }

    #[test]
    fn toggle_ranges_start_enabled() {
        let manual =
            Manual::parse("1000 MODGUESS OFF\n2000 MODGUESS\n3000 MODGUESS OFF\n").expect("parse");
        assert_eq!(
            manual.toggle_ranges("MODGUESS", 0x4000),
            vec![(0, 0x1000), (0x2000, 0x3000)]
        );
        // No REFGUESS directives: the whole ROM is enabled.
        assert_eq!(manual.toggle_ranges("REFGUESS", 0x4000), vec![(0, 0x4000)]);
    }

    #[test]
    fn island_mode_last_write_wins_at_zero() {
        let manual = Manual::parse("0 ISLANDGUESS\n0 ISLANDGUESS HIDE\n").expect("parse");
        assert_eq!(manual.island_mode().expect("mode"), IslandMode::Hide);

        let manual = Manual::parse("10 ISLANDGUESS HIDE\n").expect("parse");
        assert!(matches!(
            manual.island_mode(),
            Err(ManualError::IslandGuessNotAtZero { offset: 0x10 })
        ));
    }

    #[test]
    fn self_edit_rewrites_relative_offsets() {
        let text = b"00001000 MOD First\n+10 ENTRY Second\n+2A ENTRY Third\n";
        let edited = self_edit(text);
        assert_eq!(
            edited,
            b"00001000 MOD First\n00001010 ENTRY Second\n0000102A ENTRY Third\n"
        );
    }

    #[test]
    fn self_edit_keeps_width_and_endings() {
        let text = b"1F00 MOD A\r\n+4 ENTRY B\r\nplain line\r\n";
        let edited = self_edit(text);
        assert_eq!(edited, b"1F00 MOD A\r\n1F04 ENTRY B\r\nplain line\r\n");
    }

    #[test]
    fn self_edit_is_idempotent() {
        let text = b"00400000 FILE A.o\n+16 ENDF\nBADHEXTOKENS MOD X\n";
        let once = self_edit(text);
        let twice = self_edit(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn accumulator_ignores_plus_lines() {
        // Both + lines are relative to 2000, not to each other.
        let text = b"2000 MOD A\n+10 ENTRY B\n+20 ENTRY C\n";
        assert_eq!(self_edit(text), b"2000 MOD A\n2010 ENTRY B\n2020 ENTRY C\n");
    }
}
