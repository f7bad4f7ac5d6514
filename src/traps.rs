use indexmap::IndexMap;

use crate::asmscan::scan;
use crate::rom::{RomImage, BAD_TRAP_OFFSET, TRAP_TABLE_OFFSET};

pub const TRAP_SLOT_COUNT: u32 = 1280;
pub const TRAP_BASE: u16 = 0xa000;
const TOOLBOX_SLOT: usize = 0x800;

/// Walks the 1,280-slot trap dispatch table. Zero slots, bad-trap slots, and
/// a table that runs off the trimmed ROM are all silently dropped.
#[must_use]
pub fn extract_traps(rom: &RomImage) -> IndexMap<u16, u32> {
    let mut out = IndexMap::new();
    let Ok(base) = rom.u32be(TRAP_TABLE_OFFSET) else {
        return out;
    };
    let Ok(badtrap) = rom.u32be(BAD_TRAP_OFFSET) else {
        return out;
    };
    if base == 0 {
        return out;
    }
    for slot in 0..TRAP_SLOT_COUNT {
        let i = slot * 4;
        let Ok(value) = rom.u32be(base + i) else {
            break;
        };
        if value == 0 || value == badtrap {
            continue;
        }
        let trap = if i < 4096 {
            0xa800 + (i / 4) as u16
        } else {
            TRAP_BASE + ((i - 4096) / 4) as u16
        };
        out.insert(trap, value);
    }
    out
}

/// Names for the trap range `0xA000..0xB000`, seeded with `_Axyz`
/// placeholders and overwritten from `DispTable.a`.
#[derive(Debug)]
pub struct TrapNames {
    names: Vec<String>,
    comments: Vec<String>,
}

impl Default for TrapNames {
    fn default() -> Self {
        Self {
            names: (0..0x1000).map(|n| format!("_A{n:03X}")).collect(),
            comments: vec![String::new(); 0x1000],
        }
    }
}

impl TrapNames {
    /// Applies `ToolBox` and `OS` records in order. Each directive kind keeps
    /// its own slot counter; macro-definition records (any `&`-prefixed
    /// argument) consume nothing.
    pub fn apply_source(&mut self, text: &str) {
        let mut toolbox = 0usize;
        let mut os = 0usize;
        for rec in scan(text) {
            let is_toolbox = rec.directive.eq_ignore_ascii_case("TOOLBOX");
            if !is_toolbox && !rec.directive.eq_ignore_ascii_case("OS") {
                continue;
            }
            if rec.args.iter().any(|a| a.starts_with('&')) {
                continue;
            }
            let index = if is_toolbox {
                toolbox += 1;
                TOOLBOX_SLOT + toolbox - 1
            } else {
                os += 1;
                os - 1
            };
            if index >= self.names.len() {
                continue;
            }
            let name = rec
                .args
                .first()
                .filter(|a| !a.is_empty())
                .cloned()
                .or_else(|| (!rec.label.is_empty()).then(|| rec.label.clone()));
            if let Some(name) = name {
                self.names[index] = name;
                self.comments[index] = rec.comment;
            }
        }
    }

    #[must_use]
    pub fn name(&self, trap: u16) -> Option<&str> {
        let index = trap.checked_sub(TRAP_BASE)? as usize;
        self.names.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn comment(&self, trap: u16) -> Option<&str> {
        let index = trap.checked_sub(TRAP_BASE)? as usize;
        self.comments
            .get(index)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_traps, TrapNames};
    use crate::rom::RomImage;

    fn rom(total: usize, fill: &[(usize, &[u8])]) -> RomImage {
        let mut bytes = vec![0u8; total];
        bytes[0x1a..0x1e].copy_from_slice(&(total as u32).to_be_bytes());
        for (at, data) in fill {
            bytes[*at..*at + data.len()].copy_from_slice(data);
        }
        RomImage::new(bytes).expect("load")
    }

    #[test]
    fn maps_slots_to_toolbox_and_os_numbers() {
        let mut fill: Vec<(usize, Vec<u8>)> = vec![
            (0x22, 0x1000u32.to_be_bytes().to_vec()),
            (0x56, 0xdeadu32.to_be_bytes().to_vec()),
            // Slot 0 (byte 0): toolbox trap 0xA800.
            (0x1000, 0x2000u32.to_be_bytes().to_vec()),
            // Slot byte 8: toolbox trap 0xA802.
            (0x1008, 0x2100u32.to_be_bytes().to_vec()),
            // Byte 4096: OS trap 0xA000.
            (0x2000, 0x2200u32.to_be_bytes().to_vec()),
            // Bad-trap slot is discarded.
            (0x100c, 0xdeadu32.to_be_bytes().to_vec()),
        ];
        fill.push((0x2004, 0x2300u32.to_be_bytes().to_vec()));
        let slices: Vec<(usize, &[u8])> =
            fill.iter().map(|(at, v)| (*at, v.as_slice())).collect();
        let rom = rom(0x2400, &slices);

        let traps = extract_traps(&rom);
        assert_eq!(traps.get(&0xa800), Some(&0x2000));
        assert_eq!(traps.get(&0xa802), Some(&0x2100));
        assert_eq!(traps.get(&0xa000), Some(&0x2200));
        assert_eq!(traps.get(&0xa001), Some(&0x2300));
        assert_eq!(traps.get(&0xa803), None);
        assert_eq!(traps.len(), 4);
    }

    #[test]
    fn truncated_table_is_fail_soft() {
        let rom = rom(0x1100, &[(0x22, &0x1000u32.to_be_bytes())]);
        // Only 0x100 bytes of table fit; the walk stops there without error,
        // and all-zero slots yield nothing.
        assert!(extract_traps(&rom).is_empty());
    }

    #[test]
    fn missing_table_pointer_is_fail_soft() {
        let rom = rom(0x1000, &[]);
        assert!(extract_traps(&rom).is_empty());
    }

    #[test]
    fn placeholders_follow_the_trap_number() {
        let names = TrapNames::default();
        assert_eq!(names.name(0xa000), Some("_A000"));
        assert_eq!(names.name(0xa9f4), Some("_A9F4"));
        assert_eq!(names.name(0x9fff), None);
    }

    #[test]
    fn source_records_overwrite_in_slot_order() {
        let mut names = TrapNames::default();
        names.apply_source(
            "\
 OS Open ; open a driver
 OS Close
 ToolBox &macroarg, stuff
 ToolBox InitGraf
_Dispatch ToolBox
",
        );
        assert_eq!(names.name(0xa000), Some("Open"));
        assert_eq!(names.comment(0xa000), Some("open a driver"));
        assert_eq!(names.name(0xa001), Some("Close"));
        // The macro line consumed no slot.
        assert_eq!(names.name(0xa800), Some("InitGraf"));
        assert_eq!(names.name(0xa801), Some("_Dispatch"));
        assert_eq!(names.name(0xa002), Some("_A002"));
    }
}
