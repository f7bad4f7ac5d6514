use std::collections::HashSet;

use crate::m68k::OP_BRA_L;
use crate::rom::RomImage;

/// Global island handling, from the `ISLANDGUESS` directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IslandMode {
    #[default]
    Off,
    On,
    Hide,
}

/// A 16-byte BRA.L trampoline the original linker inserted to reach targets
/// beyond 16-bit PC-relative range. Consecutive cells form a group; `index`
/// counts from 0 within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Island {
    pub offset: u32,
    pub target: u32,
    pub index: u32,
}

/// Scans 16-byte aligned cells for island trampolines. `excluded` holds
/// `NONISLAND` offsets.
#[must_use]
pub fn detect_islands(rom: &RomImage, excluded: &HashSet<u32>) -> Vec<Island> {
    let mut out: Vec<Island> = Vec::new();
    let trim = rom.trim();
    let mut offset = 0u32;
    while offset + 16 <= trim {
        if !excluded.contains(&offset) {
            if let Some(target) = match_island(rom, offset) {
                let index = match out.last() {
                    Some(prev) if prev.offset + 16 == offset => prev.index + 1,
                    _ => 0,
                };
                out.push(Island {
                    offset,
                    target,
                    index,
                });
            }
        }
        offset += 16;
    }
    out
}

fn match_island(rom: &RomImage, offset: u32) -> Option<u32> {
    if rom.u16be(offset).ok()? != OP_BRA_L {
        return None;
    }
    if !rom.all_zero(offset + 6, 10) {
        return None;
    }
    let disp = rom.i32be(offset + 2).ok()?;
    let target = i64::from(offset) + 4 + i64::from(disp);
    if target < 0 || target >= i64::from(rom.trim()) || target & 1 != 0 {
        return None;
    }
    Some(target as u32)
}
