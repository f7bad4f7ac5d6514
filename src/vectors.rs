use indexmap::IndexMap;
use thiserror::Error;

use crate::asmscan::scan;
use crate::m68k::{
    GLUE_A_MAGIC, GLUE_B_MOVEA_ABS_BASE, GLUE_B_MOVEA_ABS_MASK, GLUE_B_MOVEA_DISP_BASE,
    GLUE_B_MOVEA_DISP_MASK, JMP_IND_BASE, JMP_IND_MASK, OP_BSR_L, OP_LEA_DESCRIPTOR, OP_RTS,
};
use crate::rom::{RomError, RomImage, VECTOR_INIT_OFFSET};

pub const TABLE_ID_MIN: u16 = 0x2010;
pub const TABLE_ID_MAX: u16 = 0x208c;

/// ROM offsets are 20 bits; table entries carry flag bits above them.
const OFFSET_MASK: u32 = 0xf_ffff;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector init walk hit a foreign opcode {opcode:#06x} at {offset:#x}")]
    MalformedVectorInit { offset: u32, opcode: u16 },
    #[error(transparent)]
    Rom(#[from] RomError),
}

/// `(table_id, voffset) -> routine offset`, in discovery order.
#[derive(Debug, Default)]
pub struct VectorTables {
    pub routines: IndexMap<(u16, u16), u32>,
}

/// A dispatch trampoline found in ROM: loads the `(table, voffset)` slot and
/// jumps through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Glue {
    pub table: u16,
    pub voffset: u16,
    pub areg: u8,
    pub offset: u32,
}

/// A vector declaration from `VectorTable.a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceVector {
    pub label: String,
    pub table: u16,
    pub voffset: u16,
    pub areg: Option<u8>,
    pub comment: String,
}

#[must_use]
pub fn valid_table_id(table: u16) -> bool {
    (TABLE_ID_MIN..=TABLE_ID_MAX).contains(&table) && table % 4 == 0
}

/// Recovers the vector tables by following `InitRomVectors` from the ROM
/// header. A ROM that does not use the convention yields empty tables; a ROM
/// that starts the convention and breaks it mid-walk is malformed.
///
/// # Errors
/// `MalformedVectorInit` on a foreign opcode inside the BSR.L walk, or a
/// propagated `BadOffset` when a committed read leaves the trimmed ROM.
pub fn extract_vector_tables(rom: &RomImage) -> Result<VectorTables, VectorError> {
    let mut tables = VectorTables::default();

    let init = rom.u32be(VECTOR_INIT_OFFSET)?;
    if init == 0 || init >= rom.trim() {
        return Ok(tables);
    }
    match rom.u16be(init) {
        Ok(op) if op == OP_BSR_L => {}
        _ => return Ok(tables),
    }

    // The first BSR.L reaches the descriptor builder; the per-table entries
    // follow it.
    let mut at = init + 6;
    loop {
        let opcode = rom.u16be(at)?;
        if opcode == OP_RTS {
            break;
        }
        if opcode != OP_BSR_L {
            return Err(VectorError::MalformedVectorInit { offset: at, opcode });
        }
        let disp = rom.i32be(at + 2)?;
        let routine = i64::from(at) + 2 + i64::from(disp);
        let Ok(routine) = u32::try_from(routine) else {
            return Ok(VectorTables::default());
        };
        if !read_table(rom, routine, &mut tables)? {
            return Ok(VectorTables::default());
        }
        at += 6;
    }
    Ok(tables)
}

/// Reads one table descriptor. Returns `Ok(false)` when the descriptor shape
/// is absent, which abandons the convention altogether.
fn read_table(rom: &RomImage, at: u32, tables: &mut VectorTables) -> Result<bool, RomError> {
    match rom.u32be(at) {
        Ok(op) if op == OP_LEA_DESCRIPTOR => {}
        _ => return Ok(false),
    }
    let table = rom.u16be(at + 6)?;
    let rec = rom.u32be(at + 16)? & OFFSET_MASK;
    let count = rom.u32be(rec + 8)?;
    for i in 0..count {
        let routine = rom.u32be(at + 16 + 4 + 4 * i)? & OFFSET_MASK;
        tables.routines.insert((table, (4 * i) as u16), routine);
    }
    Ok(true)
}

/// Scans the whole trimmed ROM for glue stubs of both shape families. Only
/// stubs whose `(table, voffset)` slot exists in the recovered vector tables
/// are kept.
#[must_use]
pub fn scan_glues(rom: &RomImage, tables: &VectorTables) -> Vec<Glue> {
    let mut out = Vec::new();
    let trim = rom.trim();
    let mut at = 0u32;
    while at + 10 <= trim {
        if let Some(glue) = match_glue(rom, at, tables) {
            out.push(glue);
        }
        at += 2;
    }
    out
}

fn match_glue(rom: &RomImage, at: u32, tables: &VectorTables) -> Option<Glue> {
    // Family A: fixed dispatch through the stack, areg is always SP.
    if rom.u32be(at).ok()? == GLUE_A_MAGIC && rom.u16be(at + 8).ok()? == OP_RTS {
        let table = rom.u16be(at + 4).ok()?;
        let voffset = rom.u16be(at + 6).ok()?;
        if valid_table_id(table) && tables.routines.contains_key(&(table, voffset)) {
            return Some(Glue {
                table,
                voffset,
                areg: 7,
                offset: at,
            });
        }
    }

    // Family B: MOVEA.L/MOVEA.L/JMP with one register threaded through all
    // three words.
    let w0 = rom.u16be(at).ok()?;
    let w4 = rom.u16be(at + 4).ok()?;
    let w8 = rom.u16be(at + 8).ok()?;
    if w0 & GLUE_B_MOVEA_ABS_MASK == GLUE_B_MOVEA_ABS_BASE
        && w4 & GLUE_B_MOVEA_DISP_MASK == GLUE_B_MOVEA_DISP_BASE
        && w8 & JMP_IND_MASK == JMP_IND_BASE
    {
        let reg = (w0 >> 9) & 7;
        if (w4 >> 9) & 7 == reg && w4 & 7 == reg && w8 & 7 == reg {
            let table = rom.u16be(at + 2).ok()?;
            let voffset = rom.u16be(at + 6).ok()?;
            if valid_table_id(table) && tables.routines.contains_key(&(table, voffset)) {
                return Some(Glue {
                    table,
                    voffset,
                    areg: reg as u8,
                    offset: at,
                });
            }
        }
    }
    None
}

/// Parses `VectorTable.a` records: a labelled line whose first two arguments
/// are hex numbers with a valid table id declares a vector.
#[must_use]
pub fn parse_vector_source(text: &str) -> Vec<SourceVector> {
    scan(text)
        .filter_map(|rec| {
            if rec.label.is_empty() || rec.args.len() < 2 {
                return None;
            }
            let table = parse_asm_hex(&rec.args[0])?;
            let voffset = parse_asm_hex(&rec.args[1])?;
            if !valid_table_id(table) {
                return None;
            }
            let areg = rec.args.get(2).and_then(|a| parse_areg(a));
            Some(SourceVector {
                label: rec.label,
                table,
                voffset,
                areg,
                comment: rec.comment,
            })
        })
        .collect()
}

fn parse_asm_hex(token: &str) -> Option<u16> {
    let digits = token
        .strip_prefix('$')
        .or_else(|| token.strip_prefix("0x"))
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

fn parse_areg(token: &str) -> Option<u8> {
    let n = token.strip_prefix('A').or_else(|| token.strip_prefix('a'))?;
    let n: u8 = n.parse().ok()?;
    (n < 8).then_some(n)
}
