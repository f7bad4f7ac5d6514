use std::collections::{HashMap, HashSet};

use crate::islands::Island;
use crate::labels::LabelMap;
use crate::m68k::RefKind;
use crate::refscan::RefSite;

/// A reference whose target resolved to a label. `site` stays absolute; the
/// emitter makes it module-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    pub site: u32,
    pub label: String,
    pub kind: RefKind,
    pub width: u8,
    pub island_index: i64,
}

/// A reference left byte-intact because no label covers its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedRef {
    pub site: u32,
    pub target: u32,
    pub kind: RefKind,
    pub width: u8,
}

#[derive(Debug, Default)]
pub struct RewriteOutcome {
    pub resolved: Vec<ResolvedRef>,
    pub unresolved: Vec<UnresolvedRef>,
}

/// Resolves and rewrites every reference whose instruction lies in
/// `[start, stop)`, patching `buf` (the module's bytes) in place.
///
/// Resolved non-branch operands are zeroed; branch operands are reseated to
/// the negated module-relative site so a relinker reads them as
/// distance-from-site. The resolved list comes back ordered by descending
/// island index of the original target, reproducing the original island
/// layout at relink time.
#[must_use]
pub fn rewrite_module(
    buf: &mut [u8],
    start: u32,
    stop: u32,
    sites: &[RefSite],
    labels: &LabelMap,
    glue_impls: &HashMap<u32, u32>,
    vector_impls: &HashSet<u32>,
    islands_by_offset: &HashMap<u32, Island>,
    hide_islands: bool,
) -> RewriteOutcome {
    let mut outcome = RewriteOutcome::default();

    for site in sites {
        let instruction = site.site.wrapping_sub(2);
        if instruction < start || instruction >= stop {
            continue;
        }
        let rel = (site.site - start) as usize;
        let width = usize::from(site.width);
        if rel + width > buf.len() {
            continue;
        }

        let orig_target = site.target;
        let mut target = site.target;
        if hide_islands {
            if let Some(island) = islands_by_offset.get(&target) {
                target = island.target;
            }
        }

        let mut label = None;
        if vector_impls.contains(&target) {
            // A direct call of a vectorised routine, bypassing its glue.
            label = labels.best(target).map(|l| format!("__v__{l}"));
        }
        if label.is_none() {
            if let Some(&implementation) = glue_impls.get(&target) {
                target = implementation;
            }
            label = labels.best(target).map(str::to_string);
        }

        if target >= start && target < stop {
            continue;
        }

        let Some(label) = label else {
            outcome.unresolved.push(UnresolvedRef {
                site: site.site,
                target: orig_target,
                kind: site.kind,
                width: site.width,
            });
            continue;
        };

        let field = &mut buf[rel..rel + width];
        field.fill(0);
        if site.kind.is_branch() {
            reseat(field, rel as u32);
        }
        let island_index = islands_by_offset
            .get(&orig_target)
            .map_or(-1, |island| i64::from(island.index));
        outcome.resolved.push(ResolvedRef {
            site: site.site,
            label,
            kind: site.kind,
            width: site.width,
            island_index,
        });
    }

    outcome.resolved.sort_by_key(|r| r.island_index);
    outcome.resolved.reverse();
    outcome
}

/// Writes `-rel` into the operand field, so the branch points at the module
/// start when the object is loaded at address 0.
fn reseat(field: &mut [u8], rel: u32) {
    let value = 0u32.wrapping_sub(rel);
    match field.len() {
        2 => field.copy_from_slice(&(value as u16).to_be_bytes()),
        _ => field.copy_from_slice(&value.to_be_bytes()),
    }
}
