use std::collections::BTreeMap;
use std::collections::HashMap;

use indexmap::IndexSet;

/// Offset → labels, insert-only. Sets preserve insertion order so synthetic
/// names never mask source names; island labelling replaces the whole set.
#[derive(Debug, Default)]
pub struct LabelMap {
    map: BTreeMap<u32, IndexSet<String>>,
}

impl LabelMap {
    pub fn insert(&mut self, offset: u32, label: impl Into<String>) {
        self.map.entry(offset).or_default().insert(label.into());
    }

    /// Replaces every label at `offset`. Used for islands, whose names take
    /// precedence over anything already recorded.
    pub fn replace(&mut self, offset: u32, label: impl Into<String>) {
        let mut set = IndexSet::new();
        set.insert(label.into());
        self.map.insert(offset, set);
    }

    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        self.map.contains_key(&offset)
    }

    /// The unique minimum under `(length, lexicographic)`.
    #[must_use]
    pub fn best(&self, offset: u32) -> Option<&str> {
        self.map.get(&offset)?.iter().map(String::as_str).min_by(best_order)
    }

    /// All `(offset, label)` pairs in `[start, stop)`, by offset, then by
    /// insertion within each offset.
    #[must_use]
    pub fn in_range(&self, start: u32, stop: u32) -> Vec<(u32, &str)> {
        self.map
            .range(start..stop)
            .flat_map(|(&off, set)| set.iter().map(move |l| (off, l.as_str())))
            .collect()
    }
}

fn best_order(a: &&str, b: &&str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Labels chosen for one module: the module name plus its entry labels in the
/// two orders the emitter needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNames {
    pub name: String,
    /// Vector-bound entries by glue address first, then the rest by offset —
    /// the order that reproduces the ROM's glue sequence when relinked.
    pub chunk_entries: Vec<(u32, String)>,
    /// The same entries by implementation address, for the comment block.
    pub offset_entries: Vec<(u32, String)>,
}

/// Picks the module name and entry lists for `[start, stop)`.
///
/// `glue_of_label` maps `(offset, label)` to the glue address for
/// vector-bound labels. A label sitting exactly at `start` names the module
/// (vector-bound candidates win); without one the module is synthesised as
/// `AUTOMOD_`.
#[must_use]
pub fn name_module(
    labels: &LabelMap,
    glue_of_label: &HashMap<(u32, String), u32>,
    start: u32,
    stop: u32,
) -> ModuleNames {
    let mut vector_bound: Vec<(u32, u32, String)> = Vec::new();
    let mut other: Vec<(u32, String)> = Vec::new();
    for (offset, label) in labels.in_range(start, stop) {
        match glue_of_label.get(&(offset, label.to_string())) {
            Some(&glue) => vector_bound.push((glue, offset, label.to_string())),
            None => other.push((offset, label.to_string())),
        }
    }
    vector_bound.sort();
    other.sort();

    let name = if let Some(pos) = vector_bound.iter().position(|v| v.1 == start) {
        let (_, _, label) = vector_bound.remove(pos);
        label
    } else if let Some(pos) = other.iter().position(|v| v.0 == start) {
        let (_, label) = other.remove(pos);
        label
    } else {
        format!("AUTOMOD_{start:X}")
    };

    let mut chunk_entries: Vec<(u32, String)> = vector_bound
        .iter()
        .map(|(_, offset, label)| (*offset, label.clone()))
        .collect();
    chunk_entries.extend(other.iter().cloned());

    let mut offset_entries: Vec<(u32, String)> = chunk_entries.clone();
    offset_entries.sort();

    ModuleNames {
        name,
        chunk_entries,
        offset_entries,
    }
}
