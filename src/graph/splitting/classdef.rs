//! class definition tables, and estimating their size during splitting

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use font_types::GlyphId16;

use super::count_ranges;
use crate::object::TableData;
use crate::remap::Remaps;
use crate::table_type::TableType;

const HEADER_SIZE: usize = 4;
const GLYPH_SIZE: usize = 2;
const RANGE_SIZE: usize = 6;

/// Decode a class definition table into (glyph, class) pairs.
///
/// Glyphs in class 0 are omitted, matching their on-disk representation.
/// Returns `None` for bytes that are not a wellformed class def.
pub(super) fn read_class_def(data: &TableData) -> Option<BTreeMap<u16, u16>> {
    let format = data.read_u16_at(0)?;
    let mut out = BTreeMap::new();
    match format {
        1 => {
            let start = data.read_u16_at(2)?;
            let count = data.read_u16_at(4)?;
            for i in 0..count as usize {
                let class = data.read_u16_at(6 + 2 * i)?;
                if class != 0 {
                    out.insert(start + i as u16, class);
                }
            }
        }
        2 => {
            let count = data.read_u16_at(2)?;
            for i in 0..count as usize {
                let rec = 4 + 6 * i;
                let start = data.read_u16_at(rec)?;
                let end = data.read_u16_at(rec + 2)?;
                let class = data.read_u16_at(rec + 4)?;
                if end < start {
                    return None;
                }
                if class != 0 {
                    for gid in start..=end {
                        out.insert(gid, class);
                    }
                }
            }
        }
        other => {
            log::warn!("unexpected class def format '{other}'");
            return None;
        }
    }
    Some(out)
}

/// Encode a class definition table, picking the smaller of the two formats.
///
/// Class-0 entries are dropped; the glyph remap is applied first.
pub(super) fn make_class_def(
    entries: impl IntoIterator<Item = (GlyphId16, u16)>,
    remaps: &Remaps,
) -> TableData {
    let entries = entries
        .into_iter()
        .filter(|(_, class)| *class != 0)
        .map(|(gid, class)| (remaps.glyph(gid).to_u16(), class))
        .collect::<BTreeMap<_, _>>();

    let mut data = TableData::new(TableType::Named("ClassDef"));
    if entries.is_empty() {
        data.write(2u16);
        data.write(0u16);
        return data;
    }

    // ranges of consecutive glyphs sharing a class
    let mut ranges: Vec<(u16, u16, u16)> = Vec::new();
    for (gid, class) in &entries {
        match ranges.last_mut() {
            Some((_, end, prev_class)) if *end + 1 == *gid && prev_class == class => *end = *gid,
            _ => ranges.push((*gid, *gid, *class)),
        }
    }

    let first = *entries.keys().next().unwrap();
    let last = *entries.keys().next_back().unwrap();
    let span = (last - first) as usize + 1;
    let format1_size = 6 + GLYPH_SIZE * span;
    let format2_size = HEADER_SIZE + RANGE_SIZE * ranges.len();

    if format1_size <= format2_size {
        data.write(1u16);
        data.write(first);
        data.write(span as u16);
        for gid in first..=last {
            data.write(entries.get(&gid).copied().unwrap_or_default());
        }
    } else {
        data.write(2u16);
        data.write(ranges.len() as u16);
        for (start, end, class) in ranges {
            data.write(start);
            data.write(end);
            data.write(class);
        }
    }
    data
}

/// Estimates the size of class def and coverage tables that would cover
/// some subset of the classes in a (coverage, class def) pair.
///
/// Used while computing split points: as classes are added the estimator
/// reports how big the eventual class def and coverage tables would be,
/// without building them.
pub(super) struct ClassDefSizeEstimator {
    glyphs_per_class: HashMap<u16, BTreeSet<u16>>,
    ranges_per_class: HashMap<u16, usize>,
    included_classes: HashSet<u16>,
    included_glyphs: BTreeSet<u16>,
}

impl ClassDefSizeEstimator {
    pub(super) fn new(glyphs_and_classes: impl IntoIterator<Item = (GlyphId16, u16)>) -> Self {
        let mut glyphs_per_class = HashMap::<u16, BTreeSet<u16>>::new();
        for (gid, class) in glyphs_and_classes {
            glyphs_per_class.entry(class).or_default().insert(gid.to_u16());
        }
        // class 0 is never written to the class def, so it has no ranges
        let ranges_per_class = glyphs_per_class
            .iter()
            .filter(|(class, _)| **class != 0)
            .map(|(class, glyphs)| (*class, count_ranges(glyphs.iter().copied())))
            .collect();
        ClassDefSizeEstimator {
            glyphs_per_class,
            ranges_per_class,
            included_classes: Default::default(),
            included_glyphs: Default::default(),
        }
    }

    /// Include `class`, returning the estimated class def size so far.
    ///
    /// Including a class twice changes nothing. Class 0 contributes its
    /// glyphs to the coverage estimate only.
    pub(super) fn add_class_def_size(&mut self, class: u16) -> usize {
        if self.included_classes.insert(class) {
            if let Some(glyphs) = self.glyphs_per_class.get(&class) {
                self.included_glyphs.extend(glyphs.iter().copied());
            }
        }
        self.class_def_size()
    }

    fn class_def_size(&self) -> usize {
        let mut n_glyphs = 0usize;
        let mut n_ranges = 0usize;
        let mut min_gid = u16::MAX;
        let mut max_gid = 0u16;
        for class in self.included_classes.iter().filter(|class| **class != 0) {
            let Some(glyphs) = self.glyphs_per_class.get(class) else {
                continue;
            };
            n_glyphs += glyphs.len();
            min_gid = min_gid.min(*glyphs.iter().next().unwrap());
            max_gid = max_gid.max(*glyphs.iter().next_back().unwrap());
            n_ranges += self.ranges_per_class[class];
        }
        let format2_size = HEADER_SIZE + RANGE_SIZE * n_ranges;
        // format 1 covers a single contiguous run of glyphs
        let contiguous = n_glyphs > 0 && (max_gid - min_gid) as usize + 1 == n_glyphs;
        if contiguous {
            format2_size.min(HEADER_SIZE + GLYPH_SIZE * n_glyphs)
        } else {
            format2_size
        }
    }

    /// The estimated size of a coverage table over all included glyphs.
    pub(super) fn coverage_size(&self) -> usize {
        let dense = HEADER_SIZE + GLYPH_SIZE * self.included_glyphs.len();
        let ranged =
            HEADER_SIZE + RANGE_SIZE * count_ranges(self.included_glyphs.iter().copied());
        dense.min(ranged)
    }

    /// Forget the included classes; the per-class data is retained.
    pub(super) fn reset(&mut self) {
        self.included_classes.clear();
        self.included_glyphs.clear();
    }
}
