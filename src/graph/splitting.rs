//! splitting oversized lookup subtables

mod classdef;
mod ligature;
mod mark2base;
mod pairpos;

pub(crate) use ligature::split_ligature_subst;
pub(crate) use mark2base::split_mark_to_base;
pub(crate) use pairpos::split_pair_pos;

use std::collections::{HashMap, HashSet, VecDeque};

use font_types::GlyphId16;

use super::{Graph, ObjectId, OffsetLen};
use crate::object::TableData;
use crate::remap::Remaps;
use crate::table_type::TableType;

pub(crate) const MAX_TABLE_SIZE: usize = u16::MAX as usize;

const USE_MARK_FILTERING_SET: u16 = 0x0010;

/// A common impl handling updating the lookup with the new subtables
pub(super) fn split_subtables(
    graph: &mut Graph,
    lookup: ObjectId,
    split_fn: fn(&mut Graph, ObjectId) -> Option<Vec<ObjectId>>,
) {
    log::debug!(
        "trying to split subtables in '{}'",
        graph.objects[&lookup].type_
    );

    let subtables = graph.objects[&lookup]
        .offsets
        .iter()
        .map(|link| link.object)
        .collect::<Vec<_>>();

    let mut new_subtables = HashMap::new();
    for (i, subtable) in subtables.into_iter().enumerate() {
        // if the subtable is shared with another lookup we must not edit
        // it in place
        let subtable = graph.duplicate_if_shared(lookup, subtable);
        if let Some(split) = split_fn(graph, subtable) {
            log::trace!("produced {} splits for subtable {i}", split.len());
            new_subtables.insert(subtable, split);
        }
    }

    if new_subtables.is_empty() {
        log::debug!("Splitting produced no new subtables");
        return;
    }

    let n_new_subtables = new_subtables
        .values()
        // - 1 because each group of new subtables replaces an old subtable
        .map(|ids| ids.len() - 1)
        .sum::<usize>();
    log::debug!("Splitting produced {n_new_subtables} new subtables");

    let data = graph.objects.get(&lookup).cloned().unwrap();
    let n_total_subtables: u16 = (data.offsets.len() + n_new_subtables).try_into().unwrap();
    let lookup_type = data.read_u16_at(0).unwrap();
    let lookup_flag = data.read_u16_at(2).unwrap();
    let mark_filtering_set = (lookup_flag & USE_MARK_FILTERING_SET != 0)
        .then(|| data.read_u16_at(6 + data.offsets.len() * 2).unwrap());

    let mut new_data = TableData::new(data.type_);
    new_data.write(lookup_type);
    new_data.write(lookup_flag);
    new_data.write(n_total_subtables);
    for sub in &data.offsets {
        match new_subtables.get(&sub.object) {
            Some(new) => new
                .iter()
                .for_each(|id| new_data.add_offset(*id, OffsetLen::Offset16)),
            None => new_data.add_offset(sub.object, OffsetLen::Offset16),
        }
    }
    if let Some(mfs) = mark_filtering_set {
        new_data.write(mfs);
    }
    graph.replace_contents(lookup, new_data);
}

/// A format-specific splitting session over one oversized subtable.
///
/// The driver calls `clone_range` for every trailing range before asking
/// the original to `shrink`, so implementations may read the original's
/// links throughout.
pub(super) trait SplitContext {
    /// the number of elements (pair sets, mark classes, ligatures..)
    fn original_count(&self) -> usize;
    /// build a new subtable covering elements `[start, end)`
    fn clone_range(&mut self, graph: &mut Graph, start: usize, end: usize) -> ObjectId;
    /// truncate the original subtable to its first `count` elements
    fn shrink(&mut self, graph: &mut Graph, count: usize);
}

/// Turn a list of split points into subtables.
///
/// `split_points[i]` is the element index where new subtable `i + 1`
/// begins; the original keeps the leading range. Returns the replacement
/// subtables in order, the (shrunk) original first.
pub(super) fn actuate_subtable_split<T: SplitContext>(
    graph: &mut Graph,
    ctx: &mut T,
    split_points: &[usize],
    original: ObjectId,
) -> Vec<ObjectId> {
    debug_assert!(!split_points.is_empty());
    let count = ctx.original_count();
    let mut result = Vec::with_capacity(split_points.len() + 1);
    result.push(original);
    for (i, start) in split_points.iter().copied().enumerate() {
        let end = split_points.get(i + 1).copied().unwrap_or(count);
        debug_assert!(start < end, "split points are ascending and in range");
        result.push(ctx.clone_range(graph, start, end));
    }
    ctx.shrink(graph, split_points[0]);
    result
}

/// Total byte size of the subgraphs under `roots`.
///
/// Nodes already in `visited` count as zero; the set is *not* cleared, so
/// accumulation can span multiple calls.
pub(super) fn subgraph_size(
    graph: &Graph,
    roots: impl IntoIterator<Item = ObjectId>,
    visited: &mut HashSet<ObjectId>,
) -> usize {
    let mut size = 0;
    let mut queue: VecDeque<_> = roots.into_iter().collect();
    while let Some(next) = queue.pop_front() {
        if !visited.insert(next) {
            continue;
        }
        let obj = &graph.objects[&next];
        size += obj.bytes.len();
        queue.extend(obj.all_children());
    }
    size
}

/// Decode a coverage table into its glyphs, in coverage order.
///
/// Returns `None` if the bytes are not a wellformed coverage table; the
/// caller then skips splitting rather than panicking.
pub(super) fn read_coverage(data: &TableData) -> Option<Vec<GlyphId16>> {
    let format = data.read_u16_at(0)?;
    let count = data.read_u16_at(2)? as usize;
    let mut out = Vec::with_capacity(count);
    match format {
        1 => {
            for i in 0..count {
                out.push(GlyphId16::new(data.read_u16_at(4 + 2 * i)?));
            }
        }
        2 => {
            for i in 0..count {
                let rec = 4 + 6 * i;
                let start = data.read_u16_at(rec)?;
                let end = data.read_u16_at(rec + 2)?;
                if end < start {
                    return None;
                }
                out.extend((start..=end).map(GlyphId16::new));
            }
        }
        other => {
            log::warn!("unexpected coverage format '{other}'");
            return None;
        }
    }
    Some(out)
}

/// Encode a coverage table, picking the smaller of the two formats.
///
/// `glyphs` must be ascending; the remap is applied first (it preserves
/// order for retained glyphs).
pub(super) fn make_coverage(glyphs: &[GlyphId16], remaps: &Remaps) -> TableData {
    let glyphs = glyphs
        .iter()
        .map(|gid| remaps.glyph(*gid).to_u16())
        .collect::<Vec<_>>();
    debug_assert!(
        glyphs.windows(2).all(|w| w[0] < w[1]),
        "coverage glyphs are ascending"
    );
    let n_ranges = count_ranges(glyphs.iter().copied());
    let mut data = TableData::new(TableType::Named("CoverageTable"));
    if glyphs.len() * 2 <= n_ranges * 6 {
        data.write(1u16);
        data.write(glyphs.len() as u16);
        for gid in &glyphs {
            data.write(*gid);
        }
    } else {
        data.write(2u16);
        data.write(n_ranges as u16);
        let mut start_idx = 0;
        while start_idx < glyphs.len() {
            let mut end_idx = start_idx;
            while glyphs.get(end_idx + 1) == Some(&(glyphs[end_idx] + 1)) {
                end_idx += 1;
            }
            data.write(glyphs[start_idx]);
            data.write(glyphs[end_idx]);
            data.write(start_idx as u16); // startCoverageIndex
            start_idx = end_idx + 1;
        }
    }
    data
}

/// The number of (start, end) ranges needed to cover an ascending glyph list.
pub(super) fn count_ranges(glyphs: impl IntoIterator<Item = u16>) -> usize {
    let mut count = 0;
    let mut last = None;
    for gid in glyphs {
        match last.take() {
            Some(prev) if gid == prev + 1 => (), // in same range
            _ => count += 1, // first glyph or glyph that starts new range
        }
        last = Some(gid);
    }
    count
}
