//! splitting PairPos (GPOS lookup type 2) subtables

use std::collections::HashSet;

use font_types::GlyphId16;

use super::classdef::{make_class_def, read_class_def, ClassDefSizeEstimator};
use super::{
    actuate_subtable_split, make_coverage, read_coverage, split_subtables, subgraph_size,
    SplitContext, MAX_TABLE_SIZE,
};
use crate::graph::{Graph, ObjectId, OffsetLen};
use crate::object::TableData;
use crate::remap::Remaps;

pub(crate) fn split_pair_pos(graph: &mut Graph, lookup: ObjectId) {
    split_subtables(graph, lookup, split_pair_pos_subtable)
}

fn split_pair_pos_subtable(graph: &mut Graph, subtable: ObjectId) -> Option<Vec<ObjectId>> {
    match graph.objects[&subtable].read_u16_at(0)? {
        1 => split_pair_pos_format_1(graph, subtable),
        2 => split_pair_pos_format_2(graph, subtable),
        other => {
            log::warn!("unexpected pairpos format '{other}'");
            None
        }
    }
}

/// The byte length of a value record with this format.
fn value_record_len(format: u16) -> usize {
    (format & 0xFF).count_ones() as usize * 2
}

// header: posFormat, coverageOffset, valueFormat1, valueFormat2, pairSetCount
const PAIRPOS_1_BASE_SIZE: usize = 10;

// based off of
// <https://github.com/harfbuzz/harfbuzz/blob/5d543d64222c6ce45332d0c188790f90691ef112/src/graph/pairpos-graph.hh#L50>
fn split_pair_pos_format_1(graph: &mut Graph, subtable: ObjectId) -> Option<Vec<ObjectId>> {
    let data = &graph.objects[&subtable];
    let coverage_link = data.offsets.first()?;
    debug_assert_eq!(coverage_link.pos, 2, "offset records are always sorted");
    let coverage_size = graph.objects[&coverage_link.object].bytes.len();
    let glyphs = read_coverage(&graph.objects[&coverage_link.object])?;
    let value_format1 = data.read_u16_at(4)?;
    let value_format2 = data.read_u16_at(6)?;
    let pair_sets = data.offsets[1..]
        .iter()
        .map(|link| link.object)
        .collect::<Vec<_>>();

    let mut visited = HashSet::with_capacity(pair_sets.len());
    let mut partial_coverage_size = 4;
    let mut accumulated = PAIRPOS_1_BASE_SIZE;
    let mut split_points = Vec::new();

    for (i, pair_set) in pair_sets.iter().enumerate() {
        // the pair set plus any device tables it references, deduped
        // within the current candidate subtable
        let table_size = subgraph_size(graph, [*pair_set], &mut visited);
        let accumulated_delta = table_size +
            // the offset to the pair set
            2;
        // another glyph in the coverage table
        partial_coverage_size += 2;
        accumulated += accumulated_delta;
        let total = accumulated + coverage_size.min(partial_coverage_size);
        if total > MAX_TABLE_SIZE && i > 0 {
            log::trace!("adding split at {i}");
            split_points.push(i);
            accumulated = PAIRPOS_1_BASE_SIZE + accumulated_delta;
            partial_coverage_size = 6; // + one glyph, because this table didn't fit
            visited.clear();
        }
    }

    if split_points.is_empty() {
        log::debug!(
            "nothing to split, size '{}'",
            accumulated + coverage_size.min(partial_coverage_size)
        );
        return None;
    }

    let mut ctx = PairPosFormat1Split {
        subtable,
        glyphs,
        value_format1,
        value_format2,
        pair_sets,
        remaps: graph.remaps().clone(),
    };
    Some(actuate_subtable_split(graph, &mut ctx, &split_points, subtable))
}

struct PairPosFormat1Split {
    subtable: ObjectId,
    glyphs: Vec<GlyphId16>,
    value_format1: u16,
    value_format2: u16,
    pair_sets: Vec<ObjectId>,
    remaps: Remaps,
}

impl PairPosFormat1Split {
    fn build(&self, graph: &mut Graph, start: usize, end: usize) -> TableData {
        let coverage = make_coverage(&self.glyphs[start..end], &self.remaps);
        let cov_id = graph.add_object(coverage);
        let mut table = TableData::new(graph.objects[&self.subtable].type_);
        table.write(1u16);
        table.add_offset(cov_id, OffsetLen::Offset16);
        table.write(self.value_format1);
        table.write(self.value_format2);
        table.write((end - start) as u16);
        for pair_set in &self.pair_sets[start..end] {
            table.add_offset(*pair_set, OffsetLen::Offset16);
        }
        table
    }
}

impl SplitContext for PairPosFormat1Split {
    fn original_count(&self) -> usize {
        self.pair_sets.len()
    }

    fn clone_range(&mut self, graph: &mut Graph, start: usize, end: usize) -> ObjectId {
        let table = self.build(graph, start, end);
        graph.add_object(table)
    }

    fn shrink(&mut self, graph: &mut Graph, count: usize) {
        let table = self.build(graph, 0, count);
        graph.replace_contents(self.subtable, table);
    }
}

// header: posFormat, coverageOffset, valueFormat1, valueFormat2,
// classDef1Offset, classDef2Offset, class1Count, class2Count
const PAIRPOS_2_BASE_SIZE: usize = 16;

// based off of
// <https://github.com/harfbuzz/harfbuzz/blob/f380a32825a1b2c51bbe21dc7acb9b3cc0921f69/src/graph/pairpos-graph.hh#L207>
fn split_pair_pos_format_2(graph: &mut Graph, subtable: ObjectId) -> Option<Vec<ObjectId>> {
    let data = &graph.objects[&subtable];
    let class1_count = data.read_u16_at(12)? as usize;
    let class2_count = data.read_u16_at(14)? as usize;
    let value_format1 = data.read_u16_at(4)?;
    let value_format2 = data.read_u16_at(6)?;
    log::info!(
        "PairPos f.2 subtable has {class1_count} class1 and {class2_count} class2, current size {}",
        data.bytes.len()
    );

    let coverage_id = data.offsets.first()?.object;
    let class_def1_id = data.offsets.get(1)?.object;
    let class_def2_id = data.offsets.get(2)?.object;
    let class_def2_size = graph.objects[&class_def2_id].bytes.len();

    let glyphs = read_coverage(&graph.objects[&coverage_id])?;
    let classes = read_class_def(&graph.objects[&class_def1_id])?;
    let glyphs_and_classes = glyphs
        .iter()
        .map(|gid| (*gid, classes.get(&gid.to_u16()).copied().unwrap_or_default()))
        .collect::<Vec<_>>();
    let mut estimator = ClassDefSizeEstimator::new(glyphs_and_classes.iter().copied());

    let class1_record_size =
        class2_count * (value_record_len(value_format1) + value_record_len(value_format2));

    let mut accumulated = PAIRPOS_2_BASE_SIZE;
    let mut split_points = Vec::new();
    let mut visited = HashSet::new();
    let mut next_device_link = 3usize; // past the coverage and class def links

    for idx in 0..class1_count {
        let mut accumulated_delta = class1_record_size;
        let class_def_1_size = estimator.add_class_def_size(idx as u16);
        let coverage_size = estimator.coverage_size();

        // any device tables referenced from this class1 record
        let record_end = (PAIRPOS_2_BASE_SIZE + (idx + 1) * class1_record_size) as u32;
        while let Some(link) = data.offsets.get(next_device_link) {
            if link.pos >= record_end {
                break;
            }
            if visited.insert(link.object) {
                accumulated_delta += graph.objects[&link.object].bytes.len();
            }
            next_device_link += 1;
        }

        accumulated += accumulated_delta;
        let largest_obj = coverage_size.max(class_def_1_size).max(class_def2_size);
        let total = accumulated + coverage_size + class_def_1_size + class_def2_size
            // largest obj packs last and can overflow
            - largest_obj;

        if total > MAX_TABLE_SIZE && idx > 0 {
            split_points.push(idx);
            // the split does not include this class, so count it again
            accumulated = PAIRPOS_2_BASE_SIZE + accumulated_delta;
            estimator.reset();
            estimator.add_class_def_size(idx as u16);
            visited.clear();
        }
    }

    log::debug!("identified {} split points", split_points.len());
    if split_points.is_empty() {
        return None;
    }

    let mut ctx = PairPosFormat2Split {
        subtable,
        class1_count,
        glyphs_and_classes,
        value_format1,
        value_format2,
        class1_record_size,
        class2_count: class2_count as u16,
        class_def2_id,
        remaps: graph.remaps().clone(),
    };
    Some(actuate_subtable_split(graph, &mut ctx, &split_points, subtable))
}

struct PairPosFormat2Split {
    subtable: ObjectId,
    class1_count: usize,
    glyphs_and_classes: Vec<(GlyphId16, u16)>,
    value_format1: u16,
    value_format2: u16,
    class1_record_size: usize,
    class2_count: u16,
    class_def2_id: ObjectId,
    remaps: Remaps,
}

impl PairPosFormat2Split {
    fn build(&self, graph: &mut Graph, start: usize, end: usize) -> TableData {
        let src = graph.objects[&self.subtable].clone();
        let included = self
            .glyphs_and_classes
            .iter()
            .filter(|(_, class)| (start..end).contains(&(*class as usize)))
            .copied()
            .collect::<Vec<_>>();

        let cov_glyphs = included.iter().map(|(gid, _)| *gid).collect::<Vec<_>>();
        let cov_id = graph.add_object(make_coverage(&cov_glyphs, &self.remaps));
        // class values index the class1 records, so rebase them
        let new_class_def1 = make_class_def(
            included
                .iter()
                .map(|(gid, class)| (*gid, class - start as u16)),
            &self.remaps,
        );
        let class_def1_id = graph.add_object(new_class_def1);

        let mut table = TableData::new(src.type_);
        table.write(2u16);
        table.add_offset(cov_id, OffsetLen::Offset16);
        table.write(self.value_format1);
        table.write(self.value_format2);
        table.add_offset(class_def1_id, OffsetLen::Offset16);
        // class def 2 is shared, unchanged
        table.add_offset(self.class_def2_id, OffsetLen::Offset16);
        table.write((end - start) as u16);
        table.write(self.class2_count);

        // the class1 records copy over wholesale; only their device links
        // need re-recording
        let byte_start = PAIRPOS_2_BASE_SIZE + start * self.class1_record_size;
        let byte_end = PAIRPOS_2_BASE_SIZE + end * self.class1_record_size;
        table
            .bytes
            .extend_from_slice(&src.bytes[byte_start..byte_end]);
        let shift = (start * self.class1_record_size) as u32;
        for link in src.offsets.iter().skip(3) {
            if (link.pos as usize) < byte_start {
                continue;
            }
            if link.pos as usize >= byte_end {
                break;
            }
            let target = self.remap_device(graph, link.object);
            table.add_offset_at(link.pos - shift, target, OffsetLen::Offset16);
        }
        table
    }

    /// Reattach a device link, cloning VariationIndex tables through the
    /// variation-index remap when one is present.
    fn remap_device(&self, graph: &mut Graph, device: ObjectId) -> ObjectId {
        const DELTA_FORMAT_VARIATION_INDEX: u16 = 0x8000;
        if !self.remaps.has_var_indices() {
            return device;
        }
        let data = &graph.objects[&device];
        if data.bytes.len() != 6 || data.read_u16_at(4) != Some(DELTA_FORMAT_VARIATION_INDEX) {
            // a plain device table; nothing to remap
            return device;
        }
        let outer = data.read_u16_at(0).unwrap();
        let inner = data.read_u16_at(2).unwrap();
        let packed = ((outer as u32) << 16) | inner as u32;
        let mapped = self.remaps.var_index(packed);
        if mapped == packed {
            return device;
        }
        let mut new_data = TableData::new(data.type_);
        new_data.write((mapped >> 16) as u16);
        new_data.write(mapped as u16);
        new_data.write(DELTA_FORMAT_VARIATION_INDEX);
        graph.add_object(new_data)
    }
}

impl SplitContext for PairPosFormat2Split {
    fn original_count(&self) -> usize {
        self.class1_count
    }

    fn clone_range(&mut self, graph: &mut Graph, start: usize, end: usize) -> ObjectId {
        let table = self.build(graph, start, end);
        graph.add_object(table)
    }

    fn shrink(&mut self, graph: &mut Graph, count: usize) {
        let table = self.build(graph, 0, count);
        graph.replace_contents(self.subtable, table);
    }
}
