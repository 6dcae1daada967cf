//! splitting LigatureSubst (GSUB lookup type 4) subtables

use std::collections::HashSet;

use font_types::GlyphId16;

use super::{
    actuate_subtable_split, make_coverage, read_coverage, split_subtables, SplitContext,
};
use crate::graph::{Graph, ObjectId, OffsetLen};
use crate::object::TableData;
use crate::remap::Remaps;

pub(crate) fn split_ligature_subst(graph: &mut Graph, lookup: ObjectId) {
    split_subtables(graph, lookup, split_ligature_subst_subtable)
}

// format, coverageOffset, ligatureSetCount
const LIGATURE_SUBST_BASE_SIZE: usize = 6;
// an empty ligature set is just its count
const LIGATURE_SET_BASE_SIZE: usize = 2;

// unlike pairpos, we split mid ligature set where necessary, so split
// points index the flattened list of ligatures across all sets.
// based off of <https://github.com/harfbuzz/harfbuzz/blob/main/src/graph/ligature-graph.hh>
fn split_ligature_subst_subtable(graph: &mut Graph, subtable: ObjectId) -> Option<Vec<ObjectId>> {
    let data = &graph.objects[&subtable];
    if data.read_u16_at(0)? != 1 {
        log::warn!("unexpected LigatureSubst format");
        return None;
    }
    let coverage_id = data.offsets.first()?.object;
    let glyphs = read_coverage(&graph.objects[&coverage_id])?;
    // owned, since moving sets around below mutates the graph
    let set_links = data.offsets[1..].to_vec();
    if glyphs.len() != set_links.len() {
        log::warn!("coverage count does not match the ligature set count");
        return None;
    }

    // moving children around assumes each set slot is a distinct object
    let mut seen = HashSet::with_capacity(set_links.len());
    if !set_links.iter().all(|link| seen.insert(link.object)) {
        log::debug!("skipping split of subtable with repeated ligature sets");
        return None;
    }

    let mut accumulated = LIGATURE_SUBST_BASE_SIZE;
    let mut split_points = Vec::new();
    let mut sets = Vec::with_capacity(set_links.len());
    let mut liga_index = 0usize;

    for set_link in set_links {
        let set_id = graph.duplicate_if_shared(subtable, set_link.object);
        let set = &graph.objects[&set_id];
        // the offset to the set, plus its count field
        accumulated += 2 + LIGATURE_SET_BASE_SIZE;
        for liga_link in &set.offsets {
            let liga_size = graph.objects[&liga_link.object].bytes.len();
            accumulated += 2 + liga_size;
            if accumulated > super::MAX_TABLE_SIZE && liga_index > 0 {
                log::trace!("adding split at ligature {liga_index}");
                split_points.push(liga_index);
                // the next subtable opens with this set and this ligature
                accumulated =
                    LIGATURE_SUBST_BASE_SIZE + 2 + LIGATURE_SET_BASE_SIZE + 2 + liga_size;
            }
            liga_index += 1;
        }
        sets.push(SetInfo {
            set_pos: set_link.pos,
            set_obj: set_id,
            liga_positions: graph.objects[&set_id]
                .offsets
                .iter()
                .map(|link| link.pos)
                .collect(),
        });
    }

    if split_points.is_empty() {
        return None;
    }

    let mut ctx = LigatureSubstSplit {
        subtable,
        glyphs,
        sets,
        remaps: graph.remaps().clone(),
    };
    Some(actuate_subtable_split(graph, &mut ctx, &split_points, subtable))
}

struct SetInfo {
    // position of the offset to this set in the original subtable
    set_pos: u32,
    set_obj: ObjectId,
    // positions of the ligature offsets within the set
    liga_positions: Vec<u32>,
}

struct LigatureSubstSplit {
    subtable: ObjectId,
    // the coverage table, one glyph per ligature set
    glyphs: Vec<GlyphId16>,
    sets: Vec<SetInfo>,
    remaps: Remaps,
}

impl SplitContext for LigatureSubstSplit {
    fn original_count(&self) -> usize {
        self.sets.iter().map(|set| set.liga_positions.len()).sum()
    }

    fn clone_range(&mut self, graph: &mut Graph, start: usize, end: usize) -> ObjectId {
        // which sets does the flat ligature range intersect, and which of
        // their ligatures does it take?
        let mut included = Vec::new();
        let mut cursor = 0usize;
        for (i, set) in self.sets.iter().enumerate() {
            let len = set.liga_positions.len();
            let lo = start.max(cursor);
            let hi = end.min(cursor + len);
            if lo < hi {
                included.push((i, (lo - cursor)..(hi - cursor)));
            }
            cursor += len;
        }
        let first_set = included.first().unwrap().0;
        let last_set = included.last().unwrap().0;

        let coverage = make_coverage(&self.glyphs[first_set..=last_set], &self.remaps);
        let coverage_id = graph.add_object(coverage);

        // placeholder set slots, filled in below by moving children
        let mut prime = TableData::new(graph.objects[&self.subtable].type_);
        prime.write(1u16);
        prime.add_offset(coverage_id, OffsetLen::Offset16);
        prime.write(included.len() as u16);
        let slot_base = prime.bytes.len();
        for _ in &included {
            prime.write(0u16);
        }
        let prime_id = graph.add_object(prime);

        for (slot, (set_index, liga_range)) in included.iter().enumerate() {
            let slot_pos = (slot_base + 2 * slot) as u32;
            let set = &self.sets[*set_index];
            if *liga_range == (0..set.liga_positions.len()) {
                // the whole set moves over
                graph.move_child(self.subtable, set.set_pos, prime_id, slot_pos);
            } else {
                // a set that straddles the split; move just these ligatures
                let mut new_set = TableData::new(graph.objects[&set.set_obj].type_);
                new_set.write(liga_range.len() as u16);
                let liga_base = new_set.bytes.len();
                for _ in liga_range.clone() {
                    new_set.write(0u16);
                }
                let new_set_id = graph.add_object(new_set);
                for (i, liga) in liga_range.clone().enumerate() {
                    graph.move_child(
                        set.set_obj,
                        set.liga_positions[liga],
                        new_set_id,
                        (liga_base + 2 * i) as u32,
                    );
                }
                graph
                    .objects
                    .get_mut(&prime_id)
                    .unwrap()
                    .add_offset_at(slot_pos, new_set_id, OffsetLen::Offset16);
            }
        }
        prime_id
    }

    fn shrink(&mut self, graph: &mut Graph, count: usize) {
        let mut cursor = 0usize;
        let mut kept_sets = 0usize;
        for set in &self.sets {
            if cursor >= count {
                break;
            }
            kept_sets += 1;
            let len = set.liga_positions.len();
            let keep = (count - cursor).min(len);
            if keep < len {
                // the boundary set; its moved-out tail is placeholder zeros
                let mut data = graph.objects[&set.set_obj].clone();
                data.bytes.truncate(2 + 2 * keep);
                data.write_over(0, keep as u16);
                debug_assert!(data
                    .offsets
                    .iter()
                    .all(|link| (link.pos as usize) < 2 + 2 * keep));
                graph.replace_contents(set.set_obj, data);
            }
            cursor += len;
        }

        // kept sets were never moved off the subtable, so only the header
        // and coverage change
        let type_ = graph.objects[&self.subtable].type_;
        let coverage = make_coverage(&self.glyphs[..kept_sets], &self.remaps);
        let coverage_id = graph.add_object(coverage);
        let mut table = TableData::new(type_);
        table.write(1u16);
        table.add_offset(coverage_id, OffsetLen::Offset16);
        table.write(kept_sets as u16);
        for set in &self.sets[..kept_sets] {
            table.add_offset(set.set_obj, OffsetLen::Offset16);
        }
        graph.replace_contents(self.subtable, table);
    }
}
