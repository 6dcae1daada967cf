//! splitting MarkToBase (GPOS lookup type 4) subtables

use std::collections::{BTreeSet, HashMap, HashSet};

use font_types::GlyphId16;

use super::{
    actuate_subtable_split, make_coverage, read_coverage, split_subtables, subgraph_size,
    SplitContext, MAX_TABLE_SIZE,
};
use crate::graph::{Graph, ObjectId, OffsetLen};
use crate::object::TableData;
use crate::remap::Remaps;
use crate::table_type::TableType;

pub(crate) fn split_mark_to_base(graph: &mut Graph, lookup: ObjectId) {
    split_subtables(graph, lookup, split_mark_to_base_subtable)
}

// the size of the subtable header plus the two (empty) array tables:
// format, markCoverageOffset, baseCoverageOffset, markClassCount,
// markArrayOffset, baseArrayOffset, markCount, baseCount
const MARK_BASE_SIZE: usize = 16;

// the mark array and base array, broken out per mark class
#[derive(Clone, Debug, Default)]
struct Mark2BaseClassInfo {
    // indices into the mark array
    marks: BTreeSet<usize>,
    // anchor tables reachable from this class
    children: Vec<ObjectId>,
}

// based off of <https://github.com/harfbuzz/harfbuzz/blob/f26fd69d858642d764/src/graph/markbasepos-graph.hh#L212>
fn split_mark_to_base_subtable(graph: &mut Graph, subtable: ObjectId) -> Option<Vec<ObjectId>> {
    let data = &graph.objects[&subtable];
    if data.read_u16_at(0)? != 1 {
        log::warn!("unexpected MarkBasePos format");
        return None;
    }
    let mark_coverage_id = data.offsets.first()?.object;
    let base_coverage_id = data.offsets.get(1)?.object;
    let mark_array_id = data.offsets.get(2)?.object;
    let base_array_id = data.offsets.get(3)?.object;
    let mark_class_count = data.read_u16_at(6)? as usize;
    let base_coverage_size = graph.objects[&base_coverage_id].bytes.len();
    let min_subtable_size = MARK_BASE_SIZE + base_coverage_size;

    let class_info = get_class_info(graph, mark_array_id, base_array_id, mark_class_count)?;
    let base_count = graph.objects[&base_array_id].read_u16_at(0)? as usize;

    let mut partial_coverage_size = 4;
    let mut accumulated = min_subtable_size;
    let mut split_points = Vec::new();
    let mut visited = HashSet::new();

    for (klass, info) in class_info.iter().enumerate() {
        let mark_size = info.marks.len() * 4; // MarkRecord
        let base_size = base_count * 2; // one column of base anchor offsets
        partial_coverage_size += info.marks.len() * 2;
        let accumulated_delta =
            mark_size + base_size + subgraph_size(graph, info.children.iter().copied(), &mut visited);
        accumulated += accumulated_delta;
        let total = accumulated + partial_coverage_size;
        if total > MAX_TABLE_SIZE && klass > 0 {
            log::trace!("adding split at class {klass}");
            split_points.push(klass);
            accumulated = min_subtable_size + accumulated_delta;
            partial_coverage_size = 4 + info.marks.len() * 2;
            visited.clear();
        }
    }

    if split_points.is_empty() {
        return None;
    }

    let mark_array = &graph.objects[&mark_array_id];
    let mark_count = mark_array.read_u16_at(0)? as usize;
    let mark_anchors = mark_array
        .offsets
        .iter()
        .map(|link| (((link.pos - 4) / 4) as usize, link.object))
        .collect::<HashMap<_, _>>();
    let mark_records = (0..mark_count)
        .map(|i| {
            let class = mark_array.read_u16_at(2 + 4 * i).unwrap_or_default();
            (class, mark_anchors.get(&i).copied())
        })
        .collect();
    let base_anchors = graph.objects[&base_array_id]
        .offsets
        .iter()
        .map(|link| (((link.pos - 2) / 2) as usize, link.object))
        .collect();

    let mut ctx = MarkToBaseSplit {
        subtable,
        mark_glyphs: read_coverage(&graph.objects[&mark_coverage_id])?,
        mark_records,
        base_anchors,
        base_coverage_id,
        base_count,
        class_count: mark_class_count,
        mark_array_type: graph.objects[&mark_array_id].type_,
        base_array_type: graph.objects[&base_array_id].type_,
        remaps: graph.remaps().clone(),
    };
    Some(actuate_subtable_split(graph, &mut ctx, &split_points, subtable))
}

// collect the marks and the reachable anchors for each mark class
fn get_class_info(
    graph: &Graph,
    mark_array_id: ObjectId,
    base_array_id: ObjectId,
    class_count: usize,
) -> Option<Vec<Mark2BaseClassInfo>> {
    let mut infos = vec![Mark2BaseClassInfo::default(); class_count];

    // mark records are four bytes, starting after the count
    let mark_array = &graph.objects[&mark_array_id];
    let mark_count = mark_array.read_u16_at(0)? as usize;
    for i in 0..mark_count {
        let class = mark_array.read_u16_at(2 + 4 * i)? as usize;
        if class >= class_count {
            log::warn!("mark record {i} names out of range class {class}");
            return None;
        }
        infos[class].marks.insert(i);
    }
    for link in &mark_array.offsets {
        let record = ((link.pos - 4) / 4) as usize;
        let class = mark_array.read_u16_at(2 + 4 * record)? as usize;
        infos.get_mut(class)?.children.push(link.object);
    }

    // the base array is a baseCount x classCount matrix of anchor offsets
    for link in &graph.objects[&base_array_id].offsets {
        let index = ((link.pos - 2) / 2) as usize;
        infos.get_mut(index % class_count)?.children.push(link.object);
    }
    Some(infos)
}

struct MarkToBaseSplit {
    subtable: ObjectId,
    // the mark coverage table, one glyph per mark record
    mark_glyphs: Vec<GlyphId16>,
    // the class and anchor of each mark record; no anchor means a null offset
    mark_records: Vec<(u16, Option<ObjectId>)>,
    // anchor at each (base * class_count + class) matrix index; sparse
    base_anchors: HashMap<usize, ObjectId>,
    base_coverage_id: ObjectId,
    base_count: usize,
    class_count: usize,
    mark_array_type: TableType,
    base_array_type: TableType,
    remaps: Remaps,
}

impl MarkToBaseSplit {
    // a new subtable covering mark classes [start, end)
    fn build(&self, graph: &mut Graph, start: usize, end: usize) -> TableData {
        let range = (start as u16)..(end as u16);
        let mark_indices = (0..self.mark_records.len())
            .filter(|i| range.contains(&self.mark_records[*i].0))
            .collect::<Vec<_>>();

        // mark records keep coverage order, so the glyphs stay sorted
        let cov_glyphs = mark_indices
            .iter()
            .map(|i| self.mark_glyphs[*i])
            .collect::<Vec<_>>();
        let mark_coverage_id = graph.add_object(make_coverage(&cov_glyphs, &self.remaps));

        let mut mark_array = TableData::new(self.mark_array_type);
        mark_array.write(mark_indices.len() as u16);
        for i in &mark_indices {
            let (class, anchor) = self.mark_records[*i];
            mark_array.write(class - start as u16);
            match anchor {
                Some(id) => mark_array.add_offset(id, OffsetLen::Offset16),
                None => mark_array.write(0u16),
            }
        }
        let mark_array_id = graph.add_object(mark_array);

        let mut base_array = TableData::new(self.base_array_type);
        base_array.write(self.base_count as u16);
        for base in 0..self.base_count {
            for class in start..end {
                match self.base_anchors.get(&(base * self.class_count + class)) {
                    Some(id) => base_array.add_offset(*id, OffsetLen::Offset16),
                    None => base_array.write(0u16),
                }
            }
        }
        let base_array_id = graph.add_object(base_array);

        let mut table = TableData::new(graph.objects[&self.subtable].type_);
        table.write(1u16);
        table.add_offset(mark_coverage_id, OffsetLen::Offset16);
        // the base coverage is shared, unchanged
        table.add_offset(self.base_coverage_id, OffsetLen::Offset16);
        table.write((end - start) as u16);
        table.add_offset(mark_array_id, OffsetLen::Offset16);
        table.add_offset(base_array_id, OffsetLen::Offset16);
        table
    }
}

impl SplitContext for MarkToBaseSplit {
    fn original_count(&self) -> usize {
        self.class_count
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
