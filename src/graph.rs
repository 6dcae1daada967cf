//! A graph for resolving table offsets

use crate::error::{Error, MalformedGraph, PackingError};
use crate::object::{Link, OffsetWhence, TableData};
use crate::remap::Remaps;
use crate::table_type::{lookup_type, TableType};

use std::{
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque},
    sync::atomic::AtomicU64,
};

#[cfg(feature = "dot2")]
mod graphviz;
mod splitting;

static OBJECT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An identifier for an object in the packing graph.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, Hash, PartialEq, Eq)]
pub struct ObjectId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OffsetLen {
    Offset16 = 2,
    Offset24 = 3,
    Offset32 = 4,
}

impl OffsetLen {
    /// The maximum value for an unsigned offset of this length.
    pub const fn max_value(self) -> u32 {
        match self {
            Self::Offset16 => u16::MAX as u32,
            Self::Offset24 => (1 << 24) - 1,
            Self::Offset32 => u32::MAX,
        }
    }

    /// The maximum value for a two's-complement offset of this length.
    pub const fn max_signed_value(self) -> i64 {
        match self {
            Self::Offset16 => i16::MAX as i64,
            Self::Offset24 => (1 << 23) - 1,
            Self::Offset32 => i32::MAX as i64,
        }
    }

    /// The minimum value for a two's-complement offset of this length.
    pub const fn min_signed_value(self) -> i64 {
        match self {
            Self::Offset16 => i16::MIN as i64,
            Self::Offset24 => -(1 << 23),
            Self::Offset32 => i32::MIN as i64,
        }
    }
}

impl std::fmt::Display for OffsetLen {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Offset16 => write!(f, "Offset16"),
            Self::Offset24 => write!(f, "Offset24"),
            Self::Offset32 => write!(f, "Offset32"),
        }
    }
}

/// A ranking used for sorting the graph.
///
/// Nodes are assigned a space, and nodes in lower spaces are always
/// packed before nodes in higher spaces.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, Hash, PartialEq, Eq)]
pub(crate) struct Space(u32);

impl Space {
    /// A generic space for nodes reachable via 16-bit offsets.
    const SHORT_REACHABLE: Space = Space(0);
    /// A generic space for nodes that are reachable via any offset.
    const REACHABLE: Space = Space(1);
    /// The first space used for assignment to specific subgraphs.
    const INIT: Space = Space(2);

    const fn is_custom(self) -> bool {
        self.0 >= Space::INIT.0
    }
}

impl ObjectId {
    pub fn next() -> Self {
        ObjectId(OBJECT_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// A graph of tables, starting at a single root.
///
/// The packing engine works on this type: it finds a write order for the
/// tables such that every offset is resolvable, editing the graph if it
/// has to (splitting, promotion, subgraph duplication), and then emits
/// the final bytes.
//NOTE: we don't derive Debug because it's way too verbose to be useful
pub struct Graph {
    /// the actual data for each table
    pub(crate) objects: BTreeMap<ObjectId, TableData>,
    /// graph-specific state used for sorting
    pub(crate) nodes: BTreeMap<ObjectId, Node>,
    order: Vec<ObjectId>,
    pub(crate) root: ObjectId,
    parents_invalid: bool,
    distance_invalid: bool,
    positions_invalid: bool,
    next_space: Space,
    num_roots_per_space: HashMap<Space, usize>,
    remaps: Remaps,
}

#[derive(Debug)]
pub(crate) struct Node {
    size: u32,
    distance: u32,
    /// overall position after sorting
    position: u32,
    pub(crate) space: Space,
    /// inbound edges; `None` marks a virtual (ordering-only) edge
    parents: Vec<(ObjectId, Option<OffsetLen>)>,
    priority: Priority,
}

/// Score used when computing shortest distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Distance {
    // a space ranking; like rankings are packed together,
    // and larger rankings are packed after smaller ones.
    space: Space,
    distance: u64,
    // a tie-breaker, based on order within a parent
    order: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct Priority(u8);

/// A record of an offset whose resolved value does not fit its field
#[derive(Clone, Debug)]
pub(crate) struct Overflow {
    parent: ObjectId,
    pub(crate) child: ObjectId,
    value: i64,
    offset_type: OffsetLen,
}

impl Priority {
    const ZERO: Priority = Priority(0);
    const ONE: Priority = Priority(1);
    const TWO: Priority = Priority(2);
    const THREE: Priority = Priority(3);

    #[cfg(test)]
    fn increase(&mut self) -> bool {
        let result = *self != Priority::THREE;
        self.0 = (self.0 + 1).min(3);
        result
    }
}

impl Distance {
    const ROOT: Distance = Distance {
        space: Space::SHORT_REACHABLE,
        distance: 0,
        order: 0,
    };

    fn rev(self) -> std::cmp::Reverse<Distance> {
        std::cmp::Reverse(self)
    }
}

impl Node {
    fn new(size: u32) -> Self {
        Node {
            size,
            position: Default::default(),
            distance: Default::default(),
            space: Space::REACHABLE,
            parents: Default::default(),
            priority: Default::default(),
        }
    }

    #[cfg(test)]
    fn raise_priority(&mut self) -> bool {
        self.priority.increase()
    }

    fn modified_distance(&self, order: u32) -> Distance {
        let prev_dist = self.distance as i64;
        let distance = match self.priority {
            Priority::ZERO => prev_dist,
            Priority::ONE => prev_dist - self.size as i64 / 2,
            Priority::TWO => prev_dist - self.size as i64,
            Priority::THREE => 0,
            _ => 0,
        }
        .max(0) as u64;

        Distance {
            space: self.space,
            distance,
            order,
        }
    }
}

/// `true` if `value` is representable in this offset field.
///
/// A resolved value of zero is reserved on disk for "no table", so a real
/// link resolving to zero never fits.
fn offset_fits(link: &Link, value: i64) -> bool {
    if value == 0 {
        return false;
    }
    if link.is_signed {
        (link.len.min_signed_value()..=link.len.max_signed_value()).contains(&value)
    } else {
        (1..=link.len.max_value() as i64).contains(&value)
    }
}

fn write_offset(at: &mut [u8], link: &Link, value: i64) {
    const CHECKED: &str = "offset overflow should be checked before now";
    let at = &mut at[..link.len as u8 as usize];
    let raw = if link.is_signed {
        i32::try_from(value).expect(CHECKED) as u32
    } else {
        u32::try_from(value).expect(CHECKED)
    };
    match link.len {
        OffsetLen::Offset16 => at.copy_from_slice(&raw.to_be_bytes()[2..]),
        OffsetLen::Offset24 => at.copy_from_slice(&raw.to_be_bytes()[1..]),
        OffsetLen::Offset32 => at.copy_from_slice(&raw.to_be_bytes()),
    }
}

impl Graph {
    pub(crate) fn from_objects(objects: BTreeMap<ObjectId, TableData>, root: ObjectId) -> Self {
        let nodes = objects
            .iter()
            .map(|(key, obj)| (*key, Node::new(obj.bytes.len() as u32)))
            .collect();
        Graph {
            objects,
            nodes,
            order: Default::default(),
            root,
            parents_invalid: true,
            distance_invalid: true,
            positions_invalid: true,
            next_space: Space::INIT,
            num_roots_per_space: Default::default(),
            remaps: Remaps::default(),
        }
    }

    /// Set the glyph and variation-index remapping tables.
    ///
    /// These are consulted whenever packing has to synthesize new coverage,
    /// class-definition, or VariationIndex tables while splitting.
    pub fn set_remaps(&mut self, remaps: Remaps) {
        self.remaps = remaps;
    }

    /// Pack the graph and return the serialized bytes.
    ///
    /// On failure nothing is written; the returned [`PackingError`] retains
    /// the graph for diagnosis.
    pub fn pack(mut self) -> Result<Vec<u8>, Error> {
        self.validate()?;
        self.remove_orphans();
        self.check_cycles()?;
        if self.pack_objects() {
            Ok(self.serialize())
        } else {
            Err(Error::PackingFailed(PackingError {
                graph: std::rc::Rc::new(self),
            }))
        }
    }

    /// Check the graph invariants we rely on everywhere else.
    ///
    /// Inputs can come from outside the crate, so violations are reported
    /// as errors instead of panicking later.
    fn validate(&self) -> Result<(), MalformedGraph> {
        if !self.objects.contains_key(&self.root) {
            return Err(MalformedGraph::MissingRoot(self.root));
        }
        for (id, obj) in &self.objects {
            for child in obj.all_children() {
                if !self.objects.contains_key(&child) {
                    return Err(MalformedGraph::MissingObject {
                        parent: *id,
                        child,
                    });
                }
            }
            for link in &obj.offsets {
                let end = link.pos as usize + link.len as u8 as usize;
                if end > obj.bytes.len() {
                    return Err(MalformedGraph::LinkOutOfBounds {
                        parent: *id,
                        pos: link.pos,
                        table_size: obj.bytes.len() as u32,
                    });
                }
            }
        }
        Ok(())
    }

    /// Reject graphs with a cycle reachable from the root.
    fn check_cycles(&self) -> Result<(), MalformedGraph> {
        const OPEN: u8 = 1;
        const DONE: u8 = 2;
        let mut state = HashMap::with_capacity(self.objects.len());
        let mut stack: Vec<(ObjectId, std::vec::IntoIter<ObjectId>)> = Vec::new();

        state.insert(self.root, OPEN);
        let children = self.objects[&self.root].all_children().collect::<Vec<_>>();
        stack.push((self.root, children.into_iter()));

        while !stack.is_empty() {
            let next = stack.last_mut().unwrap().1.next();
            match next {
                Some(child) => match state.get(&child).copied() {
                    Some(OPEN) => return Err(MalformedGraph::CycleDetected(child)),
                    Some(_) => (),
                    None => {
                        state.insert(child, OPEN);
                        let children = self.objects[&child].all_children().collect::<Vec<_>>();
                        stack.push((child, children.into_iter()));
                    }
                },
                None => {
                    let (id, _) = stack.pop().unwrap();
                    state.insert(id, DONE);
                }
            }
        }
        Ok(())
    }

    /// Write out the serialized graph.
    ///
    /// This is not public API, and you are responsible for ensuring that
    /// the graph is sorted before calling (by calling `pack_objects`, and
    /// checking that it has succeeded).
    pub(crate) fn serialize(&self) -> Vec<u8> {
        assert!(
            !self.order.is_empty(),
            "graph must be sorted before serialization"
        );
        let mut offsets = HashMap::new();
        let mut out = Vec::new();
        let mut off = 0u32;

        // first pass: write out bytes, record final positions
        for id in &self.order {
            let node = self.objects.get(id).unwrap();
            offsets.insert(*id, off);
            off += node.bytes.len() as u32;
            out.extend_from_slice(&node.bytes);
        }

        // second pass: resolve and write the offsets
        let mut table_head = 0u32;
        for id in &self.order {
            let node = self.objects.get(id).unwrap();
            let table_len = node.bytes.len() as u32;
            for link in &node.offsets {
                let child_pos = *offsets
                    .get(&link.object)
                    .expect("all children visited in first pass");
                let base = match link.whence {
                    OffsetWhence::Head => table_head as i64,
                    OffsetWhence::Tail => (table_head + table_len) as i64,
                    OffsetWhence::Absolute => 0,
                };
                let value = child_pos as i64 - base + link.bias as i64;
                let buffer_pos = (table_head + link.pos) as usize;
                write_offset(out.get_mut(buffer_pos..).unwrap(), link, value);
            }
            table_head += table_len;
        }
        out
    }

    /// Attempt to pack the graph.
    ///
    /// This involves finding an order for objects such that all offsets are
    /// resolvable.
    ///
    /// In the simple case, this just means finding a topological ordering.
    /// In exceptional cases, however, this may require us to significantly
    /// modify the graph.
    ///
    /// Our implementation is closely modeled on the implementation in the
    /// HarfBuzz repacker; see the [repacker docs] for further detail.
    ///
    /// returns `true` if a solution is found, `false` otherwise
    ///
    /// [repacker docs]: https://github.com/harfbuzz/harfbuzz/blob/main/docs/repacker.md
    pub(crate) fn pack_objects(&mut self) -> bool {
        // how many rounds of subgraph isolation we attempt before giving up
        const MAX_ISOLATION_ROUNDS: usize = 10;

        if self.basic_sort() {
            return true;
        }

        self.try_splitting_subtables();
        self.try_promoting_subtables();

        log::info!("assigning spaces");
        self.assign_spaces();
        self.sort_shortest_distance();

        if !self.has_overflows() {
            return true;
        }

        // now isolate spaces in a loop, until there are no more left:
        let mut round = 0;
        let overflows = loop {
            let overflows = self.find_overflows();
            if overflows.is_empty() {
                // we're done
                return true;
            }
            log::trace!(
                "round {round} failed with {} overflows, current size {}",
                overflows.len(),
                self.debug_len()
            );
            if round >= MAX_ISOLATION_ROUNDS {
                log::debug!("isolation round limit reached without solution");
                break overflows;
            }
            round += 1;
            if !self.try_isolating_subgraphs(&overflows) {
                log::debug!("finished isolating all subgraphs without solution");
                break overflows;
            }
            self.sort_shortest_distance();
        };

        assert!(!overflows.is_empty());
        self.debug_overflows(&overflows);
        false
    }

    /// Initial sorting operation. Attempt Kahn, falling back to shortest distance.
    ///
    /// This has to be called first, since it establishes an initial order.
    /// subsequent operations on the graph require this order.
    ///
    /// returns `true` if sort succeeds with no overflows
    fn basic_sort(&mut self) -> bool {
        log::trace!("sorting {} objects", self.objects.len());

        self.sort_kahn();
        if !self.has_overflows() {
            return true;
        }
        log::trace!("kahn failed, trying shortest distance");
        self.sort_shortest_distance();
        !self.has_overflows()
    }

    /// The value an offset field will hold, given the current positions.
    fn resolve_link(&self, parent_id: ObjectId, link: &Link) -> i64 {
        let parent = &self.nodes[&parent_id];
        let child = &self.nodes[&link.object];
        let base = match link.whence {
            OffsetWhence::Head => parent.position as i64,
            OffsetWhence::Tail => parent.position as i64 + parent.size as i64,
            OffsetWhence::Absolute => 0,
        };
        child.position as i64 - base + link.bias as i64
    }

    fn has_overflows(&self) -> bool {
        for (parent_id, data) in &self.objects {
            for link in &data.offsets {
                if !offset_fits(link, self.resolve_link(*parent_id, link)) {
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn find_overflows(&self) -> Vec<Overflow> {
        let mut result = Vec::new();
        for (parent_id, data) in &self.objects {
            for link in &data.offsets {
                let value = self.resolve_link(*parent_id, link);
                if !offset_fits(link, value) {
                    result.push(Overflow {
                        parent: *parent_id,
                        child: link.object,
                        value,
                        offset_type: link.len,
                    });
                }
            }
        }
        result
    }

    fn debug_overflows(&self, overflows: &[Overflow]) {
        let (parents, children): (HashSet<_>, HashSet<_>) =
            overflows.iter().map(|x| (x.parent, x.child)).unzip();
        log::debug!(
            "found {} overflows from {} parents to {} children",
            overflows.len(),
            parents.len(),
            children.len()
        );

        for overflow in overflows {
            log::debug!(
                "{:?} -> {:?} type {} value {}",
                overflow.parent,
                overflow.child,
                overflow.offset_type,
                overflow.value
            );
        }
    }

    // only valid if order is up to date. Returns total byte len of graph.
    fn debug_len(&self) -> usize {
        self.order
            .iter()
            .map(|id| self.objects.get(id).unwrap().bytes.len())
            .sum()
    }

    fn update_parents(&mut self) {
        if !self.parents_invalid {
            return;
        }
        for node in self.nodes.values_mut() {
            node.parents.clear();
        }

        for (id, obj) in &self.objects {
            for link in &obj.offsets {
                self.nodes
                    .get_mut(&link.object)
                    .unwrap()
                    .parents
                    .push((*id, Some(link.len)));
            }
            for virt in &obj.virtuals {
                self.nodes.get_mut(virt).unwrap().parents.push((*id, None));
            }
        }
        self.parents_invalid = false;
    }

    pub(crate) fn remove_orphans(&mut self) {
        let mut visited = HashSet::with_capacity(self.nodes.len());
        self.find_subgraph(self.root, &mut visited);
        if visited.len() != self.nodes.len() {
            log::info!("removing {} orphan nodes", self.nodes.len() - visited.len());
            for id in self
                .nodes
                .keys()
                .copied()
                .collect::<HashSet<_>>()
                .difference(&visited)
            {
                self.nodes.remove(id);
                self.objects.remove(id);
            }
            self.parents_invalid = true;
        }
    }

    pub(crate) fn sort_kahn(&mut self) {
        self.positions_invalid = true;
        if self.nodes.len() <= 1 {
            self.order.extend(self.nodes.keys().copied());
            return;
        }

        let mut queue = BinaryHeap::new();
        let mut removed_edges = HashMap::new();
        let mut current_pos: u32 = 0;
        self.order.clear();

        self.update_parents();
        queue.push(std::cmp::Reverse(self.root));

        while let Some(id) = queue.pop().map(|x| x.0) {
            let next = &self.objects[&id];
            self.order.push(id);
            self.nodes.get_mut(&id).unwrap().position = current_pos;
            current_pos += next.bytes.len() as u32;
            for child in next.all_children() {
                let seen_edges = removed_edges.entry(child).or_insert(0usize);
                *seen_edges += 1;
                // if the target of this link has no other incoming links, add
                // to the queue
                if *seen_edges == self.nodes[&child].parents.len() {
                    queue.push(std::cmp::Reverse(child));
                }
            }
        }
        debug_assert!(
            self.order.len() == self.nodes.len(),
            "cycles and orphans are rejected before sorting"
        );
    }

    pub(crate) fn sort_shortest_distance(&mut self) {
        self.positions_invalid = true;
        self.update_parents();
        self.update_distances();
        self.assign_space_0();

        let mut queue = BinaryHeap::new();
        let mut removed_edges = HashMap::with_capacity(self.nodes.len());
        let mut current_pos = 0;
        self.order.clear();

        queue.push((Distance::ROOT.rev(), self.root));
        let mut obj_order = 1u32;
        while let Some((_, id)) = queue.pop() {
            let next = &self.objects[&id];
            self.order.push(id);
            self.nodes.get_mut(&id).unwrap().position = current_pos;
            current_pos += next.bytes.len() as u32;
            for child in next.all_children() {
                let seen_edges = removed_edges.entry(child).or_insert(0usize);
                *seen_edges += 1;
                // if the target of this link has no other incoming links, add
                // to the queue
                if *seen_edges == self.nodes[&child].parents.len() {
                    let distance = self.nodes[&child].modified_distance(obj_order);
                    obj_order += 1;
                    queue.push((distance.rev(), child));
                }
            }
        }

        debug_assert!(
            self.order.len() == self.nodes.len(),
            "cycles and orphans are rejected before sorting"
        );
    }

    fn update_distances(&mut self) {
        self.nodes
            .values_mut()
            .for_each(|node| node.distance = u32::MAX);
        self.nodes.get_mut(&self.root).unwrap().distance = u32::MIN;

        let mut queue = BinaryHeap::new();
        let mut visited = HashSet::new();
        queue.push((Default::default(), self.root));

        while let Some((_, next_id)) = queue.pop() {
            if !visited.insert(next_id) {
                continue;
            }
            let next_distance = self.nodes[&next_id].distance;
            let next_obj = &self.objects[&next_id];
            for child in next_obj.all_children() {
                if visited.contains(&child) {
                    continue;
                }

                let child_node = self.nodes.get_mut(&child).unwrap();
                let child_distance = next_distance + child_node.size;

                if child_distance < child_node.distance {
                    child_node.distance = child_distance;
                    queue.push((child_distance, child));
                }
            }
        }

        self.distance_invalid = false;
    }

    /// isolate and assign spaces to subgraphs reachable via long offsets.
    ///
    /// This finds all subgraphs that are reachable via long offsets, and
    /// isolates them (ensuring they are *only* reachable via long offsets),
    /// assigning each unique space an identifier.
    ///
    /// Each space may have multiple roots; this works by finding the connected
    /// components from each root (counting only nodes reachable via long offsets).
    ///
    /// This is a close port of the [assign_spaces] method used by the HarfBuzz
    /// repacker.
    ///
    /// [assign_spaces]: https://github.com/harfbuzz/harfbuzz/blob/main/src/graph/graph.hh#L624
    fn assign_spaces(&mut self) -> bool {
        self.update_parents();
        let (visited, mut roots) = self.find_space_roots();

        if roots.is_empty() {
            return false;
        }

        log::trace!("found {} space roots to isolate", roots.len());

        // we want to *invert* the visited set
        let mut visited = self
            .order
            .iter()
            .copied()
            .collect::<HashSet<_>>()
            .difference(&visited)
            .copied()
            .collect::<HashSet<_>>();

        let mut connected_roots = BTreeSet::new(); // we can reuse this
        while let Some(next) = roots.iter().copied().next() {
            connected_roots.clear();
            self.find_connected_nodes(next, &mut roots, &mut visited, &mut connected_roots);
            self.isolate_subgraph(&mut connected_roots);

            self.distance_invalid = true;
            self.positions_invalid = true;
        }
        true
    }

    /// Find the root nodes of 32-bit space.
    ///
    /// These are the set of nodes that have incoming long offsets, for which
    /// no ancestor has an incoming long offset.
    ///
    /// Ported from the [find_space_roots] method in HarfBuzz.
    ///
    /// [find_space_roots]: https://github.com/harfbuzz/harfbuzz/blob/main/src/graph/graph.hh#L508
    fn find_space_roots(&self) -> (HashSet<ObjectId>, BTreeSet<ObjectId>) {
        let mut visited = HashSet::new();
        let mut roots = BTreeSet::new();

        let mut queue = VecDeque::from([self.root]);

        while let Some(id) = queue.pop_front() {
            if visited.contains(&id) {
                continue;
            }
            let obj = self.objects.get(&id).unwrap();
            for link in &obj.offsets {
                if link.len == OffsetLen::Offset32 {
                    roots.insert(link.object);
                    self.find_subgraph(link.object, &mut visited);
                } else {
                    queue.push_back(link.object);
                }
            }
            // virtual edges impose no width; keep walking
            queue.extend(obj.virtuals.iter().copied());
        }
        (visited, roots)
    }

    fn find_subgraph(&self, idx: ObjectId, nodes: &mut HashSet<ObjectId>) {
        if !nodes.insert(idx) {
            return;
        }
        for child in self.objects.get(&idx).unwrap().all_children() {
            self.find_subgraph(child, nodes);
        }
    }

    fn find_subgraph_map(&self, idx: ObjectId, graph: &mut BTreeMap<ObjectId, usize>) {
        use std::collections::btree_map::Entry;
        for child in self.objects[&idx].all_children() {
            match graph.entry(child) {
                // To avoid double counting, we only recurse if we are seeing
                // this node for the first time.
                Entry::Vacant(entry) => {
                    entry.insert(1);
                    self.find_subgraph_map(child, graph);
                }
                Entry::Occupied(entry) => {
                    *entry.into_mut() += 1;
                }
            }
        }
    }

    /// find all of the members of 'targets' that are reachable, skipping nodes in `visited`.
    fn find_connected_nodes(
        &self,
        id: ObjectId,
        targets: &mut BTreeSet<ObjectId>,
        visited: &mut HashSet<ObjectId>,
        connected: &mut BTreeSet<ObjectId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        if targets.remove(&id) {
            connected.insert(id);
        }
        // recurse to all children and parents
        for (obj, _) in &self.nodes.get(&id).unwrap().parents {
            self.find_connected_nodes(*obj, targets, visited, connected);
        }
        for child in self.objects.get(&id).unwrap().all_children() {
            self.find_connected_nodes(child, targets, visited, connected);
        }
    }

    /// Isolate the subgraph with the provided roots, moving it to a new space.
    ///
    /// This duplicates any nodes in this subgraph that are shared with
    /// any other nodes in the graph.
    ///
    /// Based on the [isolate_subgraph] method in HarfBuzz.
    ///
    /// [isolate_subgraph]: https://github.com/harfbuzz/harfbuzz/blob/main/src/graph/graph.hh#L508
    fn isolate_subgraph(&mut self, roots: &mut BTreeSet<ObjectId>) -> bool {
        self.update_parents();

        // map of object id -> number of incoming edges
        let mut subgraph = BTreeMap::new();

        for root in roots.iter() {
            // for the roots, we set the edge count to the number of long
            // incoming offsets; if this differs from the total number of
            // incoming offsets it means we need to dupe the root as well.
            let inbound_wide_offsets = self.nodes[root]
                .parents
                .iter()
                .filter(|(_, len)| !matches!(len, Some(OffsetLen::Offset16)))
                .count();
            subgraph.insert(*root, inbound_wide_offsets);
            self.find_subgraph_map(*root, &mut subgraph);
        }

        let next_space = self.next_space();
        log::debug!("moved {} roots to {next_space:?}", roots.len());
        self.num_roots_per_space.insert(next_space, roots.len());
        let mut id_map = HashMap::new();
        for (id, incoming_edges_in_subgraph) in &subgraph {
            // there are edges to this object from outside the subgraph; dupe it.
            if *incoming_edges_in_subgraph < self.nodes[id].parents.len() {
                self.duplicate_subgraph(*id, &mut id_map, next_space);
            }
        }

        // now remap any links in the subgraph from nodes that were not
        // themselves duplicated (since they were not reachable from outside)
        for id in subgraph.keys().filter(|k| !id_map.contains_key(k)) {
            self.nodes.get_mut(id).unwrap().space = next_space;
            let obj = self.objects.get_mut(id).unwrap();
            for link in &mut obj.offsets {
                if let Some(new_id) = id_map.get(&link.object) {
                    link.object = *new_id;
                }
            }
            for virt in &mut obj.virtuals {
                if let Some(new_id) = id_map.get(virt) {
                    *virt = *new_id;
                }
            }
        }

        if id_map.is_empty() {
            return false;
        }

        // now everything but the links to the roots has been remapped;
        // remap those, if needed
        for root in roots.iter() {
            let Some(new_id) = id_map.get(root) else {
                continue;
            };
            self.parents_invalid = true;
            self.positions_invalid = true;
            for (parent_id, len) in &self.nodes[new_id].parents {
                if !matches!(len, Some(OffsetLen::Offset16)) {
                    let parent = self.objects.get_mut(parent_id).unwrap();
                    for link in &mut parent.offsets {
                        if link.object == *root {
                            link.object = *new_id;
                        }
                    }
                    for virt in &mut parent.virtuals {
                        if *virt == *root {
                            *virt = *new_id;
                        }
                    }
                }
            }
        }

        // if any roots changed, we also rename them in the input set:
        for (old, new) in id_map {
            if roots.remove(&old) {
                roots.insert(new);
            }
        }

        true
    }

    /// for each space that has overflows and > 1 roots, select half the roots
    /// and move them to a separate subgraph.
    ///
    /// return `true` if any change was made.
    ///
    /// This is a port of the [_try_isolating_subgraphs] method in hb-repacker.
    ///
    /// [_try_isolating_subgraphs]: https://github.com/harfbuzz/harfbuzz/blob/main/src/hb-repacker.hh#L182
    fn try_isolating_subgraphs(&mut self, overflows: &[Overflow]) -> bool {
        let mut to_isolate = BTreeMap::new();
        for overflow in overflows {
            let parent_space = self.nodes[&overflow.parent].space;
            // we only isolate subgraphs in wide-space
            if !parent_space.is_custom() || self.num_roots_per_space[&parent_space] < 2 {
                continue;
            }
            // if parent space is custom it means all children should also be
            // in the same custom space.
            debug_assert_eq!(parent_space, self.nodes[&overflow.child].space);
            let root = self.find_root_of_space(overflow.parent);
            debug_assert_eq!(self.nodes[&root].space, parent_space);
            to_isolate
                .entry(parent_space)
                .or_insert_with(BTreeSet::new)
                .insert(root);
        }

        if to_isolate.is_empty() {
            return false;
        }

        for (space, mut roots) in to_isolate {
            let n_total_roots = self.num_roots_per_space[&space];
            debug_assert!(n_total_roots >= 2, "checked in the loop above");
            let max_to_move = n_total_roots / 2;
            log::trace!(
                "moving {} of {} candidate roots from {space:?} to new space",
                max_to_move.min(roots.len()),
                roots.len()
            );
            while roots.len() > max_to_move {
                roots.pop_last();
            }
            self.isolate_subgraph(&mut roots);
            *self.num_roots_per_space.get_mut(&space).unwrap() -= roots.len();
        }

        true
    }

    // invariant: obj must not be in space 0
    fn find_root_of_space(&self, obj: ObjectId) -> ObjectId {
        let space = self.nodes[&obj].space;
        debug_assert!(space.is_custom());
        let parent = self.nodes[&obj].parents[0].0;
        if self.nodes[&parent].space != space {
            return obj;
        }
        self.find_root_of_space(parent)
    }

    fn next_space(&mut self) -> Space {
        self.next_space = Space(self.next_space.0 + 1);
        self.next_space
    }

    fn try_promoting_subtables(&mut self) {
        let Some((can_promote, parent_id)) = self.get_promotable_subtables() else {
            return;
        };
        let to_promote = self.select_promotions(&can_promote, parent_id);
        log::info!(
            "promoting {} of {} eligible subtables",
            to_promote.len(),
            can_promote.len()
        );
        self.actually_promote_subtables(&to_promote);
    }

    pub(crate) fn actually_promote_subtables(&mut self, to_promote: &[ObjectId]) {
        fn make_extension(lookup: TableType, original_type: u16, subtable: ObjectId) -> TableData {
            const EXT_FORMAT: u16 = 1;
            let name = match lookup {
                TableType::GsubLookup(_) => "ExtensionSubstFormat1",
                _ => "ExtensionPosFormat1",
            };
            let mut data = TableData::new(TableType::Named(name));
            data.write(EXT_FORMAT);
            data.write(original_type);
            data.add_offset(subtable, OffsetLen::Offset32);
            data
        }

        for id in to_promote {
            // 'id' is a lookup table.
            // we need to:
            // - change the lookup type
            // - create a new extension table for each subtable
            // - update the object ids

            let mut lookup = self.objects.remove(id).unwrap();
            // promoting twice is a no-op
            if !lookup.type_.is_promotable() {
                self.objects.insert(*id, lookup);
                continue;
            }
            let original_type = lookup.type_.to_lookup_type().expect("validated before now");
            for subtable_ref in &mut lookup.offsets {
                let ext_table = make_extension(lookup.type_, original_type, subtable_ref.object);
                let ext_id = self.add_object(ext_table);
                subtable_ref.object = ext_id;
                subtable_ref.len = OffsetLen::Offset16;
            }
            let promoted = lookup.type_.promote();
            lookup.write_over(0, promoted.to_lookup_type().expect("lookups stay lookups"));
            lookup.type_ = promoted;
            self.objects.insert(*id, lookup);
        }
        self.parents_invalid = true;
        self.positions_invalid = true;
    }

    /// Manually add an object to the graph, after initial construction.
    ///
    /// This can be used to perform edits to the graph during packing, such
    /// as for table splitting or promotion.
    ///
    /// This has drawbacks; in particular, at this stage we no longer deduplicate
    /// objects.
    pub(crate) fn add_object(&mut self, data: TableData) -> ObjectId {
        self.parents_invalid = true;
        self.distance_invalid = true;

        let id = ObjectId::next();
        self.nodes.insert(id, Node::new(data.bytes.len() as _));
        self.objects.insert(id, data);
        id
    }

    /// Swap out the contents of an existing object, keeping its id.
    ///
    /// Used when a table shrinks during splitting; links into the object
    /// remain valid.
    pub(crate) fn replace_contents(&mut self, id: ObjectId, data: TableData) {
        self.nodes.get_mut(&id).unwrap().size = data.bytes.len() as u32;
        self.objects.insert(id, data);
        self.parents_invalid = true;
        self.distance_invalid = true;
        self.positions_invalid = true;
    }

    /// Shallow-duplicate `child`, retargeting only `parent`'s links at the clone.
    ///
    /// Links from any other table still point at the original.
    pub(crate) fn duplicate(&mut self, parent: ObjectId, child: ObjectId) -> ObjectId {
        let clone = self.objects.get(&child).cloned().unwrap();
        let space = self.nodes[&child].space;
        let new_id = self.add_object(clone);
        self.nodes.get_mut(&new_id).unwrap().space = space;
        log::trace!("duplicated {child:?} to {new_id:?} for {parent:?}");

        let parent_obj = self.objects.get_mut(&parent).unwrap();
        for link in &mut parent_obj.offsets {
            if link.object == child {
                link.object = new_id;
            }
        }
        for virt in &mut parent_obj.virtuals {
            if *virt == child {
                *virt = new_id;
            }
        }
        new_id
    }

    /// Copy-on-write: duplicate `child` only if tables other than `parent`
    /// link to it.
    ///
    /// Returns the id `parent`'s links point at afterwards. Link multiplicity
    /// counts: two links from the same parent are two inbound edges.
    pub(crate) fn duplicate_if_shared(&mut self, parent: ObjectId, child: ObjectId) -> ObjectId {
        self.update_parents();
        let links_from_parent = self.objects[&parent].links_to(child);
        debug_assert!(links_from_parent > 0, "parent must actually link to child");
        if self.nodes[&child].parents.len() <= links_from_parent {
            return child;
        }
        self.duplicate(parent, child)
    }

    /// Detach the link at `old_pos` of `old_parent` and reattach it at
    /// `new_pos` of `new_parent`.
    ///
    /// The link keeps its width, whence, bias and signedness.
    pub(crate) fn move_child(
        &mut self,
        old_parent: ObjectId,
        old_pos: u32,
        new_parent: ObjectId,
        new_pos: u32,
    ) {
        let old_obj = self.objects.get_mut(&old_parent).unwrap();
        let idx = old_obj
            .offsets
            .iter()
            .position(|link| link.pos == old_pos)
            .expect("moved links exist");
        let mut link = old_obj.offsets.remove(idx);
        link.pos = new_pos;
        self.objects.get_mut(&new_parent).unwrap().offsets.push(link);
        self.parents_invalid = true;
        self.distance_invalid = true;
    }

    /// The object pointed at by the offset field at `pos`, if there is one.
    pub(crate) fn index_for_offset(&self, id: ObjectId, pos: u32) -> Option<ObjectId> {
        self.objects
            .get(&id)?
            .offsets
            .iter()
            .find(|link| link.pos == pos)
            .map(|link| link.object)
    }

    pub(crate) fn remaps(&self) -> &Remaps {
        &self.remaps
    }

    // get the list of tables that can be promoted, as well as the id of their
    // parent table (`None` when a lookup is itself the root)
    fn get_promotable_subtables(&self) -> Option<(Vec<ObjectId>, Option<ObjectId>)> {
        let can_promote = self
            .objects
            .iter()
            .filter_map(|(id, obj)| (obj.type_.is_promotable()).then_some(*id))
            .collect::<Vec<_>>();

        if can_promote.is_empty() {
            return None;
        }

        // sanity check: ensure that all promotable tables have a common root.
        let parents = can_promote
            .iter()
            .flat_map(|id| {
                self.nodes
                    .get(id)
                    .expect("all nodes exist")
                    .parents
                    .iter()
                    .map(|x| x.0)
            })
            .collect::<HashSet<_>>();

        // the only promotable subtables should be lookups, and there should
        // be at most a single LookupList that is their parent; if there is
        // more than one parent then something weird is going on. a lookup
        // packed as the root has no parent at all, and is still promotable.
        if parents.len() > 1 {
            log::warn!("promotable subtables exist with multiple parents");
            return None;
        }

        let parent_id = parents.iter().next().copied();
        Some((can_promote, parent_id))
    }

    /// select the tables to promote to extension, harfbuzz algorithm
    ///
    /// Based on the logic in HarfBuzz's [`_promote_extensions_if_needed`][hb-promote] function.
    ///
    /// [hb-promote]: https://github.com/harfbuzz/harfbuzz/blob/5d543d64222c6ce45332d0c188790f90691ef112/src/hb-repacker.hh#L97
    fn select_promotions(
        &self,
        candidates: &[ObjectId],
        parent_id: Option<ObjectId>,
    ) -> Vec<ObjectId> {
        struct LookupSize {
            id: ObjectId,
            subgraph_size: usize,
            subtable_count: usize,
        }

        impl LookupSize {
            // I could impl Ord but then I need to impl PartialEq and it ends
            // up being way more code
            fn sort_key(&self) -> impl Ord {
                let bytes_per_subtable = self.subtable_count as f64 / self.subgraph_size as f64;
                // f64 isn't ord, so we turn it into an integer,
                // then reverse, because we want bigger things first
                std::cmp::Reverse((bytes_per_subtable * 1e9) as u64)
            }
        }

        let mut lookup_sizes = Vec::with_capacity(candidates.len());
        let mut reusable_buffer = HashSet::new();
        let mut queue = VecDeque::new();
        for id in candidates {
            // get the subgraph size
            queue.clear();
            queue.push_back(*id);
            let subgraph_size = self.find_subgraph_size(&mut queue, &mut reusable_buffer);
            let subtable_count = self.objects.get(id).unwrap().offsets.len();
            lookup_sizes.push(LookupSize {
                id: *id,
                subgraph_size,
                subtable_count,
            });
        }

        lookup_sizes.sort_by_key(LookupSize::sort_key);
        const EXTENSION_SIZE: usize = 8; // number of bytes added by an extension subtable
        const MAX_LAYER_SIZE: usize = u16::MAX as usize;

        // a rootless lookup has no LookupList layer to account for
        let lookup_list_size = parent_id
            .map(|id| self.objects.get(&id).unwrap().bytes.len())
            .unwrap_or_default();
        let mut l2_l3_size = lookup_list_size; // size of LookupList + lookups
        let mut l3_l4_size = 0; // Lookups + lookup subtables
        let mut l4_plus_size = 0; // subtables and anything below that

        // start by assuming all lookups are extensions; we will adjust this later
        // if we do not promote.
        for lookup in &lookup_sizes {
            let subtables_size = lookup.subtable_count * EXTENSION_SIZE;
            l3_l4_size += subtables_size;
            l4_plus_size += subtables_size;
        }

        let mut layers_full = false;
        let mut to_promote = Vec::new();
        for lookup in &lookup_sizes {
            if !layers_full {
                let lookup_size = self.objects.get(&lookup.id).unwrap().bytes.len();
                let subtables_size = self.find_children_size(lookup.id);
                let remaining_size = lookup.subgraph_size - lookup_size - subtables_size;
                l2_l3_size += lookup_size;
                l3_l4_size += lookup_size + subtables_size;
                // adjust down, because we are demoting out of extension space
                l3_l4_size -= lookup.subtable_count * EXTENSION_SIZE;
                l4_plus_size += subtables_size + remaining_size;

                if l2_l3_size < MAX_LAYER_SIZE
                    && l3_l4_size < MAX_LAYER_SIZE
                    && l4_plus_size < MAX_LAYER_SIZE
                {
                    // this lookup fits in the 16-bit space, great
                    continue;
                }
                layers_full = true;
            }
            to_promote.push(lookup.id);
        }
        to_promote
    }

    /// See if we have any subtables that support splitting, and split them
    /// if needed.
    ///
    /// Based on [`_presplit_subtables_if_needed`][presplit] in hb-repacker
    ///
    /// [presplit]: https://github.com/harfbuzz/harfbuzz/blob/5d543d64222c6ce45332d0c188790f90691ef112/src/hb-repacker.hh#LL72C22-L72C22
    fn try_splitting_subtables(&mut self) {
        let splittable = self
            .objects
            .iter()
            .filter_map(|(id, obj)| obj.type_.is_splittable().then_some(*id))
            .collect::<Vec<_>>();
        for lookup in &splittable {
            self.split_subtables_if_needed(*lookup);
        }
        if !splittable.is_empty() {
            self.remove_orphans();
        }
    }

    fn split_subtables_if_needed(&mut self, lookup: ObjectId) {
        match self.objects[&lookup].type_ {
            TableType::GposLookup(lookup_type::GPOS_PAIR_POS) => {
                splitting::split_pair_pos(self, lookup)
            }
            TableType::GposLookup(lookup_type::GPOS_MARK_TO_BASE) => {
                splitting::split_mark_to_base(self, lookup)
            }
            TableType::GsubLookup(lookup_type::GSUB_LIGATURE) => {
                splitting::split_ligature_subst(self, lookup)
            }
            _ => (),
        }
    }

    /// the size only of children of this object, not the whole subgraph
    fn find_children_size(&self, id: ObjectId) -> usize {
        self.objects[&id]
            .offsets
            .iter()
            .map(|off| self.objects.get(&off.object).unwrap().bytes.len())
            .sum()
    }

    pub(crate) fn find_subgraph_size(
        &self,
        queue: &mut VecDeque<ObjectId>,
        visited: &mut HashSet<ObjectId>,
    ) -> usize {
        let mut size = 0;
        visited.clear();
        while !queue.is_empty() {
            let next = queue.pop_front().unwrap();
            visited.insert(next);
            let obj = self.objects.get(&next).unwrap();
            size += obj.bytes.len();
            queue.extend(
                obj.all_children()
                    .filter(|child| !visited.contains(child)),
            );
        }
        size
    }

    fn duplicate_subgraph(
        &mut self,
        root: ObjectId,
        dupes: &mut HashMap<ObjectId, ObjectId>,
        space: Space,
    ) -> ObjectId {
        if let Some(existing) = dupes.get(&root) {
            return *existing;
        }
        self.parents_invalid = true;
        self.distance_invalid = true;
        let new_root = ObjectId::next();
        log::trace!("duplicating node {root:?} to {new_root:?}");

        let mut obj = self.objects.get(&root).cloned().unwrap();
        let mut node = Node::new(obj.bytes.len() as u32);
        node.space = space;

        for link in &mut obj.offsets {
            // recursively duplicate the object
            link.object = self.duplicate_subgraph(link.object, dupes, space);
        }
        for virt in &mut obj.virtuals {
            *virt = self.duplicate_subgraph(*virt, dupes, space);
        }
        dupes.insert(root, new_root);
        self.objects.insert(new_root, obj);
        self.nodes.insert(new_root, node);
        new_root
    }

    /// Find the set of nodes that are reachable from root only following
    /// 16 & 24 bit offsets, and assign them to space 0.
    fn assign_space_0(&mut self) {
        let mut stack = VecDeque::from([self.root]);

        while let Some(next) = stack.pop_front() {
            match self.nodes.get_mut(&next) {
                Some(node) if node.space != Space::SHORT_REACHABLE => {
                    node.space = Space::SHORT_REACHABLE
                }
                _ => continue,
            }
            if let Some(obj) = self.objects.get(&next) {
                for link in &obj.offsets {
                    if link.len != OffsetLen::Offset32 {
                        stack.push_back(link.object);
                    }
                }
                stack.extend(obj.virtuals.iter().copied());
            }
        }
    }

    #[cfg(test)]
    fn find_descendents(&self, root: ObjectId) -> HashSet<ObjectId> {
        let mut result = HashSet::new();
        let mut stack = VecDeque::from([root]);
        while let Some(id) = stack.pop_front() {
            if result.insert(id) {
                for child in self
                    .objects
                    .get(&id)
                    .iter()
                    .flat_map(|obj| obj.all_children())
                {
                    stack.push_back(child);
                }
            }
        }
        result
    }

    #[cfg(feature = "dot2")]
    pub(crate) fn write_graph_viz(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        // if this is set then we prune the generated graph
        const PRUNE_GRAPH_ENV_VAR: &str = "REPACKER_PRUNE_GRAPH";
        let try_trim_graph = std::env::var_os(PRUNE_GRAPH_ENV_VAR).is_some();
        graphviz::GraphVizGraph::from_graph(self, try_trim_graph).write_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use crate::GraphBuilder;

    use super::*;

    pub(crate) fn make_ids<const N: usize>() -> [ObjectId; N] {
        let mut ids = [ObjectId::next(); N];
        for id in ids.iter_mut().skip(1) {
            *id = ObjectId::next();
        }
        ids
    }

    struct TestLink {
        from: ObjectId,
        to: ObjectId,
        width: Option<OffsetLen>,
    }

    pub(crate) struct TestGraphBuilder {
        objects: Vec<(ObjectId, usize)>,
        links: Vec<TestLink>,
    }

    impl TestGraphBuilder {
        pub(crate) fn new<const N: usize>(ids: [ObjectId; N], sizes: [usize; N]) -> Self {
            TestGraphBuilder {
                objects: ids.into_iter().zip(sizes).collect(),
                links: Default::default(),
            }
        }

        pub(crate) fn add_link(
            &mut self,
            from: ObjectId,
            to: ObjectId,
            width: OffsetLen,
        ) -> &mut Self {
            self.links.push(TestLink {
                from,
                to,
                width: Some(width),
            });
            self
        }

        fn add_virtual_link(&mut self, from: ObjectId, to: ObjectId) -> &mut Self {
            self.links.push(TestLink {
                from,
                to,
                width: None,
            });
            self
        }

        pub(crate) fn build(&self) -> Graph {
            let mut objects = self
                .objects
                .iter()
                .map(|(id, size)| (*id, TableData::make_mock(*size)))
                .collect::<BTreeMap<_, _>>();

            for link in &self.links {
                let from = objects.get_mut(&link.from).unwrap();
                match link.width {
                    Some(width) => from.add_mock_offset(link.to, width),
                    None => from.add_virtual(link.to),
                }
            }
            let root = self.objects.first().unwrap().0;
            Graph::from_objects(objects, root)
        }
    }

    #[test]
    fn priority_smoke_test() {
        let mut node = Node::new(20);
        node.distance = 100;
        let mod0 = node.modified_distance(1);
        node.raise_priority();
        let mod1 = node.modified_distance(1);
        assert!(mod0 > mod1);
        node.raise_priority();
        let mod2 = node.modified_distance(1);
        assert!(mod1 > mod2);
        node.raise_priority();
        let mod3 = node.modified_distance(1);
        assert!(mod2 > mod3, "{mod2:?} {mod3:?}");

        // max priority is 3
        node.raise_priority();
        let mod4 = node.modified_distance(1);
        assert_eq!(mod3, mod4);
    }

    #[test]
    fn kahn_basic() {
        let ids = make_ids::<4>();
        let sizes = [10, 10, 20, 10];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset16)
            .add_link(ids[0], ids[3], OffsetLen::Offset16)
            .add_link(ids[3], ids[1], OffsetLen::Offset16)
            .build();

        graph.sort_kahn();
        // 3 links 1, so 1 must be last
        assert_eq!(&graph.order, &[ids[0], ids[2], ids[3], ids[1]]);
    }

    #[test]
    fn shortest_basic() {
        let ids = make_ids::<4>();
        let sizes = [10, 10, 20, 10];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset16)
            .add_link(ids[0], ids[3], OffsetLen::Offset16)
            .build();

        graph.sort_shortest_distance();
        // but 2 is larger than 3, so should be ordered after
        assert_eq!(&graph.order, &[ids[0], ids[1], ids[3], ids[2]]);
    }

    #[test]
    fn overflow_basic() {
        let ids = make_ids::<3>();
        let sizes = [10, u16::MAX as usize - 5, 100];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset16)
            .add_link(ids[1], ids[2], OffsetLen::Offset16)
            .build();
        graph.sort_kahn();
        assert_eq!(graph.find_overflows().len(), 1);
        assert_eq!(graph.find_overflows()[0].parent, ids[0]);
        assert_eq!(graph.find_overflows()[0].child, ids[2]);
    }

    #[test]
    fn virtual_link_orders_emission() {
        let ids = make_ids::<3>();
        let sizes = [10, 10, 20];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset16)
            .add_virtual_link(ids[2], ids[1])
            .build();

        // without the virtual link, 1 would sort before 2
        graph.sort_kahn();
        assert_eq!(&graph.order, &[ids[0], ids[2], ids[1]]);
        graph.sort_shortest_distance();
        assert_eq!(&graph.order, &[ids[0], ids[2], ids[1]]);

        // virtual links write no bytes
        assert_eq!(graph.serialize().len(), 40);
    }

    #[test]
    fn duplicate_subgraph() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ids = make_ids::<10>();
        let sizes = [10; 10];

        // root has two children, one 16 and one 32-bit offset.
        // those subgraphs share three nodes, which must be duped.

        //
        //     before          after
        //      0                 0
        //     / ⑊            ┌───┘⑊
        //    1   2 ---+      1     2 ---+
        //    |\ / \   |     / \   / \   |
        //    | 3   4  5    9   3 3'  4  5
        //    |  \ / \          |  \ / \
        //    |   6   7         6   6'  7
        //    |       |                 |
        //    |    8──┘              8──┘
        //    |    │                /
        //    9 ───┘               9'

        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset32)
            .add_link(ids[1], ids[3], OffsetLen::Offset16)
            .add_link(ids[1], ids[9], OffsetLen::Offset16)
            .add_link(ids[2], ids[3], OffsetLen::Offset16)
            .add_link(ids[2], ids[4], OffsetLen::Offset16)
            .add_link(ids[2], ids[5], OffsetLen::Offset16)
            .add_link(ids[3], ids[6], OffsetLen::Offset16)
            .add_link(ids[4], ids[6], OffsetLen::Offset16)
            .add_link(ids[4], ids[7], OffsetLen::Offset16)
            .add_link(ids[7], ids[8], OffsetLen::Offset16)
            .add_link(ids[8], ids[9], OffsetLen::Offset16)
            .build();

        assert_eq!(graph.nodes.len(), 10);
        let one = graph.find_descendents(ids[1]);
        let two = graph.find_descendents(ids[2]);
        assert_eq!(one.intersection(&two).count(), 3);

        graph.sort_shortest_distance();
        graph.assign_spaces();

        // 3, 6, and 9 should be duplicated
        assert_eq!(graph.nodes.len(), 13);
        let one = graph.find_descendents(ids[1]);
        let two = graph.find_descendents(ids[2]);
        assert_eq!(one.intersection(&two).count(), 0);

        for id in &one {
            assert!(!graph.nodes.get(id).unwrap().space.is_custom());
        }

        for id in &two {
            assert!(graph.nodes.get(id).unwrap().space.is_custom());
        }
    }

    #[test]
    fn split_overflowing_spaces() {
        // this attempts to show a simplified version of a gsub table with extension
        // subtables, before any isolation/deduplication has happened.
        //
        //    before                         after
        //      0           (GSUB)             0
        //      |                              |
        //      1        (lookup List)         1
        //      |                              |
        //      2          (Lookup)            2
        //     / \                            / \
        //  ╔═3   4═╗   (ext subtables)    ╔═3   4═╗
        //  ║       ║                      ║       ║   (long offsets)
        //  5─┐   ┌─6    (subtables)       5       6
        //  │ └─8─┘ │                     / \     / \
        //  │       │    (cov tables)    7'  8'  7   8
        //  └───7───┘
        //

        let _ = env_logger::builder().is_test(true).try_init();
        let ids = make_ids::<9>();
        // make the coverage tables big enough that overflow is unavoidable
        let sizes = [10, 4, 12, 8, 8, 14, 14, 65520, 65520];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[1], ids[2], OffsetLen::Offset16)
            .add_link(ids[2], ids[3], OffsetLen::Offset16)
            .add_link(ids[2], ids[4], OffsetLen::Offset16)
            .add_link(ids[3], ids[5], OffsetLen::Offset32)
            .add_link(ids[4], ids[6], OffsetLen::Offset32)
            .add_link(ids[5], ids[7], OffsetLen::Offset16)
            .add_link(ids[5], ids[8], OffsetLen::Offset16)
            .add_link(ids[6], ids[7], OffsetLen::Offset16)
            .add_link(ids[6], ids[8], OffsetLen::Offset16)
            .build();
        graph.sort_shortest_distance();

        assert!(graph.has_overflows());
        assert_eq!(graph.nodes.len(), 9);

        graph.assign_spaces();
        graph.sort_shortest_distance();

        // now spaces are assigned, but not isolated
        assert_eq!(graph.nodes[&ids[5]].space, graph.nodes[&ids[6]].space);
        assert_eq!(graph.nodes.len(), 9);

        // now isolate space that overflows
        let overflows = graph.find_overflows();
        graph.try_isolating_subgraphs(&overflows);
        graph.sort_shortest_distance();

        assert_eq!(graph.nodes.len(), 11);
        assert!(graph.find_overflows().is_empty());
        // ensure we correctly update the roots_per_space bookkeeping
        assert_eq!(graph.num_roots_per_space[&graph.nodes[&ids[6]].space], 1);
        assert_eq!(graph.num_roots_per_space[&graph.nodes[&ids[5]].space], 1);
    }

    #[test]
    fn all_roads_lead_to_overflow() {
        // this is a regression test for a bug we had where we would fail
        // to correctly duplicate shared subgraphs when there were
        // multiple links between two objects, which caused us to overcount
        // the 'incoming edges in subgraph'.

        let _ = env_logger::builder().is_test(true).try_init();

        let ids = make_ids::<9>();
        let sizes = [10, 10, 10, 10, 10, 65524, 65524, 10, 24];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset32)
            .add_link(ids[0], ids[2], OffsetLen::Offset32)
            .add_link(ids[0], ids[3], OffsetLen::Offset32)
            .add_link(ids[0], ids[4], OffsetLen::Offset32)
            .add_link(ids[1], ids[5], OffsetLen::Offset16)
            .add_link(ids[1], ids[5], OffsetLen::Offset16)
            .add_link(ids[2], ids[6], OffsetLen::Offset16)
            .add_link(ids[3], ids[7], OffsetLen::Offset16)
            .add_link(ids[5], ids[8], OffsetLen::Offset16)
            .add_link(ids[5], ids[8], OffsetLen::Offset16)
            .add_link(ids[6], ids[8], OffsetLen::Offset16)
            .add_link(ids[7], ids[8], OffsetLen::Offset16)
            .build();

        graph.sort_shortest_distance();
        graph.assign_spaces();
        graph.sort_shortest_distance();
        let overflows = graph.find_overflows();
        assert!(!overflows.is_empty());
        assert!(graph.try_isolating_subgraphs(&overflows));
        graph.sort_shortest_distance();
        assert!(!graph.has_overflows());
    }

    #[test]
    fn two_roots_one_space() {
        // If a subgraph is reachable from multiple long offsets, they are all
        // initially placed in the same space.
        //
        //  ┌──0═══╗    ┌──0═══╗
        //  │  ║   ║    │  ║   ║
        //  │  ║   ║    │  ║   ║
        //  1  2   3    1  2   3
        //  │   \ /     │   \ /
        //  └────4      4    4'
        //       │      │    │
        //       5      5    5'

        let ids = make_ids::<6>();
        let sizes = [10; 6];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset32)
            .add_link(ids[0], ids[3], OffsetLen::Offset32)
            .add_link(ids[1], ids[4], OffsetLen::Offset16)
            .add_link(ids[2], ids[4], OffsetLen::Offset16)
            .add_link(ids[3], ids[4], OffsetLen::Offset16)
            .add_link(ids[4], ids[5], OffsetLen::Offset16)
            .build();

        assert_eq!(graph.nodes.len(), 6);
        graph.sort_shortest_distance();
        graph.assign_spaces();
        assert_eq!(graph.nodes.len(), 8);
        let one = graph.find_descendents(ids[1]);
        assert!(one.iter().all(|id| !graph.nodes[id].space.is_custom()));

        let two = graph.find_descendents(ids[2]);
        let three = graph.find_descendents(ids[3]);
        assert_eq!(two.intersection(&three).count(), 2);
        assert_eq!(two.union(&three).count(), 4);

        assert_eq!(
            two.union(&three)
                .map(|id| graph.nodes[id].space)
                .collect::<HashSet<_>>()
                .len(),
            1
        );
    }

    #[test]
    fn duplicate_shared_root_subgraph() {
        // if a node is linked from both 16 & 32-bit space, and has no parents
        // in 32 bit space, it should always still be duped.
        //
        //    before    after
        //     0          0
        //    / ⑊        / ⑊
        //   1   ⑊      1   2
        //   └───╴2     │
        //              2'

        let ids = make_ids::<3>();
        let sizes = [10; 3];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset32)
            .add_link(ids[1], ids[2], OffsetLen::Offset16)
            .build();
        graph.sort_kahn();
        graph.assign_spaces();
        assert_eq!(graph.nodes.len(), 4);
    }

    #[test]
    fn assign_space_even_without_any_duplication() {
        // the subgraph of the long offset (0->2) is already isolated, and
        // so requires no duplication; but we should still correctly assign a
        // space to the children.
        //
        //     0
        //    / ⑊
        //   1   2
        //      /
        //     3

        let ids = make_ids::<4>();
        let sizes = [10; 4];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset16)
            .add_link(ids[0], ids[2], OffsetLen::Offset32)
            .add_link(ids[2], ids[3], OffsetLen::Offset16)
            .build();
        graph.sort_kahn();
        graph.assign_spaces();
        let two = graph.find_descendents(ids[2]);
        assert!(two.iter().all(|id| graph.nodes[id].space.is_custom()));
    }

    #[test]
    fn sort_respects_spaces() {
        let ids = make_ids::<4>();
        let sizes = [10; 4];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset32)
            .add_link(ids[0], ids[2], OffsetLen::Offset32)
            .add_link(ids[0], ids[3], OffsetLen::Offset16)
            .build();
        graph.sort_shortest_distance();
        assert_eq!(&graph.order, &[ids[0], ids[3], ids[1], ids[2]]);
    }

    #[test]
    fn assign_32bit_spaces_if_needed() {
        let ids = make_ids::<3>();
        let sizes = [10, u16::MAX as usize, 10];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset32)
            .add_link(ids[0], ids[2], OffsetLen::Offset16)
            .add_link(ids[1], ids[2], OffsetLen::Offset16)
            .build();
        graph.basic_sort();
        // this will overflow unless the 32-bit offset is put last.
        assert!(graph.has_overflows());
        graph.pack_objects();
        assert!(!graph.has_overflows());
    }

    #[test]
    fn unpackable_graph_should_fail() {
        let _ = env_logger::builder().is_test(true).try_init();
        // specifically, it should not run forever.
        let ids = make_ids::<4>();
        let sizes = [10, 10, 66000, 66000];
        let mut graph = TestGraphBuilder::new(ids, sizes)
            .add_link(ids[0], ids[1], OffsetLen::Offset32)
            .add_link(ids[1], ids[2], OffsetLen::Offset16)
            .add_link(ids[1], ids[3], OffsetLen::Offset16)
            .build();

        assert!(!graph.pack_objects());
    }

    #[test]
    fn duplicate_if_shared_is_copy_on_write() {
        // A and B share S; editing on behalf of A must not disturb B.
        let [root, a, b, s] = make_ids::<4>();
        let sizes = [10, 10, 10, 10];
        let mut graph = TestGraphBuilder::new([root, a, b, s], sizes)
            .add_link(root, a, OffsetLen::Offset16)
            .add_link(root, b, OffsetLen::Offset16)
            .add_link(a, s, OffsetLen::Offset16)
            .add_link(b, s, OffsetLen::Offset16)
            .build();

        let s_for_a = graph.duplicate_if_shared(a, s);
        assert_ne!(s_for_a, s);
        assert_eq!(graph.objects[&a].offsets[0].object, s_for_a);
        assert_eq!(graph.objects[&b].offsets[0].object, s);

        // b is now the only parent, so no further copying
        let s_for_b = graph.duplicate_if_shared(b, s);
        assert_eq!(s_for_b, s);
        assert_eq!(graph.nodes.len(), 5);
    }

    #[test]
    fn move_child_and_index_for_offset() {
        let [root, a, b, c] = make_ids::<4>();
        let sizes = [10, 10, 10, 10];
        let mut graph = TestGraphBuilder::new([root, a, b, c], sizes)
            .add_link(root, a, OffsetLen::Offset16)
            .add_link(root, b, OffsetLen::Offset16)
            .add_link(a, c, OffsetLen::Offset16)
            .build();

        assert_eq!(graph.index_for_offset(a, 0), Some(c));
        assert_eq!(graph.index_for_offset(b, 0), None);

        graph.move_child(a, 0, b, 4);
        assert_eq!(graph.index_for_offset(a, 0), None);
        assert_eq!(graph.index_for_offset(b, 4), Some(c));
        // the link still reaches c, so nothing is orphaned
        graph.remove_orphans();
        assert_eq!(graph.nodes.len(), 4);
    }

    #[test]
    fn promotion_is_idempotent() {
        let mut builder = GraphBuilder::new();
        let mut subtable = TableData::new(TableType::Unknown);
        subtable.write(1u16);
        let sub = builder.add(subtable);
        let mut lookup = TableData::new(TableType::GposLookup(lookup_type::GPOS_PAIR_POS));
        lookup.write(lookup_type::GPOS_PAIR_POS); // lookupType
        lookup.write(0u16); // lookupFlag
        lookup.write(1u16); // subTableCount
        lookup.add_offset(sub, OffsetLen::Offset16);
        let lookup = builder.add(lookup);
        let mut graph = builder.build(lookup);

        graph.actually_promote_subtables(&[lookup]);
        let n_objects = graph.objects.len();
        assert_eq!(n_objects, 3); // lookup, extension, subtable
        assert_eq!(
            graph.objects[&lookup].type_,
            TableType::GposLookup(lookup_type::GPOS_EXTENSION)
        );
        assert_eq!(
            graph.objects[&lookup].read_u16_at(0),
            Some(lookup_type::GPOS_EXTENSION)
        );
        let ext = graph.objects[&lookup].offsets[0].object;
        assert_eq!(graph.objects[&ext].read_u16_at(0), Some(1)); // format
        assert_eq!(
            graph.objects[&ext].read_u16_at(2),
            Some(lookup_type::GPOS_PAIR_POS)
        );
        assert_eq!(graph.objects[&ext].offsets[0].len, OffsetLen::Offset32);
        assert_eq!(graph.objects[&ext].offsets[0].object, sub);

        // a second promotion must change nothing
        graph.actually_promote_subtables(&[lookup]);
        assert_eq!(graph.objects.len(), n_objects);
        assert_eq!(graph.objects[&lookup].offsets[0].object, ext);
    }

    #[test]
    fn promote_a_lookup_at_the_root() {
        // a lookup packed as the graph root has no LookupList parent, but
        // must still be eligible for promotion; without it this graph
        // cannot pack at all.
        let _ = env_logger::builder().is_test(true).try_init();
        let mut builder = GraphBuilder::new();
        let mut subtables = Vec::new();
        for fill in [0x1111u16, 0x2222] {
            let mut sub = TableData::new(TableType::Unknown);
            for _ in 0..32765 {
                sub.write(fill);
            }
            subtables.push(builder.add(sub));
        }
        let mut lookup = TableData::new(TableType::GposLookup(1));
        lookup.write(1u16); // lookupType (SinglePos, not splittable)
        lookup.write(0u16); // lookupFlag
        lookup.write(2u16); // subTableCount
        for sub in &subtables {
            lookup.add_offset(*sub, OffsetLen::Offset16);
        }
        let lookup = builder.add(lookup);
        let mut graph = builder.build(lookup);

        graph.basic_sort();
        assert!(graph.has_overflows());
        assert!(graph.pack_objects());
        assert_eq!(
            graph.objects[&lookup].type_,
            TableType::GposLookup(lookup_type::GPOS_EXTENSION)
        );
    }

    #[test]
    fn serialize_resolves_whence_and_bias() {
        let mut builder = GraphBuilder::new();

        let mut c1_data = TableData::new(TableType::Unknown);
        c1_data.write(0xaaaau16);
        c1_data.write(0xaaaau16);
        let c1 = builder.add(c1_data);
        let mut c2_data = TableData::new(TableType::Unknown);
        c2_data.write(0xbbbbu16);
        c2_data.write(0xbbbbu16);
        let c2 = builder.add(c2_data);

        let mut root_data = TableData::new(TableType::Unknown);
        root_data.add_offset(c1, OffsetLen::Offset16);
        root_data.add_offset_from(c2, OffsetLen::Offset16, OffsetWhence::Tail, 0, false);
        root_data.add_offset_from(c2, OffsetLen::Offset32, OffsetWhence::Absolute, 0, false);
        root_data.add_offset_from(c1, OffsetLen::Offset16, OffsetWhence::Head, 2, true);
        let root = builder.add(root_data);

        let graph = builder.build(root);
        let bytes = graph.pack().unwrap();

        // root is 10 bytes, then c1 at 10, c2 at 14
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0..2], 10u16.to_be_bytes()); // head offset to c1
        assert_eq!(bytes[2..4], 4u16.to_be_bytes()); // tail offset to c2
        assert_eq!(bytes[4..8], 14u32.to_be_bytes()); // absolute offset to c2
        assert_eq!(bytes[8..10], 12i16.to_be_bytes()); // biased signed offset to c1
    }

    #[test]
    fn resolved_zero_offset_is_an_overflow() {
        let mut builder = GraphBuilder::new();
        let mut c1_data = TableData::new(TableType::Unknown);
        c1_data.write(0xaaaau16);
        let c1 = builder.add(c1_data);
        // a tail-relative offset to the table that immediately follows
        // resolves to zero, which means 'no table'
        let mut root_data = TableData::new(TableType::Unknown);
        root_data.add_offset_from(c1, OffsetLen::Offset16, OffsetWhence::Tail, 0, false);
        let root = builder.add(root_data);
        let graph = builder.build(root);
        assert!(matches!(graph.pack(), Err(Error::PackingFailed(_))));
    }

    #[test]
    fn packing_errors_are_printable() {
        let mut builder = GraphBuilder::new();
        let mut c1_data = TableData::new(TableType::Unknown);
        c1_data.write(0xaaaau16);
        let c1 = builder.add(c1_data);
        let mut root_data = TableData::new(TableType::Unknown);
        root_data.add_offset_from(c1, OffsetLen::Offset16, OffsetWhence::Tail, 0, false);
        let root = builder.add(root_data);
        let err = builder.build(root).pack().unwrap_err();

        assert!(format!("{err:?}").contains("PackingError"));
        assert_eq!(err.to_string(), "Table packing failed with 1 overflows");
    }

    #[test]
    fn malformed_graphs_error_instead_of_panicking() {
        // missing object
        let [a, ghost] = make_ids::<2>();
        let mut data = TableData::make_mock(10);
        data.add_mock_offset(ghost, OffsetLen::Offset16);
        let graph = Graph::from_objects([(a, data)].into(), a);
        assert!(matches!(
            graph.pack(),
            Err(Error::MalformedGraph(MalformedGraph::MissingObject { .. }))
        ));

        // offset field outside the table's bytes
        let [a, b] = make_ids::<2>();
        let mut data = TableData::make_mock(1);
        data.add_mock_offset(b, OffsetLen::Offset16);
        let graph = Graph::from_objects([(a, data), (b, TableData::make_mock(4))].into(), a);
        assert!(matches!(
            graph.pack(),
            Err(Error::MalformedGraph(MalformedGraph::LinkOutOfBounds { .. }))
        ));

        // a cycle
        let [a, b] = make_ids::<2>();
        let mut a_data = TableData::make_mock(10);
        a_data.add_mock_offset(b, OffsetLen::Offset16);
        let mut b_data = TableData::make_mock(10);
        b_data.add_mock_offset(a, OffsetLen::Offset16);
        let graph = Graph::from_objects([(a, a_data), (b, b_data)].into(), a);
        assert!(matches!(
            graph.pack(),
            Err(Error::MalformedGraph(MalformedGraph::CycleDetected(_)))
        ));

        // missing root
        let graph = Graph::from_objects(Default::default(), ObjectId::next());
        assert!(matches!(
            graph.pack(),
            Err(Error::MalformedGraph(MalformedGraph::MissingRoot(_)))
        ));
    }

    #[test]
    fn round_trip_identity() {
        // a graph that fits must serialize with every offset landing on
        // its child's position
        let [root, c1, c2] = make_ids::<3>();
        let sizes = [10, 4, 6];
        let mut graph = TestGraphBuilder::new([root, c1, c2], sizes)
            .add_link(root, c1, OffsetLen::Offset16)
            .add_link(root, c2, OffsetLen::Offset16)
            .add_link(c1, c2, OffsetLen::Offset16)
            .build();
        assert!(graph.pack_objects());
        let bytes = graph.serialize();
        assert_eq!(bytes.len(), 20);
        for (parent_id, data) in &graph.objects {
            let parent_pos = graph.nodes[parent_id].position;
            for link in &data.offsets {
                let field = (parent_pos + link.pos) as usize;
                let written = u16::from_be_bytes([bytes[field], bytes[field + 1]]);
                let child_pos = graph.nodes[&link.object].position;
                assert_eq!(parent_pos + written as u32, child_pos);
            }
        }
    }
}
