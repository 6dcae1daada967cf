//! The serialized-table objects that make up a graph.
//!
//! A [`TableData`] is a table body as raw big-endian bytes, plus records of
//! the offset fields inside it. Offset fields are written as zero
//! placeholders and only resolved once the whole graph has been packed.

use std::collections::HashMap;

use crate::graph::{Graph, ObjectId, OffsetLen};
use crate::table_type::TableType;

/// Where an offset is measured from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetWhence {
    /// From the first byte of the parent table.
    #[default]
    Head,
    /// From the byte after the last byte of the parent table.
    Tail,
    /// From the start of the serialized buffer.
    Absolute,
}

/// An offset field inside a table, and the object it points at.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Link {
    /// the position of the offset within the parent table
    pub(crate) pos: u32,
    /// the offset length in bytes
    pub(crate) len: OffsetLen,
    pub(crate) whence: OffsetWhence,
    /// added to the resolved offset before writing
    pub(crate) bias: i32,
    /// whether the field stores a two's-complement value
    pub(crate) is_signed: bool,
    /// the object pointed to by the offset
    pub(crate) object: ObjectId,
}

/// The encoded data for a given table, along with info on included offsets
#[derive(Debug, Default, Clone, Hash, PartialEq, Eq)]
pub struct TableData {
    pub(crate) type_: TableType,
    pub(crate) bytes: Vec<u8>,
    pub(crate) offsets: Vec<Link>,
    /// ordering-only dependencies; no bytes are written for these
    pub(crate) virtuals: Vec<ObjectId>,
}

impl TableData {
    pub fn new(type_: TableType) -> Self {
        TableData {
            type_,
            ..Default::default()
        }
    }

    /// Write a scalar value into the table, as big-endian bytes.
    pub fn write(&mut self, value: impl Scalar) {
        value.write_be(&mut self.bytes);
    }

    /// Overwrite previously written bytes at `pos`.
    pub(crate) fn write_over(&mut self, pos: usize, value: impl Scalar) {
        let mut temp = Vec::with_capacity(4);
        value.write_be(&mut temp);
        self.bytes[pos..pos + temp.len()].copy_from_slice(&temp);
    }

    pub(crate) fn read_u16_at(&self, pos: usize) -> Option<u16> {
        let bytes = self.bytes.get(pos..pos + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Add an unsigned head-relative offset to another object.
    ///
    /// This writes placeholder null bytes, which are overwritten when the
    /// final graph is serialized.
    pub fn add_offset(&mut self, object: ObjectId, len: OffsetLen) {
        self.add_offset_from(object, len, OffsetWhence::Head, 0, false)
    }

    /// Add an offset, specifying where it is measured from, a bias, and
    /// signedness.
    pub fn add_offset_from(
        &mut self,
        object: ObjectId,
        len: OffsetLen,
        whence: OffsetWhence,
        bias: i32,
        is_signed: bool,
    ) {
        self.offsets.push(Link {
            pos: self.bytes.len() as u32,
            len,
            whence,
            bias,
            is_signed,
            object,
        });
        self.bytes.extend(&[0u8, 0, 0, 0][..len as u8 as usize]);
    }

    /// Record an offset at a position that has already been written.
    pub(crate) fn add_offset_at(&mut self, pos: u32, object: ObjectId, len: OffsetLen) {
        self.offsets.push(Link {
            pos,
            len,
            whence: OffsetWhence::Head,
            bias: 0,
            is_signed: false,
            object,
        });
    }

    /// Add a virtual link: `object` must be packed after this table, but
    /// no offset field exists.
    pub fn add_virtual(&mut self, object: ObjectId) {
        self.virtuals.push(object);
    }

    /// All objects this table links to, real links first.
    pub(crate) fn all_children(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.offsets
            .iter()
            .map(|link| link.object)
            .chain(self.virtuals.iter().copied())
    }

    /// The number of links (real and virtual) from this table to `id`.
    pub(crate) fn links_to(&self, id: ObjectId) -> usize {
        self.all_children().filter(|child| *child == id).count()
    }

    #[cfg(test)]
    pub(crate) fn make_mock(size: usize) -> Self {
        TableData {
            type_: TableType::Unknown,
            bytes: vec![0xca; size], // has no special meaning
            offsets: Vec::new(),
            virtuals: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn add_mock_offset(&mut self, object: ObjectId, len: OffsetLen) {
        let pos = self.offsets.iter().map(|off| off.len as u8 as u32).sum();
        self.offsets.push(Link {
            pos,
            len,
            whence: OffsetWhence::Head,
            bias: 0,
            is_signed: false,
            object,
        });
    }
}

/// Accumulates the objects of a graph, deduplicating identical tables.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    objects: HashMap<TableData, ObjectId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, returning its id. Identical tables share an id.
    pub fn add(&mut self, data: TableData) -> ObjectId {
        *self.objects.entry(data).or_insert_with(ObjectId::next)
    }

    /// Build the graph, rooted at `root`.
    pub fn build(self, root: ObjectId) -> Graph {
        let objects = self.objects.into_iter().map(|(k, v)| (v, k)).collect();
        Graph::from_objects(objects, root)
    }
}

/// Big-endian encoding for the fixed-width values written into tables.
pub trait Scalar {
    fn write_be(self, out: &mut Vec<u8>);
}

macro_rules! write_be_bytes {
    ($ty:ty) => {
        impl Scalar for $ty {
            #[inline]
            fn write_be(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes())
            }
        }
    };
}

//NOTE: not implemented for offsets! it would be too easy to accidentally write them.
write_be_bytes!(u8);
write_be_bytes!(i8);
write_be_bytes!(u16);
write_be_bytes!(i16);
write_be_bytes!(u32);
write_be_bytes!(i32);
write_be_bytes!(font_types::Uint24);
write_be_bytes!(font_types::GlyphId16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_bytes_match_offset_width() {
        let [id] = [ObjectId::next()];
        let mut data = TableData::new(TableType::Unknown);
        data.write(1u16);
        data.add_offset(id, OffsetLen::Offset16);
        data.add_offset_from(id, OffsetLen::Offset24, OffsetWhence::Tail, -2, true);
        assert_eq!(data.bytes, [0, 1, 0, 0, 0, 0, 0]);
        assert_eq!(data.offsets[0].pos, 2);
        assert_eq!(data.offsets[1].pos, 4);
        assert_eq!(data.offsets[1].bias, -2);
        assert!(data.offsets[1].is_signed);
    }

    #[test]
    fn builder_dedups_identical_tables() {
        let [child] = [ObjectId::next()];
        let mut builder = GraphBuilder::new();
        let mut a = TableData::new(TableType::Unknown);
        a.write(5u16);
        a.add_offset(child, OffsetLen::Offset16);
        let b = a.clone();
        let mut c = a.clone();
        c.write(1u8);

        let id_a = builder.add(a);
        let id_b = builder.add(b);
        let id_c = builder.add(c);
        assert_eq!(id_a, id_b);
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn read_and_overwrite() {
        let mut data = TableData::new(TableType::Unknown);
        data.write(0xdeadu16);
        data.write(7u16);
        assert_eq!(data.read_u16_at(2), Some(7));
        assert_eq!(data.read_u16_at(3), None);
        data.write_over(0, 2u16);
        assert_eq!(data.read_u16_at(0), Some(2));
    }
}
