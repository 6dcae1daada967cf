//! Packing graphs of font tables into their serialized form.
//!
//! An OpenType table is a tree (or, with sharing, a graph) of subtables
//! joined by offsets of limited width; most are 16 bits. Finding an ordering
//! of the subtables in which every offset fits its field is NP-hard in
//! general, and for large fonts a naive ordering commonly fails.
//!
//! This crate packs such a graph. Build your tables with [`GraphBuilder`],
//! describing each one as a [`TableData`] (raw bytes plus offset records),
//! and call [`Graph::pack`]. The engine sorts the graph, and when offsets
//! still overflow it edits it: oversized GSUB/GPOS subtables are split,
//! lookups are promoted to extension lookups, and shared subgraphs are
//! isolated or duplicated until everything fits.
//!
//! The approach is a port of the algorithm used by hb-repacker, described at
//! <https://github.com/harfbuzz/harfbuzz/blob/main/docs/repacker.md>.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

mod error;
mod graph;
mod object;
mod remap;
mod table_type;

pub use error::{Error, MalformedGraph, PackingError};
pub use graph::{Graph, ObjectId, OffsetLen};
pub use object::{GraphBuilder, Link, OffsetWhence, Scalar, TableData};
pub use remap::Remaps;
pub use table_type::TableType;
