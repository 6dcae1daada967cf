//! Errors that occur during packing

use crate::graph::{Graph, ObjectId};

/// A packing could not be found that satisfied all offsets
#[derive(Clone)]
pub struct PackingError {
    pub(crate) graph: std::rc::Rc<Graph>,
}

// manual impl because the graph itself is not Debug
impl std::fmt::Debug for PackingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackingError")
            .field("overflows", &self.graph.find_overflows().len())
            .finish_non_exhaustive()
    }
}

/// The input graph is not something we can pack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MalformedGraph {
    /// the root id has no object
    MissingRoot(ObjectId),
    /// a link points at an object that does not exist
    MissingObject { parent: ObjectId, child: ObjectId },
    /// an offset field does not fit within its parent's bytes
    LinkOutOfBounds {
        parent: ObjectId,
        pos: u32,
        table_size: u32,
    },
    /// the graph contains a cycle through this object
    CycleDetected(ObjectId),
}

/// An error occurred while packing this graph
#[derive(Debug)]
pub enum Error {
    MalformedGraph(MalformedGraph),
    PackingFailed(PackingError),
}

impl PackingError {
    /// Write a graphviz file representing the failed packing to the provided path.
    ///
    /// Has the same semantics as [`std::fs::write`].
    #[cfg(feature = "dot2")]
    pub fn write_graph_viz(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        self.graph.write_graph_viz(path)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MalformedGraph(err) => err.fmt(f),
            Error::PackingFailed(err) => err.fmt(f),
        }
    }
}

impl std::fmt::Display for PackingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Table packing failed with {} overflows",
            self.graph.find_overflows().len()
        )
    }
}

impl std::fmt::Display for MalformedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedGraph::MissingRoot(id) => write!(f, "no object for root {id:?}"),
            MalformedGraph::MissingObject { parent, child } => {
                write!(f, "{parent:?} links to nonexistent object {child:?}")
            }
            MalformedGraph::LinkOutOfBounds {
                parent,
                pos,
                table_size,
            } => write!(
                f,
                "{parent:?} has an offset field at {pos} but is only {table_size} bytes"
            ),
            MalformedGraph::CycleDetected(id) => write!(f, "cycle through {id:?}"),
        }
    }
}

impl From<MalformedGraph> for Error {
    fn from(src: MalformedGraph) -> Error {
        Error::MalformedGraph(src)
    }
}

impl std::error::Error for PackingError {}
impl std::error::Error for MalformedGraph {}
impl std::error::Error for Error {}
