//! Support for generating graphviz files from the object graph

use std::collections::BTreeSet;

use super::{Graph, ObjIdx};
use crate::serialize::LinkWidth;

pub struct GraphVizGraph<'a> {
    graph: &'a Graph,
    nodes: Vec<ObjIdx>,
    edges: Vec<GraphVizEdge>,
}

impl<'a> GraphVizGraph<'a> {
    pub(crate) fn from_graph(graph: &'a Graph, prune_non_overflows: bool) -> Self {
        // if we are pruning, only objects at either end of an overflowing
        // link are kept.
        let nodes: BTreeSet<_> = if !prune_non_overflows {
            (0..graph.len()).collect()
        } else {
            graph
                .overflows()
                .iter()
                .flat_map(|overflow| [overflow.parent(), overflow.child()])
                .collect()
        };

        let positions = graph.positions();
        let mut edges = Vec::new();
        for parent_idx in nodes.iter().copied() {
            for link in graph.vertices[parent_idx].links() {
                if !nodes.contains(&link.obj_idx()) {
                    continue;
                }
                let offset = graph.compute_offset(parent_idx, link, &positions);
                edges.push(GraphVizEdge {
                    source: parent_idx,
                    target: link.obj_idx(),
                    offset,
                    width: link.width(),
                    overflows: !link.is_valid_offset(offset),
                });
            }
        }

        GraphVizGraph {
            graph,
            edges,
            nodes: nodes.into_iter().collect(),
        }
    }

    /// Write out this graph as a graphviz file to the provided path.
    ///
    /// Overwrites any existing file at this location.
    pub fn write_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let mut buf = Vec::new();
        dot2::render(self, &mut buf).map_err(|e| std::io::Error::other(format!("{e:?}")))?;
        std::fs::write(path, &buf)
    }
}

#[derive(Clone, Debug)]
pub struct GraphVizEdge {
    source: ObjIdx,
    target: ObjIdx,
    offset: i64,
    width: LinkWidth,
    overflows: bool,
}

impl<'a> dot2::GraphWalk<'a> for GraphVizGraph<'a> {
    type Node = ObjIdx;
    type Edge = GraphVizEdge;
    type Subgraph = ();

    fn nodes(&'a self) -> dot2::Nodes<'a, Self::Node> {
        self.nodes.as_slice().into()
    }

    fn edges(&'a self) -> dot2::Edges<'a, Self::Edge> {
        self.edges.as_slice().into()
    }

    fn source(&'a self, edge: &Self::Edge) -> Self::Node {
        edge.source
    }

    fn target(&'a self, edge: &Self::Edge) -> Self::Node {
        edge.target
    }
}

impl<'a> dot2::Labeller<'a> for GraphVizGraph<'a> {
    type Node = ObjIdx;
    type Edge = GraphVizEdge;
    type Subgraph = ();

    fn graph_id(&'a self) -> dot2::Result<dot2::Id<'a>> {
        dot2::Id::new("ObjectPacking")
    }

    fn node_id(&'a self, n: &Self::Node) -> dot2::Result<dot2::Id<'a>> {
        dot2::Id::new(format!("N{n}"))
    }

    fn node_label<'b>(&'b self, n: &Self::Node) -> dot2::Result<dot2::label::Text<'b>> {
        let size = self.graph.vertices[*n].table_size();
        let root = if self.graph.root_idx() == Some(*n) {
            ", root"
        } else {
            ""
        };
        Ok(dot2::label::Text::LabelStr(
            format!("{n} ({size}B{root})").into(),
        ))
    }

    fn edge_label(&'a self, e: &Self::Edge) -> dot2::label::Text<'a> {
        let bits = e.width.size() * 8;
        dot2::label::Text::LabelStr(format!("{} ({bits})", e.offset).into())
    }

    fn edge_color(&'a self, e: &Self::Edge) -> Option<dot2::label::Text<'a>> {
        if e.overflows {
            return Some(dot2::label::Text::LabelStr("firebrick".into()));
        }
        None
    }

    fn edge_style(&'a self, e: &Self::Edge) -> dot2::Style {
        if e.overflows {
            dot2::Style::Bold
        } else {
            dot2::Style::Solid
        }
    }
}
