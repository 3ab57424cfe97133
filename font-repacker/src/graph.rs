//! A graph of packed objects, and the operations used to reorder it.
//!
//! The graph is stored in reverse serialization order: the root is the
//! last vertex, and it is written first. Links refer to vertices by index,
//! so reordering the graph means permuting the vertices and remapping the
//! index stored in every link.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
};

use fnv::FnvHashSet;

use crate::{
    error::RepackError,
    serialize::{Link, LinkWidth, ObjIdx, Object, Serializer},
};

#[cfg(feature = "dot2")]
mod graphviz;

/// A single object in the graph.
#[derive(Clone, Debug, Default)]
pub struct Vertex {
    // head/tail: indices into the graph's data buffer for this object
    head: usize,
    tail: usize,
    links: Vec<Link>,
}

/// The serialized extent of a vertex, for a given order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Position {
    start: usize,
    end: usize,
}

/// A record of an overflowing offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overflow {
    parent: ObjIdx,
    child: ObjIdx,
    offset: i64,
    width: LinkWidth,
    is_signed: bool,
}

impl Overflow {
    pub fn parent(&self) -> ObjIdx {
        self.parent
    }

    pub fn child(&self) -> ObjIdx {
        self.child
    }

    /// The value that could not be encoded, after applying the link's bias.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn width(&self) -> LinkWidth {
        self.width
    }

    pub fn is_signed(&self) -> bool {
        self.is_signed
    }
}

impl Vertex {
    pub fn table_size(&self) -> usize {
        self.tail - self.head
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    fn is_leaf(&self) -> bool {
        self.links.is_empty()
    }

    // every link field must be inside the object, and no two fields may overlap.
    fn link_positions_valid(&self) -> bool {
        let table_size = self.table_size();
        let mut fields = self
            .links
            .iter()
            .map(|l| {
                let start = l.position() as usize;
                (start, start + l.width().size())
            })
            .collect::<Vec<_>>();
        fields.sort_unstable();

        fields.iter().all(|(_, end)| *end <= table_size)
            && fields.windows(2).all(|pair| pair[0].1 <= pair[1].0)
    }
}

/// A graph of objects connected by offset links.
#[derive(Debug, Default)]
pub struct Graph {
    vertices: Vec<Vertex>,
    data: Vec<u8>,
}

impl Graph {
    /// Build a graph from a packed object list.
    ///
    /// `objects` must be in reverse topological order: the last object is
    /// the root, and no object links to one that comes after it. If the
    /// first entry is `None` it is treated as the nil object and dropped;
    /// links are adjusted to account for it.
    ///
    /// The object data is copied; `objects` is not modified.
    pub fn from_objects(objects: &[Option<Object>]) -> Result<Self, RepackError> {
        let removed_nil = matches!(objects.first(), Some(None));
        let objects = if removed_nil { &objects[1..] } else { objects };

        let count = objects.len();
        let total_size = objects.iter().flatten().map(Object::len).sum();
        let mut this = Graph {
            vertices: Vec::with_capacity(count),
            data: Vec::with_capacity(total_size),
        };

        for obj in objects {
            let obj = obj.as_ref().ok_or(RepackError::GraphErrorInvalidObjIndex)?;
            let head = this.data.len();
            this.data.extend_from_slice(obj.bytes());

            let mut links = obj.links().to_vec();
            for link in links.iter_mut() {
                let obj_idx = if removed_nil {
                    // the nil object can not be linked to
                    link.obj_idx()
                        .checked_sub(1)
                        .ok_or(RepackError::GraphErrorInvalidObjIndex)?
                } else {
                    link.obj_idx()
                };
                if obj_idx >= count {
                    return Err(RepackError::GraphErrorInvalidObjIndex);
                }
                link.update_obj_idx(obj_idx);
            }

            let v = Vertex {
                head,
                tail: this.data.len(),
                links,
            };
            if !v.link_positions_valid() {
                return Err(RepackError::GraphErrorInvalidLinkPosition);
            }
            this.vertices.push(v);
        }

        log::trace!("built graph of {count} objects, {total_size} bytes");
        Ok(this)
    }

    /// The vertices, in their current (reverse serialization) order.
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn vertex(&self, obj_idx: ObjIdx) -> Option<&Vertex> {
        self.vertices.get(obj_idx)
    }

    /// The encoded bytes of a vertex.
    pub fn vertex_data(&self, obj_idx: ObjIdx) -> Option<&[u8]> {
        let v = self.vertex(obj_idx)?;
        self.data.get(v.head..v.tail)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// The index of the root; the last vertex.
    pub fn root_idx(&self) -> Option<ObjIdx> {
        self.vertices.len().checked_sub(1)
    }

    pub fn total_size_in_bytes(&self) -> usize {
        self.vertices.iter().map(Vertex::table_size).sum()
    }

    /// Count the incoming links of every vertex.
    ///
    /// Multiple links from one parent to the same child are counted
    /// separately.
    pub fn incoming_edge_count(&self) -> Vec<usize> {
        let mut counts = vec![0; self.vertices.len()];
        for v in &self.vertices {
            for link in &v.links {
                counts[link.obj_idx()] += 1;
            }
        }
        counts
    }

    /// Check that the root has no parents and every other vertex has at
    /// least one.
    pub fn is_fully_connected(&self) -> Result<(), RepackError> {
        let Some(root_idx) = self.root_idx() else {
            return Ok(());
        };
        let counts = self.incoming_edge_count();

        // Root cannot have parents
        if counts[root_idx] > 0 {
            return Err(RepackError::GraphErrorInvalidRoot);
        }

        if counts[..root_idx].iter().any(|count| *count == 0) {
            return Err(RepackError::GraphErrorOrphanedNodes);
        }
        Ok(())
    }

    /// Generates a new topological sorting of the graph using Kahn's
    /// algorithm, visiting ready vertices in FIFO order.
    ///
    /// This is cheap, but makes no attempt to keep related objects close.
    pub fn sort_kahn(&mut self) -> Result<(), RepackError> {
        let Some(root_idx) = self.root_idx().filter(|idx| *idx > 0) else {
            // no need to do sorting when num of nodes < 2
            return Ok(());
        };

        let mut edge_count = self.incoming_edge_count();
        if edge_count[root_idx] > 0 {
            return Err(RepackError::GraphErrorInvalidRoot);
        }
        let mut queue = VecDeque::from([root_idx]);
        let mut sorted = Vec::with_capacity(self.vertices.len());

        while let Some(next_id) = queue.pop_front() {
            sorted.push(next_id);
            for link in &self.vertices[next_id].links {
                let child_idx = link.obj_idx();
                edge_count[child_idx] -= 1;
                if edge_count[child_idx] == 0 {
                    queue.push_back(child_idx);
                }
            }
        }

        self.apply_order(sorted)
    }

    /// Generates a new topological sorting of the graph, preferring at each
    /// step the ready vertex that is nearest to the root.
    ///
    /// Distances are weighted so that objects reached through 16-bit
    /// offsets are placed before those reached through 32-bit offsets, and
    /// small objects before large ones.
    pub fn sort_shortest_distance(&mut self) -> Result<(), RepackError> {
        let Some(root_idx) = self.root_idx().filter(|idx| *idx > 0) else {
            return Ok(());
        };

        let mut edge_count = self.incoming_edge_count();
        if edge_count[root_idx] > 0 {
            return Err(RepackError::GraphErrorInvalidRoot);
        }
        let distance_to = self.compute_distances(root_idx)?;
        // entries are reversed to pop the nearest first; equal distances
        // pop the lowest index first.
        let mut queue = BinaryHeap::with_capacity(self.vertices.len());
        let mut sorted = Vec::with_capacity(self.vertices.len());

        queue.push(Reverse((distance_to[root_idx], root_idx)));
        while let Some(Reverse((_, next_id))) = queue.pop() {
            sorted.push(next_id);
            for link in &self.vertices[next_id].links {
                let child_idx = link.obj_idx();
                edge_count[child_idx] -= 1;
                if edge_count[child_idx] == 0 {
                    queue.push(Reverse((distance_to[child_idx], child_idx)));
                }
            }
        }

        self.apply_order(sorted)
    }

    // Finds the distance to each object in the graph from the root node,
    // using Dijkstra's algorithm.
    fn compute_distances(&self, root_idx: ObjIdx) -> Result<Vec<i64>, RepackError> {
        let count = self.vertices.len();
        let mut distance_to = vec![i64::MAX; count];
        distance_to[root_idx] = 0;

        let mut queue = BinaryHeap::with_capacity(count);
        queue.push(Reverse((0_i64, root_idx)));

        let mut visited = vec![false; count];
        while let Some(Reverse((next_distance, next_idx))) = queue.pop() {
            if visited[next_idx] {
                continue;
            }
            visited[next_idx] = true;

            for link in &self.vertices[next_idx].links {
                let child_idx = link.obj_idx();
                if visited[child_idx] {
                    continue;
                }

                let child_weight =
                    self.vertices[child_idx].table_size() as i64 + link.width().distance_penalty();
                let child_distance = next_distance + child_weight;
                if child_distance < distance_to[child_idx] {
                    distance_to[child_idx] = child_distance;
                    queue.push(Reverse((child_distance, child_idx)));
                }
            }
        }

        let unvisited = visited.iter().filter(|v| !**v).count();
        if unvisited > 0 {
            log::debug!("{unvisited} objects are unreachable from the root");
            return Err(RepackError::GraphErrorOrphanedNodes);
        }
        Ok(distance_to)
    }

    /// Reorder vertices given a list of current indices in serialization
    /// order (root first).
    ///
    /// Vertices are assigned new ids counting down from `count - 1`, so the
    /// root keeps the last slot.
    fn apply_order(&mut self, sorted: Vec<ObjIdx>) -> Result<(), RepackError> {
        let count = self.vertices.len();
        if sorted.len() != count {
            return Err(self.unsorted_error(sorted.len()));
        }

        let mut id_map = vec![None; count];
        for (new_id, old_id) in (0..count).rev().zip(sorted.iter().copied()) {
            id_map[old_id] = Some(new_id);
        }
        let id_map = id_map
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(RepackError::GraphErrorCycleDetected)?;

        let mut old_vertices = std::mem::take(&mut self.vertices);
        let mut sorted_graph = sorted
            .iter()
            .map(|idx| std::mem::take(&mut old_vertices[*idx]))
            .collect::<Vec<_>>();

        Self::remap_obj_indices(&id_map, &mut sorted_graph)?;
        sorted_graph.reverse();
        self.vertices = sorted_graph;
        Ok(())
    }

    /// Updates all obj_idx's in all links using the provided mapping.
    fn remap_obj_indices(id_map: &[ObjIdx], vertices: &mut [Vertex]) -> Result<(), RepackError> {
        for link in vertices.iter_mut().flat_map(|v| v.links.iter_mut()) {
            let new_idx = id_map
                .get(link.obj_idx())
                .ok_or(RepackError::GraphErrorInvalidObjIndex)?;
            link.update_obj_idx(*new_idx);
        }
        Ok(())
    }

    // a sort did not visit every vertex: either some are unreachable,
    // or some are only reachable through a cycle.
    fn unsorted_error(&self, num_sorted: usize) -> RepackError {
        let count = self.vertices.len();
        let reachable = self.find_reachable();
        log::debug!(
            "sorted {num_sorted} of {count} objects, {} reachable from the root",
            reachable.len()
        );
        if reachable.len() < count {
            RepackError::GraphErrorOrphanedNodes
        } else {
            RepackError::GraphErrorCycleDetected
        }
    }

    fn find_reachable(&self) -> FnvHashSet<ObjIdx> {
        let mut visited = FnvHashSet::default();
        let mut stack = self.root_idx().into_iter().collect::<Vec<_>>();
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            stack.extend(self.vertices[idx].links.iter().map(Link::obj_idx));
        }
        visited
    }

    // compute the serialized start/end positions for each vertex; the
    // root (last) is written first.
    pub(crate) fn positions(&self) -> Vec<Position> {
        let mut positions = vec![Position::default(); self.vertices.len()];
        let mut cur_pos = 0;
        for (idx, v) in self.vertices.iter().enumerate().rev() {
            let start = cur_pos;
            cur_pos += v.table_size();
            positions[idx] = Position {
                start,
                end: cur_pos,
            };
        }
        positions
    }

    #[inline]
    fn compute_offset(&self, parent_idx: ObjIdx, link: &Link, positions: &[Position]) -> i64 {
        let parent = positions[parent_idx];
        let child = positions[link.obj_idx()];
        link.offset(parent.start, parent.end, child.start)
    }

    /// Will any offsets overflow when the graph is serialized in the
    /// current order?
    pub fn will_overflow(&self) -> bool {
        let positions = self.positions();
        self.vertices.iter().enumerate().any(|(parent_idx, v)| {
            v.links.iter().any(|link| {
                let offset = self.compute_offset(parent_idx, link, &positions);
                !link.is_valid_offset(offset)
            })
        })
    }

    /// Find every overflowing offset in the current order.
    ///
    /// Multiple overflowing links between the same two objects are only
    /// reported once.
    pub fn overflows(&self) -> Vec<Overflow> {
        let positions = self.positions();
        let mut seen = FnvHashSet::default();
        let mut out = Vec::new();
        for (parent_idx, v) in self.vertices.iter().enumerate() {
            for link in &v.links {
                let offset = self.compute_offset(parent_idx, link, &positions);
                if link.is_valid_offset(offset) || !seen.insert((parent_idx, link.obj_idx())) {
                    continue;
                }
                out.push(Overflow {
                    parent: parent_idx,
                    child: link.obj_idx(),
                    offset,
                    width: link.width(),
                    is_signed: link.is_signed(),
                });
            }
        }
        out
    }

    pub(crate) fn debug_overflows(&self, overflows: &[Overflow]) {
        let (parents, children): (FnvHashSet<_>, FnvHashSet<_>) =
            overflows.iter().map(|x| (x.parent, x.child)).unzip();
        log::debug!(
            "found {} overflows from {} parents to {} children",
            overflows.len(),
            parents.len(),
            children.len()
        );

        for overflow in overflows {
            log::debug!(
                "{} -> {} ({}{:?}, leaf: {}) offset {}",
                overflow.parent,
                overflow.child,
                if overflow.is_signed { "signed " } else { "" },
                overflow.width,
                self.vertices[overflow.child].is_leaf(),
                overflow.offset,
            );
        }
    }

    /// Write out the graph, in the current order.
    ///
    /// Every offset is resolved against the final layout; an offset that
    /// does not fit means the graph was not checked with
    /// [`Graph::will_overflow`] before calling this.
    pub fn serialize(&self) -> Result<Vec<u8>, RepackError> {
        let positions = self.positions();
        let mut s = Serializer::new(self.total_size_in_bytes());
        s.start_serialize()?;

        // objects are packed in reverse serialization order, so the root
        // is packed last and written first.
        for (idx, v) in self.vertices.iter().enumerate() {
            s.push()?;
            let start = s.embed_bytes(&self.data[v.head..v.tail])?;

            for link in &v.links {
                let offset = self.compute_offset(idx, link, &positions);
                if !link.is_valid_offset(offset) {
                    return Err(RepackError::ErrorOffsetOutOfRange {
                        parent: idx,
                        child: link.obj_idx(),
                    });
                }
                s.write_offset(
                    start + link.position() as usize,
                    offset,
                    link.width(),
                    link.is_signed(),
                )?;
            }

            s.pop_pack(false)?;
        }
        s.end_serialize()?;

        Ok(s.copy_bytes()?)
    }

    /// Write a graphviz file describing the current layout to `path`.
    ///
    /// If the `REPACKER_PRUNE_GRAPH` environment variable is set, only
    /// objects that participate in an overflow are included.
    #[cfg(feature = "dot2")]
    pub fn write_graph_viz(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        // if this is set then we prune the generated graph
        const PRUNE_GRAPH_ENV_VAR: &str = "REPACKER_PRUNE_GRAPH";
        let try_trim_graph = std::env::var_os(PRUNE_GRAPH_ENV_VAR).is_some();
        graphviz::GraphVizGraph::from_graph(self, try_trim_graph).write_to_file(path)
    }
}
