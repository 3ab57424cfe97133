//! Resolve offset overflows by reordering the object graph.
//!
//! Ordering strategies are tried in turn, cheapest first, until one of them
//! produces a layout where every offset fits.

use std::fmt::Display;

use crate::{error::RepackError, graph::Graph, serialize::Object};

/// A way of choosing a serialization order for the object graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortStrategy {
    /// Breadth-first from the root, via Kahn's algorithm.
    Kahn,
    /// Objects nearest the root first, weighted by size and offset width.
    ShortestDistance,
}

impl SortStrategy {
    fn apply(self, graph: &mut Graph) -> Result<(), RepackError> {
        match self {
            SortStrategy::Kahn => graph.sort_kahn(),
            SortStrategy::ShortestDistance => graph.sort_shortest_distance(),
        }
    }
}

impl Display for SortStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortStrategy::Kahn => write!(f, "kahn"),
            SortStrategy::ShortestDistance => write!(f, "shortest distance"),
        }
    }
}

/// Resolves offset overflows with a configurable list of strategies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repacker {
    strategies: Vec<SortStrategy>,
}

impl Default for Repacker {
    fn default() -> Self {
        Repacker {
            strategies: vec![SortStrategy::Kahn, SortStrategy::ShortestDistance],
        }
    }
}

impl Repacker {
    /// Create a repacker that tries `strategies` in order.
    ///
    /// If the list is empty, the input order is checked as-is.
    pub fn new(strategies: impl IntoIterator<Item = SortStrategy>) -> Self {
        Repacker {
            strategies: strategies.into_iter().collect(),
        }
    }

    pub fn strategies(&self) -> &[SortStrategy] {
        &self.strategies
    }

    /// Lay out a packed object list so that every offset fits, and return
    /// the serialized bytes.
    ///
    /// `objects` is in reverse serialization order, with the root last; this
    /// is what [`Serializer::packed_objects`] returns.
    ///
    /// [`Serializer::packed_objects`]: crate::Serializer::packed_objects
    pub fn resolve(&self, objects: &[Option<Object>]) -> Result<Vec<u8>, RepackError> {
        let mut graph = Graph::from_objects(objects)?;
        graph.is_fully_connected()?;
        self.resolve_graph(&mut graph)?;
        graph.serialize()
    }

    /// Reorder `graph` until it no longer overflows.
    pub fn resolve_graph(&self, graph: &mut Graph) -> Result<(), RepackError> {
        if self.strategies.is_empty() && !graph.will_overflow() {
            return Ok(());
        }

        for (i, strategy) in self.strategies.iter().enumerate() {
            if i > 0 {
                log::info!("offset overflow remains, trying {strategy} sort");
            }
            strategy.apply(graph)?;
            if !graph.will_overflow() {
                log::trace!("{strategy} sort produced a valid layout");
                return Ok(());
            }
        }

        let overflows = graph.overflows();
        graph.debug_overflows(&overflows);
        Err(RepackError::ErrorNoResolution(overflows.len()))
    }
}

/// Lay out a packed object list so that every offset fits, using the
/// default strategies.
///
/// See [`Repacker::resolve`].
pub fn resolve_overflows(objects: &[Option<Object>]) -> Result<Vec<u8>, RepackError> {
    Repacker::default().resolve(objects)
}
