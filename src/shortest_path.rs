//! Exact shortest path on a DAG, returned as an edge-indicator vector.
//!
//! This is the hard (min-plus) counterpart of a soft shortest-path relaxation:
//! \[
//! V = \min_{\pi \in \mathcal{P}(s\to t)} \sum_{e\in\pi} c_e,
//! \]
//! with nodes ordered topologically (every edge satisfies `from < to`), source `0`
//! and sink `n-1`. The output marks each edge on the arg-min path with `1.0`.
//!
//! The indicator map is piecewise constant in the costs, which makes it a typical
//! black-box solver for [`crate::Imle`]: [`DagShortestPath`] implements
//! [`Solver`] over cost arrays of shape `[batch, nb_edges]`.

use ndarray::{ArrayD, Axis};

use crate::error::SolverError;
use crate::solver::Solver;

/// Errors for the shortest-path solver.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Graph must have at least 2 nodes (source and sink).
    #[error("graph must have at least 2 nodes, got {0}")]
    TooFewNodes(usize),
    /// Edge endpoint out of bounds.
    #[error("edge endpoint out of bounds: edge {edge_idx} has ({from}->{to}) for n={n}")]
    EdgeOutOfBounds {
        /// Index of the offending edge in the provided slice.
        edge_idx: usize,
        /// Source endpoint of that edge.
        from: usize,
        /// Destination endpoint of that edge.
        to: usize,
        /// Number of nodes in the graph.
        n: usize,
    },
    /// DAG/topological invariant violated.
    #[error("expected DAG/topological order with from < to; edge {edge_idx} has ({from}->{to})")]
    NotDagOrder {
        /// Index of the offending edge in the provided slice.
        edge_idx: usize,
        /// Source endpoint of that edge.
        from: usize,
        /// Destination endpoint of that edge.
        to: usize,
    },
    /// One cost per edge is required.
    #[error("got {len} costs for {expected} edges")]
    CostLength {
        /// Number of costs provided.
        len: usize,
        /// Number of edges in the graph.
        expected: usize,
    },
    /// Costs must be finite.
    #[error("edge {edge_idx} has non-finite cost {cost}")]
    NonFiniteCost {
        /// Index of the offending edge.
        edge_idx: usize,
        /// The cost itself.
        cost: f64,
    },
    /// No path exists from source to sink.
    #[error("no path exists from source to sink")]
    NoPath,
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Directed edge in a DAG. Costs are supplied separately, one per edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Source node index.
    pub from: usize,
    /// Destination node index.
    pub to: usize,
}

fn validate(n: usize, edges: &[Edge]) -> Result<()> {
    if n < 2 {
        return Err(Error::TooFewNodes(n));
    }
    for (k, e) in edges.iter().enumerate() {
        if e.from >= n || e.to >= n {
            return Err(Error::EdgeOutOfBounds {
                edge_idx: k,
                from: e.from,
                to: e.to,
                n,
            });
        }
        if e.from >= e.to {
            return Err(Error::NotDagOrder {
                edge_idx: k,
                from: e.from,
                to: e.to,
            });
        }
    }
    Ok(())
}

/// Shortest path from node 0 to node `n-1`.
///
/// Returns `(value, indicators)` where `indicators.len() == edges.len()`. Ties are
/// broken toward the edge with the lower index.
pub fn shortest_path_indicators(n: usize, edges: &[Edge], costs: &[f64]) -> Result<(f64, Vec<f64>)> {
    validate(n, edges)?;
    if costs.len() != edges.len() {
        return Err(Error::CostLength {
            len: costs.len(),
            expected: edges.len(),
        });
    }
    if let Some((k, &c)) = costs.iter().enumerate().find(|(_, c)| !c.is_finite()) {
        return Err(Error::NonFiniteCost { edge_idx: k, cost: c });
    }

    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (k, e) in edges.iter().enumerate() {
        incoming[e.to].push(k);
    }

    let mut dist = vec![f64::INFINITY; n];
    let mut via: Vec<Option<usize>> = vec![None; n];
    dist[0] = 0.0;
    for v in 1..n {
        for &ek in &incoming[v] {
            let a = dist[edges[ek].from];
            if !a.is_finite() {
                continue;
            }
            let d = a + costs[ek];
            if d < dist[v] {
                dist[v] = d;
                via[v] = Some(ek);
            }
        }
    }

    let value = dist[n - 1];
    if !value.is_finite() {
        return Err(Error::NoPath);
    }

    let mut indicators = vec![0.0; edges.len()];
    let mut v = n - 1;
    while v != 0 {
        // Every reachable non-source node has a predecessor edge.
        let ek = via[v].ok_or(Error::NoPath)?;
        indicators[ek] = 1.0;
        v = edges[ek].from;
    }
    Ok((value, indicators))
}

/// Batched shortest-path solver over a fixed DAG.
#[derive(Debug, Clone)]
pub struct DagShortestPath {
    n: usize,
    edges: Vec<Edge>,
}

impl DagShortestPath {
    /// Fix the graph topology; costs arrive at solve time.
    pub fn new(n: usize, edges: Vec<Edge>) -> Result<Self> {
        validate(n, &edges)?;
        Ok(Self { n, edges })
    }

    /// Number of edges, i.e. the width of the cost array.
    pub fn nb_edges(&self) -> usize {
        self.edges.len()
    }
}

impl Solver for DagShortestPath {
    fn solve(&self, theta: &ArrayD<f64>) -> std::result::Result<ArrayD<f64>, SolverError> {
        if theta.ndim() != 2 || theta.shape()[1] != self.edges.len() {
            return Err(Error::CostLength {
                len: theta.shape().last().copied().unwrap_or(0),
                expected: self.edges.len(),
            }
            .into());
        }
        let mut out = ArrayD::zeros(theta.raw_dim());
        for (row, mut dst) in theta.outer_iter().zip(out.axis_iter_mut(Axis(0))) {
            let costs: Vec<f64> = row.iter().copied().collect();
            let (_value, ind) = shortest_path_indicators(self.n, &self.edges, &costs)?;
            for (d, v) in dst.iter_mut().zip(ind) {
                *d = v;
            }
        }
        Ok(out)
    }
}
