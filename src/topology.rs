//! The in-memory directed multigraph at the heart of a graph: a dense
//! vertex arena plus an edge arena carrying a stable `local_idx` per
//! ordered pair, so composite edge ids round-trip through §4.B's pure
//! encode/decode functions.
//!
//! # Invariants
//! - `vertex_count()` vertices exist, numbered `0..vertex_count()`, with no
//!   gaps — [`Topology::remove_vertex`] maintains this by renaming the
//!   highest-numbered vertex into the hole it leaves (the swap protocol;
//!   the document-store side of that protocol lives in `mutation.rs`).
//! - For every ordered pair `(o, t)` with `k` parallel edges, the stored
//!   `local_idx` values are exactly `{0, .., k-1}`.

use crate::identifiers::{LocalIdx, VertexId};
use std::collections::HashMap;

/// A stable handle to a live edge, valid until that edge (or its vertex, via
/// the swap protocol) is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeHandle(u64);

#[derive(Debug, Clone)]
struct EdgeSlot {
    origin: VertexId,
    terminus: VertexId,
    local_idx: LocalIdx,
    alive: bool,
}

/// An edge that was relinked as a side effect of the vertex swap protocol:
/// its composite id changed because one of its endpoints was renumbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelinkedEdge {
    pub handle: EdgeHandle,
    pub old_id: String,
    pub new_id: String,
}

/// What happened when a vertex was removed.
#[derive(Debug, Clone)]
pub struct RemoveVertexOutcome {
    /// Composite ids of edges that were incident to the removed vertex and
    /// are now gone entirely.
    pub removed_edge_ids: Vec<String>,
    /// Present when a vertex other than the last was removed: the
    /// highest-numbered vertex was renamed into the hole.
    pub swap: Option<SwapOutcome>,
}

#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub old_id: VertexId,
    pub new_id: VertexId,
    pub relinked_edges: Vec<RelinkedEdge>,
}

/// Edges whose `local_idx` changed because a parallel edge ahead of them in
/// the same `(origin, terminus)` pair was removed.
#[derive(Debug, Clone)]
pub struct RemoveEdgeOutcome {
    pub removed_edge_id: String,
    pub relinked_edges: Vec<RelinkedEdge>,
}

pub fn encode_edge_id(origin: VertexId, local_idx: LocalIdx, terminus: VertexId) -> String {
    format!("{origin}_{local_idx}_{terminus}")
}

#[derive(Default, Clone)]
pub struct Topology {
    edges: Vec<EdgeSlot>,
    out_edges: Vec<Vec<u64>>,
    in_edges: Vec<Vec<u64>>,
    /// Ordered (by local_idx) list of edge-arena indices for each ordered
    /// pair; position in the vector is always that edge's `local_idx`.
    pair_edges: HashMap<(VertexId, VertexId), Vec<u64>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_vertices(&self) -> u64 {
        self.out_edges.len() as u64
    }

    pub fn num_edges(&self) -> u64 {
        self.edges.iter().filter(|e| e.alive).count() as u64
    }

    pub fn add_vertex(&mut self) -> VertexId {
        let id = self.out_edges.len() as VertexId;
        self.out_edges.push(Vec::new());
        self.in_edges.push(Vec::new());
        id
    }

    fn edge_id_of(&self, idx: u64) -> String {
        let slot = &self.edges[idx as usize];
        encode_edge_id(slot.origin, slot.local_idx, slot.terminus)
    }

    pub fn add_edge(&mut self, origin: VertexId, terminus: VertexId) -> EdgeHandle {
        let pair = (origin, terminus);
        let local_idx = self.pair_edges.get(&pair).map(|v| v.len()).unwrap_or(0) as LocalIdx;
        let idx = self.edges.len() as u64;
        self.edges.push(EdgeSlot {
            origin,
            terminus,
            local_idx,
            alive: true,
        });
        self.out_edges[origin as usize].push(idx);
        self.in_edges[terminus as usize].push(idx);
        self.pair_edges.entry(pair).or_default().push(idx);
        EdgeHandle(idx)
    }

    pub fn local_idx(&self, handle: EdgeHandle) -> LocalIdx {
        self.edges[handle.0 as usize].local_idx
    }

    pub fn endpoints(&self, handle: EdgeHandle) -> (VertexId, VertexId) {
        let slot = &self.edges[handle.0 as usize];
        (slot.origin, slot.terminus)
    }

    pub fn edge_id(&self, handle: EdgeHandle) -> String {
        self.edge_id_of(handle.0)
    }

    /// All edges between `origin` and `terminus`, in ascending `local_idx`
    /// order.
    pub fn all_edges(&self, origin: VertexId, terminus: VertexId) -> Vec<EdgeHandle> {
        self.pair_edges
            .get(&(origin, terminus))
            .into_iter()
            .flatten()
            .map(|&idx| EdgeHandle(idx))
            .collect()
    }

    /// Every live edge in the topology, in arena order.
    pub fn all_edge_handles(&self) -> impl Iterator<Item = EdgeHandle> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.alive)
            .map(|(idx, _)| EdgeHandle(idx as u64))
    }

    pub fn out_edges(&self, v: VertexId) -> Vec<EdgeHandle> {
        self.out_edges[v as usize].iter().map(|&idx| EdgeHandle(idx)).collect()
    }

    pub fn in_edges(&self, v: VertexId) -> Vec<EdgeHandle> {
        self.in_edges[v as usize].iter().map(|&idx| EdgeHandle(idx)).collect()
    }

    pub fn out_degree(&self, v: VertexId) -> usize {
        self.out_edges[v as usize].len()
    }

    pub fn in_degree(&self, v: VertexId) -> usize {
        self.in_edges[v as usize].len()
    }

    pub fn out_neighbours(&self, v: VertexId) -> Vec<VertexId> {
        self.out_edges[v as usize]
            .iter()
            .map(|&idx| self.edges[idx as usize].terminus)
            .collect()
    }

    pub fn in_neighbours(&self, v: VertexId) -> Vec<VertexId> {
        self.in_edges[v as usize]
            .iter()
            .map(|&idx| self.edges[idx as usize].origin)
            .collect()
    }

    /// Remove the target edge, then compact the remaining local indices for
    /// its `(origin, terminus)` pair down to `0..k-1` in their existing
    /// order, per the link-delete compaction rule (§4.H).
    pub fn remove_edge(&mut self, handle: EdgeHandle) -> RemoveEdgeOutcome {
        let removed_edge_id = self.edge_id_of(handle.0);
        let (origin, terminus) = self.endpoints(handle);
        self.detach_edge(handle.0);

        let remaining = self.pair_edges.entry((origin, terminus)).or_default();
        let mut relinked = Vec::new();
        for (new_local_idx, &idx) in remaining.iter().enumerate() {
            let new_local_idx = new_local_idx as LocalIdx;
            let slot = &mut self.edges[idx as usize];
            if slot.local_idx != new_local_idx {
                let old_id = encode_edge_id(slot.origin, slot.local_idx, slot.terminus);
                slot.local_idx = new_local_idx;
                let new_id = encode_edge_id(slot.origin, slot.local_idx, slot.terminus);
                relinked.push(RelinkedEdge {
                    handle: EdgeHandle(idx),
                    old_id,
                    new_id,
                });
            }
        }

        RemoveEdgeOutcome {
            removed_edge_id,
            relinked_edges: relinked,
        }
    }

    /// Detach an edge from every index (out_edges, in_edges, pair_edges) and
    /// mark it dead, without renumbering siblings. Used both by
    /// `remove_edge` (which then renumbers) and by vertex removal (which
    /// drops all of a vertex's edges outright).
    fn detach_edge(&mut self, idx: u64) {
        let slot = self.edges[idx as usize].clone();
        self.edges[idx as usize].alive = false;
        self.out_edges[slot.origin as usize].retain(|&i| i != idx);
        self.in_edges[slot.terminus as usize].retain(|&i| i != idx);
        if let Some(v) = self.pair_edges.get_mut(&(slot.origin, slot.terminus)) {
            v.retain(|&i| i != idx);
        }
    }

    /// Remove vertex `v`, applying the dense-id swap protocol: if `v` is
    /// not the highest-numbered vertex, the highest-numbered vertex is
    /// renamed into `v`'s slot so the vertex domain stays `0..N`.
    pub fn remove_vertex(&mut self, v: VertexId) -> RemoveVertexOutcome {
        let n = self.num_vertices();
        assert!(v < n, "vertex {v} out of range (num_vertices={n})");

        let incident: Vec<u64> = self.out_edges[v as usize]
            .iter()
            .chain(self.in_edges[v as usize].iter())
            .copied()
            .collect();
        let removed_edge_ids: Vec<String> = incident.iter().map(|&idx| self.edge_id_of(idx)).collect();
        for idx in incident {
            // A self-loop appears in both out_edges[v] and in_edges[v]; guard
            // against detaching it twice.
            if self.edges[idx as usize].alive {
                self.detach_edge(idx);
            }
        }

        if v == n - 1 {
            self.out_edges.pop();
            self.in_edges.pop();
            return RemoveVertexOutcome {
                removed_edge_ids,
                swap: None,
            };
        }

        let s = n - 1;
        let s_out = std::mem::take(&mut self.out_edges[s as usize]);
        let s_in = std::mem::take(&mut self.in_edges[s as usize]);

        let mut touched: Vec<u64> = s_out.iter().chain(s_in.iter()).copied().collect();
        touched.sort_unstable();
        touched.dedup();

        let mut relinked_edges = Vec::with_capacity(touched.len());
        for idx in &touched {
            let idx = *idx;
            let old_id = self.edge_id_of(idx);
            let slot = &mut self.edges[idx as usize];
            let old_pair = (slot.origin, slot.terminus);
            if slot.origin == s {
                slot.origin = v;
            }
            if slot.terminus == s {
                slot.terminus = v;
            }
            let new_pair = (slot.origin, slot.terminus);
            let new_id = encode_edge_id(slot.origin, slot.local_idx, slot.terminus);

            if old_pair != new_pair {
                if let Some(bucket) = self.pair_edges.get_mut(&old_pair) {
                    bucket.retain(|&i| i != idx);
                }
                self.pair_edges.entry(new_pair).or_default().push(idx);
            }
            relinked_edges.push(RelinkedEdge {
                handle: EdgeHandle(idx),
                old_id,
                new_id,
            });
        }

        self.out_edges[v as usize] = s_out;
        self.in_edges[v as usize] = s_in;
        self.out_edges.pop();
        self.in_edges.pop();

        RemoveVertexOutcome {
            removed_edge_ids,
            swap: Some(SwapOutcome {
                old_id: s,
                new_id: v,
                relinked_edges,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_vertex_graph() -> (Topology, EdgeHandle) {
        let mut t = Topology::new();
        t.add_vertex();
        t.add_vertex();
        t.add_vertex();
        let h = t.add_edge(0, 2);
        (t, h)
    }

    #[test]
    fn edge_id_round_trips_local_idx() {
        let mut t = Topology::new();
        t.add_vertex();
        t.add_vertex();
        let h0 = t.add_edge(0, 1);
        let h1 = t.add_edge(0, 1);
        assert_eq!(t.edge_id(h0), "0_0_1");
        assert_eq!(t.edge_id(h1), "0_1_1");
        assert_eq!(t.local_idx(h1), 1);
    }

    #[test]
    fn removing_last_vertex_has_no_swap() {
        let mut t = Topology::new();
        t.add_vertex();
        t.add_vertex();
        t.add_edge(0, 1);
        let outcome = t.remove_vertex(1);
        assert!(outcome.swap.is_none());
        assert_eq!(outcome.removed_edge_ids, vec!["0_0_1".to_string()]);
        assert_eq!(t.num_vertices(), 1);
    }

    #[test]
    fn removing_middle_vertex_swaps_last_into_the_hole() {
        // nodes {0,1,2}, link 0_0_2 -- matches the spec's scenario 3.
        let (mut t, _) = three_vertex_graph();
        let outcome = t.remove_vertex(1);
        assert_eq!(outcome.removed_edge_ids.len(), 0);
        let swap = outcome.swap.expect("vertex 2 should swap into slot 1");
        assert_eq!(swap.old_id, 2);
        assert_eq!(swap.new_id, 1);
        assert_eq!(swap.relinked_edges.len(), 1);
        assert_eq!(swap.relinked_edges[0].old_id, "0_0_2");
        assert_eq!(swap.relinked_edges[0].new_id, "0_0_1");
        assert_eq!(t.num_vertices(), 2);
        assert_eq!(t.edge_id(swap.relinked_edges[0].handle), "0_0_1");
    }

    #[test]
    fn link_delete_compacts_local_idx() {
        // three parallel links 0_0_1, 0_1_1, 0_2_1; delete the middle one.
        let mut t = Topology::new();
        t.add_vertex();
        t.add_vertex();
        let h0 = t.add_edge(0, 1);
        let h1 = t.add_edge(0, 1);
        let h2 = t.add_edge(0, 1);
        assert_eq!(t.edge_id(h0), "0_0_1");
        assert_eq!(t.edge_id(h1), "0_1_1");
        assert_eq!(t.edge_id(h2), "0_2_1");

        let outcome = t.remove_edge(h1);
        assert_eq!(outcome.removed_edge_id, "0_1_1");
        assert_eq!(outcome.relinked_edges.len(), 1);
        assert_eq!(outcome.relinked_edges[0].old_id, "0_2_1");
        assert_eq!(outcome.relinked_edges[0].new_id, "0_1_1");

        let remaining = t.all_edges(0, 1);
        assert_eq!(remaining.len(), 2);
        assert_eq!(t.edge_id(remaining[0]), "0_0_1");
        assert_eq!(t.edge_id(remaining[1]), "0_1_1");
    }

    #[test]
    fn degree_and_neighbour_queries() {
        let (t, _) = three_vertex_graph();
        assert_eq!(t.out_degree(0), 1);
        assert_eq!(t.in_degree(2), 1);
        assert_eq!(t.out_neighbours(0), vec![2]);
        assert_eq!(t.in_neighbours(2), vec![0]);
    }
}
