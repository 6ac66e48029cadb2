//! The Walk Engine (§4.I): tiered BFS/DFS from a source vertex, with
//! per-tier direction and document-filter control, optional induced-
//! subgraph analytics, and a neighbour-overlap similarity mode.
//!
//! Grounded on the host crate's `native_graph_storage.rs` `get_subgraph`/
//! `find_paths_iterative` machinery: an explicit frontier vector rather
//! than recursion, so depth is bounded by `dist` instead of the call
//! stack.

use crate::algorithms::GraphAlgorithms;
use crate::document_store::DocumentStore;
use crate::errors::SynthError;
use crate::expr::{Predicate, UdfRegistry};
use crate::identifiers::VertexId;
use crate::property_map::sanitize_for_json;
use crate::topology::Topology;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone)]
pub struct Tier {
    pub direction: Direction,
    pub node_filter: Option<Predicate>,
    pub link_filter: Option<Predicate>,
}

#[derive(Debug, Clone)]
pub struct WalkSpec {
    pub tiers: Vec<Tier>,
    /// Induced-subgraph algorithm to run over the discovered nodes, or the
    /// `"similarity"` special case.
    pub topo: Option<String>,
}

/// One discovered node's "proof": the edge id that reached it.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub node: VertexId,
    pub via_edge: String,
}

/// The result of a completed walk: every node discovered at the final
/// tier, each with its reaching edge.
#[derive(Debug, Clone, Default)]
pub struct WalkResult {
    pub discovered: Vec<Discovery>,
}

async fn doc_matches(
    store: &dyn DocumentStore,
    graph_id: &str,
    table: &str,
    key: &str,
    pred: &Predicate,
    udfs: &UdfRegistry,
) -> Result<bool, SynthError> {
    let Some(doc) = store
        .get(graph_id, table, key)
        .await
        .map_err(|e| SynthError::topology_precondition(e.to_string()))?
    else {
        return Ok(false);
    };
    Ok(pred.eval(&doc, udfs))
}

/// Run the tiered BFS/DFS described in §4.I. `topology` is a read-only
/// snapshot (callers hold the graph's topology read lock for the
/// duration, per §5's "small results" allowance).
pub async fn walk(
    store: &dyn DocumentStore,
    graph_id: &str,
    topology: &Topology,
    udfs: &UdfRegistry,
    source: VertexId,
    spec: &WalkSpec,
) -> Result<WalkResult, SynthError> {
    let mut frontier: HashMap<VertexId, String> = HashMap::new();
    frontier.insert(source, String::new());

    for tier in &spec.tiers {
        let mut next: HashMap<VertexId, String> = HashMap::new();
        for &node in frontier.keys() {
            let handles = match tier.direction {
                Direction::Out => topology.out_edges(node),
                Direction::In => topology.in_edges(node),
            };
            for handle in handles {
                let (origin, terminus) = topology.endpoints(handle);
                let target = if origin == node { terminus } else { origin };
                if target == source {
                    continue;
                }
                let edge_id = topology.edge_id(handle);
                if let Some(pred) = &tier.link_filter {
                    if !doc_matches(store, graph_id, crate::catalog::LINKS_TABLE, &edge_id, pred, udfs).await? {
                        continue;
                    }
                }
                next.entry(target).or_insert(edge_id);
            }
        }

        if let Some(pred) = &tier.node_filter {
            let mut filtered = HashMap::new();
            for (node, edge_id) in next {
                let key = node.to_string();
                if doc_matches(store, graph_id, crate::catalog::NODES_TABLE, &key, pred, udfs).await? {
                    filtered.insert(node, edge_id);
                }
            }
            next = filtered;
        }

        frontier = next;
    }

    Ok(WalkResult {
        discovered: frontier
            .into_iter()
            .map(|(node, via_edge)| Discovery { node, via_edge })
            .collect(),
    })
}

/// Build a secondary topology over exactly the discovered nodes and the
/// edges among them, run `algorithm_name` via `algorithms`, and return
/// the resulting property map as sanitized JSON keyed by original vertex
/// id. The secondary topology and its property maps are discarded after
/// this call returns — nothing is registered in the Graph Catalog.
pub fn induced_subgraph_analytics(
    host_topology: &Topology,
    discovered: &[VertexId],
    algorithm_name: &str,
    params: &Value,
    algorithms: &dyn GraphAlgorithms,
) -> Result<Value, SynthError> {
    if algorithm_name == "hits" {
        return Err(SynthError::PreqlSyntax {
            message: "hits is not valid on an induced subgraph; use hits_hub or hits_authority".to_string(),
            offending_key: Some("topo".to_string()),
        });
    }

    let node_set: HashSet<VertexId> = discovered.iter().copied().collect();
    let mut remap: HashMap<VertexId, VertexId> = HashMap::new();
    let mut ordered: Vec<VertexId> = discovered.to_vec();
    ordered.sort_unstable();
    let mut sub = Topology::new();
    for &old in &ordered {
        remap.insert(old, sub.add_vertex());
    }
    for &old in &ordered {
        for handle in host_topology.out_edges(old) {
            let (_, terminus) = host_topology.endpoints(handle);
            if node_set.contains(&terminus) {
                sub.add_edge(remap[&old], remap[&terminus]);
            }
        }
    }

    let map = algorithms.run(algorithm_name, &sub, params)?;
    let mut out = serde_json::Map::new();
    for &old in &ordered {
        let new = remap[&old];
        let value = map.get_json(new as usize);
        let sanitized = match value.as_f64() {
            Some(f) => sanitize_for_json(f),
            None => value,
        };
        out.insert(old.to_string(), sanitized);
    }
    Ok(Value::Object(out))
}

/// `topo="similarity"`: neighbour-overlap between each discovered node and
/// the source, in the walk's (single) direction.
pub fn similarity(topology: &Topology, source: VertexId, discovered: &[VertexId], direction: Direction) -> Value {
    let source_neighbours: HashSet<VertexId> = match direction {
        Direction::Out => topology.out_neighbours(source).into_iter().collect(),
        Direction::In => topology.in_neighbours(source).into_iter().collect(),
    };
    let mut out = serde_json::Map::new();
    for &node in discovered {
        let neighbours: HashSet<VertexId> = match direction {
            Direction::Out => topology.out_neighbours(node).into_iter().collect(),
            Direction::In => topology.in_neighbours(node).into_iter().collect(),
        };
        let overlap = source_neighbours.intersection(&neighbours).count();
        out.insert(node.to_string(), json!(overlap));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::BuiltinAlgorithms;
    use crate::document_store::FileDocumentStore;
    use tempfile::TempDir;

    fn chain_graph(n: u64) -> Topology {
        let mut t = Topology::new();
        for _ in 0..n {
            t.add_vertex();
        }
        for v in 0..n.saturating_sub(1) {
            t.add_edge(v, v + 1);
        }
        t
    }

    async fn seeded_store(n: u64, leaf_at: &[u64]) -> (TempDir, FileDocumentStore) {
        use crate::document_store::{ConflictMode, Durability};
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        store.create_database("g1").await.unwrap();
        store.create_table("g1", "nodes").await.unwrap();
        store.create_table("g1", "links").await.unwrap();
        for v in 0..n {
            let ty = if leaf_at.contains(&v) { "leaf" } else { "inner" };
            store
                .insert("g1", "nodes", vec![json!({"id": v, "type": ty})], ConflictMode::Error, Durability::Soft)
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn walk_two_tiers_excludes_filtered_leaf_matching_spec_scenario_5() {
        let topo = chain_graph(3);
        let (_dir, store) = seeded_store(3, &[]).await;
        let udfs = UdfRegistry::new();
        let spec = WalkSpec {
            tiers: vec![
                Tier { direction: Direction::Out, node_filter: None, link_filter: None },
                Tier {
                    direction: Direction::Out,
                    node_filter: Some(Predicate::FieldEquals(std::collections::HashMap::from([(
                        "type".to_string(),
                        json!("leaf"),
                    )]))),
                    link_filter: None,
                },
            ],
            topo: None,
        };
        let result = walk(&store, "g1", &topo, &udfs, 0, &spec).await.unwrap();
        assert!(result.discovered.is_empty(), "node 2 has type inner, not leaf, and should be excluded");
    }

    #[tokio::test]
    async fn walk_two_tiers_keeps_matching_leaf() {
        let topo = chain_graph(3);
        let (_dir, store) = seeded_store(3, &[2]).await;
        let udfs = UdfRegistry::new();
        let spec = WalkSpec {
            tiers: vec![
                Tier { direction: Direction::Out, node_filter: None, link_filter: None },
                Tier {
                    direction: Direction::Out,
                    node_filter: Some(Predicate::FieldEquals(std::collections::HashMap::from([(
                        "type".to_string(),
                        json!("leaf"),
                    )]))),
                    link_filter: None,
                },
            ],
            topo: None,
        };
        let result = walk(&store, "g1", &topo, &udfs, 0, &spec).await.unwrap();
        assert_eq!(result.discovered.len(), 1);
        assert_eq!(result.discovered[0].node, 2);
    }

    #[test]
    fn induced_subgraph_rejects_hits() {
        let topo = chain_graph(3);
        let algos = BuiltinAlgorithms;
        let err = induced_subgraph_analytics(&topo, &[0, 1], "hits", &json!({}), &algos).unwrap_err();
        assert_eq!(err.type_name(), "PreqlSyntaxError");
    }

    #[test]
    fn induced_subgraph_runs_degree_over_discovered_nodes_only() {
        let topo = chain_graph(4);
        let algos = BuiltinAlgorithms;
        let out = induced_subgraph_analytics(&topo, &[0, 1, 2], "degree", &json!({}), &algos).unwrap();
        // vertex 2's out-edge to 3 is outside the induced set, so its
        // induced degree is 0 even though its host-topology degree is 1.
        assert_eq!(out["2"], json!(0));
        assert_eq!(out["0"], json!(1));
    }

    #[test]
    fn similarity_counts_shared_out_neighbours() {
        let mut topo = Topology::new();
        for _ in 0..4 {
            topo.add_vertex();
        }
        topo.add_edge(0, 2);
        topo.add_edge(0, 3);
        topo.add_edge(1, 2);
        let out = similarity(&topo, 0, &[1], Direction::Out);
        assert_eq!(out["1"], json!(1));
    }
}
