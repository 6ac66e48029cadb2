//! Shared invariant-checking helper for the integration suite, the way the
//! host crate shares constants/helpers (`tests/test_constants.rs`) across
//! its own test binaries.

use anyhow::{ensure, Result};
use std::collections::{HashMap, HashSet};
use synthdb::catalog::{Graph, LINKS_TABLE, LINK_TYPES_TABLE, NODES_TABLE, NODE_TYPES_TABLE};
use synthdb::document_store::DocumentStore;
use synthdb::identifiers::split_edge_id;

/// Checks testable-property invariants 1-7 against the live topology and
/// the document store backing it. Intended to run after any mutation
/// sequence in an integration test.
pub async fn assert_graph_invariants(graph: &Graph, store: &dyn DocumentStore) -> Result<()> {
    let db = graph.document_database();
    let num_vertices = graph.topology.read().num_vertices();
    let num_edges = graph.topology.read().num_edges();

    let node_count = store.count(db, NODES_TABLE).await?;
    ensure!(
        num_vertices == node_count,
        "topology has {num_vertices} vertices but 'nodes' has {node_count} rows"
    );

    let link_docs = store.get_all(db, LINKS_TABLE).await?;
    ensure!(
        num_edges as usize == link_docs.len(),
        "topology has {num_edges} edges but 'links' has {} rows",
        link_docs.len()
    );

    // Invariant 3: vertex domain is dense, {0..num_vertices-1}.
    for v in 0..num_vertices {
        ensure!(
            store.get(db, NODES_TABLE, &v.to_string()).await?.is_some(),
            "vertex {v} has no corresponding node document"
        );
    }

    // Invariants 4 & 5: every links.id parses to (o, idx, t) within the
    // vertex domain, and per-pair local_idx sets match topology exactly.
    let mut by_pair: HashMap<(u64, u64), Vec<u16>> = HashMap::new();
    for doc in &link_docs {
        let id = doc
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("link document missing string 'id'"))?;
        let (o, idx, t) = split_edge_id(id).ok_or_else(|| anyhow::anyhow!("link id '{id}' does not parse"))?;
        ensure!(o < num_vertices && t < num_vertices, "link '{id}' references a vertex outside {{0..{num_vertices}}}");
        by_pair.entry((o, t)).or_default().push(idx);
    }
    for ((o, t), mut idxs) in by_pair {
        idxs.sort_unstable();
        let expected: Vec<u16> = (0..idxs.len() as u16).collect();
        ensure!(idxs == expected, "local_idx set for ({o},{t}) is {idxs:?}, expected {expected:?}");
        let topo_handles = graph.topology.read().all_edges(o, t);
        ensure!(
            topo_handles.len() == idxs.len(),
            "topology has {} parallel edges for ({o},{t}) but the store has {}",
            topo_handles.len(),
            idxs.len()
        );
    }

    // Invariant 6: UID uniqueness.
    let node_docs = store.get_all(db, NODES_TABLE).await?;
    assert_unique_uids(&node_docs, "nodes")?;
    assert_unique_uids(&link_docs, "links")?;

    // Invariant 7: protected types exist.
    ensure!(store.get(db, NODE_TYPES_TABLE, "Node").await?.is_some(), "'Node' type missing");
    ensure!(store.get(db, LINK_TYPES_TABLE, "Link").await?.is_some(), "'Link' type missing");

    Ok(())
}

fn assert_unique_uids(docs: &[serde_json::Value], table: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for doc in docs {
        if let Some(uid) = doc.get("uid").and_then(|v| v.as_str()) {
            ensure!(seen.insert(uid.to_string()), "duplicate uid '{uid}' in '{table}'");
        }
    }
    Ok(())
}
