//! The Mutation Protocol (§4.H): inserts, updates, and deletes that keep
//! the topology and the document store consistent, including the
//! dense-id swap protocol and local-idx compaction.

use crate::catalog::{Graph, LINKS_TABLE, LINK_TYPES_TABLE, NODES_TABLE, NODE_TYPES_TABLE};
use crate::document_store::{ConflictMode, DocumentStore, Durability};
use crate::errors::SynthError;
use crate::identifiers::{self, Identifier, RefKind, VertexId};
use crate::topology::{encode_edge_id, EdgeHandle, Topology};
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Internal table journaling node-delete swaps before their document
/// writes apply, so a crash mid-swap can be reconciled at the next
/// `GraphCatalog::bootstrap` (§9).
pub const SWAP_JOURNAL_TABLE: &str = "_swap_journal";

pub const FREE_MODE_NODE_QUOTA: u64 = 1000;
pub const FREE_MODE_LINK_QUOTA: u64 = 10000;

#[derive(Debug, Clone, Copy, Default)]
pub struct MutationOptions {
    pub free_mode: bool,
}

/// `{old_id, new_id}` pair for a single renumbered node or link.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OldNew {
    pub old_id: Value,
    pub new_id: Value,
}

/// The manifest returned by node/link deletion, per §4.H.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeleteManifest {
    pub nodes_deleted: u64,
    pub links_deleted: Vec<String>,
    pub nodes_updated: HashMap<String, OldNew>,
    pub links_updated: HashMap<String, OldNew>,
}

/// The stringified primary-key form the document store uses for a
/// document's `id` field — matches `FileDocumentStore::insert`'s own key
/// derivation so lookups agree with what was actually stored.
fn doc_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn resolve_vertex_ref(
    store: &dyn DocumentStore,
    graph: &Graph,
    reference: Option<&Value>,
) -> Result<VertexId> {
    let reference = reference.ok_or_else(|| SynthError::missing_required_params(&["origin/terminus"]))?;
    let num_vertices = graph.topology.read().num_vertices();
    match reference {
        Value::Number(n) => {
            let v = n
                .as_u64()
                .ok_or_else(|| SynthError::wrong_param_type("origin/terminus", "int"))?;
            if v >= num_vertices {
                return Err(SynthError::nonexistence(&graph.id, "node", v.to_string()).into());
            }
            Ok(v)
        }
        Value::String(s) => match identifiers::classify(s, RefKind::Node) {
            Some(Identifier::VertexId(v)) => {
                if v >= num_vertices {
                    return Err(SynthError::nonexistence(&graph.id, "node", s).into());
                }
                Ok(v)
            }
            Some(Identifier::Uid(uid)) => {
                let doc = store
                    .get_by_index(&graph.id, NODES_TABLE, "uid", &uid.to_string())
                    .await?
                    .ok_or_else(|| SynthError::nonexistence(&graph.id, "node", s))?;
                doc.get("id")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| SynthError::nonexistence(&graph.id, "node", s).into())
            }
            _ => Err(SynthError::nonexistence(&graph.id, "node", s).into()),
        },
        _ => Err(SynthError::wrong_param_type("origin/terminus", "int or string").into()),
    }
}

/// Node insert, per §4.H: reuse an existing vertex on `replace`/`update`
/// conflict when `id`/`uid` resolve to one; otherwise allocate a fresh
/// vertex (subject to the free-mode quota).
#[instrument(skip(store, graph, doc))]
pub async fn insert_node(
    store: &dyn DocumentStore,
    graph: &Graph,
    mut doc: Value,
    conflict: ConflictMode,
    opts: MutationOptions,
) -> Result<Value> {
    let _guard = graph.write_lock.lock().await;

    let mut existing_vertex = None;
    if matches!(conflict, ConflictMode::Replace | ConflictMode::Update) {
        if let Some(id_num) = doc.get("id").and_then(|v| v.as_u64()) {
            if id_num < graph.topology.read().num_vertices() {
                existing_vertex = Some(id_num);
            }
        }
        if existing_vertex.is_none() {
            if let Some(uid) = doc.get("uid").and_then(|v| v.as_str()) {
                if let Some(existing_doc) = store.get_by_index(&graph.id, NODES_TABLE, "uid", uid).await? {
                    existing_vertex = existing_doc.get("id").and_then(|v| v.as_u64());
                }
            }
        }
    }

    let vertex_id = match existing_vertex {
        Some(v) => v,
        None => {
            if opts.free_mode {
                let count = store.count(&graph.id, NODES_TABLE).await?;
                if count >= FREE_MODE_NODE_QUOTA {
                    return Err(SynthError::quota_exceeded("nodes", FREE_MODE_NODE_QUOTA).into());
                }
            }
            graph.topology.write().add_vertex()
        }
    };

    doc["id"] = json!(vertex_id);
    if doc.get("uid").and_then(|v| v.as_str()).is_none() {
        doc["uid"] = json!(Uuid::new_v4().to_string());
    }
    if doc.get("type").is_none() {
        doc["type"] = json!("Node");
    }
    let type_id = doc.get("type").and_then(|v| v.as_str()).unwrap_or("Node").to_string();
    ensure_node_type_exists(store, graph, &type_id).await?;

    store
        .insert(&graph.id, NODES_TABLE, vec![doc.clone()], conflict, Durability::Soft)
        .await?;
    Ok(doc)
}

async fn ensure_node_type_exists(store: &dyn DocumentStore, graph: &Graph, type_id: &str) -> Result<()> {
    if store.get(&graph.id, NODE_TYPES_TABLE, type_id).await?.is_some() {
        return Ok(());
    }
    store
        .insert(
            &graph.id,
            NODE_TYPES_TABLE,
            vec![json!({"id": type_id, "shape": "dynamic", "color": "dynamic", "image": null})],
            ConflictMode::Error,
            Durability::Soft,
        )
        .await?;
    Ok(())
}

async fn ensure_link_type_exists(store: &dyn DocumentStore, graph: &Graph, type_id: &str) -> Result<()> {
    if store.get(&graph.id, LINK_TYPES_TABLE, type_id).await?.is_some() {
        return Ok(());
    }
    store
        .insert(
            &graph.id,
            LINK_TYPES_TABLE,
            vec![json!({
                "id": type_id, "color": "dynamic", "image": null,
                "min": 0.0, "max": 1.0, "function": "elastic", "units": null
            })],
            ConflictMode::Error,
            Durability::Soft,
        )
        .await?;
    Ok(())
}

async fn maybe_widen_elastic(store: &dyn DocumentStore, graph: &Graph, type_id: &str, value: f64) -> Result<()> {
    let Some(link_type) = store.get(&graph.id, LINK_TYPES_TABLE, type_id).await? else {
        return Ok(());
    };
    if link_type.get("function").and_then(|v| v.as_str()) != Some("elastic") {
        return Ok(());
    }
    let min = link_type.get("min").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let max = link_type.get("max").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if value < min || value > max {
        let patch = json!({ "min": value.min(min), "max": value.max(max) });
        store.update(&graph.id, LINK_TYPES_TABLE, type_id, patch).await?;
    }
    Ok(())
}

/// Link insert, per §4.H.
#[instrument(skip(store, graph, doc))]
pub async fn insert_link(
    store: &dyn DocumentStore,
    graph: &Graph,
    mut doc: Value,
    opts: MutationOptions,
) -> Result<Value> {
    let _guard = graph.write_lock.lock().await;

    let origin = resolve_vertex_ref(store, graph, doc.get("origin")).await?;
    let terminus = resolve_vertex_ref(store, graph, doc.get("terminus")).await?;

    if opts.free_mode {
        let count = store.count(&graph.id, LINKS_TABLE).await?;
        if count >= FREE_MODE_LINK_QUOTA {
            return Err(SynthError::quota_exceeded("links", FREE_MODE_LINK_QUOTA).into());
        }
    }

    let handle = graph.topology.write().add_edge(origin, terminus);
    let local_idx = graph.topology.read().local_idx(handle);
    let id = encode_edge_id(origin, local_idx, terminus);

    let type_id = doc
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("Link")
        .to_string();
    ensure_link_type_exists(store, graph, &type_id).await?;

    if let Some(value) = doc.get("value").and_then(|v| v.as_f64()) {
        maybe_widen_elastic(store, graph, &type_id, value).await?;
    }

    if let Value::Object(map) = &mut doc {
        map.remove("origin");
        map.remove("terminus");
    }
    doc["id"] = json!(id);
    doc["type"] = json!(type_id);
    if doc.get("uid").and_then(|v| v.as_str()).is_none() {
        doc["uid"] = json!(Uuid::new_v4().to_string());
    }

    store
        .insert(&graph.id, LINKS_TABLE, vec![doc.clone()], ConflictMode::Error, Durability::Soft)
        .await?;
    let _ = handle;
    Ok(doc)
}

/// Node delete — the dense-id swap protocol (§4.H).
#[instrument(skip(store, graph))]
pub async fn delete_node(store: &dyn DocumentStore, graph: &Graph, vertex_id: VertexId) -> Result<DeleteManifest> {
    let _guard = graph.write_lock.lock().await;
    let vertex_key = vertex_id.to_string();

    if store.get(&graph.id, NODES_TABLE, &vertex_key).await?.is_none() {
        return Err(SynthError::nonexistence(&graph.id, "node", &vertex_key).into());
    }

    let outcome = graph.topology.write().remove_vertex(vertex_id);

    let mut links_deleted = Vec::new();
    for edge_id in &outcome.removed_edge_ids {
        if let Some(doc) = store.get(&graph.id, LINKS_TABLE, edge_id).await? {
            if let Some(uid) = doc.get("uid").and_then(|v| v.as_str()) {
                links_deleted.push(uid.to_string());
            }
        }
        store.delete(&graph.id, LINKS_TABLE, edge_id).await?;
    }

    let mut nodes_updated = HashMap::new();
    let mut links_updated = HashMap::new();

    if let Some(swap) = &outcome.swap {
        let journal_id = format!("swap-{}", swap.old_id);
        let journal_doc = json!({
            "id": journal_id,
            "old_id": swap.old_id,
            "new_id": swap.new_id,
            "relinked": swap.relinked_edges.iter()
                .map(|r| json!({"old_id": r.old_id, "new_id": r.new_id}))
                .collect::<Vec<_>>(),
        });
        // Journal before the document writes below, so a crash mid-swap is
        // reconcilable from this entry at the next catalog bootstrap.
        store
            .insert(&graph.id, SWAP_JOURNAL_TABLE, vec![journal_doc], ConflictMode::Replace, Durability::Hard)
            .await?;

        let swap_doc = store
            .get(&graph.id, NODES_TABLE, &swap.old_id.to_string())
            .await?
            .ok_or_else(|| SynthError::nonexistence(&graph.id, "node", &swap.old_id.to_string()))?;
        let uid = swap_doc.get("uid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let mut new_doc = swap_doc;
        new_doc["id"] = json!(swap.new_id);
        store
            .insert(&graph.id, NODES_TABLE, vec![new_doc], ConflictMode::Replace, Durability::Hard)
            .await?;
        store.delete(&graph.id, NODES_TABLE, &swap.old_id.to_string()).await?;
        nodes_updated.insert(uid, OldNew { old_id: json!(swap.old_id), new_id: json!(swap.new_id) });

        for relink in &swap.relinked_edges {
            if let Some(old_doc) = store.get(&graph.id, LINKS_TABLE, &relink.old_id).await? {
                let link_uid = old_doc.get("uid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let mut new_doc = old_doc;
                new_doc["id"] = json!(relink.new_id);
                store
                    .insert(&graph.id, LINKS_TABLE, vec![new_doc], ConflictMode::Replace, Durability::Hard)
                    .await?;
                store.delete(&graph.id, LINKS_TABLE, &relink.old_id).await?;
                links_updated.insert(
                    link_uid,
                    OldNew { old_id: json!(relink.old_id), new_id: json!(relink.new_id) },
                );
            }
        }

        store.delete(&graph.id, SWAP_JOURNAL_TABLE, &journal_id).await?;
    } else {
        store.delete(&graph.id, NODES_TABLE, &vertex_key).await?;
    }

    Ok(DeleteManifest {
        nodes_deleted: 1,
        links_deleted,
        nodes_updated,
        links_updated,
    })
}

/// Replay a swap-journal entry left over from a crash between the topology
/// write and the document-store writes, per §9.
pub async fn reconcile_swap_entry(store: &dyn DocumentStore, graph_id: &str, entry: &Value) -> Result<()> {
    let Some(old_id) = entry.get("old_id").and_then(|v| v.as_u64()) else {
        return Ok(());
    };
    let new_id = entry.get("new_id").and_then(|v| v.as_u64()).unwrap_or(old_id);

    if let Some(old_doc) = store.get(graph_id, NODES_TABLE, &old_id.to_string()).await? {
        let mut new_doc = old_doc;
        new_doc["id"] = json!(new_id);
        store
            .insert(graph_id, NODES_TABLE, vec![new_doc], ConflictMode::Replace, Durability::Hard)
            .await?;
        store.delete(graph_id, NODES_TABLE, &old_id.to_string()).await?;
    }

    if let Some(relinked) = entry.get("relinked").and_then(|v| v.as_array()) {
        for r in relinked {
            let (Some(old_link_id), Some(new_link_id)) = (
                r.get("old_id").and_then(|v| v.as_str()),
                r.get("new_id").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            if let Some(old_doc) = store.get(graph_id, LINKS_TABLE, old_link_id).await? {
                let mut new_doc = old_doc;
                new_doc["id"] = json!(new_link_id);
                store
                    .insert(graph_id, LINKS_TABLE, vec![new_doc], ConflictMode::Replace, Durability::Hard)
                    .await?;
                store.delete(graph_id, LINKS_TABLE, old_link_id).await?;
            }
        }
    }

    if let Some(journal_id) = entry.get("id").and_then(|v| v.as_str()) {
        store.delete(graph_id, SWAP_JOURNAL_TABLE, journal_id).await?;
    }
    warn!(graph = graph_id, old_id, new_id, "reconciled half-applied node-delete swap");
    Ok(())
}

/// Link delete — local-idx compaction (§4.H).
#[instrument(skip(store, graph))]
pub async fn delete_link(store: &dyn DocumentStore, graph: &Graph, handle: EdgeHandle) -> Result<DeleteManifest> {
    let _guard = graph.write_lock.lock().await;

    let removed_doc = {
        let id = graph.topology.read().edge_id(handle);
        store.get(&graph.id, LINKS_TABLE, &id).await?
    };

    let outcome = graph.topology.write().remove_edge(handle);
    store.delete(&graph.id, LINKS_TABLE, &outcome.removed_edge_id).await?;

    let mut links_deleted = Vec::new();
    if let Some(doc) = removed_doc {
        if let Some(uid) = doc.get("uid").and_then(|v| v.as_str()) {
            links_deleted.push(uid.to_string());
        }
    }

    let mut links_updated = HashMap::new();
    for relink in outcome.relinked_edges {
        if let Some(old_doc) = store.get(&graph.id, LINKS_TABLE, &relink.old_id).await? {
            let uid = old_doc.get("uid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let mut new_doc = old_doc;
            new_doc["id"] = json!(relink.new_id);
            store
                .insert(&graph.id, LINKS_TABLE, vec![new_doc], ConflictMode::Replace, Durability::Hard)
                .await?;
            store.delete(&graph.id, LINKS_TABLE, &relink.old_id).await?;
            links_updated.insert(uid, OldNew { old_id: json!(relink.old_id), new_id: json!(relink.new_id) });
        }
    }

    Ok(DeleteManifest {
        nodes_deleted: 0,
        links_deleted,
        nodes_updated: HashMap::new(),
        links_updated,
    })
}

/// Type delete (§4.H): protected ids refuse; otherwise the type record is
/// removed and every document of that type is bulk-updated to the default.
pub async fn delete_type(
    store: &dyn DocumentStore,
    graph_id: &str,
    type_table: &str,
    doc_table: &str,
    type_id: &str,
    default_type: &str,
) -> Result<()> {
    if type_id == "Node" || type_id == "Link" {
        return Err(SynthError::protected_type(type_id).into());
    }
    store.delete(graph_id, type_table, type_id).await?;
    for doc in store.get_all(graph_id, doc_table).await? {
        if doc.get("type").and_then(|v| v.as_str()) == Some(type_id) {
            let key = doc_key(&doc["id"]);
            store.update(graph_id, doc_table, &key, json!({"type": default_type})).await?;
        }
    }
    Ok(())
}

/// Finalize-graph: used by every generator after it hands back a raw
/// topology with no backing documents yet (§4.H).
#[instrument(skip(store, topology))]
pub async fn finalize_graph(store: &dyn DocumentStore, graph_id: &str, topology: &Topology) -> Result<()> {
    store.create_database(graph_id).await?;
    for table in [NODES_TABLE, LINKS_TABLE, NODE_TYPES_TABLE, LINK_TYPES_TABLE, SWAP_JOURNAL_TABLE] {
        store.create_table(graph_id, table).await?;
    }
    store.create_index(graph_id, NODES_TABLE, "uid").await?;
    store.create_index(graph_id, LINKS_TABLE, "uid").await?;

    store
        .insert(
            graph_id,
            NODE_TYPES_TABLE,
            vec![json!({"id": "Node", "shape": "dynamic", "color": "dynamic", "image": null})],
            ConflictMode::Error,
            Durability::Hard,
        )
        .await?;
    store
        .insert(
            graph_id,
            LINK_TYPES_TABLE,
            vec![json!({
                "id": "Link", "color": "dynamic", "image": null,
                "min": 0.0, "max": 1.0, "function": "elastic", "units": null
            })],
            ConflictMode::Error,
            Durability::Hard,
        )
        .await?;

    const BATCH: usize = 200;

    let mut node_batch = Vec::with_capacity(BATCH);
    for v in 0..topology.num_vertices() {
        node_batch.push(json!({"id": v, "type": "Node", "uid": Uuid::new_v4().to_string()}));
        if node_batch.len() == BATCH {
            store
                .insert(graph_id, NODES_TABLE, std::mem::take(&mut node_batch), ConflictMode::Error, Durability::Soft)
                .await?;
        }
    }
    if !node_batch.is_empty() {
        store
            .insert(graph_id, NODES_TABLE, node_batch, ConflictMode::Error, Durability::Soft)
            .await?;
    }

    let mut link_batch = Vec::with_capacity(BATCH);
    for handle in topology.all_edge_handles() {
        let id = topology.edge_id(handle);
        link_batch.push(json!({"id": id, "type": "Link", "uid": Uuid::new_v4().to_string(), "value": 1}));
        if link_batch.len() == BATCH {
            store
                .insert(graph_id, LINKS_TABLE, std::mem::take(&mut link_batch), ConflictMode::Error, Durability::Soft)
                .await?;
        }
    }
    if !link_batch.is_empty() {
        store
            .insert(graph_id, LINKS_TABLE, link_batch, ConflictMode::Error, Durability::Soft)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GraphCatalog;
    use crate::document_store::FileDocumentStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn graph_with_store() -> (TempDir, Arc<FileDocumentStore>, Arc<Graph>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileDocumentStore::open(dir.path()).await.unwrap());
        let catalog = GraphCatalog::new(store.clone());
        catalog.create_graph(Some("g1".to_string())).await.unwrap();
        let graph = catalog.get("g1").unwrap();
        (dir, store, graph)
    }

    #[tokio::test]
    async fn insert_two_nodes_and_a_parallel_link_scenario() {
        // spec scenario 1 + 2.
        let (_dir, store, graph) = graph_with_store().await;
        let opts = MutationOptions::default();
        insert_node(store.as_ref(), &graph, json!({"type": "A"}), ConflictMode::Error, opts).await.unwrap();
        insert_node(store.as_ref(), &graph, json!({"type": "B"}), ConflictMode::Error, opts).await.unwrap();
        assert_eq!(store.count("g1", NODES_TABLE).await.unwrap(), 2);

        let l1 = insert_link(store.as_ref(), &graph, json!({"origin": 0, "terminus": 1}), opts).await.unwrap();
        let l2 = insert_link(store.as_ref(), &graph, json!({"origin": 0, "terminus": 1}), opts).await.unwrap();
        assert_eq!(l1["id"], "0_0_1");
        assert_eq!(l2["id"], "0_1_1");
    }

    #[tokio::test]
    async fn node_delete_swap_matches_spec_scenario_3() {
        let (_dir, store, graph) = graph_with_store().await;
        let opts = MutationOptions::default();
        for _ in 0..3 {
            insert_node(store.as_ref(), &graph, json!({}), ConflictMode::Error, opts).await.unwrap();
        }
        insert_link(store.as_ref(), &graph, json!({"origin": 0, "terminus": 2}), opts).await.unwrap();

        let manifest = delete_node(store.as_ref(), &graph, 1).await.unwrap();
        assert_eq!(graph.topology.read().num_vertices(), 2);
        let updated = manifest.nodes_updated.values().next().unwrap();
        assert_eq!(updated.old_id, json!(2));
        assert_eq!(updated.new_id, json!(1));
        let link_updated = manifest.links_updated.values().next().unwrap();
        assert_eq!(link_updated.old_id, json!("0_0_2"));
        assert_eq!(link_updated.new_id, json!("0_0_1"));

        assert!(store.get("g1", NODES_TABLE, "1").await.unwrap().is_some());
        assert!(store.get("g1", NODES_TABLE, "2").await.unwrap().is_none());
        assert!(store.get("g1", LINKS_TABLE, "0_0_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn link_delete_compacts_matching_spec_scenario_4() {
        let (_dir, store, graph) = graph_with_store().await;
        let opts = MutationOptions::default();
        insert_node(store.as_ref(), &graph, json!({}), ConflictMode::Error, opts).await.unwrap();
        insert_node(store.as_ref(), &graph, json!({}), ConflictMode::Error, opts).await.unwrap();
        insert_link(store.as_ref(), &graph, json!({"origin": 0, "terminus": 1}), opts).await.unwrap();
        insert_link(store.as_ref(), &graph, json!({"origin": 0, "terminus": 1}), opts).await.unwrap();
        insert_link(store.as_ref(), &graph, json!({"origin": 0, "terminus": 1}), opts).await.unwrap();
        let middle = graph.topology.read().all_edges(0, 1)[1];

        delete_link(store.as_ref(), &graph, middle).await.unwrap();
        let remaining = store.get_all("g1", LINKS_TABLE).await.unwrap();
        let mut ids: Vec<String> = remaining.iter().map(|d| d["id"].as_str().unwrap().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["0_0_1".to_string(), "0_1_1".to_string()]);
    }

    #[tokio::test]
    async fn deleting_protected_type_is_refused() {
        let (_dir, store, _graph) = graph_with_store().await;
        let err = delete_type(store.as_ref(), "g1", NODE_TYPES_TABLE, NODES_TABLE, "Node", "Node")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<SynthError>().is_some());
    }

    #[tokio::test]
    async fn finalize_graph_batches_generated_topology() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(dir.path()).await.unwrap();
        let mut topo = Topology::new();
        for _ in 0..5 {
            topo.add_vertex();
        }
        topo.add_edge(0, 1);
        topo.add_edge(1, 2);
        finalize_graph(&store, "generated", &topo).await.unwrap();
        assert_eq!(store.count("generated", NODES_TABLE).await.unwrap(), 5);
        assert_eq!(store.count("generated", LINKS_TABLE).await.unwrap(), 2);
    }
}
