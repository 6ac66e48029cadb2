//! The Graph Catalog (§4.D): registry of live graphs, their lifecycle, and
//! the startup reconciliation that rebuilds every graph's topology from the
//! document store.

use crate::document_store::{ConflictMode, DocumentStore, Durability};
use crate::errors::SynthError;
use crate::identifiers::split_edge_id;
use crate::mutation::SWAP_JOURNAL_TABLE;
use crate::property_map::PropertyMapRegistry;
use crate::topology::Topology;
use anyhow::Result;
use parking_lot::RwLock as SyncRwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Database/graph ids the catalog never treats as a live graph.
const RESERVED_NAMES: &[&str] = &["test", "_system"];

pub const NODE_TYPES_TABLE: &str = "node_types";
pub const LINK_TYPES_TABLE: &str = "link_types";
pub const NODES_TABLE: &str = "nodes";
pub const LINKS_TABLE: &str = "links";

/// A live graph: its topology, its ephemeral property maps, and the
/// single-writer mutex that serializes every mutation against it (§5).
pub struct Graph {
    pub id: String,
    pub topology: SyncRwLock<Topology>,
    pub properties: SyncRwLock<PropertyMapRegistry>,
    /// Held for the duration of any insert/update/delete/commit against this
    /// graph. Readers never take this lock.
    pub write_lock: AsyncMutex<()>,
    /// Set on a subgraph (`subgraph.rs`): the database its node/link
    /// documents actually live in, since a filtered view keeps the host's
    /// vertex ids rather than renumbering them.
    pub host_database: Option<String>,
}

impl Graph {
    fn empty(id: String) -> Self {
        Self {
            id,
            topology: SyncRwLock::new(Topology::new()),
            properties: SyncRwLock::new(PropertyMapRegistry::new()),
            write_lock: AsyncMutex::new(()),
            host_database: None,
        }
    }

    /// The database name document-store lookups for this graph's nodes and
    /// links should use: the host's, for a subgraph, otherwise its own id.
    pub fn document_database(&self) -> &str {
        self.host_database.as_deref().unwrap_or(&self.id)
    }
}

pub struct GraphCatalog {
    store: Arc<dyn DocumentStore>,
    graphs: SyncRwLock<HashMap<String, Arc<Graph>>>,
}

impl GraphCatalog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            graphs: SyncRwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.graphs.read().keys().cloned().collect()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Register an already-constructed graph (a subgraph, or a
    /// finalized generator result) under `id`. Callers are responsible for
    /// having checked the id isn't already live.
    pub fn register(&self, id: String, mut graph: Graph, host_database: Option<String>) {
        graph.id = id.clone();
        graph.host_database = host_database;
        self.graphs.write().insert(id, Arc::new(graph));
    }

    /// Enumerate every non-reserved database in the store, rebuild its
    /// in-memory topology, and replay any half-applied swap journal entry
    /// found along the way (§9's open question on swap atomicity).
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<()> {
        for name in self.store.list_databases().await? {
            if RESERVED_NAMES.contains(&name.as_str()) {
                continue;
            }
            match self.load_graph(&name).await {
                Ok(graph) => {
                    self.graphs.write().insert(name.clone(), Arc::new(graph));
                    info!(graph = %name, "graph loaded at startup");
                }
                Err(e) => warn!(graph = %name, error = %e, "failed to load graph at startup"),
            }
        }
        Ok(())
    }

    async fn load_graph(&self, name: &str) -> Result<Graph> {
        let graph = Graph::empty(name.to_string());

        let num_nodes = self.store.count(name, NODES_TABLE).await?;
        let link_docs = self.store.get_all(name, LINKS_TABLE).await?;

        // Edges must be added per pair in ascending stored `local_idx` order
        // for `Topology::add_edge`'s auto-incrementing counter to land on
        // the same indices the store recorded; `get_all` makes no ordering
        // guarantee, so pairs (and the indices within them) are sorted here
        // before replay (§8 invariant 4).
        let mut by_pair: HashMap<(u64, u64), Vec<u16>> = HashMap::new();
        for doc in &link_docs {
            if let Some(id) = doc.get("id").and_then(|v| v.as_str()) {
                if let Some((o, idx, t)) = split_edge_id(id) {
                    by_pair.entry((o, t)).or_default().push(idx);
                }
            }
        }

        let mut topo = Topology::new();
        for _ in 0..num_nodes {
            topo.add_vertex();
        }
        let mut pairs: Vec<_> = by_pair.into_iter().collect();
        pairs.sort_by_key(|(pair, _)| *pair);
        for ((o, t), mut idxs) in pairs {
            idxs.sort_unstable();
            for _ in idxs {
                topo.add_edge(o, t);
            }
        }
        *graph.topology.write() = topo;

        self.reconcile_swap_journal(&graph, name).await?;
        Ok(graph)
    }

    async fn reconcile_swap_journal(&self, _graph: &Graph, name: &str) -> Result<()> {
        if self.store.count(name, SWAP_JOURNAL_TABLE).await.unwrap_or(0) == 0 {
            return Ok(());
        }
        let pending = self.store.get_all(name, SWAP_JOURNAL_TABLE).await?;
        for entry in pending {
            warn!(graph = %name, entry = %entry, "replaying half-applied node-delete swap from journal");
            crate::mutation::reconcile_swap_entry(self.store.as_ref(), name, &entry).await?;
        }
        Ok(())
    }

    /// `create_graph(name?)` per §4.D: name defaults to a UUID with dashes
    /// replaced by underscores; fails with `DuplicateIDError` if the graph
    /// is already live or the underlying database exists.
    #[instrument(skip(self))]
    pub async fn create_graph(&self, name: Option<String>) -> Result<String> {
        let name = name
            .unwrap_or_else(|| Uuid::new_v4().to_string())
            .replace('-', "_");

        if self.graphs.read().contains_key(&name) || self.store.database_exists(&name).await? {
            return Err(SynthError::duplicate_id(&name).into());
        }

        self.store.create_database(&name).await?;
        for table in [NODES_TABLE, LINKS_TABLE, NODE_TYPES_TABLE, LINK_TYPES_TABLE, SWAP_JOURNAL_TABLE] {
            self.store.create_table(&name, table).await?;
        }
        self.store.create_index(&name, NODES_TABLE, "uid").await?;
        self.store.create_index(&name, LINKS_TABLE, "uid").await?;

        self.store
            .insert(
                &name,
                NODE_TYPES_TABLE,
                vec![json!({"id": "Node", "shape": "dynamic", "color": "dynamic", "image": null})],
                ConflictMode::Error,
                Durability::Hard,
            )
            .await?;
        self.store
            .insert(
                &name,
                LINK_TYPES_TABLE,
                vec![json!({
                    "id": "Link", "color": "dynamic", "image": null,
                    "min": 0.0, "max": 1.0, "function": "elastic", "units": null
                })],
                ConflictMode::Error,
                Durability::Hard,
            )
            .await?;

        self.graphs
            .write()
            .insert(name.clone(), Arc::new(Graph::empty(name.clone())));
        Ok(name)
    }

    pub async fn drop_graph(&self, name: &str) -> Result<()> {
        let removed = self.graphs.write().remove(name);
        let Some(graph) = removed else {
            return Err(SynthError::nonexistence(name, "graph", name).into());
        };
        // A subgraph has no database of its own (its documents live in the
        // host's), so dropping one must not touch the host's database.
        if graph.host_database.is_none() {
            self.store.drop_database(name).await?;
        }
        Ok(())
    }
}
