//! The Query Planner (§4.F): parses a request envelope into a dispatched
//! operation, and the parameter-coercion rule every algorithm/generator
//! call goes through before it runs.
//!
//! Grounded on the host crate's `Query`/`QueryBuilder` validated-
//! construction pattern (`contracts.rs`, `builders.rs`): `RequestEnvelope`
//! is a plain `serde`-deserialized struct using the wire header names of
//! §6 (`q`, `g`, `params`, `body`), and dispatch is a straightforward match
//! over `q` rather than a hand-rolled parser, since the wire format here is
//! already structured JSON.

use crate::algorithms::{coerce_params, BuiltinAlgorithms, GraphAlgorithms, ParamKind, ParamSpec};
use crate::catalog::{Graph, GraphCatalog, LINKS_TABLE, LINK_TYPES_TABLE, NODES_TABLE, NODE_TYPES_TABLE};
use crate::document_store::{ConflictMode, DocumentStore, Durability};
use crate::errors::SynthError;
use crate::expr::{Predicate, Projection, UdfRegistry};
use crate::generators;
use crate::identifiers::{self, Identifier, RefKind, VertexId};
use crate::mutation::{self, MutationOptions};
use crate::property_map::{sanitize_for_json, PropertyMap, ValueType};
use crate::stream::{CoerceTo, ReduceOp, SortSpec, StreamSpec};
use crate::subgraph;
use crate::walk::{self, Direction, Tier, WalkSpec};
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// `{graph_id, operation, parameters, body?}`, spelled with the wire names
/// of §6: `q` selects the operation, `g` names the graph, `params` carries
/// arguments, and `body` carries a streamed payload (insert documents,
/// update patches, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub q: String,
    #[serde(default)]
    pub g: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub body: Option<Value>,
}

/// What a handled request produces. `ping` is the one operation with a
/// literal non-JSON wire response (§6); everything else is a JSON
/// document, with `stream`'s array payload framed by the transport layer
/// per the client's chosen mode (tab vs event-stream, §4.G).
#[derive(Debug, Clone)]
pub enum Response {
    Text(String),
    Json(Value),
}

/// Top-level request handler: owns the Graph Catalog, the document store,
/// the algorithms boundary, and the named-UDF registry dynamic predicates
/// resolve against.
pub struct SynthDb {
    pub catalog: GraphCatalog,
    pub store: Arc<dyn DocumentStore>,
    pub algorithms: Box<dyn GraphAlgorithms>,
    pub udfs: UdfRegistry,
    pub mutation_opts: MutationOptions,
}

impl SynthDb {
    pub fn new(store: Arc<dyn DocumentStore>, free_mode: bool) -> Self {
        Self {
            catalog: GraphCatalog::new(store.clone()),
            store,
            algorithms: Box::new(BuiltinAlgorithms),
            udfs: UdfRegistry::new(),
            mutation_opts: MutationOptions { free_mode },
        }
    }

    pub async fn bootstrap(&self) -> Result<()> {
        self.catalog.bootstrap().await
    }

    fn graph(&self, envelope: &RequestEnvelope) -> Result<Arc<Graph>, SynthError> {
        let id = envelope
            .g
            .as_deref()
            .ok_or_else(|| SynthError::PreqlSyntax {
                message: "this operation requires a graph id ('g')".to_string(),
                offending_key: Some("g".to_string()),
            })?;
        self.catalog
            .get(id)
            .ok_or_else(|| SynthError::nonexistence(id, "graph", id))
    }

    pub async fn handle(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        match envelope.q.as_str() {
            "ping" => Ok(Response::Text("Hi there!".to_string())),
            "list_graphs" => Ok(Response::Json(json!(self.catalog.list()))),
            "create_graph" => self.op_create_graph(envelope).await,
            "drop_graph" => self.op_drop_graph(envelope).await,
            "graph_stats" => self.op_graph_stats(envelope).await,
            "insert" => self.op_insert(envelope).await,
            "pluck" => self.op_pluck(envelope).await,
            "stream" => self.op_stream(envelope).await,
            "update" => self.op_update(envelope).await,
            "delete" => self.op_delete(envelope).await,
            "topology" => self.op_topology(envelope).await,
            "generate" => self.op_generate(envelope).await,
            "commit" => self.op_commit(envelope).await,
            "graph_filter" => self.op_graph_filter(envelope).await,
            "walk" => self.op_walk(envelope).await,
            "fields" => self.op_fields(envelope).await,
            "create_index" => self.op_create_index(envelope).await,
            other => Err(SynthError::PreqlSyntax {
                message: format!("unknown operation '{other}'"),
                offending_key: Some("q".to_string()),
            }),
        }
    }

    async fn op_create_graph(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let name = envelope.params.get("name").and_then(|v| v.as_str()).map(str::to_string);
        let id = self
            .catalog
            .create_graph(name)
            .await
            .map_err(downcast_or_internal)?;
        Ok(Response::Json(json!({"id": id})))
    }

    async fn op_drop_graph(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        self.catalog.drop_graph(&graph.id).await.map_err(downcast_or_internal)?;
        Ok(Response::Json(json!({"dropped": graph.id})))
    }

    async fn op_graph_stats(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let num_nodes = graph.topology.read().num_vertices();
        let num_links = graph.topology.read().num_edges();
        let node_types = self.type_ids(&graph, NODE_TYPES_TABLE).await?;
        let link_types = self.type_ids(&graph, LINK_TYPES_TABLE).await?;
        Ok(Response::Json(json!({
            "id": graph.id,
            "num_nodes": num_nodes,
            "num_links": num_links,
            "node_types": node_types,
            "link_types": link_types,
        })))
    }

    async fn type_ids(&self, graph: &Graph, table: &str) -> Result<Vec<String>, SynthError> {
        let docs = self
            .store
            .get_all(graph.document_database(), table)
            .await
            .map_err(|e| SynthError::nonexistence(&graph.id, "table", e.to_string()))?;
        Ok(docs.iter().filter_map(|d| d.get("id").and_then(|v| v.as_str()).map(str::to_string)).collect())
    }

    async fn op_insert(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let table = envelope.params.get("table").and_then(|v| v.as_str()).unwrap_or("nodes");
        let conflict = parse_conflict(&envelope.params);
        let docs = match envelope.body {
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
            None => {
                return Err(SynthError::missing_required_params(&["body"]));
            }
        };

        let mut inserted = 0u64;
        let mut errors = 0u64;
        for doc in docs {
            let result = match table {
                "nodes" => mutation::insert_node(self.store.as_ref(), &graph, doc, conflict, self.mutation_opts)
                    .await
                    .map(|_| ()),
                "links" => mutation::insert_link(self.store.as_ref(), &graph, doc, self.mutation_opts)
                    .await
                    .map(|_| ()),
                other => {
                    return Err(SynthError::PreqlSyntax {
                        message: format!("insert is not supported on table '{other}'"),
                        offending_key: Some("table".to_string()),
                    })
                }
            };
            match result {
                Ok(()) => inserted += 1,
                Err(_) => errors += 1,
            }
        }
        Ok(Response::Json(json!({"inserted": inserted, "errors": errors})))
    }

    async fn resolve_node_key(&self, graph: &Graph, reference: &str) -> Result<String, SynthError> {
        match identifiers::classify(reference, RefKind::Node) {
            Some(Identifier::VertexId(v)) => {
                if v >= graph.topology.read().num_vertices() {
                    return Err(SynthError::nonexistence(&graph.id, "node", reference));
                }
                Ok(v.to_string())
            }
            Some(Identifier::Uid(uid)) => {
                let doc = self
                    .store
                    .get_by_index(graph.document_database(), NODES_TABLE, "uid", &uid.to_string())
                    .await
                    .map_err(|e| SynthError::nonexistence(&graph.id, "node", e.to_string()))?
                    .ok_or_else(|| SynthError::nonexistence(&graph.id, "node", reference))?;
                doc.get("id")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .ok_or_else(|| SynthError::nonexistence(&graph.id, "node", reference))
            }
            _ => Err(SynthError::nonexistence(&graph.id, "node", reference)),
        }
    }

    async fn resolve_link_key(&self, graph: &Graph, reference: &str) -> Result<String, SynthError> {
        match identifiers::classify(reference, RefKind::Link) {
            Some(Identifier::EdgeTriple(o, idx, t)) => Ok(format!("{o}_{idx}_{t}")),
            Some(Identifier::Uid(uid)) => {
                let doc = self
                    .store
                    .get_by_index(graph.document_database(), LINKS_TABLE, "uid", &uid.to_string())
                    .await
                    .map_err(|e| SynthError::nonexistence(&graph.id, "link", e.to_string()))?
                    .ok_or_else(|| SynthError::nonexistence(&graph.id, "link", reference))?;
                doc.get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| SynthError::nonexistence(&graph.id, "link", reference))
            }
            _ => Err(SynthError::nonexistence(&graph.id, "link", reference)),
        }
    }

    /// For every `NodeRef`/`LinkRef` parameter `specs` declares, resolve the
    /// caller-supplied reference via §4.E (`resolve_node_key`/
    /// `resolve_link_key`) and rewrite it to the canonical key, so an
    /// algorithm body never has to re-implement identifier resolution (or
    /// skip it) itself. `coerce_params` only checks that these parameters
    /// are strings; this is the step that actually resolves them and turns
    /// a miss into a `NonexistenceError`, per spec.md's "return null on
    /// miss; the caller converts to NonexistenceError".
    async fn resolve_ref_params(&self, graph: &Graph, specs: &[ParamSpec], params: &Value) -> Result<Value, SynthError> {
        let mut obj = params.as_object().cloned().unwrap_or_default();
        for spec in specs {
            let Some(reference) = obj.get(spec.name).and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };
            let key = match spec.kind {
                ParamKind::NodeRef => self.resolve_node_key(graph, &reference).await?,
                ParamKind::LinkRef => self.resolve_link_key(graph, &reference).await?,
                _ => continue,
            };
            obj.insert(spec.name.to_string(), json!(key));
        }
        Ok(Value::Object(obj))
    }

    async fn op_pluck(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let kind = envelope.params.get("kind").and_then(|v| v.as_str()).unwrap_or("node");

        if kind == "property_map" {
            let map_name = envelope
                .params
                .get("map")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SynthError::missing_required_params(&["map"]))?;
            let key = envelope
                .params
                .get("key")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| SynthError::missing_required_params(&["key"]))? as usize;
            let properties = graph.properties.read();
            let map = properties
                .get(map_name)
                .ok_or_else(|| SynthError::nonexistence(&graph.id, "property_map", map_name))?;
            return Ok(Response::Json(map.get_json(key)));
        }

        let reference = envelope
            .params
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["id"]))?;
        let (table, key) = match kind {
            "node" => (NODES_TABLE, self.resolve_node_key(&graph, reference).await?),
            "link" => (LINKS_TABLE, self.resolve_link_key(&graph, reference).await?),
            "node_type" => (NODE_TYPES_TABLE, reference.to_string()),
            "link_type" => (LINK_TYPES_TABLE, reference.to_string()),
            other => {
                return Err(SynthError::PreqlSyntax {
                    message: format!("pluck does not support kind '{other}'"),
                    offending_key: Some("kind".to_string()),
                })
            }
        };
        let doc = self
            .store
            .get(graph.document_database(), table, &key)
            .await
            .map_err(|e| SynthError::nonexistence(&graph.id, kind, e.to_string()))?
            .ok_or_else(|| SynthError::nonexistence(&graph.id, kind, reference))?;

        match envelope.params.get("field").and_then(|v| v.as_str()) {
            Some(path) => Ok(Response::Json(
                crate::expr::field_path(&doc, path).cloned().unwrap_or(Value::Null),
            )),
            None => Ok(Response::Json(doc)),
        }
    }

    fn table_for(&self, name: &str) -> Result<&'static str, SynthError> {
        match name {
            "nodes" => Ok(NODES_TABLE),
            "links" => Ok(LINKS_TABLE),
            "node_types" => Ok(NODE_TYPES_TABLE),
            "link_types" => Ok(LINK_TYPES_TABLE),
            other => Err(SynthError::PreqlSyntax {
                message: format!("unknown table '{other}'"),
                offending_key: Some("table".to_string()),
            }),
        }
    }

    async fn op_stream(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let table_name = envelope.params.get("table").and_then(|v| v.as_str()).unwrap_or("nodes");
        let table = self.table_for(table_name)?;
        let spec = parse_stream_spec(&envelope.params)?;

        let items = self
            .store
            .get_all(graph.document_database(), table)
            .await
            .map_err(|e| SynthError::nonexistence(&graph.id, table_name, e.to_string()))?;

        if spec.coerce_to == Some(CoerceTo::PropertyMap) {
            let field = envelope
                .params
                .get("map_field")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SynthError::missing_required_params(&["map_field"]))?;
            let mut filtered = items;
            if let Some(pred) = &spec.filter {
                filtered.retain(|doc| pred.eval(doc, &self.udfs));
            }
            let mut map = PropertyMap::new_scalar(ValueType::Float, filtered.len());
            for doc in &filtered {
                let key = doc.get("id").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let value = doc.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
                if key < map.len() {
                    map.set_float(key, value);
                }
            }
            let name = envelope.params.get("name").and_then(|v| v.as_str()).map(str::to_string);
            let name = graph.properties.write().insert(name, map);
            return Ok(Response::Json(json!({"property_map": name})));
        }

        Ok(Response::Json(crate::stream::run_pipeline(items, &self.udfs, &spec)))
    }

    async fn op_update(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let kind = envelope.params.get("kind").and_then(|v| v.as_str()).unwrap_or("node");
        let reference = envelope
            .params
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["id"]))?;
        let patch = envelope.body.clone().unwrap_or(Value::Null);
        let (table, key) = match kind {
            "node" => (NODES_TABLE, self.resolve_node_key(&graph, reference).await?),
            "link" => (LINKS_TABLE, self.resolve_link_key(&graph, reference).await?),
            other => {
                return Err(SynthError::PreqlSyntax {
                    message: format!("update does not support kind '{other}'"),
                    offending_key: Some("kind".to_string()),
                })
            }
        };
        let updated = self
            .store
            .update(graph.document_database(), table, &key, patch)
            .await
            .map_err(|e| SynthError::nonexistence(&graph.id, kind, e.to_string()))?;
        if !updated {
            return Err(SynthError::nonexistence(&graph.id, kind, reference));
        }
        Ok(Response::Json(json!({"updated": true})))
    }

    async fn op_delete(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let kind = envelope.params.get("kind").and_then(|v| v.as_str()).unwrap_or("node");
        let reference = envelope
            .params
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["id"]))?;

        let manifest = match kind {
            "node" => {
                let key = self.resolve_node_key(&graph, reference).await?;
                let vertex_id: VertexId = key.parse().map_err(|_| SynthError::nonexistence(&graph.id, "node", reference))?;
                mutation::delete_node(self.store.as_ref(), &graph, vertex_id)
                    .await
                    .map_err(downcast_or_internal)?
            }
            "link" => {
                let key = self.resolve_link_key(&graph, reference).await?;
                let (o, _idx, t) = identifiers::split_edge_id(&key).ok_or_else(|| SynthError::nonexistence(&graph.id, "link", reference))?;
                let handle = {
                    let topo = graph.topology.read();
                    topo.all_edges(o, t)
                        .into_iter()
                        .find(|h| topo.edge_id(*h) == key)
                        .ok_or_else(|| SynthError::nonexistence(&graph.id, "link", reference))?
                };
                mutation::delete_link(self.store.as_ref(), &graph, handle)
                    .await
                    .map_err(downcast_or_internal)?
            }
            "node_type" | "link_type" => {
                let (type_table, doc_table, default_type) = if kind == "node_type" {
                    (NODE_TYPES_TABLE, NODES_TABLE, "Node")
                } else {
                    (LINK_TYPES_TABLE, LINKS_TABLE, "Link")
                };
                mutation::delete_type(self.store.as_ref(), &graph.id, type_table, doc_table, reference, default_type)
                    .await
                    .map_err(downcast_or_internal)?;
                return Ok(Response::Json(json!({"deleted": reference})));
            }
            other => {
                return Err(SynthError::PreqlSyntax {
                    message: format!("delete does not support kind '{other}'"),
                    offending_key: Some("kind".to_string()),
                })
            }
        };
        Ok(Response::Json(json!(manifest)))
    }

    async fn op_topology(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let kind = envelope.params.get("kind").and_then(|v| v.as_str()).unwrap_or("graph");

        match kind {
            "node" => {
                let reference = envelope
                    .params
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SynthError::missing_required_params(&["id"]))?;
                let key = self.resolve_node_key(&graph, reference).await?;
                let v: VertexId = key.parse().unwrap();
                let function = envelope.params.get("function").and_then(|v| v.as_str()).unwrap_or("neighbours");
                let topo = graph.topology.read();
                let body = match function {
                    "degree" => json!({"in": topo.in_degree(v), "out": topo.out_degree(v)}),
                    "neighbours" => json!({
                        "in": topo.in_neighbours(v),
                        "out": topo.out_neighbours(v),
                    }),
                    "links" => json!({
                        "in": topo.in_edges(v).into_iter().map(|h| topo.edge_id(h)).collect::<Vec<_>>(),
                        "out": topo.out_edges(v).into_iter().map(|h| topo.edge_id(h)).collect::<Vec<_>>(),
                    }),
                    other => {
                        return Err(SynthError::PreqlSyntax {
                            message: format!("unknown node topology function '{other}'"),
                            offending_key: Some("function".to_string()),
                        })
                    }
                };
                Ok(Response::Json(body))
            }
            "link" => {
                let reference = envelope
                    .params
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SynthError::missing_required_params(&["id"]))?;
                let key = self.resolve_link_key(&graph, reference).await?;
                let (o, _idx, t) = identifiers::split_edge_id(&key).ok_or_else(|| SynthError::nonexistence(&graph.id, "link", reference))?;
                Ok(Response::Json(json!({"origin": o, "terminus": t})))
            }
            "graph" => {
                let algorithm = envelope
                    .params
                    .get("algorithm")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SynthError::missing_required_params(&["algorithm"]))?;
                let specs = self
                    .algorithms
                    .params(algorithm)
                    .ok_or_else(|| SynthError::topology_precondition(format!("unknown algorithm '{algorithm}'")))?;
                coerce_params(specs, &envelope.params)?;
                let resolved_params = self.resolve_ref_params(&graph, specs, &envelope.params).await?;
                let topo = graph.topology.read();
                let map = self.algorithms.run(algorithm, &topo, &resolved_params)?;
                let mut out = serde_json::Map::new();
                for v in 0..topo.num_vertices() {
                    let value = map.get_json(v as usize);
                    let sanitized = match value.as_f64() {
                        Some(f) => sanitize_for_json(f),
                        None => value,
                    };
                    out.insert(v.to_string(), sanitized);
                }
                Ok(Response::Json(Value::Object(out)))
            }
            other => Err(SynthError::PreqlSyntax {
                message: format!("topology does not support kind '{other}'"),
                offending_key: Some("kind".to_string()),
            }),
        }
    }

    async fn op_generate(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let generator = envelope
            .params
            .get("generator")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["generator"]))?;
        let specs = generators::params(generator)
            .ok_or_else(|| SynthError::topology_precondition(format!("unknown generator '{generator}'")))?;
        coerce_params(specs, &envelope.params)?;

        let topology = match generator {
            "random_graph" => generators::random_graph(&envelope.params)?,
            "complete_graph" => generators::complete_graph(&envelope.params)?,
            "circular_graph" => generators::circular_graph(&envelope.params)?,
            other => return Err(SynthError::topology_precondition(format!("unknown generator '{other}'"))),
        };

        let name = envelope.params.get("name").and_then(|v| v.as_str()).map(str::to_string);
        let id = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()).replace('-', "_");
        if self.catalog.get(&id).is_some() || self.store.database_exists(&id).await.unwrap_or(false) {
            return Err(SynthError::duplicate_id(&id));
        }
        mutation::finalize_graph(self.store.as_ref(), &id, &topology)
            .await
            .map_err(downcast_or_internal)?;
        let graph = Graph {
            id: id.clone(),
            topology: parking_lot::RwLock::new(topology),
            properties: parking_lot::RwLock::new(crate::property_map::PropertyMapRegistry::new()),
            write_lock: tokio::sync::Mutex::new(()),
            host_database: None,
        };
        self.catalog.register(id.clone(), graph, None);
        Ok(Response::Json(json!({"id": id})))
    }

    async fn op_commit(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let map_name = envelope
            .params
            .get("map")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["map"]))?;
        let field_path = envelope
            .params
            .get("target_field")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["target_field"]))?;

        let (len, table) = {
            let properties = graph.properties.read();
            let map = properties
                .get(map_name)
                .ok_or_else(|| SynthError::nonexistence(&graph.id, "property_map", map_name))?;
            (map.len(), NODES_TABLE)
        };

        let mut committed = 0u64;
        for key in 0..len {
            let value = {
                let properties = graph.properties.read();
                properties.get(map_name).unwrap().get_json(key)
            };
            let patch = nested_patch(field_path, value);
            let updated = self
                .store
                .update(graph.document_database(), table, &key.to_string(), patch)
                .await
                .map_err(|e| SynthError::nonexistence(&graph.id, "node", e.to_string()))?;
            if updated {
                committed += 1;
            }
        }
        Ok(Response::Json(json!({"committed": committed})))
    }

    async fn op_graph_filter(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let filter_id = envelope
            .params
            .get("filter_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["filter_id"]))?
            .to_string();
        let predicate = parse_predicate(envelope.params.get("filter").unwrap_or(&Value::Null))?;
        let id = subgraph::graph_filter(&self.catalog, self.store.as_ref(), &graph, filter_id, &predicate, &self.udfs)
            .await
            .map_err(downcast_or_internal)?;
        Ok(Response::Json(json!({"id": id})))
    }

    async fn op_walk(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let source_ref = envelope
            .params
            .get("source")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["source"]))?;
        let source: VertexId = self.resolve_node_key(&graph, source_ref).await?.parse().unwrap();

        let spec = parse_walk_spec(&envelope.params)?;
        let topo = graph.topology.read().clone();
        let result = walk::walk(self.store.as_ref(), graph.document_database(), &topo, &self.udfs, source, &spec).await?;
        let discovered: Vec<VertexId> = result.discovered.iter().map(|d| d.node).collect();

        if let Some(topo_name) = &spec.topo {
            if topo_name == "similarity" {
                let direction = spec.tiers.last().map(|t| t.direction).unwrap_or(Direction::Out);
                return Ok(Response::Json(walk::similarity(&topo, source, &discovered, direction)));
            }
            let value = walk::induced_subgraph_analytics(&topo, &discovered, topo_name, &envelope.params, self.algorithms.as_ref())?;
            return Ok(Response::Json(value));
        }

        Ok(Response::Json(json!(discovered
            .into_iter()
            .map(|n| json!({"node": n}))
            .collect::<Vec<_>>())))
    }

    async fn op_fields(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let table_name = envelope.params.get("table").and_then(|v| v.as_str()).unwrap_or("nodes");
        let table = self.table_for(table_name)?;
        let docs = self
            .store
            .get_all(graph.document_database(), table)
            .await
            .map_err(|e| SynthError::nonexistence(&graph.id, table_name, e.to_string()))?;
        let mut fields: Vec<String> = Vec::new();
        for doc in &docs {
            if let Some(obj) = doc.as_object() {
                for key in obj.keys() {
                    if !fields.contains(key) {
                        fields.push(key.clone());
                    }
                }
            }
        }
        Ok(Response::Json(json!(fields)))
    }

    async fn op_create_index(&self, envelope: RequestEnvelope) -> Result<Response, SynthError> {
        let graph = self.graph(&envelope)?;
        let table_name = envelope.params.get("table").and_then(|v| v.as_str()).unwrap_or("nodes");
        let table = self.table_for(table_name)?;
        let field = envelope
            .params
            .get("field")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SynthError::missing_required_params(&["field"]))?;
        self.store
            .create_index(graph.document_database(), table, field)
            .await
            .map_err(downcast_or_internal)?;
        Ok(Response::Json(json!({"created": true})))
    }
}

fn downcast_or_internal(err: anyhow::Error) -> SynthError {
    match err.downcast::<SynthError>() {
        Ok(e) => e,
        Err(e) => SynthError::topology_precondition(e.to_string()),
    }
}

fn nested_patch(path: &str, value: Value) -> Value {
    let mut parts: Vec<&str> = path.split('.').collect();
    let mut acc = value;
    while let Some(last) = parts.pop() {
        acc = json!({ last: acc });
    }
    acc
}

fn parse_conflict(params: &Value) -> ConflictMode {
    match params.get("conflict").and_then(|v| v.as_str()) {
        Some("replace") => ConflictMode::Replace,
        Some("update") => ConflictMode::Update,
        _ => ConflictMode::Error,
    }
}

fn parse_predicate(value: &Value) -> Result<Predicate, SynthError> {
    if value.is_null() {
        return Ok(Predicate::FieldEquals(Default::default()));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| SynthError::wrong_param_type("filter", format!("predicate ({e})")))
}

fn parse_projection(value: Option<&Value>) -> Result<Option<Projection>, SynthError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| SynthError::wrong_param_type("map", format!("projection ({e})"))),
    }
}

fn parse_stream_spec(params: &Value) -> Result<StreamSpec, SynthError> {
    let filter = match params.get("filter") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_predicate(v)?),
    };
    let map = parse_projection(params.get("map"))?;
    let distinct = params.get("distinct").and_then(|v| v.as_bool()).unwrap_or(false);
    let reduce = match params.get("reduce") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let op = v
                .get("op")
                .and_then(|o| o.as_str())
                .ok_or_else(|| SynthError::missing_required_params(&["reduce.op"]))?;
            let field = v.get("field").and_then(|f| f.as_str()).unwrap_or("value").to_string();
            let op = match op {
                "sum" => ReduceOp::Sum,
                "count" => ReduceOp::Count,
                "min" => ReduceOp::Min,
                "max" => ReduceOp::Max,
                other => {
                    return Err(SynthError::PreqlSyntax {
                        message: format!("unknown reduce op '{other}'"),
                        offending_key: Some("reduce.op".to_string()),
                    })
                }
            };
            Some((op, field))
        }
    };
    let sort = match params.get("sort") {
        None | Some(Value::Null) => None,
        Some(v) => Some(SortSpec {
            field: v.get("field").and_then(|f| f.as_str()).unwrap_or("id").to_string(),
            reverse: v.get("reverse").and_then(|r| r.as_bool()).unwrap_or(false),
        }),
    };
    let limit = params.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
    let coerce_to = match params.get("coerce_to").and_then(|v| v.as_str()) {
        Some("count") => Some(CoerceTo::Count),
        Some("property_map") => Some(CoerceTo::PropertyMap),
        Some("array") | None => Some(CoerceTo::Array),
        Some(other) => {
            return Err(SynthError::PreqlSyntax {
                message: format!("unknown coerce_to '{other}'"),
                offending_key: Some("coerce_to".to_string()),
            })
        }
    };
    Ok(StreamSpec { filter, map, distinct, reduce, sort, limit, coerce_to })
}

fn parse_walk_spec(params: &Value) -> Result<WalkSpec, SynthError> {
    let dist = params.get("dist").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;

    let directions: Vec<Direction> = match params.get("direction") {
        Some(Value::String(s)) => (0..dist).map(|_| parse_direction(s)).collect::<Result<_, _>>()?,
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| parse_direction(v.as_str().unwrap_or("out")))
            .collect::<Result<Vec<_>, _>>()?,
        _ => vec![Direction::Out; dist],
    };

    let filters = params.get("filters").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let mut tiers = Vec::with_capacity(dist);
    for i in 0..dist {
        let direction = *directions.get(i).unwrap_or(&Direction::Out);
        let filter_obj = filters.get(i);
        let node_filter = match filter_obj.and_then(|f| f.get("node")) {
            Some(v) if !v.is_null() => Some(parse_predicate(v)?),
            _ => None,
        };
        let link_filter = match filter_obj.and_then(|f| f.get("link")) {
            Some(v) if !v.is_null() => Some(parse_predicate(v)?),
            _ => None,
        };
        tiers.push(Tier { direction, node_filter, link_filter });
    }

    let topo = params.get("topo").and_then(|v| v.as_str()).map(str::to_string);
    Ok(WalkSpec { tiers, topo })
}

fn parse_direction(s: &str) -> Result<Direction, SynthError> {
    match s {
        "out" => Ok(Direction::Out),
        "in" => Ok(Direction::In),
        other => Err(SynthError::wrong_param_type("direction", format!("'out' or 'in', got '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::FileDocumentStore;
    use tempfile::TempDir;

    async fn db() -> (TempDir, SynthDb) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileDocumentStore::open(dir.path()).await.unwrap());
        let db = SynthDb::new(store, false);
        db.bootstrap().await.unwrap();
        (dir, db)
    }

    fn req(q: &str, g: Option<&str>, params: Value, body: Option<Value>) -> RequestEnvelope {
        RequestEnvelope { q: q.to_string(), g: g.map(str::to_string), params, body }
    }

    #[tokio::test]
    async fn ping_returns_literal_text() {
        let (_dir, db) = db().await;
        match db.handle(req("ping", None, Value::Null, None)).await.unwrap() {
            Response::Text(t) => assert_eq!(t, "Hi there!"),
            _ => panic!("expected text response"),
        }
    }

    #[tokio::test]
    async fn full_create_insert_stats_matches_spec_scenario_1() {
        let (_dir, db) = db().await;
        let created = db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        match created {
            Response::Json(v) => assert_eq!(v, json!({"id": "g1"})),
            _ => panic!(),
        }

        let inserted = db
            .handle(req(
                "insert",
                Some("g1"),
                json!({"table": "nodes"}),
                Some(json!([{"type": "A"}, {"type": "B"}])),
            ))
            .await
            .unwrap();
        match inserted {
            Response::Json(v) => assert_eq!(v, json!({"inserted": 2, "errors": 0})),
            _ => panic!(),
        }

        let stats = db.handle(req("graph_stats", Some("g1"), Value::Null, None)).await.unwrap();
        match stats {
            Response::Json(v) => {
                assert_eq!(v["id"], "g1");
                assert_eq!(v["num_nodes"], 2);
                assert_eq!(v["num_links"], 0);
                let mut node_types: Vec<String> =
                    v["node_types"].as_array().unwrap().iter().map(|s| s.as_str().unwrap().to_string()).collect();
                node_types.sort();
                assert_eq!(node_types, vec!["A".to_string(), "B".to_string(), "Node".to_string()]);
            }
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn link_insert_matches_spec_scenario_2() {
        let (_dir, db) = db().await;
        db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}]))))
            .await
            .unwrap();

        for _ in 0..2 {
            db.handle(req(
                "insert",
                Some("g1"),
                json!({"table": "links"}),
                Some(json!({"origin": 0, "terminus": 1})),
            ))
            .await
            .unwrap();
        }

        let stream = db
            .handle(req("stream", Some("g1"), json!({"table": "links"}), None))
            .await
            .unwrap();
        match stream {
            Response::Json(v) => {
                let mut ids: Vec<String> = v.as_array().unwrap().iter().map(|d| d["id"].as_str().unwrap().to_string()).collect();
                ids.sort();
                assert_eq!(ids, vec!["0_0_1".to_string(), "0_1_1".to_string()]);
            }
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn walk_respects_tier_filters_matching_spec_scenario_5() {
        let (_dir, db) = db().await;
        db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}, {"type": "inner"}]))))
            .await
            .unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "links"}), Some(json!({"origin": 0, "terminus": 1}))))
            .await
            .unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "links"}), Some(json!({"origin": 1, "terminus": 2}))))
            .await
            .unwrap();

        let result = db
            .handle(req(
                "walk",
                Some("g1"),
                json!({
                    "source": "0",
                    "dist": 2,
                    "direction": ["out", "out"],
                    "filters": [{}, {"node": {"type": "leaf"}}],
                }),
                None,
            ))
            .await
            .unwrap();
        match result {
            Response::Json(v) => assert_eq!(v, json!([])),
            _ => panic!(),
        }
    }

    #[tokio::test]
    async fn topology_on_out_of_range_node_id_is_nonexistence_not_a_panic() {
        let (_dir, db) = db().await;
        db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}]))))
            .await
            .unwrap();

        let err = db
            .handle(req("topology", Some("g1"), json!({"kind": "node", "id": "999"}), None))
            .await
            .unwrap_err();
        assert_eq!(err.type_name(), "NonexistenceError");
    }

    #[tokio::test]
    async fn walk_from_out_of_range_source_is_nonexistence_not_a_panic() {
        let (_dir, db) = db().await;
        db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}]))))
            .await
            .unwrap();

        let err = db
            .handle(req("walk", Some("g1"), json!({"source": "999", "dist": 1, "direction": "out", "filters": [{}]}), None))
            .await
            .unwrap_err();
        assert_eq!(err.type_name(), "NonexistenceError");
    }

    #[tokio::test]
    async fn closeness_resolves_node_uid_source_and_rejects_out_of_range_numeric_source() {
        let (_dir, db) = db().await;
        let uid = uuid::Uuid::new_v4().to_string();
        db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{"uid": uid}, {}]))))
            .await
            .unwrap();

        let ok = db
            .handle(req(
                "topology",
                Some("g1"),
                json!({"kind": "graph", "algorithm": "closeness", "source": uid}),
                None,
            ))
            .await
            .unwrap();
        assert!(matches!(ok, Response::Json(_)));

        let err = db
            .handle(req(
                "topology",
                Some("g1"),
                json!({"kind": "graph", "algorithm": "closeness", "source": "999"}),
                None,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.type_name(), "NonexistenceError");
    }
}
