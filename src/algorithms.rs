//! The Algorithms Boundary (§2.J): a trait seam standing in for the
//! production system's external graph-analytics library, plus a small,
//! real built-in implementation so `topology`/`walk` requests naming an
//! algorithm have something genuine to run.
//!
//! The original system hands this work to `graph_tool`, a `graph_tool`
//! dependency we have no equivalent for; `petgraph` (already part of the
//! host crate's dependency stack, see `graph_storage.rs`) covers the
//! built-ins below without pulling in anything new.

use crate::errors::SynthError;
use crate::property_map::{PropertyMap, ValueType};
use crate::topology::Topology;
use anyhow::Result;
use petgraph::algo::connected_components as petgraph_connected_components;
use petgraph::graph::DiGraph;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// The expected JSON type of one named algorithm parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Bool,
    Int,
    String,
    Array,
    PropertyMapRef,
    NodeRef,
    LinkRef,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

fn check_kind(value: &Value, kind: ParamKind) -> bool {
    match kind {
        ParamKind::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        ParamKind::Bool => value.is_boolean(),
        ParamKind::Int => value.is_i64() || value.is_u64(),
        ParamKind::String | ParamKind::PropertyMapRef | ParamKind::NodeRef | ParamKind::LinkRef => value.is_string(),
        ParamKind::Array => value.is_array(),
    }
}

/// Check `params` against `specs`, per §4.F's parameter coercion rules.
///
/// This only checks JSON shape (a `NodeRef`/`LinkRef` must be a string).
/// Actually resolving a `NodeRef`/`LinkRef` per §4.E — and turning a miss
/// into a `NonexistenceError` — needs document-store access this module
/// doesn't have; that resolution runs in the planner's
/// `resolve_ref_params`, between this call and `GraphAlgorithms::run`.
pub fn coerce_params(specs: &[ParamSpec], params: &Value) -> Result<(), SynthError> {
    let obj = params.as_object().cloned().unwrap_or_default();
    let missing: Vec<&str> = specs
        .iter()
        .filter(|s| s.required && !obj.contains_key(s.name))
        .map(|s| s.name)
        .collect();
    if !missing.is_empty() {
        return Err(SynthError::missing_required_params(&missing));
    }
    for spec in specs {
        if let Some(value) = obj.get(spec.name) {
            if !check_kind(value, spec.kind) {
                return Err(SynthError::wrong_param_type(spec.name, format!("{:?}", spec.kind)));
            }
        }
    }
    Ok(())
}

/// A single named algorithm, its parameter contract, and its entry point.
pub trait GraphAlgorithms: Send + Sync {
    fn params(&self, name: &str) -> Option<&'static [ParamSpec]>;
    fn run(&self, name: &str, topology: &Topology, params: &Value) -> Result<PropertyMap, SynthError>;
}

fn to_petgraph(topology: &Topology) -> DiGraph<(), ()> {
    let mut g = DiGraph::new();
    let nodes: Vec<_> = (0..topology.num_vertices()).map(|_| g.add_node(())).collect();
    for v in 0..topology.num_vertices() {
        for handle in topology.out_edges(v) {
            let (o, t) = topology.endpoints(handle);
            g.add_edge(nodes[o as usize], nodes[t as usize], ());
        }
    }
    g
}

/// Shortest hop-distance from `source` to every reachable vertex, via a
/// plain BFS frontier (mirrors the host crate's iterative, non-recursive
/// `find_paths_iterative` search style rather than petgraph's generic
/// `dijkstra`, since edges here are unweighted).
fn bfs_distance(topology: &Topology, source: u64) -> HashMap<u64, i64> {
    let mut dist = HashMap::new();
    dist.insert(source, 0);
    let mut frontier = VecDeque::from([source]);
    while let Some(v) = frontier.pop_front() {
        let d = dist[&v];
        for handle in topology.out_edges(v) {
            let (_, t) = topology.endpoints(handle);
            if !dist.contains_key(&t) {
                dist.insert(t, d + 1);
                frontier.push_back(t);
            }
        }
    }
    dist
}

/// The small, real subset of algorithms this implementation ships,
/// standing in for the out-of-scope production library (§2.J): degree
/// centrality, BFS-distance closeness, connected components, and a
/// bounded-iteration PageRank.
#[derive(Debug, Default)]
pub struct BuiltinAlgorithms;

const DEGREE_PARAMS: &[ParamSpec] = &[ParamSpec { name: "direction", kind: ParamKind::String, required: false }];
const CLOSENESS_PARAMS: &[ParamSpec] = &[ParamSpec { name: "source", kind: ParamKind::NodeRef, required: true }];
const CONNECTIVITY_PARAMS: &[ParamSpec] = &[];
const PAGERANK_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "damping", kind: ParamKind::Float, required: false },
    ParamSpec { name: "iterations", kind: ParamKind::Int, required: false },
];

impl GraphAlgorithms for BuiltinAlgorithms {
    fn params(&self, name: &str) -> Option<&'static [ParamSpec]> {
        match name {
            "degree" => Some(DEGREE_PARAMS),
            "closeness" => Some(CLOSENESS_PARAMS),
            "connected_components" => Some(CONNECTIVITY_PARAMS),
            "pagerank" => Some(PAGERANK_PARAMS),
            _ => None,
        }
    }

    fn run(&self, name: &str, topology: &Topology, params: &Value) -> Result<PropertyMap, SynthError> {
        let n = topology.num_vertices() as usize;
        match name {
            "degree" => {
                let direction = params.get("direction").and_then(|v| v.as_str()).unwrap_or("out");
                let mut map = PropertyMap::new_scalar(ValueType::Int, n);
                for v in 0..topology.num_vertices() {
                    let degree = match direction {
                        "in" => topology.in_degree(v),
                        "both" => topology.in_degree(v) + topology.out_degree(v),
                        _ => topology.out_degree(v),
                    };
                    map.set_int(v as usize, degree as i64);
                }
                Ok(map)
            }
            "closeness" => {
                // `source` arrives already resolved to a dense vertex id by
                // the planner's `resolve_ref_params` (§4.E), so it is
                // guaranteed to be a valid, in-bounds decimal string here.
                let source = params
                    .get("source")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| SynthError::wrong_param_type("source", "int"))?;
                let dist = bfs_distance(topology, source);
                let mut map = PropertyMap::new_scalar(ValueType::Float, n);
                for v in 0..topology.num_vertices() {
                    let value = dist.get(&v).map(|&d| if d == 0 { 0.0 } else { 1.0 / d as f64 }).unwrap_or(0.0);
                    map.set_float(v as usize, value);
                }
                Ok(map)
            }
            "connected_components" => {
                let g = to_petgraph(topology);
                let components = petgraph_connected_components(&g);
                // petgraph only reports the count; label each vertex via its
                // own reachability set so the map still carries per-vertex
                // component ids rather than just the total.
                let mut labels = vec![-1i64; n];
                let mut next_label = 0i64;
                for v in 0..n as u64 {
                    if labels[v as usize] != -1 {
                        continue;
                    }
                    let mut stack = vec![v];
                    labels[v as usize] = next_label;
                    while let Some(cur) = stack.pop() {
                        for handle in topology.out_edges(cur).into_iter().chain(topology.in_edges(cur)) {
                            let (o, t) = topology.endpoints(handle);
                            let other = if o == cur { t } else { o };
                            if labels[other as usize] == -1 {
                                labels[other as usize] = next_label;
                                stack.push(other);
                            }
                        }
                    }
                    next_label += 1;
                }
                debug_assert_eq!(next_label as usize, components);
                let mut map = PropertyMap::new_scalar(ValueType::Int, n);
                for (v, label) in labels.into_iter().enumerate() {
                    map.set_int(v, label);
                }
                Ok(map)
            }
            "pagerank" => {
                let damping = params.get("damping").and_then(|v| v.as_f64()).unwrap_or(0.85);
                let iterations = params.get("iterations").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
                if n == 0 {
                    return Ok(PropertyMap::new_scalar(ValueType::Float, 0));
                }
                let mut rank = vec![1.0 / n as f64; n];
                for _ in 0..iterations {
                    let mut next = vec![(1.0 - damping) / n as f64; n];
                    for v in 0..n as u64 {
                        let out_degree = topology.out_degree(v).max(1) as f64;
                        let share = damping * rank[v as usize] / out_degree;
                        for handle in topology.out_edges(v) {
                            let (_, t) = topology.endpoints(handle);
                            next[t as usize] += share;
                        }
                    }
                    rank = next;
                }
                let mut map = PropertyMap::new_scalar(ValueType::Float, n);
                for (v, r) in rank.into_iter().enumerate() {
                    map.set_float(v, r);
                }
                Ok(map)
            }
            other => Err(SynthError::topology_precondition(format!("unknown algorithm '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path_graph(n: u64) -> Topology {
        let mut t = Topology::new();
        for _ in 0..n {
            t.add_vertex();
        }
        for v in 0..n.saturating_sub(1) {
            t.add_edge(v, v + 1);
        }
        t
    }

    #[test]
    fn degree_counts_out_edges_by_default() {
        let t = path_graph(3);
        let algos = BuiltinAlgorithms;
        let map = algos.run("degree", &t, &json!({})).unwrap();
        assert_eq!(map.get_json(0), Value::from(1));
        assert_eq!(map.get_json(2), Value::from(0));
    }

    #[test]
    fn connected_components_labels_disjoint_chains() {
        let mut t = Topology::new();
        for _ in 0..4 {
            t.add_vertex();
        }
        t.add_edge(0, 1);
        t.add_edge(2, 3);
        let algos = BuiltinAlgorithms;
        let map = algos.run("connected_components", &t, &json!({})).unwrap();
        assert_eq!(map.get_json(0), map.get_json(1));
        assert_eq!(map.get_json(2), map.get_json(3));
        assert_ne!(map.get_json(0), map.get_json(2));
    }

    #[test]
    fn pagerank_sums_close_to_one() {
        let t = path_graph(4);
        let algos = BuiltinAlgorithms;
        let map = algos.run("pagerank", &t, &json!({"iterations": 30})).unwrap();
        let sum: f64 = (0..4).map(|i| map.get_json(i).as_f64().unwrap()).sum();
        assert!((sum - 1.0).abs() < 0.05, "sum was {sum}");
    }

    #[test]
    fn missing_required_param_is_a_syntax_error() {
        let specs = CLOSENESS_PARAMS;
        let err = coerce_params(specs, &json!({})).unwrap_err();
        assert_eq!(err.type_name(), "PreqlSyntaxError");
    }
}
