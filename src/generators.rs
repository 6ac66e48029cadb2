//! Pure raw-topology generators (§4.H): no document-store interaction,
//! just an in-memory `Topology` handed to `mutation::finalize_graph`.
//!
//! A representative subset of the original system's generator catalog
//! (`random_graph`, `complete_graph`, `circular_graph`) — see the scope
//! note in DESIGN.md for why the rest are not reproduced function-for-
//! function, the same reasoning as the Algorithms Boundary.

use crate::algorithms::{ParamKind, ParamSpec};
use crate::errors::SynthError;
use crate::topology::Topology;
use rand::Rng;
use serde_json::Value;

const RANDOM_GRAPH_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "num_nodes", kind: ParamKind::Int, required: true },
    ParamSpec { name: "probability", kind: ParamKind::Float, required: true },
    ParamSpec { name: "directed", kind: ParamKind::Bool, required: false },
];

const COMPLETE_GRAPH_PARAMS: &[ParamSpec] =
    &[ParamSpec { name: "num_nodes", kind: ParamKind::Int, required: true }];

const CIRCULAR_GRAPH_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "num_nodes", kind: ParamKind::Int, required: true },
    ParamSpec { name: "directed", kind: ParamKind::Bool, required: false },
];

pub fn params(name: &str) -> Option<&'static [ParamSpec]> {
    match name {
        "random_graph" => Some(RANDOM_GRAPH_PARAMS),
        "complete_graph" => Some(COMPLETE_GRAPH_PARAMS),
        "circular_graph" => Some(CIRCULAR_GRAPH_PARAMS),
        _ => None,
    }
}

fn num_nodes(params: &Value) -> Result<u64, SynthError> {
    params
        .get("num_nodes")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SynthError::wrong_param_type("num_nodes", "int"))
}

/// An Erdős–Rényi random graph: every ordered pair gets an edge
/// independently with probability `probability`. `directed=false`
/// mirrors the pair into both directions.
pub fn random_graph(params: &Value) -> Result<Topology, SynthError> {
    let n = num_nodes(params)?;
    let p = params
        .get("probability")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| SynthError::wrong_param_type("probability", "float"))?;
    let directed = params.get("directed").and_then(|v| v.as_bool()).unwrap_or(true);

    let mut topo = Topology::new();
    for _ in 0..n {
        topo.add_vertex();
    }
    let mut rng = rand::thread_rng();
    for o in 0..n {
        for t in 0..n {
            if o == t {
                continue;
            }
            if rng.gen::<f64>() < p {
                topo.add_edge(o, t);
                if !directed {
                    topo.add_edge(t, o);
                }
            }
        }
    }
    Ok(topo)
}

/// Every ordered pair of distinct vertices gets an edge.
pub fn complete_graph(params: &Value) -> Result<Topology, SynthError> {
    let n = num_nodes(params)?;
    let mut topo = Topology::new();
    for _ in 0..n {
        topo.add_vertex();
    }
    for o in 0..n {
        for t in 0..n {
            if o != t {
                topo.add_edge(o, t);
            }
        }
    }
    Ok(topo)
}

/// Each vertex links to its successor mod n; `directed=false` also links
/// the reverse.
pub fn circular_graph(params: &Value) -> Result<Topology, SynthError> {
    let n = num_nodes(params)?;
    let directed = params.get("directed").and_then(|v| v.as_bool()).unwrap_or(true);
    let mut topo = Topology::new();
    for _ in 0..n {
        topo.add_vertex();
    }
    if n >= 2 {
        for v in 0..n {
            let next = (v + 1) % n;
            topo.add_edge(v, next);
            if !directed {
                topo.add_edge(next, v);
            }
        }
    }
    Ok(topo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_graph_has_n_times_n_minus_one_edges() {
        let topo = complete_graph(&json!({"num_nodes": 4})).unwrap();
        assert_eq!(topo.num_vertices(), 4);
        assert_eq!(topo.num_edges(), 12);
    }

    #[test]
    fn circular_graph_directed_has_n_edges() {
        let topo = circular_graph(&json!({"num_nodes": 5})).unwrap();
        assert_eq!(topo.num_edges(), 5);
        assert_eq!(topo.out_degree(4), 1);
        assert_eq!(topo.out_neighbours(4), vec![0]);
    }

    #[test]
    fn circular_graph_undirected_doubles_edges() {
        let topo = circular_graph(&json!({"num_nodes": 3, "directed": false})).unwrap();
        assert_eq!(topo.num_edges(), 6);
    }

    #[test]
    fn random_graph_missing_probability_is_a_syntax_error() {
        let err = random_graph(&json!({"num_nodes": 3})).unwrap_err();
        assert_eq!(err.type_name(), "PreqlSyntaxError");
    }
}
