//! The Stream Executor (§4.G): composes `get_all`/`filter`/`map`/`distinct`/
//! `reduce`/`sort`/`limit` into a lazy item sequence, then frames it for the
//! wire in tab mode or event-stream mode.
//!
//! Exposed as `impl futures::Stream`, the same seam the host crate uses to
//! hand domain iterators to its HTTP layer (`http_server.rs`,
//! `services_http_server.rs`), rather than a bespoke iterator type.

use crate::expr::{Predicate, Projection, UdfRegistry};
use crate::property_map::PropertyMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::cmp::Ordering;

/// A binary reduction applied over a numeric field of every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Count,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub field: String,
    pub reverse: bool,
}

/// What the final stage of a `stream` pipeline collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceTo {
    Array,
    Count,
    PropertyMap,
}

#[derive(Debug, Clone, Default)]
pub struct StreamSpec {
    pub filter: Option<Predicate>,
    pub map: Option<Projection>,
    pub distinct: bool,
    pub reduce: Option<(ReduceOp, String)>,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
    pub coerce_to: Option<CoerceTo>,
}

fn numeric_field(item: &Value, field: &str) -> f64 {
    item.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn apply_reduce(items: &[Value], op: ReduceOp, field: &str) -> Value {
    match op {
        ReduceOp::Count => json!(items.len()),
        ReduceOp::Sum => json!(items.iter().map(|i| numeric_field(i, field)).sum::<f64>()),
        ReduceOp::Min => items
            .iter()
            .map(|i| numeric_field(i, field))
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        ReduceOp::Max => items
            .iter()
            .map(|i| numeric_field(i, field))
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

/// Run a composed stream pipeline over an already-fetched document set
/// (the Document Store Adapter's `get_all` materializes the table; the
/// laziness this module provides is in composing the later stages and in
/// the output framing, not in deferring that initial fetch).
pub fn run_pipeline(items: Vec<Value>, udfs: &UdfRegistry, spec: &StreamSpec) -> Value {
    let mut items = items;
    if let Some(pred) = &spec.filter {
        items.retain(|doc| pred.eval(doc, udfs));
    }
    if let Some(proj) = &spec.map {
        items = items.iter().map(|doc| proj.apply(doc)).collect();
    }
    if spec.distinct {
        let mut seen = std::collections::HashSet::new();
        items.retain(|item| seen.insert(item.to_string()));
    }
    if let Some((op, field)) = &spec.reduce {
        return apply_reduce(&items, *op, field);
    }
    if let Some(sort) = &spec.sort {
        items.sort_by(|a, b| {
            let cmp = numeric_field(a, &sort.field)
                .partial_cmp(&numeric_field(b, &sort.field))
                .unwrap_or(Ordering::Equal);
            if sort.reverse {
                cmp.reverse()
            } else {
                cmp
            }
        });
    }
    if let Some(limit) = spec.limit {
        items.truncate(limit);
    }
    match spec.coerce_to {
        Some(CoerceTo::Count) => json!(items.len()),
        _ => Value::Array(items),
    }
}

/// Sort a property map's keys, intersect with `selection` (already-sorted
/// key indices from a preceding `get_all`/`filter` stage), then apply
/// `limit` — the property-map branch of §4.G's sort-then-intersect rule.
pub fn run_property_map_pipeline(
    map: &PropertyMap,
    selection: Option<&[usize]>,
    reverse: bool,
    limit: Option<usize>,
) -> Result<Vec<usize>, crate::errors::SynthError> {
    let perm = map.sort_permutation(reverse)?;
    let mut keys: Vec<usize> = match selection {
        Some(sel) => {
            let allowed: std::collections::HashSet<usize> = sel.iter().copied().collect();
            perm.into_iter().filter(|k| allowed.contains(k)).collect()
        }
        None => perm,
    };
    if let Some(limit) = limit {
        keys.truncate(limit);
    }
    Ok(keys)
}

/// Frame a stream of items one-per-line with a trailing tab byte.
pub fn tab_framed<'a>(items: BoxStream<'a, Value>) -> BoxStream<'a, Vec<u8>> {
    items
        .map(|item| {
            let mut bytes = serde_json::to_vec(&item).unwrap_or_default();
            bytes.push(b'\t');
            bytes
        })
        .boxed()
}

/// Frame a stream as Server-Sent-Events: `data: <json>\n\n` per item, then
/// a trailing termination event.
pub fn event_stream_framed<'a>(items: BoxStream<'a, Value>) -> BoxStream<'a, Vec<u8>> {
    let framed = items.map(|item| format!("data: {}\n\n", item).into_bytes()).boxed();
    framed.chain(stream::once(async { b"event: done\ndata: \n\n".to_vec() })).boxed()
}
