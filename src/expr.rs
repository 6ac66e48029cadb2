//! Predicate and projection expressions evaluated against JSON documents,
//! plus the named-UDF registry a bare string predicate resolves against
//! (§9's design note: accepted code fragments are opaque identifiers of
//! registered functions, never executed).

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A predicate evaluated against one document.
///
/// Variant order matters: `#[serde(untagged)]` tries each variant in turn
/// and keeps the first that deserializes, and `FieldEquals`'s bare
/// `HashMap<String, Value>` would happily parse *any* JSON object —
/// including one meant for `Compare`/`And`/`Or`/`Not`. Those combinators
/// are therefore given their own single-key wrapper (`{"and": [...]}`,
/// `{"or": [...]}`, `{"not": {...}}`) and are listed ahead of the
/// `FieldEquals` catch-all so they're tried first.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    And {
        and: Vec<Predicate>,
    },
    Or {
        or: Vec<Predicate>,
    },
    Not {
        not: Box<Predicate>,
    },
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// A named predicate registered in a [`UdfRegistry`], looked up rather
    /// than executed.
    Named(String),
    /// `{field: value}` — every key must equal the corresponding document
    /// field (dotted paths descend nested objects).
    FieldEquals(HashMap<String, Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Read a (possibly dotted) field path out of a document.
pub fn field_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        _ => {
            let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) else {
                return false;
            };
            match op {
                CompareOp::Lt => l < r,
                CompareOp::Le => l <= r,
                CompareOp::Gt => l > r,
                CompareOp::Ge => l >= r,
                CompareOp::Eq | CompareOp::Ne => unreachable!(),
            }
        }
    }
}

impl Predicate {
    /// Evaluate against `doc`. A `Named` predicate with no entry in
    /// `udfs` is treated as non-matching rather than an error — callers
    /// that need to surface a missing-UDF error should check
    /// [`UdfRegistry::contains`] up front during parameter coercion.
    pub fn eval(&self, doc: &Value, udfs: &UdfRegistry) -> bool {
        match self {
            Predicate::FieldEquals(fields) => fields
                .iter()
                .all(|(path, expected)| field_path(doc, path) == Some(expected)),
            Predicate::Compare { field, op, value } => {
                field_path(doc, field).is_some_and(|actual| compare(actual, *op, value))
            }
            Predicate::And { and } => and.iter().all(|p| p.eval(doc, udfs)),
            Predicate::Or { or } => or.iter().any(|p| p.eval(doc, udfs)),
            Predicate::Not { not } => !not.eval(doc, udfs),
            Predicate::Named(name) => udfs.call(name, doc).unwrap_or(false),
        }
    }
}

/// A field projection: either pass the document through whole, or pluck
/// one or more dotted field paths into a fresh object keyed by their
/// last path segment.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Projection {
    Identity,
    Fields(Vec<String>),
}

impl Projection {
    pub fn apply(&self, doc: &Value) -> Value {
        match self {
            Projection::Identity => doc.clone(),
            Projection::Fields(paths) => {
                let mut out = serde_json::Map::new();
                for path in paths {
                    let key = path.rsplit('.').next().unwrap_or(path);
                    if let Some(v) = field_path(doc, path) {
                        out.insert(key.to_string(), v.clone());
                    }
                }
                Value::Object(out)
            }
        }
    }
}

/// A named, server-registered predicate function. Stands in for the
/// "opaque code fragment" case of dynamic predicates: callers register a
/// closure ahead of time under a name, and a `Predicate::Named(name)`
/// dispatches to it instead of evaluating a string as code.
#[derive(Clone, Default)]
pub struct UdfRegistry {
    fns: HashMap<String, Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
}

impl fmt::Debug for UdfRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdfRegistry")
            .field("registered", &self.fns.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, f: impl Fn(&Value) -> bool + Send + Sync + 'static) {
        self.fns.insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn call(&self, name: &str, doc: &Value) -> Option<bool> {
        self.fns.get(name).map(|f| f(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_equals_checks_every_key() {
        let pred = Predicate::FieldEquals(HashMap::from([("type".to_string(), json!("leaf"))]));
        let udfs = UdfRegistry::new();
        assert!(pred.eval(&json!({"type": "leaf", "id": 3}), &udfs));
        assert!(!pred.eval(&json!({"type": "branch"}), &udfs));
    }

    #[test]
    fn dotted_path_descends_nested_objects() {
        let doc = json!({"meta": {"weight": 2.5}});
        assert_eq!(field_path(&doc, "meta.weight"), Some(&json!(2.5)));
    }

    #[test]
    fn compare_ops_use_numeric_coercion() {
        let pred = Predicate::Compare { field: "score".to_string(), op: CompareOp::Ge, value: json!(0.5) };
        let udfs = UdfRegistry::new();
        assert!(pred.eval(&json!({"score": 0.9}), &udfs));
        assert!(!pred.eval(&json!({"score": 0.1}), &udfs));
    }

    #[test]
    fn named_predicate_dispatches_to_registered_udf() {
        let mut udfs = UdfRegistry::new();
        udfs.register("is_leaf", |doc| doc.get("type") == Some(&json!("leaf")));
        let pred = Predicate::Named("is_leaf".to_string());
        assert!(pred.eval(&json!({"type": "leaf"}), &udfs));
        assert!(!pred.eval(&json!({"type": "branch"}), &udfs));
    }

    #[test]
    fn unregistered_named_predicate_does_not_match() {
        let pred = Predicate::Named("missing".to_string());
        assert!(!pred.eval(&json!({}), &UdfRegistry::new()));
    }

    #[test]
    fn and_or_not_combinators_evaluate_correctly() {
        let udfs = UdfRegistry::new();
        let leaf = Predicate::FieldEquals(HashMap::from([("type".to_string(), json!("leaf"))]));
        let scored = Predicate::Compare { field: "score".to_string(), op: CompareOp::Ge, value: json!(0.5) };
        let and = Predicate::And { and: vec![leaf.clone(), scored.clone()] };
        assert!(and.eval(&json!({"type": "leaf", "score": 0.9}), &udfs));
        assert!(!and.eval(&json!({"type": "leaf", "score": 0.1}), &udfs));

        let or = Predicate::Or { or: vec![leaf.clone(), scored] };
        assert!(or.eval(&json!({"type": "branch", "score": 0.9}), &udfs));

        let not = Predicate::Not { not: Box::new(leaf) };
        assert!(not.eval(&json!({"type": "branch"}), &udfs));
        assert!(!not.eval(&json!({"type": "leaf"}), &udfs));
    }

    #[test]
    fn wire_json_disambiguates_combinators_from_field_equals() {
        // Compare and the boolean combinators must not be shadowed by the
        // FieldEquals catch-all when parsed from wire JSON (see the
        // variant-order note on `Predicate`).
        let and: Predicate = serde_json::from_value(json!({
            "and": [{"type": "leaf"}, {"field": "score", "op": "ge", "value": 0.5}]
        }))
        .unwrap();
        let udfs = UdfRegistry::new();
        assert!(and.eval(&json!({"type": "leaf", "score": 0.7}), &udfs));
        assert!(!and.eval(&json!({"type": "leaf", "score": 0.1}), &udfs));

        let plain: Predicate = serde_json::from_value(json!({"type": "leaf"})).unwrap();
        assert!(matches!(plain, Predicate::FieldEquals(_)));
    }

    #[test]
    fn projection_plucks_fields_by_last_path_segment() {
        let proj = Projection::Fields(vec!["meta.weight".to_string(), "type".to_string()]);
        let out = proj.apply(&json!({"type": "leaf", "meta": {"weight": 2.5}}));
        assert_eq!(out, json!({"weight": 2.5, "type": "leaf"}));
    }
}
