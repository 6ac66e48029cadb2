//! Per-graph property maps: ephemeral, typed arrays keyed by vertex id or
//! edge handle, as produced by algorithms or by a `map` projection (§4.C).
//!
//! Maps live only in process memory; `commit` (mutation.rs) is the only way
//! to make one durable, and it goes through the same Inf/NaN/int32-max
//! sentinel substitution the walk engine uses for induced-subgraph results.

use crate::errors::SynthError;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// The element type a property map is declared over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
}

#[derive(Debug, Clone)]
enum Column {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    String(Vec<String>),
}

/// A single named property map: either a scalar column (one value per key)
/// or a vector column (one `Vec<T>` per key).
#[derive(Debug, Clone)]
pub struct PropertyMap {
    value_type: ValueType,
    is_vector: bool,
    scalar: Option<Column>,
    vector: Option<Vec<Vec<Value>>>,
}

impl PropertyMap {
    pub fn new_scalar(value_type: ValueType, len: usize) -> Self {
        let scalar = Some(match value_type {
            ValueType::Bool => Column::Bool(vec![false; len]),
            ValueType::Int => Column::Int(vec![0; len]),
            ValueType::Float => Column::Float(vec![0.0; len]),
            ValueType::String => Column::String(vec![String::new(); len]),
        });
        Self {
            value_type,
            is_vector: false,
            scalar,
            vector: None,
        }
    }

    pub fn new_vector(value_type: ValueType, len: usize) -> Self {
        Self {
            value_type,
            is_vector: true,
            scalar: None,
            vector: Some(vec![Vec::new(); len]),
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_vector(&self) -> bool {
        self.is_vector
    }

    pub fn len(&self) -> usize {
        match (&self.scalar, &self.vector) {
            (Some(Column::Bool(v)), _) => v.len(),
            (Some(Column::Int(v)), _) => v.len(),
            (Some(Column::Float(v)), _) => v.len(),
            (Some(Column::String(v)), _) => v.len(),
            (_, Some(v)) => v.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_float(&mut self, key: usize, value: f64) {
        if let Some(Column::Float(v)) = &mut self.scalar {
            v[key] = value;
        }
    }

    pub fn set_int(&mut self, key: usize, value: i64) {
        if let Some(Column::Int(v)) = &mut self.scalar {
            v[key] = value;
        }
    }

    pub fn get_json(&self, key: usize) -> Value {
        match &self.scalar {
            Some(Column::Bool(v)) => Value::Bool(v[key]),
            Some(Column::Int(v)) => Value::from(v[key]),
            Some(Column::Float(v)) => sanitize_for_json(v[key]),
            Some(Column::String(v)) => Value::String(v[key].clone()),
            None => Value::Array(self.vector.as_ref().unwrap()[key].clone()),
        }
    }

    /// Index permutation that would sort this map's keys by value. Rejects
    /// vector-valued maps with a `ValueTypeError`, per §4.C.
    pub fn sort_permutation(&self, reverse: bool) -> Result<Vec<usize>, SynthError> {
        if self.is_vector {
            return Err(SynthError::sort_on_vector_map());
        }
        let n = self.len();
        let mut perm: Vec<usize> = (0..n).collect();
        let cmp = |a: usize, b: usize| -> Ordering {
            match &self.scalar {
                Some(Column::Bool(v)) => v[a].cmp(&v[b]),
                Some(Column::Int(v)) => v[a].cmp(&v[b]),
                Some(Column::Float(v)) => v[a].partial_cmp(&v[b]).unwrap_or(Ordering::Equal),
                Some(Column::String(v)) => v[a].cmp(&v[b]),
                None => Ordering::Equal,
            }
        };
        perm.sort_by(|&a, &b| if reverse { cmp(b, a) } else { cmp(a, b) });
        Ok(perm)
    }
}

/// Replace `Inf`/`-Inf`/`NaN`, and the signed-int32 sentinel some algorithm
/// libraries use for "infinite", with the string sentinels clients expect
/// when a float crosses the JSON boundary (§9).
pub fn sanitize_for_json(f: f64) -> Value {
    const INT32_MAX: f64 = i32::MAX as f64;
    if f.is_nan() {
        Value::String("NaN".to_string())
    } else if f.is_infinite() || f >= INT32_MAX {
        Value::String("Inf".to_string())
    } else if f <= -INT32_MAX {
        Value::String("-Inf".to_string())
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String("NaN".to_string()))
    }
}

/// Per-graph registry of named property maps.
#[derive(Debug, Clone, Default)]
pub struct PropertyMapRegistry {
    maps: HashMap<String, PropertyMap>,
}

impl PropertyMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new map under `name`, or an auto-generated UUID name when
    /// `name` is `None`. Returns the name actually used.
    pub fn insert(&mut self, name: Option<String>, map: PropertyMap) -> String {
        let name = name.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.maps.insert(name.clone(), map);
        name
    }

    pub fn get(&self, name: &str) -> Option<&PropertyMap> {
        self.maps.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PropertyMap> {
        self.maps.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyMap> {
        self.maps.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.maps.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sort_returns_permutation() {
        // matches the spec's scenario 6: values [0.1,0.5,0.3,0.9,0.2]
        let mut map = PropertyMap::new_scalar(ValueType::Float, 5);
        for (i, v) in [0.1, 0.5, 0.3, 0.9, 0.2].into_iter().enumerate() {
            map.set_float(i, v);
        }
        let perm = map.sort_permutation(true).unwrap();
        assert_eq!(&perm[..2], &[3usize, 1usize]);
    }

    #[test]
    fn vector_map_sort_is_rejected() {
        let map = PropertyMap::new_vector(ValueType::Float, 3);
        let err = map.sort_permutation(false).unwrap_err();
        assert_eq!(err.type_name(), "ValueTypeError");
    }

    #[test]
    fn sanitize_replaces_non_finite_values() {
        assert_eq!(sanitize_for_json(f64::NAN), Value::String("NaN".to_string()));
        assert_eq!(sanitize_for_json(f64::INFINITY), Value::String("Inf".to_string()));
        assert_eq!(sanitize_for_json(i32::MAX as f64), Value::String("Inf".to_string()));
        assert_eq!(sanitize_for_json(1.5), Value::from(1.5));
    }

    #[test]
    fn registry_auto_names_unnamed_maps() {
        let mut reg = PropertyMapRegistry::new();
        let name = reg.insert(None, PropertyMap::new_scalar(ValueType::Int, 1));
        assert!(Uuid::parse_str(&name).is_ok());
        assert!(reg.get(&name).is_some());
    }
}
