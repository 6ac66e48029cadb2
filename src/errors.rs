//! Error taxonomy for SynthDB, and the diagnostic formatting that turns one
//! of these into the multi-line, caret-underlined message clients see.

use serde::Serialize;
use serde_json::json;
use std::fmt;

/// The closed set of error kinds a request can fail with.
///
/// Each variant carries exactly the context its formatter needs; callers
/// should prefer the constructor functions (`nonexistence`, `duplicate_id`,
/// etc.) over building variants by hand.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[serde(tag = "type", content = "detail")]
pub enum SynthError {
    #[error("{kind} '{identifier}' does not exist in graph '{graph_id}'")]
    Nonexistence {
        graph_id: String,
        kind: String,
        identifier: String,
    },

    #[error("{message}")]
    PreqlSyntax {
        message: String,
        offending_key: Option<String>,
    },

    #[error("{message}")]
    InvalidOperation { message: String },

    #[error("'{identifier}' is already in use")]
    DuplicateId { identifier: String },

    #[error("{message}")]
    Topology { message: String },

    #[error("{message}")]
    ValueType { message: String },

    #[error("{message}")]
    LimitsExceeded { message: String },
}

impl SynthError {
    pub fn nonexistence(graph_id: impl Into<String>, kind: impl Into<String>, identifier: impl Into<String>) -> Self {
        SynthError::Nonexistence {
            graph_id: graph_id.into(),
            kind: kind.into(),
            identifier: identifier.into(),
        }
    }

    pub fn missing_required_params(names: &[&str]) -> Self {
        SynthError::PreqlSyntax {
            message: format!("missing required parameter(s): {}", names.join(", ")),
            offending_key: names.first().map(|s| s.to_string()),
        }
    }

    pub fn wrong_param_type(key: impl Into<String>, expected: impl fmt::Display) -> Self {
        let key = key.into();
        SynthError::PreqlSyntax {
            message: format!("parameter '{key}' must be of type {expected}"),
            offending_key: Some(key),
        }
    }

    pub fn protected_type(type_id: impl Into<String>) -> Self {
        let type_id = type_id.into();
        SynthError::InvalidOperation {
            message: format!("type '{type_id}' is protected and cannot be deleted"),
        }
    }

    pub fn duplicate_id(identifier: impl Into<String>) -> Self {
        SynthError::DuplicateId {
            identifier: identifier.into(),
        }
    }

    pub fn topology_precondition(message: impl Into<String>) -> Self {
        SynthError::Topology {
            message: message.into(),
        }
    }

    pub fn sort_on_vector_map() -> Self {
        SynthError::ValueType {
            message: "cannot sort a property map holding vector values".to_string(),
        }
    }

    pub fn quota_exceeded(resource: &str, limit: u64) -> Self {
        SynthError::LimitsExceeded {
            message: format!("free-mode quota exceeded: {resource} limit is {limit}"),
        }
    }

    /// The stable `{error:{type, msg}}` identifier used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            SynthError::Nonexistence { .. } => "NonexistenceError",
            SynthError::PreqlSyntax { .. } => "PreqlSyntaxError",
            SynthError::InvalidOperation { .. } => "InvalidOperationError",
            SynthError::DuplicateId { .. } => "DuplicateIDError",
            SynthError::Topology { .. } => "TopologyError",
            SynthError::ValueType { .. } => "ValueTypeError",
            SynthError::LimitsExceeded { .. } => "LimitsExceededError",
        }
    }

    /// Render the multi-line diagnostic: the offending query line (if any),
    /// a caret underline of the offending span, then the explanation.
    ///
    /// `query_line` and `span` are best-effort — most operations have no
    /// natural "query line" (they are structured JSON, not PreQL source
    /// text), in which case only the explanation line is produced.
    pub fn render(&self, query_line: Option<&str>, span: Option<(usize, usize)>) -> String {
        let mut out = String::new();
        if let (Some(line), Some((start, len))) = (query_line, span) {
            out.push_str(line);
            out.push('\n');
            out.push_str(&" ".repeat(start));
            out.push_str(&"^".repeat(len.max(1)));
            out.push('\n');
        }
        out.push_str(&self.to_string());
        out
    }

    /// The `{error:{type, msg}}` envelope this error renders as on the wire.
    pub fn to_envelope(&self, query_line: Option<&str>, span: Option<(usize, usize)>) -> serde_json::Value {
        json!({
            "error": {
                "type": self.type_name(),
                "msg": self.render(query_line, span),
            }
        })
    }
}

impl From<&SynthError> for serde_json::Value {
    fn from(err: &SynthError) -> Self {
        err.to_envelope(None, None)
    }
}
