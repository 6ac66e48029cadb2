//! Validated identifier types and the primary-id classification rule that
//! maps an external reference onto an internal handle.
//!
//! # Invariants
//! - A [`VertexId`] is always within the live vertex domain of the graph it
//!   was resolved against; callers construct them only via [`Topology`]
//!   (see `topology.rs`), never directly from user input.
//! - The primary-id regex matches a decimal integer, or three
//!   underscore-separated decimal integers, and nothing else — it never
//!   matches a string beginning with a letter.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

/// A dense, graph-local vertex identifier in `[0, N)`.
pub type VertexId = u64;

/// Position of a parallel edge within `all_edges(origin, terminus)`.
pub type LocalIdx = u16;

/// The primary-id pattern: either a bare decimal integer, or three
/// underscore-separated decimal integers (an edge's composite id). Anchored
/// on both ends so a leading letter (e.g. a UUID) never matches.
static PRIMARY_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[0-9]+|[0-9]+_[0-9]+_[0-9]+)$").unwrap());

/// What an external reference resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    VertexId(VertexId),
    Uid(Uuid),
    EdgeTriple(VertexId, LocalIdx, VertexId),
    TypeId(String),
}

/// The kind of document a reference is being resolved against; determines
/// which classification rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Node,
    Link,
    Type,
}

/// True iff `s` is exactly a decimal integer or three underscore-separated
/// decimal integers — §4.E's primary-id rule.
pub fn is_primary_id(s: &str) -> bool {
    PRIMARY_ID.is_match(s)
}

/// Split a composite edge id `"{origin}_{local_idx}_{terminus}"` into its
/// parts. Returns `None` if `s` isn't of that exact triple shape.
pub fn split_edge_id(s: &str) -> Option<(VertexId, LocalIdx, VertexId)> {
    let mut parts = s.split('_');
    let o = parts.next()?.parse().ok()?;
    let idx = parts.next()?.parse().ok()?;
    let t = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((o, idx, t))
}

/// Classify an external reference string against a document kind. Returns
/// `None` only when `kind == Type`'s "numeric-only" shortcut does not apply
/// — type ids are always classified successfully as `TypeId`.
pub fn classify(reference: &str, kind: RefKind) -> Option<Identifier> {
    match kind {
        RefKind::Node => {
            if is_primary_id(reference) && !reference.contains('_') {
                reference.parse::<VertexId>().ok().map(Identifier::VertexId)
            } else {
                Uuid::parse_str(reference).ok().map(Identifier::Uid)
            }
        }
        RefKind::Link => {
            if let Some((o, idx, t)) = split_edge_id(reference) {
                Some(Identifier::EdgeTriple(o, idx, t))
            } else {
                Uuid::parse_str(reference).ok().map(Identifier::Uid)
            }
        }
        RefKind::Type => Some(Identifier::TypeId(reference.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_id_accepts_bare_integer_and_triple() {
        assert!(is_primary_id("42"));
        assert!(is_primary_id("0_0_1"));
    }

    #[test]
    fn primary_id_rejects_leading_letter_and_garbage() {
        assert!(!is_primary_id("a42"));
        assert!(!is_primary_id("42a"));
        assert!(!is_primary_id(""));
        assert!(!is_primary_id("0_0_1_2"));
        assert!(!is_primary_id("-1"));
    }

    #[test]
    fn split_edge_id_parses_triple() {
        assert_eq!(split_edge_id("0_3_7"), Some((0, 3, 7)));
        assert_eq!(split_edge_id("0_3"), None);
        assert_eq!(split_edge_id("x_3_7"), None);
    }

    #[test]
    fn classify_node_numeric_vs_uid() {
        assert_eq!(classify("12", RefKind::Node), Some(Identifier::VertexId(12)));
        let uid = Uuid::new_v4();
        assert_eq!(
            classify(&uid.to_string(), RefKind::Node),
            Some(Identifier::Uid(uid))
        );
    }

    #[test]
    fn classify_link_composite_vs_uid() {
        assert_eq!(
            classify("0_0_1", RefKind::Link),
            Some(Identifier::EdgeTriple(0, 0, 1))
        );
        assert_eq!(classify("not-a-uid-or-triple", RefKind::Link), None);
    }

    #[test]
    fn classify_type_is_always_the_literal_string() {
        assert_eq!(
            classify("Node", RefKind::Type),
            Some(Identifier::TypeId("Node".to_string()))
        );
    }
}
