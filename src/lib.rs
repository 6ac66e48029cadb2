//! SynthDB - a JSON graph database coupling an in-memory topology engine
//! with a persistent document store, queried through a fluent PreQL
//! request envelope.
//!
//! Module map follows the system's own layering: the topology/identifier
//! primitives at the bottom, the document store and mutation protocol
//! built on top of them, the query planner dispatching across both, and
//! the transport/config layers standing in for the out-of-scope
//! production HTTP stack.

pub mod algorithms;
pub mod catalog;
pub mod config;
pub mod document_store;
pub mod errors;
pub mod expr;
pub mod generators;
pub mod identifiers;
pub mod mutation;
pub mod observability;
pub mod planner;
pub mod property_map;
pub mod stream;
pub mod subgraph;
pub mod topology;
pub mod transport;
pub mod walk;

pub use errors::SynthError;
pub use observability::{init_logging, init_logging_with_level};
pub use planner::{RequestEnvelope, Response, SynthDb};
