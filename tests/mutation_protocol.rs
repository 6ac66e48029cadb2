//! Cross-module integration tests for the mutation protocol and the
//! round-trip/idempotence properties of §8, exercised through
//! `synthdb::planner::SynthDb` the way a real client would drive the
//! system, rather than through the lower-level module APIs directly.

mod support;

use serde_json::{json, Value};
use std::sync::Arc;
use support::assert_graph_invariants;
use synthdb::document_store::FileDocumentStore;
use synthdb::{RequestEnvelope, Response, SynthDb};
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

fn json_of(response: Response) -> Value {
    match response {
        Response::Json(v) => v,
        Response::Text(t) => json!(t),
    }
}

#[tokio::test]
async fn node_delete_swap_matches_spec_scenario_3() {
    let (_dir, db) = db().await;
    db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
    db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}, {}]))))
        .await
        .unwrap();
    db.handle(req("insert", Some("g1"), json!({"table": "links"}), Some(json!({"origin": 0, "terminus": 2}))))
        .await
        .unwrap();

    let manifest = json_of(db.handle(req("delete", Some("g1"), json!({"kind": "node", "id": "1"}), None)).await.unwrap());

    let stats = json_of(db.handle(req("graph_stats", Some("g1"), Value::Null, None)).await.unwrap());
    assert_eq!(stats["num_nodes"], 2);

    let node_update = manifest["nodes_updated"].as_object().unwrap().values().next().unwrap();
    assert_eq!(node_update["old_id"], json!(2));
    assert_eq!(node_update["new_id"], json!(1));
    let link_update = manifest["links_updated"].as_object().unwrap().values().next().unwrap();
    assert_eq!(link_update["old_id"], json!("0_0_2"));
    assert_eq!(link_update["new_id"], json!("0_0_1"));

    let graph = db.catalog.get("g1").unwrap();
    assert_graph_invariants(&graph, db.store.as_ref()).await.unwrap();
}

#[tokio::test]
async fn link_delete_compaction_matches_spec_scenario_4() {
    let (_dir, db) = db().await;
    db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
    db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}]))))
        .await
        .unwrap();
    for _ in 0..3 {
        db.handle(req("insert", Some("g1"), json!({"table": "links"}), Some(json!({"origin": 0, "terminus": 1}))))
            .await
            .unwrap();
    }

    db.handle(req("delete", Some("g1"), json!({"kind": "link", "id": "0_1_1"}), None))
        .await
        .unwrap();

    let remaining = json_of(db.handle(req("stream", Some("g1"), json!({"table": "links"}), None)).await.unwrap());
    let mut ids: Vec<String> = remaining.as_array().unwrap().iter().map(|d| d["id"].as_str().unwrap().to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["0_0_1".to_string(), "0_1_1".to_string()]);

    let graph = db.catalog.get("g1").unwrap();
    assert_graph_invariants(&graph, db.store.as_ref()).await.unwrap();
}

#[tokio::test]
async fn property_map_sort_and_limit_matches_spec_scenario_6() {
    let (_dir, db) = db().await;
    db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
    let values = [0.1, 0.5, 0.3, 0.9, 0.2];
    let docs: Vec<Value> = values.iter().map(|v| json!({"score": v})).collect();
    db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(Value::Array(docs))))
        .await
        .unwrap();

    let sorted = json_of(
        db.handle(req(
            "stream",
            Some("g1"),
            json!({"table": "nodes", "sort": {"field": "score", "reverse": true}, "limit": 2}),
            None,
        ))
        .await
        .unwrap(),
    );
    let scores: Vec<f64> = sorted.as_array().unwrap().iter().map(|d| d["score"].as_f64().unwrap()).collect();
    assert_eq!(scores, vec![0.9, 0.5]);
}

#[tokio::test]
async fn create_graph_is_idempotent_refusal_on_second_call() {
    let (_dir, db) = db().await;
    db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
    let err = db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap_err();
    assert_eq!(err.type_name(), "DuplicateIDError");
}

#[tokio::test]
async fn deleting_the_same_node_twice_fails_the_second_time() {
    let (_dir, db) = db().await;
    db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
    db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}]))))
        .await
        .unwrap();
    db.handle(req("delete", Some("g1"), json!({"kind": "node", "id": "0"}), None)).await.unwrap();
    let err = db
        .handle(req("delete", Some("g1"), json!({"kind": "node", "id": "0"}), None))
        .await
        .unwrap_err();
    assert_eq!(err.type_name(), "NonexistenceError");
}

#[tokio::test]
async fn reopening_the_store_rebuilds_an_identical_topology() {
    let dir = TempDir::new().unwrap();
    let links_before: Vec<String>;
    {
        let store = Arc::new(FileDocumentStore::open(dir.path()).await.unwrap());
        let db = SynthDb::new(store, false);
        db.bootstrap().await.unwrap();
        db.handle(req("create_graph", None, json!({"name": "g1"}), None)).await.unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "nodes"}), Some(json!([{}, {}, {}]))))
            .await
            .unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "links"}), Some(json!({"origin": 0, "terminus": 1}))))
            .await
            .unwrap();
        db.handle(req("insert", Some("g1"), json!({"table": "links"}), Some(json!({"origin": 1, "terminus": 2}))))
            .await
            .unwrap();

        let stream = json_of(db.handle(req("stream", Some("g1"), json!({"table": "links"}), None)).await.unwrap());
        links_before = stream.as_array().unwrap().iter().map(|d| d["id"].as_str().unwrap().to_string()).collect();
    }

    let store = Arc::new(FileDocumentStore::open(dir.path()).await.unwrap());
    let db = SynthDb::new(store, false);
    db.bootstrap().await.unwrap();

    let stats = json_of(db.handle(req("graph_stats", Some("g1"), Value::Null, None)).await.unwrap());
    assert_eq!(stats["num_nodes"], 3);
    assert_eq!(stats["num_links"], 2);

    let stream = json_of(db.handle(req("stream", Some("g1"), json!({"table": "links"}), None)).await.unwrap());
    let mut links_after: Vec<String> = stream.as_array().unwrap().iter().map(|d| d["id"].as_str().unwrap().to_string()).collect();
    let mut links_before_sorted = links_before;
    links_after.sort();
    links_before_sorted.sort();
    assert_eq!(links_after, links_before_sorted);

    let graph = db.catalog.get("g1").unwrap();
    assert_graph_invariants(&graph, db.store.as_ref()).await.unwrap();
}
