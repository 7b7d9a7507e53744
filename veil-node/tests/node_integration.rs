//! Node integration tests: lifecycle across restarts, the routed JSON
//! surface, admission control, and one real HTTP round trip.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use veil_fhe::CircuitSource;
use veil_node::config::NodeConfig;
use veil_node::http::{handle, HttpServer, Route};
use veil_node::node::SearchNode;
use veil_search::QueryInput;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const RAW_DIM: usize = 32;

fn small_config(dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::with_data_dir(dir);
    config.input_dim = RAW_DIM;
    config.reduced_dim = 8;
    config.default_top_k = 2;
    config.max_concurrent_queries = 2;
    config.scoring_threads = 2;
    config
}

fn embedding(rng: &mut StdRng) -> Vec<f32> {
    (0..RAW_DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn body(v: Value) -> Vec<u8> {
    serde_json::to_vec(&v).unwrap()
}

async fn call(node: &SearchNode, route: Route, req: Value) -> (u16, Value) {
    let reply = handle(node, route, body(req)).await;
    (reply.status, serde_json::from_slice(&reply.body).unwrap())
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn restart_reuses_keys_and_cached_circuit() {
    let dir = tempfile::tempdir().unwrap();

    let first = SearchNode::open(small_config(dir.path())).unwrap();
    assert!(first.startup().keys_created);
    assert_eq!(first.startup().circuit_source, CircuitSource::Compiled);
    let key_id = first.startup().key_id.clone();
    let first_summary = first.startup().to_string();
    first.shutdown().await.unwrap();
    drop(first);

    let second = SearchNode::start(small_config(dir.path())).await.unwrap();
    assert!(!second.startup().keys_created);
    assert_eq!(second.startup().key_id, key_id);
    assert_eq!(second.startup().circuit_source, CircuitSource::DiskCache);
    assert!(second.health().can_decrypt);

    let summary = second.startup().to_string();
    assert!(summary.contains("circuit from DiskCache"), "{}", summary);
    assert!(!summary.contains("(new)"), "{}", summary);
    assert!(first_summary.contains("circuit from Compiled"), "{}", first_summary);
    assert!(first_summary.contains("(new)"), "{}", first_summary);
}

#[tokio::test]
async fn stored_chunks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let v = embedding(&mut rng);

    let node = SearchNode::open(small_config(dir.path())).unwrap();
    let (status, _) = call(&node, Route::IngestChunk(3), json!({"chunk_id": 1, "embedding": v})).await;
    assert_eq!(status, 200);
    node.shutdown().await.unwrap();
    drop(node);

    let node = SearchNode::open(small_config(dir.path())).unwrap();
    let out = node
        .search(3, QueryInput::Embedding(v), None)
        .await
        .into_data()
        .unwrap();
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].chunk_id, 1);
    assert!(out.results[0].score > 0);
}

// ===========================================================================
// Routed surface
// ===========================================================================

#[tokio::test]
async fn ingest_search_report_delete() {
    let dir = tempfile::tempdir().unwrap();
    let node = SearchNode::open(small_config(dir.path())).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let v = embedding(&mut rng);
    let neg: Vec<f32> = v.iter().map(|x| -x).collect();

    for (chunk_id, e) in [(10, &v), (20, &neg)] {
        let (status, reply) =
            call(&node, Route::IngestChunk(1), json!({"chunk_id": chunk_id, "embedding": e})).await;
        assert_eq!(status, 200, "{}", reply);
        assert_eq!(reply["status"], "ok");
    }

    let (status, reply) = call(&node, Route::Search(1), json!({"query": {"embedding": v}})).await;
    assert_eq!(status, 200);
    let results = reply["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["chunk_id"], 10);
    assert!(reply["data"].get("text").is_none());

    let (_, eval) = call(&node, Route::EvalStats(1), Value::Null).await;
    assert_eq!(eval["data"]["count"], 1);
    assert_eq!(eval["data"]["mean_overlap"], 1.0);

    let (_, audit) = call(&node, Route::AuditReport(1), Value::Null).await;
    assert_eq!(audit["data"]["zero_plaintext_docs_exposed"], true);
    assert_eq!(audit["data"]["decryption_scope"], json!(["similarity_scores"]));

    let (status, deleted) = call(&node, Route::DeleteDocument(1), Value::Null).await;
    assert_eq!(status, 200);
    assert_eq!(deleted["data"]["chunks_removed"], 2);

    let (_, reply) = call(&node, Route::Search(1), json!({"query": {"embedding": v}})).await;
    assert_eq!(reply["data"]["results"], json!([]));
}

#[tokio::test]
async fn encrypted_query_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let node = SearchNode::open(small_config(dir.path())).unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    let v = embedding(&mut rng);
    call(&node, Route::IngestChunk(2), json!({"chunk_id": 5, "embedding": v})).await;

    let (status, enc) = call(&node, Route::Encrypt, json!({"embedding": v})).await;
    assert_eq!(status, 200);
    let ciphertext = enc["data"]["ciphertext"].as_str().unwrap().to_string();

    let (status, reply) =
        call(&node, Route::Search(2), json!({"query": {"ciphertext": ciphertext}, "k": 1})).await;
    assert_eq!(status, 200);
    assert_eq!(reply["data"]["results"][0]["chunk_id"], 5);

    let (status, reply) =
        call(&node, Route::Search(2), json!({"query": {"ciphertext": "zz"}})).await;
    assert_eq!(status, 422);
    assert_eq!(reply["kind"], "EvaluationError");
}

#[tokio::test]
async fn caller_errors_are_400() {
    let dir = tempfile::tempdir().unwrap();
    let node = SearchNode::open(small_config(dir.path())).unwrap();

    let (status, reply) =
        call(&node, Route::IngestChunk(1), json!({"chunk_id": 1, "embedding": [0.5, 0.5]})).await;
    assert_eq!(status, 400);
    assert_eq!(reply["kind"], "DimensionMismatch");

    let reply = handle(&node, Route::Search(1), b"not json".to_vec()).await;
    assert_eq!(reply.status, 400);

    let (status, reply) =
        call(&node, Route::UploadKey, json!({"server_keys": hex::encode([0u8; 64])})).await;
    assert_eq!(status, 400);
    assert_eq!(reply["kind"], "ConfigMismatch");
    let message = reply["message"].as_str().unwrap();
    assert!(message.contains("invalid key material"), "{}", message);
    assert!(!message.contains("generate_keys"), "{}", message);
    assert!(node.health().can_decrypt);
}

#[tokio::test]
async fn generate_keys_is_idempotent_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let node = SearchNode::open(small_config(dir.path())).unwrap();
    let original = node.startup().key_id.clone();

    let reply = handle(&node, Route::GenerateKeys, Vec::new()).await;
    let kept: Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(kept["data"]["created"], false);
    assert_eq!(kept["data"]["key_id"], original.as_str());

    let (_, forced) = call(&node, Route::GenerateKeys, json!({"force": true})).await;
    assert_eq!(forced["data"]["created"], true);
    assert_ne!(forced["data"]["key_id"], original.as_str());
}

// ===========================================================================
// Admission and transport
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn searches_beyond_admission_limit_all_complete() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(SearchNode::open(small_config(dir.path())).unwrap());
    let mut rng = StdRng::seed_from_u64(9);
    for chunk in 0..3 {
        let e = embedding(&mut rng);
        call(&node, Route::IngestChunk(4), json!({"chunk_id": chunk, "embedding": e})).await;
    }

    let q = embedding(&mut rng);
    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let (node, q) = (node.clone(), q.clone());
            tokio::spawn(async move { node.search(4, QueryInput::Embedding(q), Some(3)).await })
        })
        .collect();

    // Watch the node while the searches drain.
    let sampler = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut most_held = 0;
            while node.health().queries.completed < 6 {
                let health = node.health();
                assert!(health.queries.running <= 2, "{:?}", health.queries);
                assert!(health.available_query_slots <= 2);
                most_held = most_held.max(2 - health.available_query_slots);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            most_held
        })
    };

    let mut rankings = Vec::new();
    for t in tasks {
        rankings.push(t.await.unwrap().into_data().unwrap().results);
    }
    assert!(sampler.await.unwrap() <= 2);
    assert!(rankings.windows(2).all(|w| w[0] == w[1]));

    let health = node.health();
    assert_eq!(health.available_query_slots, 2);
    assert_eq!(health.queries.running, 0);
    assert_eq!(health.queries.completed, 6);
    assert!((1..=2).contains(&health.queries.peak), "{:?}", health.queries);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_search_finishes_and_frees_its_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.max_concurrent_queries = 1;
    let node = SearchNode::open(config).unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    for chunk in 0..3 {
        let e = embedding(&mut rng);
        call(&node, Route::IngestChunk(5), json!({"chunk_id": chunk, "embedding": e})).await;
    }
    let q = embedding(&mut rng);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(1),
        node.search(5, QueryInput::Embedding(q.clone()), Some(2)),
    )
    .await;
    assert!(abandoned.is_err());

    let deadline = Instant::now() + Duration::from_secs(60);
    while node.health().queries.completed < 1 {
        assert!(Instant::now() < deadline, "abandoned search never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let health = node.health();
    assert_eq!(health.available_query_slots, 1);
    assert_eq!(health.queries.running, 0);

    // The dropped caller did not cancel the work: it was scored and audited.
    let (_, report) = call(&node, Route::AuditReport(5), json!({})).await;
    assert_eq!(report["data"]["total_queries"], 1);

    let later = node
        .search(5, QueryInput::Embedding(q), Some(2))
        .await
        .into_data()
        .unwrap();
    assert_eq!(later.results.len(), 2);
    assert_eq!(node.health().queries.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(SearchNode::open(small_config(dir.path())).unwrap());
    let server = Arc::new(HttpServer::bind("127.0.0.1:0").unwrap());
    let addr = server.addr().unwrap();

    let accept = {
        let (server, node) = (server.clone(), node.clone());
        let runtime = tokio::runtime::Handle::current();
        std::thread::spawn(move || server.serve(node, runtime))
    };

    let response = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    })
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"shape\":\"d8b4\""));

    server.unblock();
    accept.join().unwrap();
}
