//! HTTP JSON surface.
//!
//! Wraps `tiny_http`. The accept loop is synchronous and hands every
//! request to the tokio runtime, where the node applies admission control
//! and runs the work on the blocking pool. Routing is a pure function of
//! method and path.

use std::io::{Cursor, Read};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tokio::runtime::Handle;
use veil_search::store::{ChunkId, DocumentId};
use veil_search::{ApiResult, ErrorKind, QueryInput};

use crate::node::SearchNode;

/// Largest accepted request body (an encrypted query is about 1 MiB as hex ×2).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Health,
    GenerateKeys,
    UploadKey,
    Encrypt,
    IngestChunk(DocumentId),
    Search(DocumentId),
    DeleteDocument(DocumentId),
    EvalStats(DocumentId),
    AuditReport(DocumentId),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    MethodNotAllowed,
}

/// Map a method and URL (query string ignored) to a route.
pub fn route(method: &Method, url: &str) -> Result<Route, RouteError> {
    let path = url.split('?').next().unwrap_or("");
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let (route, allowed) = match segments.as_slice() {
        ["health"] => (Route::Health, Method::Get),
        ["keys", "generate"] => (Route::GenerateKeys, Method::Post),
        ["keys", "upload"] => (Route::UploadKey, Method::Post),
        ["encrypt"] => (Route::Encrypt, Method::Post),
        ["documents", id] => (Route::DeleteDocument(parse_id(id)?), Method::Delete),
        ["documents", id, "chunks"] => (Route::IngestChunk(parse_id(id)?), Method::Post),
        ["documents", id, "search"] => (Route::Search(parse_id(id)?), Method::Post),
        ["documents", id, "eval"] => (Route::EvalStats(parse_id(id)?), Method::Get),
        ["documents", id, "audit"] => (Route::AuditReport(parse_id(id)?), Method::Get),
        _ => return Err(RouteError::NotFound),
    };
    if *method != allowed {
        return Err(RouteError::MethodNotAllowed);
    }
    Ok(route)
}

fn parse_id(s: &str) -> Result<DocumentId, RouteError> {
    s.parse().map_err(|_| RouteError::NotFound)
}

/// HTTP status for a failed operation.
pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::DimensionMismatch | ErrorKind::ConfigMismatch => 400,
        ErrorKind::EvaluationError | ErrorKind::DecryptionError => 422,
        ErrorKind::KeyMissingError | ErrorKind::CompilationError => 503,
        ErrorKind::StorageError | ErrorKind::InternalError => 500,
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct GenerateKeysBody {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct UploadKeyBody {
    /// Hex of the bincode server key bundle.
    server_keys: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingBody {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    chunk_id: ChunkId,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: QueryInput,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct PlainError<'a> {
    status: &'static str,
    kind: &'static str,
    message: &'a str,
}

/// A status code and a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Reply {
    fn of<T: Serialize>(result: ApiResult<T>) -> Self {
        let status = result.error_kind().map(status_for).unwrap_or(200);
        match serde_json::to_vec(&result) {
            Ok(body) => Reply { status, body },
            Err(e) => Self::plain(500, "InternalError", &format!("encoding reply: {}", e)),
        }
    }

    fn plain(status: u16, kind: &'static str, message: &str) -> Self {
        let body = serde_json::to_vec(&PlainError {
            status: "err",
            kind,
            message,
        })
        .unwrap_or_default();
        Reply { status, body }
    }

    fn bad_request(message: String) -> Self {
        Self::plain(400, "InvalidRequest", &message)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, Reply> {
    serde_json::from_slice(body).map_err(|e| Reply::bad_request(format!("invalid JSON: {}", e)))
}

/// Execute one routed request against the node.
pub async fn handle(node: &SearchNode, route: Route, body: Vec<u8>) -> Reply {
    match dispatch(node, route, body).await {
        Ok(reply) | Err(reply) => reply,
    }
}

async fn dispatch(node: &SearchNode, route: Route, body: Vec<u8>) -> Result<Reply, Reply> {
    let reply = match route {
        Route::Health => Reply::of(ApiResult::Ok {
            data: node.health(),
        }),
        Route::GenerateKeys => {
            let req: GenerateKeysBody = if body.is_empty() {
                GenerateKeysBody::default()
            } else {
                parse(&body)?
            };
            Reply::of(node.call(move |s| s.generate_keys(req.force)).await)
        }
        Route::UploadKey => {
            let req: UploadKeyBody = parse(&body)?;
            let bundle = hex::decode(req.server_keys)
                .map_err(|e| Reply::bad_request(format!("server_keys is not hex: {}", e)))?;
            Reply::of(node.call(move |s| s.upload_key(&bundle)).await)
        }
        Route::Encrypt => {
            let req: EmbeddingBody = parse(&body)?;
            Reply::of(node.call(move |s| s.encrypt_vector(&req.embedding)).await)
        }
        Route::IngestChunk(doc) => {
            let req: ChunkBody = parse(&body)?;
            Reply::of(
                node.call(move |s| s.ingest_chunk(doc, req.chunk_id, &req.embedding))
                    .await,
            )
        }
        Route::Search(doc) => {
            let req: SearchBody = parse(&body)?;
            Reply::of(node.search(doc, req.query, req.k).await)
        }
        Route::DeleteDocument(doc) => Reply::of(node.call(move |s| s.delete_document(doc)).await),
        Route::EvalStats(doc) => Reply::of(node.call(move |s| s.get_eval_stats(doc)).await),
        Route::AuditReport(doc) => Reply::of(node.call(move |s| s.get_audit_report(doc)).await),
    };
    Ok(reply)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct HttpServer {
    server: Server,
}

impl HttpServer {
    /// Bind to `addr` ("127.0.0.1:0" picks a free port).
    pub fn bind(addr: &str) -> Result<Self> {
        let server =
            Server::http(addr).map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;
        Ok(Self { server })
    }

    pub fn addr(&self) -> Option<std::net::SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Make a blocked `serve` return.
    pub fn unblock(&self) {
        self.server.unblock();
    }

    /// Accept requests until unblocked, handling each on `runtime`.
    pub fn serve(&self, node: Arc<SearchNode>, runtime: Handle) {
        for mut request in self.server.incoming_requests() {
            let routed = route(request.method(), request.url());
            let mut body = Vec::new();
            let read = request
                .as_reader()
                .take(MAX_BODY_BYTES as u64 + 1)
                .read_to_end(&mut body);
            debug!("{} {}", request.method(), request.url());

            let node = node.clone();
            runtime.spawn(async move {
                let reply = match (routed, read) {
                    (Err(RouteError::NotFound), _) => Reply::plain(404, "NotFound", "not found"),
                    (Err(RouteError::MethodNotAllowed), _) => {
                        Reply::plain(405, "MethodNotAllowed", "method not allowed")
                    }
                    (_, Err(e)) => Reply::bad_request(format!("read error: {}", e)),
                    (Ok(_), Ok(_)) if body.len() > MAX_BODY_BYTES => {
                        Reply::plain(413, "PayloadTooLarge", "request body too large")
                    }
                    (Ok(route), Ok(_)) => handle(&node, route, body).await,
                };
                if let Err(e) = request.respond(respond_json(reply)) {
                    warn!("failed to send response: {}", e);
                }
            });
        }
    }
}

fn respond_json(reply: Reply) -> Response<Cursor<Vec<u8>>> {
    let headers = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .map(|h| vec![h])
        .unwrap_or_default();
    let len = reply.body.len();
    Response::new(
        StatusCode(reply.status),
        headers,
        Cursor::new(reply.body),
        Some(len),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_method_and_path() {
        assert_eq!(route(&Method::Get, "/health"), Ok(Route::Health));
        assert_eq!(route(&Method::Post, "/keys/generate"), Ok(Route::GenerateKeys));
        assert_eq!(route(&Method::Post, "/documents/7/search?x=1"), Ok(Route::Search(7)));
        assert_eq!(route(&Method::Delete, "/documents/7"), Ok(Route::DeleteDocument(7)));
        assert_eq!(route(&Method::Get, "/documents/7/audit"), Ok(Route::AuditReport(7)));
    }

    #[test]
    fn rejects_unknown_paths_and_methods() {
        assert_eq!(route(&Method::Get, "/nope"), Err(RouteError::NotFound));
        assert_eq!(route(&Method::Get, "/documents/abc/eval"), Err(RouteError::NotFound));
        assert_eq!(
            route(&Method::Get, "/documents/7/search"),
            Err(RouteError::MethodNotAllowed)
        );
    }

    #[test]
    fn error_kinds_map_to_status_classes() {
        assert_eq!(status_for(ErrorKind::DimensionMismatch), 400);
        assert_eq!(status_for(ErrorKind::ConfigMismatch), 400);
        assert_eq!(status_for(ErrorKind::KeyMissingError), 503);
        assert_eq!(status_for(ErrorKind::CompilationError), 503);
        assert_eq!(status_for(ErrorKind::StorageError), 500);
    }

    #[test]
    fn invalid_json_is_a_bad_request() {
        let err = parse::<ChunkBody>(b"{\"chunk_id\":").unwrap_err();
        assert_eq!(err.status, 400);
        let json: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(json["status"], "err");
        assert_eq!(json["kind"], "InvalidRequest");
    }
}
