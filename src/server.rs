//! HTTP surface: resource catalog endpoints plus ranged file serving.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::catalog::{AddResource, Catalog, ResourceId, ResourceInfo};
use crate::{Error, RangeOutcome, Ranged, Result, StreamConfig};

/// Process configuration, usually built from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub download_dir: PathBuf,
    pub stream: StreamConfig,
}

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn Catalog>,
    pub stream: StreamConfig,
    /// Cancelled when the server shuts down; ends every body still streaming.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(catalog: Arc<dyn Catalog>, stream: StreamConfig) -> Self {
        AppState { catalog, stream, shutdown: CancellationToken::new() }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/resources", get(list_resources).post(add_resource))
        .route("/resources/{id}", get(get_resource).delete(remove_resource))
        .route("/resources/{id}/files/{*path}", get(serve_file).head(serve_file))
        .with_state(state)
}

/// Binds `config.bind` and serves until `shutdown` resolves.
pub async fn serve(
    config: &Config,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        download_dir = %config.download_dir.display(),
        "listening"
    );
    serve_on(listener, state, shutdown).await
}

/// Serves on an already bound listener until `shutdown` resolves, then
/// cancels in-flight streams so the graceful shutdown does not wait on
/// sources that never deliver.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let streams = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            streams.cancel();
        })
        .await
}

fn parse_id(id: &str) -> Result<ResourceId> {
    id.parse().map_err(|_| Error::resource_not_found(id))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_resources(State(state): State<AppState>) -> Json<Vec<ResourceInfo>> {
    Json(state.catalog.list().await)
}

async fn add_resource(
    State(state): State<AppState>,
    Json(request): Json<AddResource>,
) -> Result<Json<ResourceInfo>> {
    let info = state.catalog.add(&request.path).await?;
    Ok(Json(info))
}

async fn get_resource(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ResourceInfo>> {
    let id = parse_id(&id)?;
    Ok(Json(state.catalog.get(&id).await?))
}

async fn remove_resource(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let id = parse_id(&id)?;
    state.catalog.remove(&id).await?;
    let body = json!({
        "message": "Resource and data deleted successfully",
        "id": id,
    });
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn serve_file(
    State(state): State<AppState>,
    method: Method,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Ranged> {
    let id = parse_id(&id)?;
    let path = path.trim_start_matches('/');
    let handle = state.catalog.file(&id, path).await?;

    // ignored by the responder for HEAD
    let outcome = RangeOutcome::from_header(headers.get(header::RANGE), handle.length());
    tracing::debug!(%id, path, %method, ?outcome, "file request");

    Ok(Ranged::new(handle, method, outcome)
        .with_config(state.stream.clone())
        .with_cancellation(state.shutdown.child_token()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::LocalCatalog;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        app: Router,
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Movie.2024");
        std::fs::create_dir_all(root.join("subs")).unwrap();
        std::fs::write(root.join("movie.mp4"), data(1000)).unwrap();
        std::fs::write(root.join("subs/en.srt"), b"1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();
        let catalog = Arc::new(LocalCatalog::new(dir.path()));
        let app = router(AppState::new(catalog, StreamConfig::default()));
        Fixture { _dir: dir, root, app }
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn add(fixture: &Fixture) -> String {
        let body = json!({ "path": fixture.root }).to_string();
        let request = Request::post("/resources")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = send(&fixture.app, request).await;
        assert_eq!(StatusCode::OK, response.status());
        let info = json_body(response).await;
        info["id"].as_str().unwrap().to_string()
    }

    fn file_request(method: Method, id: &str, path: &str, range: Option<&str>) -> Request<Body> {
        let mut request = Request::builder().method(method).uri(format!("/resources/{id}/files/{path}"));
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        request.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let fixture = fixture();
        let response = send(&fixture.app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(json!({ "status": "ok" }), json_body(response).await);
    }

    #[tokio::test]
    async fn test_add_get_and_list() {
        let fixture = fixture();
        let id = add(&fixture).await;
        assert_eq!(40, id.len());

        let response = send(&fixture.app, Request::get(format!("/resources/{id}")).body(Body::empty()).unwrap()).await;
        assert_eq!(StatusCode::OK, response.status());
        let info = json_body(response).await;
        assert_eq!("Movie.2024", info["name"]);
        assert_eq!(1000 + 35, info["size"]);
        assert_eq!("movie.mp4", info["files"][0]["path"]);
        assert_eq!("subs/en.srt", info["files"][1]["path"]);

        let response = send(&fixture.app, Request::get("/resources").body(Body::empty()).unwrap()).await;
        let list = json_body(response).await;
        assert_eq!(1, list.as_array().unwrap().len());
        assert_eq!(id, list[0]["id"]);
    }

    #[tokio::test]
    async fn test_add_bad_descriptor() {
        let fixture = fixture();
        let request = Request::post("/resources")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"path":"/definitely/not/here"}"#))
            .unwrap();
        let response = send(&fixture.app, request).await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let fixture = fixture();
        let unknown = "0".repeat(40);
        for uri in [format!("/resources/{unknown}"), "/resources/not-a-hash".to_string()] {
            let response = send(&fixture.app, Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(StatusCode::NOT_FOUND, response.status());
        }
        let response = send(&fixture.app, file_request(Method::GET, &unknown, "movie.mp4", Some("bytes=0-1"))).await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let fixture = fixture();
        let id = add(&fixture).await;
        let response = send(&fixture.app, file_request(Method::GET, &id, "missing.mkv", Some("bytes=0-1"))).await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        assert_eq!("File not found: missing.mkv", json_body(response).await["error"]);
    }

    #[tokio::test]
    async fn test_partial_content() {
        let fixture = fixture();
        let id = add(&fixture).await;

        let response = send(&fixture.app, file_request(Method::GET, &id, "movie.mp4", Some("bytes=0-499"))).await;
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        let head = response.headers();
        assert_eq!("bytes 0-499/1000", head["Content-Range"]);
        assert_eq!("500", head["Content-Length"]);
        assert_eq!("bytes", head["Accept-Ranges"]);
        assert_eq!("video/mp4", head["Content-Type"]);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&data(1000)[..500], &body[..]);
    }

    #[tokio::test]
    async fn test_nested_path() {
        let fixture = fixture();
        let id = add(&fixture).await;
        let response = send(&fixture.app, file_request(Method::GET, &id, "subs/en.srt", Some("bytes=-3"))).await;
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!("bytes 32-34/35", response.headers()["Content-Range"]);
        assert_eq!("application/octet-stream", response.headers()["Content-Type"]);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&b"hi\n"[..], &body[..]);
    }

    #[tokio::test]
    async fn test_not_satisfiable() {
        let fixture = fixture();
        let id = add(&fixture).await;

        for range in [Some("bytes=1000-"), Some("bytes=1000-1005"), Some("bytes=5-1"), Some("items=0-1"), None] {
            let response = send(&fixture.app, file_request(Method::GET, &id, "movie.mp4", range)).await;
            assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status(), "{range:?}");
            assert_eq!("bytes */1000", response.headers()["Content-Range"]);
            assert_eq!("bytes", response.headers()["Accept-Ranges"]);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn test_head() {
        let fixture = fixture();
        let id = add(&fixture).await;

        let response = send(&fixture.app, file_request(Method::HEAD, &id, "movie.mp4", None)).await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("1000", response.headers()["Content-Length"]);
        assert_eq!("video/mp4", response.headers()["Content-Type"]);
        assert_eq!("bytes", response.headers()["Accept-Ranges"]);
        assert!(response.headers().get("Content-Range").is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let fixture = fixture();
        let id = add(&fixture).await;

        let request = Request::delete(format!("/resources/{id}")).body(Body::empty()).unwrap();
        let response = send(&fixture.app, request).await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(id, json_body(response).await["id"]);
        assert!(!fixture.root.exists());

        let request = Request::delete(format!("/resources/{id}")).body(Body::empty()).unwrap();
        let response = send(&fixture.app, request).await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }
}
