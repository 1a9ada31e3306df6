use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Shared by every handler.
#[derive(Debug)]
pub struct AppState {
    /// Served under `/tenant_images/`.
    pub images_dir: PathBuf,
    /// Callback markers land in `<workdir>/<node>/callback`.
    pub workdir: PathBuf,
    /// Public key handed to the agent through the deploy steps.
    pub ssh_key: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/fake", get(stub_file))
        .route("/tenant_images/{name}", get(tenant_image))
        .route(
            "/v1/nodes/{node}/vendor_passthru/deploy_steps",
            get(deploy_steps).post(deploy_steps_result),
        )
        .route("/v1/nodes/{node}/vendor_passthru", post(callback))
        .with_state(state)
}

fn stub_body() -> Json<Value> {
    Json(json!({}))
}

/// A single path segment that cannot escape its parent directory.
fn is_plain_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains('/') && !s.contains('\\') && s != "." && !s.contains("..")
}

async fn stub_file() -> Json<Value> {
    info!("stub image requested");
    stub_body()
}

async fn tenant_image(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if !is_plain_segment(&name) {
        warn!(name, "rejected image name");
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = state.images_dir.join(&name);
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "tenant image not found");
            return (StatusCode::NOT_FOUND, format!("File not found ({})", path.display())).into_response();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "tenant image unreadable");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    info!(image = %name, "serving tenant image");
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

async fn deploy_steps(State(state): State<Arc<AppState>>, Path(node): Path<String>) -> Response {
    let Some(key) = &state.ssh_key else {
        warn!(node, "deploy steps requested but no key configured");
        return StatusCode::NOT_FOUND.into_response();
    };
    info!(node, "serving deploy steps");
    Json(json!({
        "action": {
            "name": "inject-ssh-keys",
            "payload": {"ssh-keys": {"root": [key]}},
        }
    }))
    .into_response()
}

async fn deploy_steps_result(Path(node): Path<String>) -> (StatusCode, Json<Value>) {
    info!(node, "deploy step result received");
    (StatusCode::ACCEPTED, Json(json!({"url": null})))
}

async fn callback(State(state): State<Arc<AppState>>, Path(node): Path<String>) -> Response {
    if !is_plain_segment(&node) {
        warn!(node, "rejected callback node id");
        return StatusCode::BAD_REQUEST.into_response();
    }
    let dir = state.workdir.join(&node);
    let marker = dir.join("callback");
    let written = match tokio::fs::create_dir_all(&dir).await {
        Ok(()) => tokio::fs::write(&marker, b"").await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        warn!(path = %marker.display(), error = %e, "callback marker not written");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    info!(node, "got callback");
    (StatusCode::ACCEPTED, stub_body()).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        images: PathBuf,
        workdir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&workdir).unwrap();
        Fixture {
            _dir: dir,
            images,
            workdir,
        }
    }

    fn app(fx: &Fixture, ssh_key: Option<&str>) -> Router {
        router(Arc::new(AppState {
            images_dir: fx.images.clone(),
            workdir: fx.workdir.clone(),
            ssh_key: ssh_key.map(str::to_string),
        }))
    }

    async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn fake_returns_stub_body() {
        let fx = fixture();
        let (status, body) = send(app(&fx, None), Method::GET, "/fake").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({}));
    }

    #[tokio::test]
    async fn tenant_image_is_streamed() {
        let fx = fixture();
        std::fs::write(fx.images.join("centos-7.img"), b"disk image bytes").unwrap();

        let (status, body) = send(app(&fx, None), Method::GET, "/tenant_images/centos-7.img").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"disk image bytes");

        let (status, _) = send(app(&fx, None), Method::GET, "/tenant_images/absent.img").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app(&fx, None), Method::GET, "/tenant_images/..%2Fsecret").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deploy_steps_inject_key() {
        let fx = fixture();
        let uri = "/v1/nodes/rft-node-1/vendor_passthru/deploy_steps";

        let (status, body) = send(app(&fx, Some("ssh-rsa AAAA test")), Method::GET, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json_body(&body),
            json!({
                "action": {
                    "name": "inject-ssh-keys",
                    "payload": {"ssh-keys": {"root": ["ssh-rsa AAAA test"]}},
                }
            })
        );

        let (status, _) = send(app(&fx, None), Method::GET, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(app(&fx, None), Method::POST, uri).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json_body(&body), json!({"url": null}));
        assert!(!fx.workdir.join("rft-node-1/callback").exists());
    }

    #[tokio::test]
    async fn callback_creates_marker() {
        let fx = fixture();
        let (status, body) =
            send(app(&fx, None), Method::POST, "/v1/nodes/rft-node-1/vendor_passthru").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json_body(&body), json!({}));
        let marker = fx.workdir.join("rft-node-1/callback");
        assert!(marker.is_file());
        assert_eq!(std::fs::read(&marker).unwrap(), b"");
    }

    #[tokio::test]
    async fn callback_rejects_traversal() {
        let fx = fixture();
        let (status, _) =
            send(app(&fx, None), Method::POST, "/v1/nodes/..%2F..%2Fetc/vendor_passthru").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!fx.workdir.join("callback").exists());
    }

    #[test]
    fn plain_segments() {
        assert!(is_plain_segment("rft-node-1a2b3c4d"));
        assert!(!is_plain_segment(""));
        assert!(!is_plain_segment("."));
        assert!(!is_plain_segment(".."));
        assert!(!is_plain_segment("a/b"));
    }
}
