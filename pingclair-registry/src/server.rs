//! OCI Distribution v2 wire surface (spec §4.4/§6), served with the same
//! hyper `service_fn` + raw `TcpListener` shape the teacher used for its
//! admin API.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pingclair_core::event_bus::{Event, EventBus};
use tokio::net::TcpListener;

use crate::blob_store::BlobStore;
use crate::manifest_store::ManifestStore;

pub struct Registry {
    blobs: BlobStore,
    manifests: ManifestStore,
    events: EventBus,
}

impl Registry {
    pub fn new(blobs: BlobStore, manifests: ManifestStore, events: EventBus) -> Self {
        Self { blobs, manifests, events }
    }
}

pub async fn run_registry_server(addr: SocketAddr, registry: Arc<Registry>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "registry listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "registry accept error");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle(req, registry.clone())))
                .await
            {
                tracing::debug!(%peer, error = %err, "registry connection closed with error");
            }
        });
    }
}

/// A parsed OCI Distribution v2 path. `name` may itself contain slashes.
enum Route {
    Base,
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    StartUpload { name: String },
    UploadChunk { name: String, id: String },
    TagsList { name: String },
    NotFound,
}

fn parse_route(path: &str) -> Route {
    let Some(rest) = path.strip_prefix("/v2/") else {
        return Route::NotFound;
    };
    if rest.is_empty() {
        return Route::Base;
    }

    if let Some((name, tail)) = rsplit_on(rest, "/manifests/") {
        return Route::Manifest { name, reference: tail };
    }
    if let Some((name, tail)) = rsplit_on(rest, "/blobs/uploads/") {
        if tail.is_empty() {
            return Route::StartUpload { name };
        }
        return Route::UploadChunk { name, id: tail };
    }
    if let Some((name, tail)) = rsplit_on(rest, "/blobs/") {
        return Route::Blob { name, digest: tail };
    }
    if let Some(name) = rest.strip_suffix("/tags/list") {
        return Route::TagsList { name: name.to_string() };
    }

    Route::NotFound
}

fn rsplit_on(rest: &str, marker: &str) -> Option<(String, String)> {
    rest.find(marker).map(|idx| (rest[..idx].to_string(), rest[idx + marker.len()..].to_string()))
}

fn query_param<'a>(uri: &'a hyper::Uri, key: &str) -> Option<&'a str> {
    let query = uri.query()?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

async fn handle(req: Request<Incoming>, registry: Arc<Registry>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = parse_route(&path);

    let result = match (method, route) {
        (Method::GET, Route::Base) => Ok(base_response()),
        (Method::HEAD, Route::Manifest { name, reference }) => get_manifest(&registry, &name, &reference, true).await,
        (Method::GET, Route::Manifest { name, reference }) => get_manifest(&registry, &name, &reference, false).await,
        (Method::PUT, Route::Manifest { name, reference }) => put_manifest(req, &registry, &name, &reference).await,
        (Method::DELETE, Route::Manifest { name, reference }) => delete_manifest(&registry, &name, &reference).await,
        (Method::HEAD, Route::Blob { name, digest }) => get_blob(&registry, &name, &digest, true).await,
        (Method::GET, Route::Blob { name, digest }) => get_blob(&registry, &name, &digest, false).await,
        (Method::POST, Route::StartUpload { name }) => start_upload(&registry, &name).await,
        (Method::PATCH, Route::UploadChunk { name, id }) => patch_upload(req, &registry, &name, &id).await,
        (Method::PUT, Route::UploadChunk { name, id }) => {
            let digest = query_param(req.uri(), "digest").map(str::to_string);
            put_upload(req, &registry, &name, &id, digest).await
        }
        (Method::GET, Route::TagsList { name }) => tags_list(&registry, &name).await,
        _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
    };

    Ok(result.unwrap_or_else(|status_and_msg: (StatusCode, String)| text_response(status_and_msg.0, &status_and_msg.1)))
}

type HandlerResult = Result<Response<Full<Bytes>>, (StatusCode, String)>;

fn base_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Distribution-API-Version", "registry/2.0")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn text_response(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    Response::builder().status(status).body(Full::new(Bytes::from(msg.to_string()))).unwrap()
}

async fn get_manifest(registry: &Registry, name: &str, reference: &str, head_only: bool) -> HandlerResult {
    match registry.manifests.get(name, reference).await {
        Ok(Some(stored)) => {
            let body = if head_only { Bytes::new() } else { Bytes::from(stored.body) };
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", stored.content_type)
                .header("Docker-Content-Digest", stored.digest)
                .body(Full::new(body))
                .unwrap())
        }
        Ok(None) => Err((StatusCode::NOT_FOUND, "manifest not found".to_string())),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

async fn put_manifest(req: Request<Incoming>, registry: &Registry, name: &str, reference: &str) -> HandlerResult {
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing Content-Type header".to_string()))?
        .to_string();

    let body = req
        .collect()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .to_bytes()
        .to_vec();

    let digest = registry
        .manifests
        .put(name, reference, &content_type, body.clone())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let manifest_json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    registry.events.publish(Event::ImagePushed {
        name: name.to_string(),
        reference: reference.to_string(),
        manifest: body,
        annotations: manifest_json
            .get("annotations")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default(),
    });

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("Location", format!("/v2/{name}/manifests/{reference}"))
        .header("Docker-Content-Digest", digest)
        .body(Full::new(Bytes::new()))
        .unwrap())
}

async fn delete_manifest(registry: &Registry, name: &str, reference: &str) -> HandlerResult {
    match registry.manifests.delete(name, reference).await {
        Ok(true) => Ok(Response::builder().status(StatusCode::ACCEPTED).body(Full::new(Bytes::new())).unwrap()),
        Ok(false) => Err((StatusCode::NOT_FOUND, "manifest not found".to_string())),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

async fn get_blob(registry: &Registry, _name: &str, digest: &str, head_only: bool) -> HandlerResult {
    match registry.blobs.read(digest).await {
        Ok(Some(bytes)) => {
            let body = if head_only { Bytes::new() } else { Bytes::from(bytes) };
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Docker-Content-Digest", digest)
                .body(Full::new(body))
                .unwrap())
        }
        Ok(None) => Err((StatusCode::NOT_FOUND, "blob not found".to_string())),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

async fn start_upload(registry: &Registry, name: &str) -> HandlerResult {
    let id = registry
        .blobs
        .start_upload(name)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Location", format!("/v2/{name}/blobs/uploads/{id}"))
        .header("Range", "0-0")
        .body(Full::new(Bytes::new()))
        .unwrap())
}

async fn patch_upload(req: Request<Incoming>, registry: &Registry, name: &str, id: &str) -> HandlerResult {
    let chunk = req
        .collect()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .to_bytes();

    let offset = registry
        .blobs
        .append_chunk(id, &chunk)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Location", format!("/v2/{name}/blobs/uploads/{id}"))
        .header("Range", format!("0-{}", offset.saturating_sub(1)))
        .body(Full::new(Bytes::new()))
        .unwrap())
}

async fn put_upload(
    req: Request<Incoming>,
    registry: &Registry,
    name: &str,
    id: &str,
    digest: Option<String>,
) -> HandlerResult {
    let Some(digest) = digest else {
        return Err((StatusCode::BAD_REQUEST, "missing digest query parameter".to_string()));
    };

    let final_chunk = req
        .collect()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .to_bytes();

    let result = registry.blobs.finalize(id, Some(&final_chunk), &digest).await;

    match result {
        Ok(computed_digest) => Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header("Location", format!("/v2/{name}/blobs/{computed_digest}"))
            .header("Docker-Content-Digest", computed_digest)
            .body(Full::new(Bytes::new()))
            .unwrap()),
        Err(err) => {
            let _ = registry.blobs.cancel(id).await;
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
    }
}

async fn tags_list(registry: &Registry, name: &str) -> HandlerResult {
    let tags = registry.manifests.tags_list(name).await;
    let json = serde_json::json!({ "name": name, "tags": tags });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(json.to_string())))
        .unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_route_with_nested_name() {
        match parse_route("/v2/library/nginx/manifests/latest") {
            Route::Manifest { name, reference } => {
                assert_eq!(name, "library/nginx");
                assert_eq!(reference, "latest");
            }
            _ => panic!("expected Manifest route"),
        }
    }

    #[test]
    fn parses_upload_start_and_chunk_routes() {
        assert!(matches!(parse_route("/v2/app/blobs/uploads/"), Route::StartUpload { .. }));
        match parse_route("/v2/app/blobs/uploads/abc-123") {
            Route::UploadChunk { id, .. } => assert_eq!(id, "abc-123"),
            _ => panic!("expected UploadChunk route"),
        }
    }

    #[test]
    fn parses_tags_list_route() {
        assert!(matches!(parse_route("/v2/app/tags/list"), Route::TagsList { .. }));
    }
}
