//! HTTP API for the Haven node.
//!
//! Serves the vault fetch protocol: ref advertisement and upload-pack.

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use haven_storage::{PackCache, StorageError, Vault, VaultFs};
use haven_sync::{advertise_refs, upload_pack, SyncError, UPLOAD_PACK_SERVICE};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::access::{AccessControl, PeerId};

/// Header a peer uses to present its identity.
pub const PEER_HEADER: &str = "x-haven-peer";

const CACHE_CONTROL: &str = "no-cache, max-age=0, must-revalidate";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Opened vaults.
    pub vaults: Arc<VaultRegistry>,
    /// Per-vault peer authorization.
    pub acl: Arc<dyn AccessControl>,
}

/// Opens vaults beneath a shared filesystem, one subdirectory per vault,
/// all sharing one pack-index cache.
pub struct VaultRegistry {
    fs: Arc<dyn VaultFs>,
    cache: Arc<PackCache>,
    open: RwLock<HashMap<String, Arc<Vault>>>,
}

impl VaultRegistry {
    /// Creates a registry over a filesystem rooted at the data directory.
    pub fn new(fs: Arc<dyn VaultFs>) -> Self {
        Self {
            fs,
            cache: Arc::new(PackCache::new()),
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a vault by name, reusing a previously opened handle.
    pub fn open(&self, name: &str) -> Result<Arc<Vault>, ApiError> {
        if let Some(vault) = self.open.read().get(name) {
            return Ok(vault.clone());
        }
        if !self.fs.exists(Path::new(name)) {
            return Err(ApiError::VaultNotFound(name.to_string()));
        }
        let vault = Arc::new(Vault::open(
            self.fs.clone(),
            name,
            name,
            self.cache.clone(),
        ));
        self.open
            .write()
            .entry(name.to_string())
            .or_insert(vault.clone());
        Ok(vault)
    }

    /// Initializes a new empty vault.
    pub fn create(&self, name: &str) -> Result<Arc<Vault>, ApiError> {
        validate_vault_name(name)?;
        let vault = Arc::new(
            Vault::init(self.fs.clone(), name, name, self.cache.clone())
                .map_err(ApiError::Storage)?,
        );
        self.open.write().insert(name.to_string(), vault.clone());
        Ok(vault)
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("vault not found: {0}")]
    VaultNotFound(String),
    // Reported as not-found so unauthorized peers cannot tell denied
    // vaults from absent ones.
    #[error("vault not found: {0}")]
    PermissionDenied(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::VaultNotFound(_) | ApiError::PermissionDenied(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::Protocol(_)) | ApiError::Sync(SyncError::InvalidPktLine(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Sync(SyncError::Storage(e)) | ApiError::Storage(e) => match e {
                StorageError::ObjectNotFound(_) | StorageError::RefNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Sync(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, [(header::CACHE_CONTROL, CACHE_CONTROL)], body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Rejects vault names that could escape the data directory.
fn validate_vault_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid && !name.contains("..") {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "invalid vault name: {:?}",
            name
        )))
    }
}

fn peer_from(headers: &HeaderMap) -> PeerId {
    headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| PeerId(s.to_string()))
        .unwrap_or_else(PeerId::anonymous)
}

fn authorize(state: &AppState, vault: &str, headers: &HeaderMap) -> Result<Arc<Vault>, ApiError> {
    validate_vault_name(vault)?;
    let peer = peer_from(headers);
    if !state.acl.can_access(vault, &peer) {
        tracing::debug!(vault, peer = %peer.0, "access denied");
        return Err(ApiError::PermissionDenied(vault.to_string()));
    }
    state.vaults.open(vault)
}

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/{vault}/info/refs", get(info_refs))
        .route("/{vault}/git-upload-pack", post(git_upload_pack))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ref advertisement for a fetch.
async fn info_refs(
    State(state): State<AppState>,
    UrlPath(vault): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let service = params.get("service").map(String::as_str).unwrap_or("");
    if service != UPLOAD_PACK_SERVICE {
        return Err(ApiError::BadRequest(format!(
            "unsupported service: {:?}",
            service
        )));
    }
    let vault = authorize(&state, &vault, &headers)?;

    // Ref resolution is synchronous filesystem work.
    let output = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        advertise_refs(&mut out, &vault)?;
        Ok::<_, SyncError>(out)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-advertisement",
        )
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .body(Body::from(output))
        .map_err(|e| ApiError::Internal(e.to_string()))?)
}

/// Upload-pack negotiation and pack streaming.
async fn git_upload_pack(
    State(state): State<AppState>,
    UrlPath(vault): UrlPath<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let vault = authorize(&state, &vault, &headers)?;

    let output = tokio::task::spawn_blocking(move || {
        let mut input = Cursor::new(body);
        let mut out = Vec::new();
        upload_pack(&mut input, &mut out, &vault)?;
        Ok::<_, SyncError>(out)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-git-upload-pack-result")
        .header(header::CACHE_CONTROL, CACHE_CONTROL)
        .body(Body::from(output))
        .map_err(|e| ApiError::Internal(e.to_string()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_name_validation() {
        assert!(validate_vault_name("team-secrets").is_ok());
        assert!(validate_vault_name("vault_2").is_ok());
        assert!(validate_vault_name("a.b").is_ok());

        assert!(validate_vault_name("").is_err());
        assert!(validate_vault_name("..").is_err());
        assert!(validate_vault_name("a..b").is_err());
        assert!(validate_vault_name("../etc").is_err());
        assert!(validate_vault_name("a/b").is_err());
        assert!(validate_vault_name("a\\b").is_err());
        assert!(validate_vault_name(".hidden").is_err());
    }
}
