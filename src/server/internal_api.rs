// src/server/internal_api.rs

//! The internal cluster HTTP API (spec.md §6): every endpoint a peer node
//! calls on another node, mounted under `/api/internal/cluster/*`, plus the
//! unauthenticated `/health` liveness probe and `/metrics` Prometheus
//! endpoint. Mutual TLS (when cluster TLS material is loaded) authenticates
//! the connection; the HMAC middleware in this module authenticates the
//! caller's claimed node identity on top of that, the same two-layer shape
//! the teacher uses for ACL-gated commands issued over an already-TLS'd
//! connection.

use crate::core::aggregator::LocalBucketLister;
use crate::core::deletion_log;
use crate::core::errors::ClusterError;
use crate::core::metrics::gather_metrics;
use crate::core::model::{
    AccessKey, BucketPermission, DeletionEntry, EntityType, GroupMapping, HealthStatus, IdpProvider, Node, Tenant,
    User,
};
use crate::core::orchestrator::{
    ClusterHandle, NodesResponse, RegisterNodeRequest, RegisterNodeResponse, ValidateTokenRequest,
    ValidateTokenResponse,
};
use crate::core::snapshot::build_snapshot;
use crate::core::sync::{receive_push, SyncableEntity};
use crate::core::transport::signing::{
    verify, AUTH_HEADER_NODE_ID, AUTH_HEADER_NONCE, AUTH_HEADER_SIGNATURE, AUTH_HEADER_TIMESTAMP,
};
use axum::body::Body;
use axum::extract::{Json, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Shared application state for the internal API. `lister` is `None` when
/// the embedding process hasn't wired up the bucket-metadata boundary
/// (`LocalBucketLister`, spec.md §1 "out of scope: the bucket-metadata
/// service") — the bucket listing endpoint answers `501` in that case
/// rather than panicking.
#[derive(Clone)]
pub struct ApiState {
    pub handle: ClusterHandle,
    pub lister: Option<Arc<dyn LocalBucketLister>>,
}

/// Wraps a `ClusterError` so it can be returned directly from axum handlers.
struct ApiError(ClusterError);

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::AuthError(_) => StatusCode::UNAUTHORIZED,
            ClusterError::ConflictError(_) | ClusterError::AlreadyInitialized | ClusterError::ClusterDisabled => {
                StatusCode::CONFLICT
            }
            ClusterError::CircuitOpen(_) | ClusterError::NoHealthyNode(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ClusterError::TransportError(_) => StatusCode::BAD_GATEWAY,
            ClusterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

/// Builds the full router: unauthenticated bootstrap/liveness/metrics routes
/// merged with the HMAC-protected cluster routes.
pub fn build_router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/api/internal/cluster/tenant-sync", post(entity_sync::<Tenant>))
        .route("/api/internal/cluster/user-sync", post(entity_sync::<User>))
        .route("/api/internal/cluster/access-key-sync", post(entity_sync::<AccessKey>))
        .route(
            "/api/internal/cluster/bucket-permission-sync",
            post(entity_sync::<BucketPermission>),
        )
        .route("/api/internal/cluster/idp-provider-sync", post(entity_sync::<IdpProvider>))
        .route("/api/internal/cluster/group-mapping-sync", post(entity_sync::<GroupMapping>))
        .route("/api/internal/cluster/tenant-delete-sync", post(tenant_delete_sync))
        .route("/api/internal/cluster/user-delete-sync", post(user_delete_sync))
        .route(
            "/api/internal/cluster/access-key-delete-sync",
            post(access_key_delete_sync),
        )
        .route(
            "/api/internal/cluster/bucket-permission-delete-sync",
            post(bucket_permission_delete_sync),
        )
        .route(
            "/api/internal/cluster/idp-provider-delete-sync",
            post(idp_provider_delete_sync),
        )
        .route(
            "/api/internal/cluster/group-mapping-delete-sync",
            post(group_mapping_delete_sync),
        )
        .route("/api/internal/cluster/deletion-log-sync", post(deletion_log_sync))
        .route("/api/internal/cluster/state-snapshot", get(state_snapshot))
        .route("/api/internal/cluster/jwt-secret", get(jwt_secret))
        .route("/api/internal/cluster/buckets", get(list_local_buckets))
        .route("/api/internal/cluster/migration/{kind}/{bucket}", post(migration_stub))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_signed_request));

    let public = Router::new()
        .route("/api/internal/cluster/validate-token", post(validate_token))
        .route("/api/internal/cluster/register-node", post(register_node))
        .route("/api/internal/cluster/nodes", get(list_nodes))
        .route("/health", get(health))
        .route("/metrics", get(metrics));

    public.merge(protected).with_state(state)
}

/// HMAC authentication middleware (spec.md §6.1): reads the four
/// `X-MaxIOFS-*` headers, resolves the claimed node's token from the
/// registry, and recomputes the signature. Rejects with `401` on any
/// mismatch, missing header, or unknown node.
async fn require_signed_request(State(state): State<ApiState>, request: Request<Body>, next: Next) -> Response {
    let headers = request.headers();
    let Some(node_id) = headers.get(AUTH_HEADER_NODE_ID).and_then(|v| v.to_str().ok()) else {
        return unauthorized("missing node id header");
    };
    let Ok(node_id) = Uuid::parse_str(node_id) else {
        return unauthorized("invalid node id header");
    };
    let Some(timestamp) = headers
        .get(AUTH_HEADER_TIMESTAMP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return unauthorized("missing or invalid timestamp header");
    };
    let Some(nonce) = headers.get(AUTH_HEADER_NONCE).and_then(|v| v.to_str().ok()) else {
        return unauthorized("missing nonce header");
    };
    let Some(signature) = headers.get(AUTH_HEADER_SIGNATURE).and_then(|v| v.to_str().ok()) else {
        return unauthorized("missing signature header");
    };

    let node = match state.handle.store.get_node(node_id).await {
        Ok(Some(n)) => n,
        Ok(None) => return unauthorized("unknown node"),
        Err(e) => {
            warn!(error = %e, "failed to look up node for request signature verification");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
    };

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let now = Utc::now().timestamp();
    if !verify(&node.node_token, &method, &path, timestamp, nonce, signature, now) {
        return unauthorized("signature verification failed");
    }

    next.run(request).await
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": reason}))).into_response()
}

// ---- Bootstrap / membership (unauthenticated, spec.md §4.11) -------------

async fn validate_token(
    State(state): State<ApiState>,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<Json<ValidateTokenResponse>, ApiError> {
    let cfg = state
        .handle
        .store
        .get_cluster_config()
        .await?
        .ok_or(ClusterError::ClusterDisabled)?;
    if cfg.cluster_token != req.cluster_token {
        return Err(ClusterError::AuthError("invalid cluster token".into()).into());
    }
    Ok(Json(ValidateTokenResponse {
        region: cfg.region,
        ca_cert_pem: cfg.ca_cert_pem,
        ca_key_pem: cfg.ca_key_pem,
    }))
}

async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<Json<RegisterNodeResponse>, ApiError> {
    let node = Node {
        id: req.node_id,
        name: req.node_name,
        endpoint: req.endpoint,
        node_token: req.node_token,
        region: req.region,
        priority: 0,
        health_status: HealthStatus::Unknown,
        last_health_check: None,
        last_seen: Some(Utc::now()),
        latency_ms: None,
        capacity_bytes: None,
        used_bytes: None,
        is_stale: false,
        last_local_write_at: None,
        metadata: Default::default(),
    };
    state.handle.store.upsert_node(&node).await?;
    Ok(Json(RegisterNodeResponse { node }))
}

#[derive(Debug, Deserialize)]
struct NodesQuery {
    cluster_token: String,
}

async fn list_nodes(
    State(state): State<ApiState>,
    Query(query): Query<NodesQuery>,
) -> Result<Json<NodesResponse>, ApiError> {
    let cfg = state
        .handle
        .store
        .get_cluster_config()
        .await?
        .ok_or(ClusterError::ClusterDisabled)?;
    if cfg.cluster_token != query.cluster_token {
        return Err(ClusterError::AuthError("invalid cluster token".into()).into());
    }
    let nodes = state.handle.store.list_nodes().await?;
    Ok(Json(NodesResponse { nodes }))
}

// ---- Liveness / metrics ---------------------------------------------------

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], gather_metrics())
}

// ---- Entity sync (spec.md §4.4 "Receive side") ---------------------------

async fn entity_sync<E: SyncableEntity>(
    State(state): State<ApiState>,
    Json(body): Json<E>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let applied = receive_push::<E>(&state.handle.store, body).await?;
    Ok(Json(json!({"applied": applied})))
}

// ---- Tombstone sync (spec.md §4.4, one route per entity type) ------------

async fn delete_sync(state: &ApiState, body: DeletionEntry, entity_type: EntityType) -> Result<Json<serde_json::Value>, ApiError> {
    let applied = deletion_log::apply_incoming_tombstone(
        &state.handle.store,
        entity_type,
        &body.entity_id,
        body.deleted_by_node_id,
        body.deleted_at,
    )
    .await?;
    Ok(Json(json!({"applied": applied})))
}

async fn tenant_delete_sync(
    State(state): State<ApiState>,
    Json(body): Json<DeletionEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_sync(&state, body, EntityType::Tenant).await
}

async fn user_delete_sync(
    State(state): State<ApiState>,
    Json(body): Json<DeletionEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_sync(&state, body, EntityType::User).await
}

async fn access_key_delete_sync(
    State(state): State<ApiState>,
    Json(body): Json<DeletionEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_sync(&state, body, EntityType::AccessKey).await
}

async fn bucket_permission_delete_sync(
    State(state): State<ApiState>,
    Json(body): Json<DeletionEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_sync(&state, body, EntityType::BucketPermission).await
}

async fn idp_provider_delete_sync(
    State(state): State<ApiState>,
    Json(body): Json<DeletionEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_sync(&state, body, EntityType::IdpProvider).await
}

async fn group_mapping_delete_sync(
    State(state): State<ApiState>,
    Json(body): Json<DeletionEntry>,
) -> Result<Json<serde_json::Value>, ApiError> {
    delete_sync(&state, body, EntityType::GroupMapping).await
}

async fn deletion_log_sync(
    State(state): State<ApiState>,
    Json(tombstones): Json<Vec<DeletionEntry>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut applied = 0u32;
    for tombstone in tombstones {
        let Ok(entity_type) = tombstone.entity_type.parse::<EntityType>() else {
            warn!(entity_type = %tombstone.entity_type, "unknown entity type in bulk tombstone push, skipping");
            continue;
        };
        match deletion_log::apply_incoming_tombstone(
            &state.handle.store,
            entity_type,
            &tombstone.entity_id,
            tombstone.deleted_by_node_id,
            tombstone.deleted_at,
        )
        .await
        {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => warn!(entity_id = %tombstone.entity_id, error = %e, "failed to apply tombstone from bulk push"),
        }
    }
    Ok(Json(json!({"applied": applied})))
}

// ---- State snapshot / reconciliation (spec.md §4.6, §4.7) -----------------

async fn state_snapshot(State(state): State<ApiState>) -> Result<Json<crate::core::model::StateSnapshot>, ApiError> {
    let snapshot = build_snapshot(&state.handle.store, state.handle.local_node_id).await?;
    Ok(Json(snapshot))
}

async fn jwt_secret(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let secret = state.handle.store.get_config_value("jwt_secret").await?;
    Ok(Json(json!({"jwt_secret": secret})))
}

// ---- Bucket listing fan-out target (spec.md §4.10) ------------------------

#[derive(Debug, Deserialize)]
struct BucketsQuery {
    tenant: Option<Uuid>,
}

#[derive(Debug, serde::Serialize)]
struct BucketListingEntry {
    bucket: String,
    tenant_id: Option<Uuid>,
}

/// Answers another node's fan-out query for this node's local bucket
/// listing, consumed by `core::aggregator`'s peer query.
async fn list_local_buckets(
    State(state): State<ApiState>,
    Query(query): Query<BucketsQuery>,
) -> Result<Json<Vec<BucketListingEntry>>, ApiError> {
    let Some(lister) = &state.lister else {
        return Err(ClusterError::Internal("bucket listing not configured on this node".into()).into());
    };
    let buckets = lister.list_local_buckets(query.tenant).await?;
    Ok(Json(
        buckets
            .into_iter()
            .map(|bucket| BucketListingEntry {
                bucket,
                tenant_id: query.tenant,
            })
            .collect(),
    ))
}

// ---- External migration path (spec.md §1, §6: out of scope) ---------------

async fn migration_stub(Path((kind, bucket)): Path<(String, String)>) -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": format!("migration kind '{kind}' for bucket '{bucket}' is handled by the external migration tool, not this node"),
        })),
    )
}
