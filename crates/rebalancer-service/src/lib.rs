#![deny(unsafe_code)]

pub mod snapshot;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rebalancer_core::{
    Asset, BridgeLeg, ChainId, DelegationGrant, DelegationPolicy, DelegationSession, DriftReport,
    Ed25519KeyRing, EngineConfig, ErrorKind, Identity, LedgerEntry, PolicyBounds, Portfolio,
    RebalanceAction, RebalanceEngine, RebalancerError, SessionStatus, SignedOperation, SwapLeg,
    TokenId,
};
use serde::{Deserialize, Serialize};
use snapshot::{SnapshotError, SnapshotStore};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Service configuration, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// REST socket address to bind
    pub listen: SocketAddr,

    /// File holding the persisted engine snapshot
    pub snapshot_path: PathBuf,

    /// Engine roles and defaults
    pub engine: EngineConfig,

    /// Owner identity to hex-encoded ed25519 public key
    pub signer_keys: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8092)),
            snapshot_path: PathBuf::from("data/rebalancer-snapshot.json"),
            engine: EngineConfig::default(),
            signer_keys: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("{}: {e}", path.display())))?;
        let config: ServiceConfig =
            toml::from_str(&contents).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<RebalanceEngine>,
    pub snapshots: Arc<Mutex<SnapshotStore>>,
}

impl ServiceState {
    /// Build the engine, register signer keys and restore the last snapshot.
    pub fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            snapshot_path,
            engine: engine_config,
            signer_keys,
            ..
        } = config;

        let keys = Ed25519KeyRing::new();
        for (owner, key_hex) in &signer_keys {
            keys.register_hex_key(Identity::new(owner.as_str()), key_hex)?;
        }
        let engine = RebalanceEngine::with_system_clock(engine_config, Arc::new(keys))?;

        let store = SnapshotStore::new(snapshot_path);
        if let Some(snapshot) = store.read()? {
            engine.restore(snapshot)?;
            info!(path = %store.path().display(), "Restored engine snapshot");
        }

        Ok(Self {
            engine: Arc::new(engine),
            snapshots: Arc::new(Mutex::new(store)),
        })
    }

    /// Persist the current engine state.
    ///
    /// The store lock is taken before the snapshot so a slower writer can
    /// never overwrite a newer image.
    pub async fn persist(&self) -> Result<(), ApiError> {
        let store = self.snapshots.lock().await;
        let snapshot = self.engine.snapshot()?;
        store.write(&snapshot).inspect_err(|e| {
            warn!(path = %store.path().display(), error = %e, "Snapshot write failed");
        })?;
        Ok(())
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/portfolios", post(create_portfolio))
        .route("/v1/portfolios/:owner", get(get_portfolio).put(update_portfolio))
        .route("/v1/portfolios/:owner/assets", post(add_asset))
        .route("/v1/portfolios/:owner/assets/remove", post(remove_asset))
        .route("/v1/portfolios/:owner/deactivate", post(deactivate_portfolio))
        .route("/v1/portfolios/:owner/needs-rebalancing", post(needs_rebalancing))
        .route("/v1/portfolios/:owner/drift", post(calculate_drift))
        .route("/v1/portfolios/:owner/balances", post(update_balance))
        .route("/v1/portfolios/:owner/rebalanced", post(execute_rebalance))
        .route("/v1/delegations", post(enable_delegation))
        .route("/v1/delegations/:owner", get(get_delegation))
        .route("/v1/delegations/:owner/disable", post(disable_delegation))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/revoke", post(revoke_session))
        .route("/v1/sessions/:id/verify", post(verify_operation))
        .route("/v1/sessions/:id/execute", post(execute_operation))
        .route("/v1/sessions/:id/batch", post(batch_execute))
        .route("/v1/rebalances", post(trigger_rebalance))
        .route("/v1/rebalances/:id", get(get_rebalance))
        .route("/v1/rebalances/:id/swap-legs/:index", post(execute_swap_leg))
        .route("/v1/rebalances/:id/bridge-legs/:index", post(execute_bridge_leg))
        .route("/v1/rebalances/:id/complete", post(complete_action))
        .route("/v1/rebalances/:id/pause", post(pause_action))
        .route("/v1/prices", post(set_price))
        .route("/v1/prices/:chain_id/:token", get(get_price))
        .route("/v1/audit/entries", get(list_audit_entries))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(String),
    #[error("core engine error: {0}")]
    Core(#[from] RebalancerError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] RebalancerError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

/// HTTP status for each error class.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::State | ErrorKind::Replay => StatusCode::CONFLICT,
        ErrorKind::Economic => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let kind = err.kind();
                (
                    status_for(kind),
                    Json(serde_json::json!({ "error": err.to_string(), "kind": kind.name() })),
                )
                    .into_response()
            }
            ApiError::Snapshot(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string(), "kind": "internal" })),
            )
                .into_response(),
        }
    }
}

// --- Health ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    audit_entries: usize,
    audit_chain_intact: bool,
}

async fn health(State(state): State<ServiceState>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "ok",
        service: "rebalancer-service",
        audit_entries: state.engine.audit_entries(None)?.len(),
        audit_chain_intact: state.engine.verify_audit_chain(),
    }))
}

// --- Portfolios ----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct AssetRequest {
    token_id: String,
    chain_id: ChainId,
    target_bps: u32,
}

impl From<AssetRequest> for Asset {
    fn from(request: AssetRequest) -> Self {
        Asset::new(request.token_id, request.chain_id, request.target_bps)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CreatePortfolioRequest {
    owner: String,
    assets: Vec<AssetRequest>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdatePortfolioRequest {
    assets: Vec<AssetRequest>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoveAssetRequest {
    token_id: String,
    chain_id: ChainId,
}

async fn create_portfolio(
    State(state): State<ServiceState>,
    Json(request): Json<CreatePortfolioRequest>,
) -> Result<(StatusCode, Json<Portfolio>), ApiError> {
    let assets = request.assets.into_iter().map(Asset::from).collect();
    let portfolio = state
        .engine
        .create_portfolio(&Identity::new(request.owner), assets)?;
    state.persist().await?;
    Ok((StatusCode::CREATED, Json(portfolio)))
}

async fn update_portfolio(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<UpdatePortfolioRequest>,
) -> Result<Json<Portfolio>, ApiError> {
    let assets = request.assets.into_iter().map(Asset::from).collect();
    let portfolio = state
        .engine
        .update_portfolio(&Identity::new(owner), assets)?;
    state.persist().await?;
    Ok(Json(portfolio))
}

async fn get_portfolio(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Portfolio>, ApiError> {
    state
        .engine
        .get_portfolio(&Identity::new(owner.as_str()))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("portfolio '{}' not found", owner)))
}

async fn add_asset(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<AssetRequest>,
) -> Result<Json<Portfolio>, ApiError> {
    let portfolio = state
        .engine
        .add_asset(&Identity::new(owner), request.into())?;
    state.persist().await?;
    Ok(Json(portfolio))
}

async fn remove_asset(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<RemoveAssetRequest>,
) -> Result<Json<Portfolio>, ApiError> {
    let portfolio = state.engine.remove_asset(
        &Identity::new(owner),
        &TokenId::new(request.token_id),
        request.chain_id,
    )?;
    state.persist().await?;
    Ok(Json(portfolio))
}

#[derive(Debug, Clone, Serialize)]
struct Ack {
    status: &'static str,
}

async fn deactivate_portfolio(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Ack>, ApiError> {
    state.engine.deactivate_portfolio(&Identity::new(owner))?;
    state.persist().await?;
    Ok(Json(Ack {
        status: "deactivated",
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct NeedsRebalancingRequest {
    current_bps: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct NeedsRebalancingResponse {
    owner: String,
    needs_rebalancing: bool,
}

async fn needs_rebalancing(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<NeedsRebalancingRequest>,
) -> Result<Json<NeedsRebalancingResponse>, ApiError> {
    let needed = state
        .engine
        .needs_rebalancing(&Identity::new(owner.as_str()), &request.current_bps)?;
    Ok(Json(NeedsRebalancingResponse {
        owner,
        needs_rebalancing: needed,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct DriftRequest {
    tokens: Vec<String>,
    balances: Vec<u128>,
}

async fn calculate_drift(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<DriftRequest>,
) -> Result<Json<DriftReport>, ApiError> {
    let tokens: Vec<TokenId> = request.tokens.into_iter().map(TokenId::new).collect();
    Ok(Json(state.engine.calculate_drift(
        &Identity::new(owner),
        &tokens,
        &request.balances,
    )?))
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateBalanceRequest {
    caller: String,
    token: String,
    balance: u128,
}

async fn update_balance(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<UpdateBalanceRequest>,
) -> Result<Json<Ack>, ApiError> {
    state.engine.update_balance(
        &Identity::new(request.caller),
        &Identity::new(owner),
        &TokenId::new(request.token),
        request.balance,
    )?;
    state.persist().await?;
    Ok(Json(Ack { status: "updated" }))
}

#[derive(Debug, Clone, Deserialize)]
struct ExecuteRebalanceRequest {
    caller: String,
    total_value_usd: u128,
}

async fn execute_rebalance(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ExecuteRebalanceRequest>,
) -> Result<Json<Portfolio>, ApiError> {
    let portfolio = state.engine.execute_rebalance(
        &Identity::new(request.caller),
        &Identity::new(owner),
        request.total_value_usd,
    )?;
    state.persist().await?;
    Ok(Json(portfolio))
}

// --- Delegations -------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct EnableDelegationRequest {
    owner: String,
    delegate: String,
    max_slippage_bps: u32,
    max_rebalance_usd: u128,
    threshold_bps: u32,
    cooldown_secs: u64,
    ttl_secs: Option<u64>,
    max_ops: Option<u32>,
}

async fn enable_delegation(
    State(state): State<ServiceState>,
    Json(request): Json<EnableDelegationRequest>,
) -> Result<(StatusCode, Json<DelegationGrant>), ApiError> {
    let bounds = PolicyBounds {
        max_slippage_bps: request.max_slippage_bps,
        max_rebalance_usd: request.max_rebalance_usd,
        threshold_bps: request.threshold_bps,
        cooldown_secs: request.cooldown_secs,
    };
    let grant = state.engine.enable_delegation(
        &Identity::new(request.owner),
        &Identity::new(request.delegate),
        bounds,
        request.ttl_secs,
        request.max_ops,
    )?;
    state.persist().await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

async fn get_delegation(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<DelegationPolicy>, ApiError> {
    state
        .engine
        .get_delegation_policy(&Identity::new(owner.as_str()))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("delegation policy for '{}' not found", owner)))
}

#[derive(Debug, Clone, Serialize)]
struct DisableDelegationResponse {
    owner: String,
    revoked_sessions: usize,
}

async fn disable_delegation(
    Path(owner): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<DisableDelegationResponse>, ApiError> {
    let revoked = state
        .engine
        .disable_delegation(&Identity::new(owner.as_str()))?;
    state.persist().await?;
    Ok(Json(DisableDelegationResponse {
        owner,
        revoked_sessions: revoked,
    }))
}

// --- Sessions ------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct SessionResponse {
    status: SessionStatus,
    session: DelegationSession,
}

async fn get_session(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .engine
        .get_session(&id)?
        .ok_or_else(|| ApiError::not_found(format!("session '{}' not found", id)))?;
    Ok(Json(SessionResponse {
        status: session.status_at(state.engine.now()),
        session,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CallerRequest {
    caller: String,
}

async fn revoke_session(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<Ack>, ApiError> {
    state
        .engine
        .revoke_session(&Identity::new(request.caller), &id)?;
    state.persist().await?;
    Ok(Json(Ack { status: "revoked" }))
}

#[derive(Debug, Clone, Deserialize)]
struct VerifyRequest {
    op: SignedOperation,
}

#[derive(Debug, Clone, Serialize)]
struct VerifyResponse {
    session_id: String,
    digest: String,
}

async fn verify_operation(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let digest = state.engine.verify_operation(&id, &request.op)?;
    state.persist().await?;
    Ok(Json(VerifyResponse {
        session_id: id,
        digest: digest.to_hex(),
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ExecuteRequest {
    caller: String,
    op: SignedOperation,
    #[serde(default)]
    reference: String,
}

async fn execute_operation(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<DelegationSession>, ApiError> {
    let session = state.engine.execute_operation(
        &Identity::new(request.caller),
        &id,
        &request.op,
        &request.reference,
    )?;
    state.persist().await?;
    Ok(Json(session))
}

#[derive(Debug, Clone, Deserialize)]
struct BatchRequest {
    caller: String,
    ops: Vec<SignedOperation>,
    references: Vec<String>,
}

async fn batch_execute(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<DelegationSession>, ApiError> {
    let session = state.engine.batch_execute_operations(
        &Identity::new(request.caller),
        &id,
        &request.ops,
        &request.references,
    )?;
    state.persist().await?;
    Ok(Json(session))
}

// --- Rebalances ------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct TriggerRebalanceRequest {
    caller: String,
    session_id: String,
    op: SignedOperation,
    #[serde(default)]
    swap_legs: Vec<SwapLeg>,
    #[serde(default)]
    bridge_legs: Vec<BridgeLeg>,
    total_value_usd: u128,
}

async fn trigger_rebalance(
    State(state): State<ServiceState>,
    Json(request): Json<TriggerRebalanceRequest>,
) -> Result<(StatusCode, Json<RebalanceAction>), ApiError> {
    let action = state.engine.trigger_rebalance(
        &Identity::new(request.caller),
        &request.session_id,
        &request.op,
        request.swap_legs,
        request.bridge_legs,
        request.total_value_usd,
    )?;
    state.persist().await?;
    Ok((StatusCode::CREATED, Json(action)))
}

async fn get_rebalance(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RebalanceAction>, ApiError> {
    state
        .engine
        .get_rebalance_action(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("rebalance action '{}' not found", id)))
}

#[derive(Debug, Clone, Deserialize)]
struct SwapLegOutcome {
    caller: String,
    actual_amount_out: u128,
}

async fn execute_swap_leg(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<ServiceState>,
    Json(request): Json<SwapLegOutcome>,
) -> Result<Json<RebalanceAction>, ApiError> {
    let action = state.engine.execute_swap_leg(
        &Identity::new(request.caller),
        &id,
        index,
        request.actual_amount_out,
    )?;
    state.persist().await?;
    Ok(Json(action))
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeLegOutcome {
    caller: String,
    actual_amount: u128,
}

async fn execute_bridge_leg(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<ServiceState>,
    Json(request): Json<BridgeLegOutcome>,
) -> Result<Json<RebalanceAction>, ApiError> {
    let action = state.engine.execute_bridge_leg(
        &Identity::new(request.caller),
        &id,
        index,
        request.actual_amount,
    )?;
    state.persist().await?;
    Ok(Json(action))
}

async fn complete_action(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<RebalanceAction>, ApiError> {
    let action = state
        .engine
        .complete_action(&Identity::new(request.caller), &id)?;
    state.persist().await?;
    Ok(Json(action))
}

async fn pause_action(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<RebalanceAction>, ApiError> {
    let action = state
        .engine
        .pause_action(&Identity::new(request.caller), &id)?;
    state.persist().await?;
    Ok(Json(action))
}

// --- Prices ------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct SetPriceRequest {
    caller: String,
    chain_id: ChainId,
    token: String,
    price_usd: u128,
}

#[derive(Debug, Clone, Serialize)]
struct PriceResponse {
    chain_id: ChainId,
    token: String,
    price_usd: u128,
}

async fn set_price(
    State(state): State<ServiceState>,
    Json(request): Json<SetPriceRequest>,
) -> Result<Json<PriceResponse>, ApiError> {
    state.engine.set_price(
        &Identity::new(request.caller),
        request.chain_id,
        TokenId::new(request.token.as_str()),
        request.price_usd,
    )?;
    state.persist().await?;
    Ok(Json(PriceResponse {
        chain_id: request.chain_id,
        token: request.token,
        price_usd: request.price_usd,
    }))
}

async fn get_price(
    Path((chain_id, token)): Path<(ChainId, String)>,
    State(state): State<ServiceState>,
) -> Json<PriceResponse> {
    let price_usd = state
        .engine
        .get_price(chain_id, &TokenId::new(token.as_str()));
    Json(PriceResponse {
        chain_id,
        token,
        price_usd,
    })
}

// --- Audit ---------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct AuditEntriesQuery {
    subject: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct AuditEntriesResponse {
    total: usize,
    returned: usize,
    chain_intact: bool,
    items: Vec<LedgerEntry>,
}

async fn list_audit_entries(
    State(state): State<ServiceState>,
    Query(query): Query<AuditEntriesQuery>,
) -> Result<Json<AuditEntriesResponse>, ApiError> {
    let mut entries = state.engine.audit_entries(query.subject.as_deref())?;
    entries.reverse();

    let total = entries.len();
    let limit = query.limit.unwrap_or(100).min(1000);
    let items: Vec<LedgerEntry> = entries.into_iter().take(limit).collect();

    Ok(Json(AuditEntriesResponse {
        total,
        returned: items.len(),
        chain_intact: state.engine.verify_audit_chain(),
        items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use ed25519_dalek::{Signer, SigningKey};
    use rebalancer_core::{operation_digest, OperationType};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn test_config(label: &str) -> ServiceConfig {
        let mut signer_keys = BTreeMap::new();
        signer_keys.insert(
            "owner-1".to_string(),
            hex::encode(signing_key().verifying_key().to_bytes()),
        );
        ServiceConfig {
            snapshot_path: std::env::temp_dir()
                .join(format!("rebalancer-{}-{}", label, Uuid::new_v4()))
                .join("snapshot.json"),
            engine: EngineConfig {
                admins: vec![Identity::new("admin")],
                price_feeds: vec![Identity::new("oracle")],
                authorized_agents: vec![Identity::new("agent-1")],
                ..EngineConfig::default()
            },
            signer_keys,
            ..ServiceConfig::default()
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn signed_op(session: &DelegationSession, nonce: u64) -> SignedOperation {
        let mut op = SignedOperation {
            owner: Identity::new("owner-1"),
            delegate: Identity::new("agent-1"),
            nonce,
            op_type: OperationType::Rebalance,
            payload: serde_json::json!({"reason": "drift"}),
            timestamp: Utc::now(),
            signature: Vec::new(),
        };
        let digest = operation_digest(&op, &session.policy_hash).unwrap();
        op.signature = signing_key().sign(digest.as_bytes()).to_bytes().to_vec();
        op
    }

    async fn seeded_app(config: ServiceConfig) -> (Router, DelegationSession) {
        let app = build_router(ServiceState::bootstrap(config).unwrap());
        let (status, _) = send(
            &app,
            "POST",
            "/v1/portfolios",
            Some(serde_json::json!({
                "owner": "owner-1",
                "assets": [
                    {"token_id": "USDC", "chain_id": 1, "target_bps": 5000},
                    {"token_id": "ETH", "chain_id": 1, "target_bps": 5000}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, grant) = send(
            &app,
            "POST",
            "/v1/delegations",
            Some(serde_json::json!({
                "owner": "owner-1",
                "delegate": "agent-1",
                "max_slippage_bps": 50,
                "max_rebalance_usd": 1_000_000,
                "threshold_bps": 100,
                "cooldown_secs": 3600,
                "max_ops": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session: DelegationSession = serde_json::from_value(grant["session"].clone()).unwrap();
        (app, session)
    }

    #[test]
    fn service_config_reads_engine_table() {
        let dir = std::env::temp_dir().join(format!("rebalancer-config-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rebalancer.toml");
        std::fs::write(
            &path,
            r#"
            listen = "0.0.0.0:9000"

            [engine]
            admins = ["admin"]
            default_max_ops = 4

            [signer_keys]
            owner-1 = "00"
            "#,
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.engine.default_max_ops, 4);
        assert_eq!(config.engine.default_session_ttl_secs, 86_400);
        assert_eq!(config.signer_keys.len(), 1);

        // The malformed key only surfaces when the engine is built.
        assert!(ServiceState::bootstrap(config).is_err());
        assert_eq!(
            ServiceConfig::load(&dir.join("missing.toml")).unwrap(),
            ServiceConfig::default()
        );
    }

    #[tokio::test]
    async fn health_reports_intact_audit_chain() {
        let app = build_router(ServiceState::bootstrap(test_config("health")).unwrap());
        let (status, body) = send(&app, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["audit_chain_intact"], true);
    }

    #[tokio::test]
    async fn invalid_allocation_maps_to_bad_request() {
        let app = build_router(ServiceState::bootstrap(test_config("invalid")).unwrap());
        let (status, body) = send(
            &app,
            "POST",
            "/v1/portfolios",
            Some(serde_json::json!({
                "owner": "owner-1",
                "assets": [
                    {"token_id": "USDC", "chain_id": 1, "target_bps": 5000},
                    {"token_id": "ETH", "chain_id": 1, "target_bps": 4999}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn rebalance_flow_persists_and_rejects_second_completion() {
        let config = test_config("flow");
        let snapshot_path = config.snapshot_path.clone();
        let (app, session) = seeded_app(config.clone()).await;

        let (status, action) = send(
            &app,
            "POST",
            "/v1/rebalances",
            Some(serde_json::json!({
                "caller": "agent-1",
                "session_id": session.id,
                "op": signed_op(&session, 0),
                "swap_legs": [{
                    "token_in": "USDC",
                    "token_out": "ETH",
                    "amount_in": 1000,
                    "min_amount_out": 995,
                    "chain_id": 1,
                    "route_ref": "route-1"
                }],
                "total_value_usd": 1000
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let action_id = action["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/rebalances/{action_id}/swap-legs/0"),
            Some(serde_json::json!({"caller": "agent-1", "actual_amount_out": 994})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "economic");

        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/rebalances/{action_id}/swap-legs/0"),
            Some(serde_json::json!({"caller": "agent-1", "actual_amount_out": 995})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let complete = format!("/v1/rebalances/{action_id}/complete");
        let caller = serde_json::json!({"caller": "agent-1"});
        let (status, body) = send(&app, "POST", &complete, Some(caller.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["executed"], true);

        let (status, body) = send(&app, "POST", &complete, Some(caller)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "state");

        // A restarted service sees the same action and session state.
        assert!(snapshot_path.exists());
        let restarted = build_router(ServiceState::bootstrap(config).unwrap());
        let (status, body) = send(&restarted, "GET", &format!("/v1/rebalances/{action_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        let (_, body) = send(&restarted, "GET", &format!("/v1/sessions/{}", session.id), None).await;
        assert_eq!(body["status"], "exhausted");
    }

    #[tokio::test]
    async fn replayed_operation_maps_to_conflict() {
        let (app, session) = seeded_app(test_config("replay")).await;
        let op = signed_op(&session, 0);
        let uri = format!("/v1/sessions/{}/verify", session.id);

        let (status, body) = send(&app, "POST", &uri, Some(serde_json::json!({"op": op}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["digest"].as_str().map(str::len), Some(64));

        let (status, body) = send(&app, "POST", &uri, Some(serde_json::json!({"op": op}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "replay");
    }

    #[tokio::test]
    async fn only_feed_sets_prices_and_only_admin_pauses() {
        let app = build_router(ServiceState::bootstrap(test_config("roles")).unwrap());
        let price = serde_json::json!({"caller": "agent-1", "chain_id": 1, "token": "ETH", "price_usd": 3000});
        let (status, _) = send(&app, "POST", "/v1/prices", Some(price)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let price = serde_json::json!({"caller": "oracle", "chain_id": 1, "token": "ETH", "price_usd": 3000});
        let (status, _) = send(&app, "POST", "/v1/prices", Some(price)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, "GET", "/v1/prices/1/ETH", None).await;
        assert_eq!(body["price_usd"], 3000);
        let (_, body) = send(&app, "GET", "/v1/prices/10/ETH", None).await;
        assert_eq!(body["price_usd"], 0);

        let (status, _) = send(
            &app,
            "POST",
            "/v1/rebalances/act-missing/pause",
            Some(serde_json::json!({"caller": "agent-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn audit_entries_filter_by_subject() {
        let (app, session) = seeded_app(test_config("audit")).await;
        let (status, body) = send(
            &app,
            "GET",
            &format!("/v1/audit/entries?subject={}", session.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chain_intact"], true);
        let items = body["items"].as_array().cloned().unwrap_or_default();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["event"]["stage"], "session_created");
    }
}
