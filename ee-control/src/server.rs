//! The control plane HTTP surface.
//!
//! Three audiences share this router: agents (the WebSocket control
//! channel), the public (resolve + proxy), and operators (apps, ledger,
//! settlement, abuse, nodes). Role tokens form a strict lattice: the admin
//! token is accepted wherever a launcher or uptime token is. A role whose
//! token is unset in config is disabled, which makes its paths open.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ee_api::{
    ledger::{
        AbuseAuthorizeRequest, AbuseReportRequest, NodeRegisterRequest,
        PurchaseCreditsRequest, SettleRequest, TransferCreditsRequest,
        UsageReportRequest,
    },
    reasons,
};
use ee_ledger::{AbuseDecision, LedgerError};
use http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use serde_json::json;
use tracing::info;

use crate::{
    config::{token_matches, Config},
    proxy::{bridge, ProxyEnvelope},
    session::serve_session,
    state::SharedState,
};

pub fn control_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tunnel", get(tunnel))
        .route("/v1/resolve/{app_name}", get(resolve_app))
        .route("/v1/proxy/{app_name}", post(proxy_envelope))
        .route("/v1/apps", get(list_apps))
        .route("/v1/apps/{app_name}", get(get_app))
        .route("/dashboard", get(dashboard))
        .route("/admin", get(dashboard))
        .route("/v1/credits/purchase", post(purchase_credits))
        .route("/v1/credits/transfer", post(transfer_credits))
        .route("/v1/balances/{account_id}", get(get_balance))
        .route("/v1/usage/report", post(report_usage))
        .route("/v1/settlements/{period}/finalize", post(finalize_settlement))
        .route("/v1/abuse/reports", post(file_abuse_report))
        .route("/v1/abuse/reports/{report_id}/authorize", post(authorize_abuse_report))
        .route("/v1/nodes/register", post(register_node))
        .route("/v1/nodes/{node_id}", get(get_node))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// --- Errors --- //

/// HTTP-mapped errors. Every body is JSON; every reason is a closed tag.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    /// Policy refusal carrying the full status payload.
    Forbidden(serde_json::Value),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized =>
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})))
                    .into_response(),
            Self::NotFound(reason) =>
                (StatusCode::NOT_FOUND, Json(json!({"error": reason}))).into_response(),
            Self::Forbidden(payload) =>
                (StatusCode::FORBIDDEN, Json(payload)).into_response(),
            Self::BadRequest(reason) =>
                (StatusCode::BAD_REQUEST, Json(json!({"error": reason}))).into_response(),
            Self::Internal(detail) => {
                tracing::error!("internal error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal_error"})),
                )
                    .into_response()
            }
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ReportNotFound => Self::NotFound(e.to_string()),
            LedgerError::Storage(detail) => Self::Internal(detail),
            _ => Self::BadRequest(e.to_string()),
        }
    }
}

// --- Auth --- //

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    Launcher,
    Uptime,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

/// Enforce a role. The admin token satisfies every role; an unset token
/// disables the role's check entirely.
pub fn require_role(
    config: &Config,
    headers: &HeaderMap,
    role: Role,
) -> Result<(), ApiError> {
    let role_hash = match role {
        Role::Admin => &config.admin_token_hash,
        Role::Launcher => &config.launcher_token_hash,
        Role::Uptime => &config.uptime_token_hash,
    };
    let role_hash = match role_hash {
        Some(hash) => hash,
        None => return Ok(()),
    };

    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if token_matches(token, role_hash) {
        return Ok(());
    }
    if role != Role::Admin {
        if let Some(admin_hash) = &config.admin_token_hash {
            if token_matches(token, admin_hash) {
                return Ok(());
            }
        }
    }
    Err(ApiError::Unauthorized)
}

// --- Handlers --- //

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn tunnel(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_session(state, socket))
}

async fn resolve_app(
    State(state): State<SharedState>,
    Path(app_name): Path<String>,
) -> Result<Json<ee_api::status::AppStatus>, ApiError> {
    let record = state
        .registry
        .get(&app_name)
        .ok_or_else(|| ApiError::NotFound(reasons::UNKNOWN_APP.to_owned()))?;
    let payload = state.registry.status_payload(&record);
    if !payload.allowed {
        let value = serde_json::to_value(&payload)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Err(ApiError::Forbidden(value));
    }
    Ok(Json(payload))
}

async fn proxy_envelope(
    State(state): State<SharedState>,
    Path(app_name): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let envelope: ProxyEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) =>
            return ApiError::BadRequest(reasons::INVALID_PROXY_PAYLOAD.to_owned())
                .into_response(),
    };
    bridge(&state, &app_name, envelope).await
}

async fn list_apps(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    let apps: Vec<_> = state
        .registry
        .list()
        .iter()
        .map(|record| state.registry.status_payload(record))
        .collect();
    Ok(Json(json!({"apps": apps})))
}

async fn get_app(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(app_name): Path<String>,
) -> Result<Json<ee_api::status::AppStatus>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    let record = state
        .registry
        .get(&app_name)
        .ok_or_else(|| ApiError::NotFound(reasons::UNKNOWN_APP.to_owned()))?;
    Ok(Json(state.registry.status_payload(&record)))
}

async fn dashboard(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Html<String>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;

    let mut rows = String::new();
    for record in state.registry.list() {
        let payload = state.registry.status_payload(&record);
        let state_label = format!("{:?}", payload.registration_state).to_lowercase();
        let attest_label = format!("{:?}", payload.attestation_status).to_lowercase();
        let health_label = format!("{:?}", payload.health_status).to_lowercase();
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            payload.app_name,
            payload.repo,
            payload.release_tag,
            payload.network,
            state_label,
            attest_label,
            health_label,
            if payload.sealed { "yes" } else { "no" },
            if payload.ws_connected { "yes" } else { "no" },
            payload.registration_expires_at.to_rfc3339(),
        ));
    }
    if rows.is_empty() {
        rows = "<tr><td colspan='10'>No apps registered</td></tr>".to_owned();
    }

    Ok(Html(format!(
        "<!doctype html><html><head><meta charset='utf-8'>\
         <title>Easy Enclave Dashboard</title>\
         <style>body{{font-family:Arial,Helvetica,sans-serif;margin:24px;}}\
         table{{border-collapse:collapse;width:100%;}}\
         th,td{{border:1px solid #ddd;padding:8px;text-align:left;}}\
         th{{background:#f2f2f2;}}</style></head><body>\
         <h1>Easy Enclave Dashboard</h1><table><thead><tr>\
         <th>App</th><th>Repo</th><th>Release</th><th>Network</th>\
         <th>TTL</th><th>Attestation</th><th>Health</th><th>Sealed</th>\
         <th>Connected</th><th>Expires</th></tr></thead>\
         <tbody>{rows}</tbody></table></body></html>"
    )))
}

async fn purchase_credits(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<PurchaseCreditsRequest>,
) -> Result<Json<ee_ledger::Balance>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    let cents = ee_ledger::parse_cents(request.amount.as_ref())?;
    let balance = state.ledger.purchase_credits(&request.account_id, cents)?;
    Ok(Json(balance))
}

async fn transfer_credits(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<TransferCreditsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    let cents = ee_ledger::parse_cents(request.amount.as_ref())?;
    let transfer_id =
        state
            .ledger
            .transfer_credits(&request.from_account, &request.to_account, cents)?;
    Ok(Json(json!({"transfer_id": transfer_id})))
}

async fn get_balance(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<ee_ledger::Balance>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    Ok(Json(state.ledger.get_balance(&account_id)?))
}

async fn report_usage(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<UsageReportRequest>,
) -> Result<Json<ee_ledger::UsageReceipt>, ApiError> {
    require_role(&state.config, &headers, Role::Uptime)?;
    let vcpu_hours = ee_ledger::parse_vcpu_hours(request.vcpu_hours.as_ref())?;
    let receipt = state.ledger.report_usage(
        &request.account_id,
        &request.node_id,
        vcpu_hours,
        &request.period_start,
        &request.period_end,
    )?;
    Ok(Json(receipt))
}

async fn finalize_settlement(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(period): Path<String>,
    Json(request): Json<SettleRequest>,
) -> Result<Json<ee_ledger::SettlementOutcome>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    info!(%period, node_id = %request.node_id, "finalizing settlement");
    let outcome = state.ledger.settle_period(
        &request.node_id,
        &request.period_start,
        &request.period_end,
    )?;
    Ok(Json(outcome))
}

async fn file_abuse_report(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<AbuseReportRequest>,
) -> Result<Json<ee_ledger::AbuseReceipt>, ApiError> {
    require_role(&state.config, &headers, Role::Launcher)?;
    let receipt = state.ledger.file_abuse_report(
        &request.node_id,
        request.period_start.as_deref(),
        request.period_end.as_deref(),
        Some("launcher"),
        request.reason.as_deref(),
    )?;
    Ok(Json(receipt))
}

async fn authorize_abuse_report(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(report_id): Path<String>,
    Json(request): Json<AbuseAuthorizeRequest>,
) -> Result<Json<ee_ledger::AbuseReceipt>, ApiError> {
    require_role(&state.config, &headers, Role::Admin)?;
    let decision = AbuseDecision::from_action(&request.action)?;
    let receipt = state
        .ledger
        .authorize_abuse_report(&report_id, "admin", decision)?;
    Ok(Json(receipt))
}

/// Admin or the node's own bearer token.
fn require_admin_or_node_token(
    state: &SharedState,
    headers: &HeaderMap,
    node_id: &str,
) -> Result<(), ApiError> {
    if require_role(&state.config, headers, Role::Admin).is_ok() {
        return Ok(());
    }
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if state.ledger.verify_node_token(node_id, token) {
        return Ok(());
    }
    Err(ApiError::Unauthorized)
}

async fn register_node(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<NodeRegisterRequest>,
) -> Result<Json<ee_ledger::RegisteredNode>, ApiError> {
    require_admin_or_node_token(&state, &headers, &request.node_id)?;
    let registered = state.ledger.register_node(
        &request.node_id,
        request.price_cents_per_vcpu_hour,
        request.stake_tier.as_deref(),
        request.stake_amount_cents,
        request.allow_update,
        request.rotate_token,
    )?;
    Ok(Json(registered))
}

async fn get_node(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<Json<ee_ledger::Node>, ApiError> {
    require_admin_or_node_token(&state, &headers, &node_id)?;
    let node = state
        .ledger
        .get_node(&node_id)?
        .ok_or_else(|| ApiError::NotFound("unknown_node".to_owned()))?;
    Ok(Json(node))
}

#[cfg(test)]
mod test {
    use http::header::AUTHORIZATION;

    use super::*;
    use crate::config::hash_token;

    fn config_with_tokens(
        admin: Option<&str>,
        launcher: Option<&str>,
    ) -> Config {
        let mut config = Config::from_env();
        config.admin_token_hash = admin.map(hash_token);
        config.launcher_token_hash = launcher.map(hash_token);
        config.uptime_token_hash = None;
        config
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn unset_token_disables_the_role() {
        let config = config_with_tokens(None, None);
        require_role(&config, &HeaderMap::new(), Role::Admin).unwrap();
        require_role(&config, &HeaderMap::new(), Role::Launcher).unwrap();
    }

    #[test]
    fn admin_token_satisfies_lower_roles() {
        let config = config_with_tokens(Some("adm"), Some("lnc"));
        // Launcher path accepts both its own token and the admin token.
        require_role(&config, &headers_with("lnc"), Role::Launcher).unwrap();
        require_role(&config, &headers_with("adm"), Role::Launcher).unwrap();
        // The reverse does not hold.
        assert!(require_role(&config, &headers_with("lnc"), Role::Admin).is_err());
        // Garbage is garbage.
        assert!(require_role(&config, &headers_with("nope"), Role::Launcher).is_err());
        assert!(require_role(&config, &HeaderMap::new(), Role::Admin).is_err());
    }
}
