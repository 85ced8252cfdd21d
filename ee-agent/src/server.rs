//! The agent's HTTP API: liveness, attestation introspection, deploys.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ee_attest::provider::QuoteProvider;
use ee_common::ids;
use http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{
    attestation::build_attestation,
    config::Config,
    deploy::{run_deployment, DeployJob, Deployment, DeploymentStore},
};

pub struct AgentState {
    pub config: Config,
    pub provider: Box<dyn QuoteProvider>,
    pub deployments: DeploymentStore,
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AgentState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/attestation", get(attestation))
        .route("/deploy", post(deploy))
        .route("/status/{deployment_id}", get(status))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn attestation(State(state): State<SharedState>) -> Response {
    match build_attestation(&state.config, state.provider.as_ref()) {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => {
            warn!("attestation failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("{e:#}")})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    repo: String,
    #[serde(default)]
    bundle_artifact_id: Option<i64>,
    #[serde(default)]
    bundle_b64: Option<String>,
    #[serde(default)]
    private_env: Option<String>,
}

async fn deploy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> Response {
    if request.repo.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing required field: repo"})),
        )
            .into_response();
    }
    if request.bundle_artifact_id.is_none() && request.bundle_b64.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Provide bundle_artifact_id or bundle_b64"})),
        )
            .into_response();
    }

    let mut deployment = Deployment::new(
        ids::new_id(),
        request.repo.clone(),
        request.bundle_artifact_id,
    );
    if let Err(e) = state.deployments.save(&mut deployment) {
        warn!("failed to persist deployment: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal_error"})),
        )
            .into_response();
    }

    let job = DeployJob {
        deployment_id: deployment.id.clone(),
        repo: request.repo,
        bundle_artifact_id: request.bundle_artifact_id,
        bundle_b64: request.bundle_b64,
        private_env: request.private_env,
        bearer_token: bearer_token(&headers).map(str::to_owned),
    };
    let worker_state = state.clone();
    ee_common::task::EeTask::spawn("deploy-worker", async move {
        let attest_state = worker_state.clone();
        run_deployment(
            job,
            &worker_state.deployments,
            &worker_state.config.workload_dir,
            &worker_state.http,
            move || {
                build_attestation(&attest_state.config, attest_state.provider.as_ref())
                    .map(|payload| payload.quote)
            },
        )
        .await;
    })
    .detach();

    (
        StatusCode::ACCEPTED,
        Json(json!({"deployment_id": deployment.id, "status": "pending"})),
    )
        .into_response()
}

async fn status(
    State(state): State<SharedState>,
    Path(deployment_id): Path<String>,
) -> Response {
    match state.deployments.load(&deployment_id) {
        Some(deployment) => Json(deployment).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Deployment not found"})),
        )
            .into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .or_else(|| value.strip_prefix("token "))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bearer_variants() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(AUTHORIZATION, "token xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("xyz"));
        headers.remove(AUTHORIZATION);
        assert_eq!(bearer_token(&headers), None);
    }
}
