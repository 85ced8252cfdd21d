//! Bridging client HTTP requests through a session's tunnel.
//!
//! Two entry points share [`bridge`]: the explicit `/v1/proxy/{app}` JSON
//! envelope on the control listener, and the edge listener which accepts
//! any method on any path and resolves the app from `X-EE-App` or the
//! first label of `Host`.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
    Json, Router,
};
use base64::Engine;
use ee_api::{reasons, tunnel::ProxyRequest};
use ee_common::ids;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{state::SharedState, tunnels::ProxyError};

/// The request envelope accepted by `/v1/proxy/{app}`.
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyEnvelope {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_b64: String,
}

fn default_method() -> String {
    "GET".to_owned()
}

fn default_path() -> String {
    "/".to_owned()
}

/// Resolve the app, gate on `allowed`, and relay one request through the
/// session. Every failure maps to the fixed HTTP vocabulary: 404 unknown,
/// 403 with the status payload, 503 no_tunnel, 504 proxy_timeout.
pub async fn bridge(
    state: &SharedState,
    app_name: &str,
    envelope: ProxyEnvelope,
) -> Response {
    let record = match state.registry.get(app_name) {
        Some(record) => record,
        None =>
            return error_response(StatusCode::NOT_FOUND, reasons::UNKNOWN_APP),
    };
    let payload = state.registry.status_payload(&record);
    if !payload.allowed {
        return (StatusCode::FORBIDDEN, Json(payload)).into_response();
    }

    let handle = match state.tunnels.get(app_name) {
        Some(handle) => handle,
        None =>
            return error_response(StatusCode::SERVICE_UNAVAILABLE, reasons::NO_TUNNEL),
    };

    let request = ProxyRequest {
        request_id: ids::new_request_id(),
        method: envelope.method,
        path: envelope.path,
        headers: envelope.headers,
        body_b64: envelope.body_b64,
    };
    debug!(app_name, request_id = request.request_id, "bridging request");

    match handle.proxy(request, state.config.proxy_timeout).await {
        Ok(response) => agent_response_to_http(response),
        Err(ProxyError::Timeout) =>
            error_response(StatusCode::GATEWAY_TIMEOUT, reasons::PROXY_TIMEOUT),
        Err(ProxyError::NoTunnel) =>
            error_response(StatusCode::SERVICE_UNAVAILABLE, reasons::NO_TUNNEL),
    }
}

/// Reconstruct the backend's response bit-exact: status, headers (minus
/// hop-by-hop and length framing), and the decoded body.
fn agent_response_to_http(response: ee_api::tunnel::ProxyResponse) -> Response {
    let status = match StatusCode::from_u16(response.status) {
        Ok(status) => status,
        Err(_) =>
            return error_response(StatusCode::BAD_GATEWAY, reasons::INVALID_PROXY_PAYLOAD),
    };
    let body = match base64::engine::general_purpose::STANDARD.decode(&response.body_b64)
    {
        Ok(body) => body,
        Err(_) =>
            return error_response(StatusCode::BAD_GATEWAY, reasons::INVALID_PROXY_PAYLOAD),
    };

    let mut http_response = Response::builder().status(status);
    if let Some(headers) = http_response.headers_mut() {
        for (name, value) in &response.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            let (name, value) = match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => (name, value),
                _ => continue,
            };
            headers.append(name, value);
        }
    }
    http_response
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            error_response(StatusCode::BAD_GATEWAY, reasons::INVALID_PROXY_PAYLOAD)
        })
}

fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("host")
}

fn error_response(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({"error": reason}))).into_response()
}

// --- Edge listener --- //

/// The edge proxy router: any method, any path.
pub fn edge_router(state: SharedState) -> Router {
    Router::new()
        .fallback(edge_handler)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// `X-EE-App` wins; otherwise the first label of `Host` names the app.
fn resolve_app_name(headers: &HeaderMap) -> Option<String> {
    if let Some(app) = headers.get("x-ee-app").and_then(|v| v.to_str().ok()) {
        if !app.is_empty() {
            return Some(app.to_owned());
        }
    }
    let host = headers.get(http::header::HOST)?.to_str().ok()?;
    let label = host.split(['.', ':']).next()?;
    if label.is_empty() {
        return None;
    }
    Some(label.to_owned())
}

async fn edge_handler(
    State(state): State<SharedState>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let app_name = match resolve_app_name(&parts.headers) {
        Some(app_name) => app_name,
        None => return error_response(StatusCode::NOT_FOUND, reasons::MISSING_APP),
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let mut headers = BTreeMap::new();
    for (name, value) in &parts.headers {
        if name == http::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_owned(), value.to_owned());
        }
    }

    let body = match axum::body::to_bytes(body, 16 * 1024 * 1024).await {
        Ok(body) => body,
        Err(_) =>
            return error_response(StatusCode::BAD_REQUEST, reasons::INVALID_PROXY_PAYLOAD),
    };

    let envelope = ProxyEnvelope {
        method: parts.method.to_string(),
        path,
        headers,
        body_b64: base64::engine::general_purpose::STANDARD.encode(&body),
    };
    bridge(&state, &app_name, envelope).await
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::try_from(*value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn explicit_header_beats_host() {
        let resolved = resolve_app_name(&headers(&[
            ("x-ee-app", "demo"),
            ("host", "other.apps.example"),
        ]));
        assert_eq!(resolved.as_deref(), Some("demo"));
    }

    #[test]
    fn host_first_label_fallback() {
        let resolved =
            resolve_app_name(&headers(&[("host", "demo.apps.example:443")]));
        assert_eq!(resolved.as_deref(), Some("demo"));
        let bare = resolve_app_name(&headers(&[("host", "demo:9090")]));
        assert_eq!(bare.as_deref(), Some("demo"));
    }

    #[test]
    fn missing_both_is_none() {
        assert_eq!(resolve_app_name(&HeaderMap::new()), None);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[tokio::test]
    async fn unknown_app_is_404() {
        let state = std::sync::Arc::new(crate::state::ControlPlane::for_testing(
            crate::config::Config::from_env(),
        ));
        let response = bridge(
            &state,
            "ghost",
            ProxyEnvelope {
                method: "GET".to_owned(),
                path: "/".to_owned(),
                headers: BTreeMap::new(),
                body_b64: String::new(),
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
