//! The control-channel WebSocket frame set.
//!
//! Text frames, one JSON object per frame, every object tagged with a
//! `"type"` field. The message set is closed: a frame whose tag is not
//! recognized deserializes to [`TunnelFrame::Unknown`] and is answered with
//! `status{invalid, unknown_message}` rather than an error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default network for agents that don't specify one.
pub const DEFAULT_NETWORK: &str = "forge-1";

/// A single frame on the control WebSocket, in either direction.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    /// agent -> server: announce identity and request admission.
    Register(Register),
    /// server -> agent: challenge with a fresh nonce.
    AttestRequest(AttestRequest),
    /// agent -> server: quote + measurements bound to the nonce.
    AttestResponse(AttestResponse),
    /// server -> agent: bridge one HTTP request into the enclave.
    ProxyRequest(ProxyRequest),
    /// agent -> server: the backend's response, bit-exact.
    ProxyResponse(ProxyResponse),
    /// agent -> server: liveness report.
    Health(Health),
    /// server -> agent: acknowledge or reject the previous frame.
    Status(Status),
    /// Anything with an unrecognized `"type"` tag.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Register {
    pub repo: String,
    pub release_tag: String,
    pub app_name: String,
    pub agent_id: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_version: Option<String>,
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_owned()
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AttestRequest {
    /// Hex-encoded 16-byte nonce. The next `attest_response` must echo it.
    pub nonce: String,
    /// Seconds the agent has to answer before the session is closed.
    pub deadline_s: u64,
    /// Why this round was started ("register" or "periodic").
    pub reason: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AttestResponse {
    pub nonce: String,
    /// Base64 quote bytes.
    #[serde(default)]
    pub quote: Option<String>,
    /// Hex report data the quote binds.
    #[serde(default)]
    pub report_data: Option<String>,
    /// Agent-reported measurements, compared key-by-key to the allowlist.
    #[serde(default)]
    pub measurements: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_b64: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProxyResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_b64: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Health {
    pub status: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Status {
    /// "ok" or "invalid".
    pub state: String,
    pub reason: String,
}

impl TunnelFrame {
    pub fn status_ok(reason: &str) -> Self {
        Self::Status(Status {
            state: "ok".to_owned(),
            reason: reason.to_owned(),
        })
    }

    pub fn status_invalid(reason: &str) -> Self {
        Self::Status(Status {
            state: "invalid".to_owned(),
            reason: reason.to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_defaults_network() {
        let frame: TunnelFrame = serde_json::from_str(
            r#"{"type":"register","repo":"acme/app","release_tag":"v1",
                "app_name":"demo","agent_id":"agent-1"}"#,
        )
        .unwrap();
        match frame {
            TunnelFrame::Register(register) => {
                assert_eq!(register.network, "forge-1");
                assert_eq!(register.tunnel_version, None);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let frame: TunnelFrame =
            serde_json::from_str(r#"{"type":"gossip","payload":1}"#).unwrap();
        assert_eq!(frame, TunnelFrame::Unknown);
    }

    #[test]
    fn frames_roundtrip() {
        let frames = vec![
            TunnelFrame::AttestRequest(AttestRequest {
                nonce: "cafef00d".to_owned(),
                deadline_s: 30,
                reason: "register".to_owned(),
            }),
            TunnelFrame::ProxyRequest(ProxyRequest {
                request_id: "abc123".to_owned(),
                method: "GET".to_owned(),
                path: "/hello".to_owned(),
                headers: BTreeMap::from([("accept".to_owned(), "*/*".to_owned())]),
                body_b64: String::new(),
            }),
            TunnelFrame::Health(Health {
                status: "pass".to_owned(),
            }),
            TunnelFrame::status_invalid("nonce_mismatch"),
        ];
        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let back: TunnelFrame = serde_json::from_str(&json).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn wire_tag_is_snake_case() {
        let json = serde_json::to_value(TunnelFrame::Health(Health {
            status: "pass".to_owned(),
        }))
        .unwrap();
        assert_eq!(json["type"], "health");
        let json = serde_json::to_value(TunnelFrame::AttestRequest(AttestRequest {
            nonce: "00".to_owned(),
            deadline_s: 30,
            reason: "periodic".to_owned(),
        }))
        .unwrap();
        assert_eq!(json["type"], "attest_request");
    }
}
