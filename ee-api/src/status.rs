//! Externally-observable per-app status, served by `/v1/resolve/{app}`,
//! `/v1/apps`, and the dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Active,
    Warning,
    Expired,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttestationStatus {
    Unknown,
    Valid,
    Invalid,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Pass,
    Fail,
}

/// One row of the registry as clients and operators see it. `allowed` is
/// derived, never stored: active registration ∧ valid attestation ∧ passing
/// health ∧ live socket ∧ (sealed where the network demands it).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AppStatus {
    pub app_name: String,
    pub repo: String,
    pub release_tag: String,
    pub network: String,
    pub agent_id: String,
    pub registered_at: DateTime<Utc>,
    pub registration_expires_at: DateTime<Utc>,
    pub registration_state: RegistrationState,
    pub sealed: bool,
    pub attestation_status: AttestationStatus,
    pub health_status: HealthStatus,
    pub ws_connected: bool,
    pub last_attested_at: Option<DateTime<Utc>>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub allowed: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn states_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&RegistrationState::Warning).unwrap(),
            "\"warning\"",
        );
        assert_eq!(
            serde_json::to_string(&AttestationStatus::Valid).unwrap(),
            "\"valid\"",
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Fail).unwrap(),
            "\"fail\"",
        );
    }
}
