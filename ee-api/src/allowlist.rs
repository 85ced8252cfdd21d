//! The release-pinned allowlist asset (`agent-attestation-allowlist.json`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expected measurements for one `(repo, release_tag)`, published as a
/// release asset by the build pipeline.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Allowlist {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub release_tag: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Agent-level measurements, compared key-by-key against what the agent
    /// reports in `attest_response`.
    #[serde(default)]
    pub measurements: Map<String, Value>,
    /// Expected hex report data for the agent's quote.
    #[serde(default)]
    pub report_data: Option<String>,
    /// Quote-level measurements (mrtd, rtmr0..3), compared against the
    /// values parsed out of the verified quote.
    #[serde(default)]
    pub quote_measurements: Map<String, Value>,
}

/// Why an allowlist document was rejected at load time.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllowlistError {
    #[error("allowlist is missing measurements.vm_image_id")]
    MissingVmImageId,
}

impl Allowlist {
    /// Validate invariants that must hold before an allowlist is used.
    /// An allowlist without a `vm_image_id` pins nothing and is rejected.
    pub fn validate(&self) -> Result<(), AllowlistError> {
        match self.measurements.get("vm_image_id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(()),
            _ => Err(AllowlistError::MissingVmImageId),
        }
    }

    /// Whether the allowlist requires a sealed VM image.
    pub fn sealed(&self) -> bool {
        matches!(self.measurements.get("sealed"), Some(Value::Bool(true)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vm_image_id_is_required() {
        let allowlist: Allowlist = serde_json::from_str(
            r#"{
                "version": "1.0",
                "release_tag": "v3",
                "measurements": {"agent_dir_sha256": "aa"},
                "quote_measurements": {"mrtd": "bb"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            allowlist.validate(),
            Err(AllowlistError::MissingVmImageId)
        );

        let allowlist: Allowlist = serde_json::from_str(
            r#"{"measurements": {"vm_image_id": "img-1", "sealed": true}}"#,
        )
        .unwrap();
        allowlist.validate().unwrap();
        assert!(allowlist.sealed());
    }
}
