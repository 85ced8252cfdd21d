//! The agent attestation payload served at `GET /attestation` and echoed
//! over the tunnel in `attest_response`.

use serde::{Deserialize, Serialize};

/// What the agent measures about itself. The report data of its quote
/// commits to exactly these four values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AgentMeasurements {
    /// SHA-256 over the agent install directory tree.
    pub agent_dir_sha256: String,
    /// SHA-256 of the agent executable itself.
    pub agent_py_sha256: String,
    /// Identifier of the VM image the agent booted from.
    pub vm_image_id: String,
    /// Whether the VM was launched from an immutable sealed image.
    pub sealed: bool,
}

impl AgentMeasurements {
    /// The canonical preimage of the quote's report data: fields in fixed
    /// order, joined by `\n`, no trailing newline. `SHA256(material)` fills
    /// report_data[0..32]; the remaining 32 bytes are zero.
    pub fn report_data_material(&self) -> String {
        format!(
            "agent_dir={}\nagent_py={}\nvm_image_id={}\nsealed={}",
            self.agent_dir_sha256, self.agent_py_sha256, self.vm_image_id, self.sealed,
        )
    }
}

/// The full attestation payload: quote plus the measurements it binds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AttestationPayload {
    /// Base64 quote bytes.
    pub quote: String,
    /// Hex of the 64-byte report data the quote binds.
    pub report_data: String,
    pub measurements: AgentMeasurements,
}
