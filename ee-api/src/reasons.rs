//! Machine-readable reason tags.
//!
//! These strings are the entire error vocabulary visible outside a process:
//! in `status{invalid, <reason>}` frames, in HTTP error payloads, and in
//! ledger node events. Free text never crosses a boundary; parameterized
//! reasons use a `:` suffix (`measurement_mismatch:<key>`,
//! `dcap_error:<inner>`, `allowlist_fetch_failed:<inner>`,
//! `attest_miss:<reason>`, `health_miss:<reason>`).

// Attestation.
pub const MISSING_QUOTE_OR_MEASUREMENTS: &str = "missing_quote_or_measurements";
pub const ALLOWLIST_MISSING_MEASUREMENTS: &str = "allowlist_missing_measurements";
pub const MEASUREMENT_MISMATCH: &str = "measurement_mismatch";
pub const SEALED_REQUIRED: &str = "sealed_required";
pub const DCAP_ERROR: &str = "dcap_error";
pub const REPORT_DATA_MISMATCH: &str = "report_data_mismatch";
pub const DCAP_VERIFICATION_FAILED: &str = "dcap_verification_failed";
pub const ALLOWLIST_FETCH_FAILED: &str = "allowlist_fetch_failed";
pub const NONCE_MISMATCH: &str = "nonce_mismatch";
pub const ATTESTATION_TIMEOUT: &str = "attestation_timeout";
pub const UNEXPECTED_ATTESTATION: &str = "unexpected_attestation";

// Session.
pub const INVALID_JSON: &str = "invalid_json";
pub const UNKNOWN_MESSAGE: &str = "unknown_message";
pub const MISSING_FIELDS: &str = "missing_fields";
pub const INVALID_NETWORK: &str = "invalid_network";
pub const NOT_REGISTERED: &str = "not_registered";

// Proxy.
pub const MISSING_APP: &str = "missing_app";
pub const UNKNOWN_APP: &str = "unknown_app";
pub const NO_TUNNEL: &str = "no_tunnel";
pub const PROXY_TIMEOUT: &str = "proxy_timeout";
pub const INVALID_PROXY_PAYLOAD: &str = "invalid_proxy_payload";

// Ledger node events.
pub const EVENT_ATTEST_MISS: &str = "attest_miss";
pub const EVENT_HEALTH_MISS: &str = "health_miss";

/// `measurement_mismatch:<key>`
pub fn measurement_mismatch(key: &str) -> String {
    format!("{MEASUREMENT_MISMATCH}:{key}")
}

/// `dcap_error:<inner>`
pub fn dcap_error(inner: impl std::fmt::Display) -> String {
    format!("{DCAP_ERROR}:{inner}")
}

/// `allowlist_fetch_failed:<inner>`
pub fn allowlist_fetch_failed(inner: impl std::fmt::Display) -> String {
    format!("{ALLOWLIST_FETCH_FAILED}:{inner}")
}
