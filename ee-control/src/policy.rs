//! Admission policy: decide whether an `attest_response` satisfies the
//! release allowlist for the session's `(repo, release_tag)`.

use base64::Engine;
use ee_api::{allowlist::Allowlist, reasons, tunnel::AttestResponse};
use ee_attest::verify;
use serde_json::Value;

/// Outcome of one attestation round.
#[derive(Clone, Debug)]
pub struct AttestationOutcome {
    pub verified: bool,
    pub reason: String,
    pub sealed: bool,
    pub report_data: Option<String>,
}

impl AttestationOutcome {
    fn rejected(reason: impl Into<String>, sealed: bool) -> Self {
        Self {
            verified: false,
            reason: reason.into(),
            sealed,
            report_data: None,
        }
    }
}

/// Check an agent's attestation against the allowlist.
///
/// Measurement comparison runs before quote cryptography: a measurement
/// mismatch is the common failure and needs no network. Then the quote is
/// verified (chain, signature, optional PCCS) and its report data compared
/// to the allowlist's pinned value.
pub async fn verify_attestation(
    response: &AttestResponse,
    allowlist: &Allowlist,
    require_sealed: bool,
    pccs_url: Option<&str>,
    skip_pccs: bool,
    http: &reqwest::Client,
) -> AttestationOutcome {
    let (quote_b64, measurements) = match (&response.quote, &response.measurements) {
        (Some(quote), Some(measurements)) if !quote.is_empty() && !measurements.is_empty() =>
            (quote, measurements),
        _ => return AttestationOutcome::rejected(reasons::MISSING_QUOTE_OR_MEASUREMENTS, false),
    };

    let sealed = matches!(measurements.get("sealed"), Some(Value::Bool(true)));

    if allowlist.measurements.is_empty() {
        return AttestationOutcome::rejected(reasons::ALLOWLIST_MISSING_MEASUREMENTS, sealed);
    }
    for (key, expected) in &allowlist.measurements {
        if measurements.get(key) != Some(expected) {
            return AttestationOutcome::rejected(reasons::measurement_mismatch(key), sealed);
        }
    }

    if require_sealed && !sealed {
        return AttestationOutcome::rejected(reasons::SEALED_REQUIRED, sealed);
    }

    let quote_bytes = match base64::engine::general_purpose::STANDARD.decode(quote_b64) {
        Ok(bytes) => bytes,
        Err(_) => return AttestationOutcome::rejected(reasons::dcap_error("bad_base64"), sealed),
    };

    let verification =
        verify::verify_quote(&quote_bytes, None, pccs_url, skip_pccs, http).await;

    // Structural failure is a DCAP error; crypto/TCB failure is a
    // verification failure. The distinction is visible to operators.
    if verification.measurements.is_empty() {
        return AttestationOutcome::rejected(
            reasons::dcap_error(&verification.reason),
            sealed,
        );
    }

    let report_data = verification.report_data_hex().map(str::to_owned);
    if let (Some(actual), Some(expected)) = (&report_data, &allowlist.report_data) {
        if !actual.eq_ignore_ascii_case(expected) {
            return AttestationOutcome {
                verified: false,
                reason: reasons::REPORT_DATA_MISMATCH.to_owned(),
                sealed,
                report_data,
            };
        }
    }

    if !verification.verified {
        return AttestationOutcome {
            verified: false,
            reason: reasons::DCAP_VERIFICATION_FAILED.to_owned(),
            sealed,
            report_data,
        };
    }

    AttestationOutcome {
        verified: true,
        reason: "ok".to_owned(),
        sealed,
        report_data,
    }
}

#[cfg(test)]
mod test {
    use ee_attest::provider::{FakeQuoteProvider, QuoteProvider};
    use serde_json::json;

    use super::*;

    fn allowlist(sealed: bool) -> Allowlist {
        serde_json::from_value(json!({
            "measurements": {
                "vm_image_id": "img-1",
                "agent_dir_sha256": "aa",
                "sealed": sealed,
            },
        }))
        .unwrap()
    }

    fn response(sealed: bool) -> AttestResponse {
        let quote = FakeQuoteProvider.quote(b"r").unwrap();
        AttestResponse {
            nonce: "cafef00d".to_owned(),
            quote: Some(base64::engine::general_purpose::STANDARD.encode(quote)),
            report_data: None,
            measurements: Some(
                json!({
                    "vm_image_id": "img-1",
                    "agent_dir_sha256": "aa",
                    "sealed": sealed,
                })
                .as_object()
                .unwrap()
                .clone(),
            ),
        }
    }

    fn http() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn missing_pieces_rejected_first() {
        let mut bare = response(true);
        bare.quote = None;
        let outcome =
            verify_attestation(&bare, &allowlist(true), true, None, true, &http()).await;
        assert_eq!(outcome.reason, "missing_quote_or_measurements");
    }

    #[tokio::test]
    async fn measurement_mismatch_names_the_key() {
        let mut wrong = response(true);
        wrong
            .measurements
            .as_mut()
            .unwrap()
            .insert("vm_image_id".to_owned(), json!("img-2"));
        let outcome =
            verify_attestation(&wrong, &allowlist(true), true, None, true, &http()).await;
        assert!(!outcome.verified);
        assert_eq!(outcome.reason, "measurement_mismatch:vm_image_id");
    }

    #[tokio::test]
    async fn sealed_required_on_hardened_networks() {
        let outcome = verify_attestation(
            &response(false),
            &allowlist(false),
            true,
            None,
            true,
            &http(),
        )
        .await;
        assert_eq!(outcome.reason, "sealed_required");
        assert!(!outcome.sealed);
    }

    #[tokio::test]
    async fn fake_quote_fails_dcap_not_policy() {
        // Everything matches, so the only remaining gate is quote crypto.
        let outcome = verify_attestation(
            &response(true),
            &allowlist(true),
            true,
            None,
            true,
            &http(),
        )
        .await;
        assert!(!outcome.verified);
        assert_eq!(outcome.reason, "dcap_verification_failed");
        assert!(outcome.sealed);
    }
}
