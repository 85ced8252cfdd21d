//! TCB collateral lookups against a PCCS (or the public Intel PCS).

use serde::Deserialize;

/// Default collateral source when no PCCS is configured.
pub const INTEL_PCS_URL: &str = "https://api.trustedservices.intel.com";

/// TCB statuses that keep a quote verified.
pub const STATUS_OK: &[&str] = &["UpToDate", "SWHardeningNeeded"];
/// TCB statuses that keep a quote verified but warrant operator attention.
pub const STATUS_WARN: &[&str] =
    &["ConfigurationNeeded", "ConfigurationAndSWHardeningNeeded"];

#[derive(Debug, thiserror::Error)]
pub enum PccsError {
    #[error("pccs request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("pccs returned status {0}")]
    BadStatus(u16),
    #[error("no tcb level matches the platform svn vector")]
    NoMatchingLevel,
}

#[derive(Debug, Deserialize)]
struct TcbInfoResponse {
    #[serde(rename = "tcbInfo")]
    tcb_info: TcbInfo,
}

#[derive(Debug, Deserialize)]
struct TcbInfo {
    #[serde(rename = "tcbLevels")]
    tcb_levels: Vec<TcbLevel>,
}

#[derive(Debug, Deserialize)]
struct TcbLevel {
    tcb: Tcb,
    #[serde(rename = "tcbStatus")]
    tcb_status: String,
}

#[derive(Debug, Deserialize)]
struct Tcb {
    #[serde(rename = "tdxtcbcomponents", default)]
    tdx_tcb_components: Vec<TcbComponent>,
}

#[derive(Debug, Deserialize)]
struct TcbComponent {
    svn: u8,
}

/// Fetch TDX TCB info for the platform identified by `fmspc` and evaluate
/// the quote's TEE TCB SVN vector against it.
///
/// Returns the `tcbStatus` of the first (highest) TCB level whose every
/// component SVN is ≤ the corresponding SVN reported by the platform.
pub async fn tdx_tcb_status(
    http: &reqwest::Client,
    pccs_url: &str,
    fmspc: &[u8; 6],
    tee_tcb_svn: &[u8; 16],
) -> Result<String, PccsError> {
    let base = pccs_url.trim_end_matches('/');
    let fmspc_hex = ee_common::hex::encode(fmspc);
    let url = format!("{base}/tdx/certification/v4/tcb?fmspc={fmspc_hex}");

    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(PccsError::BadStatus(response.status().as_u16()));
    }
    let body: TcbInfoResponse = response.json().await?;

    select_level(&body.tcb_info.tcb_levels, tee_tcb_svn)
}

fn select_level(
    levels: &[TcbLevel],
    tee_tcb_svn: &[u8; 16],
) -> Result<String, PccsError> {
    for level in levels {
        let satisfied = level
            .tcb
            .tdx_tcb_components
            .iter()
            .zip(tee_tcb_svn.iter())
            .all(|(component, platform_svn)| component.svn <= *platform_svn);
        if satisfied && !level.tcb.tdx_tcb_components.is_empty() {
            return Ok(level.tcb_status.clone());
        }
    }
    Err(PccsError::NoMatchingLevel)
}

/// Whether a TCB status keeps the quote verified.
pub fn status_is_acceptable(status: &str) -> bool {
    STATUS_OK.contains(&status) || STATUS_WARN.contains(&status)
}

#[cfg(test)]
mod test {
    use super::*;

    fn level(svns: &[u8], status: &str) -> TcbLevel {
        TcbLevel {
            tcb: Tcb {
                tdx_tcb_components: svns
                    .iter()
                    .map(|svn| TcbComponent { svn: *svn })
                    .collect(),
            },
            tcb_status: status.to_owned(),
        }
    }

    #[test]
    fn first_satisfied_level_wins() {
        let levels = vec![
            level(&[5; 16], "UpToDate"),
            level(&[2; 16], "OutOfDate"),
        ];
        let platform = [3u8; 16];
        assert_eq!(select_level(&levels, &platform).unwrap(), "OutOfDate");
        let platform = [5u8; 16];
        assert_eq!(select_level(&levels, &platform).unwrap(), "UpToDate");
    }

    #[test]
    fn no_level_matches() {
        let levels = vec![level(&[9; 16], "UpToDate")];
        assert!(matches!(
            select_level(&levels, &[1u8; 16]),
            Err(PccsError::NoMatchingLevel)
        ));
    }

    #[test]
    fn status_classes() {
        assert!(status_is_acceptable("UpToDate"));
        assert!(status_is_acceptable("ConfigurationNeeded"));
        assert!(!status_is_acceptable("Revoked"));
        assert!(!status_is_acceptable("OutOfDate"));
    }
}
