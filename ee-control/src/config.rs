//! Control plane configuration.
//!
//! Built once at startup from `EE_*` environment variables and passed by
//! reference; nothing else in the process reads the environment. Role
//! tokens are hashed here so request handling only ever compares digests.

use std::{path::PathBuf, time::Duration};

use ee_common::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub control_port: u16,
    pub proxy_bind: String,
    pub proxy_port: u16,

    pub db_path: PathBuf,
    pub allowlist_asset: String,
    pub github_token: Option<String>,
    pub pccs_url: Option<String>,

    /// SHA-256 of each role's bearer token; a `None` disables the check.
    pub admin_token_hash: Option<[u8; 32]>,
    pub launcher_token_hash: Option<[u8; 32]>,
    pub uptime_token_hash: Option<[u8; 32]>,

    pub ratls_enabled: bool,
    pub ratls_cert_ttl: Duration,
    pub ratls_require_client_cert: bool,
    pub ratls_skip_pccs: bool,
    /// Accept structurally-valid quotes without an Intel chain. Development
    /// environments without TDX hardware only.
    pub ratls_allow_fake_quote: bool,
    pub ratls_dir: PathBuf,

    pub attest_interval: Duration,
    pub attest_deadline: Duration,
    pub registration_ttl_days: i64,
    pub registration_warn_days: i64,
    pub health_timeout: Duration,
    pub proxy_timeout: Duration,

    /// Networks agents may register on.
    pub allowed_networks: Vec<String>,
    /// Networks that refuse unsealed images.
    pub sealed_networks: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: env::var_or("EE_CONTROL_BIND", "0.0.0.0"),
            control_port: env::parse_or("EE_CONTROL_PORT", 8088),
            proxy_bind: env::var_or("EE_PROXY_BIND", "0.0.0.0"),
            proxy_port: env::parse_or("EE_PROXY_PORT", 9090),

            db_path: PathBuf::from(env::var_or(
                "EE_DB_PATH",
                "data/control-plane.db",
            )),
            allowlist_asset: env::var_or(
                "EE_ALLOWLIST_ASSET",
                "agent-attestation-allowlist.json",
            ),
            github_token: env::var("EE_GITHUB_TOKEN"),
            pccs_url: env::var("EE_PCCS_URL"),

            admin_token_hash: env::var("EE_ADMIN_TOKEN").map(|t| hash_token(&t)),
            launcher_token_hash: env::var("EE_LAUNCHER_TOKEN").map(|t| hash_token(&t)),
            uptime_token_hash: env::var("EE_UPTIME_TOKEN").map(|t| hash_token(&t)),

            ratls_enabled: env::bool_or("EE_RATLS_ENABLED", true),
            ratls_cert_ttl: Duration::from_secs(env::parse_or(
                "EE_RATLS_CERT_TTL_SEC",
                3600,
            )),
            ratls_require_client_cert: env::bool_or("EE_RATLS_REQUIRE_CLIENT_CERT", true),
            ratls_skip_pccs: env::bool_or("EE_RATLS_SKIP_PCCS", false),
            ratls_allow_fake_quote: env::bool_or("EE_RATLS_ALLOW_FAKE_QUOTE", false),
            ratls_dir: PathBuf::from(env::var_or(
                "EE_RATLS_DIR",
                "/var/lib/easy-enclave/ratls",
            )),

            attest_interval: Duration::from_secs(env::parse_or(
                "EE_ATTEST_INTERVAL_SEC",
                3600,
            )),
            attest_deadline: Duration::from_secs(env::parse_or(
                "EE_ATTEST_DEADLINE_SEC",
                30,
            )),
            registration_ttl_days: env::parse_or("EE_REGISTRATION_TTL_DAYS", 30),
            registration_warn_days: env::parse_or("EE_REGISTRATION_WARN_DAYS", 3),
            health_timeout: Duration::from_secs(env::parse_or(
                "EE_HEALTH_TIMEOUT_SEC",
                120,
            )),
            proxy_timeout: Duration::from_secs(env::parse_or("EE_PROXY_TIMEOUT_SEC", 15)),

            allowed_networks: vec![
                "forge-1".to_owned(),
                "staging".to_owned(),
                "dev".to_owned(),
            ],
            sealed_networks: vec!["forge-1".to_owned()],
        }
    }

    pub fn network_allowed(&self, network: &str) -> bool {
        self.allowed_networks.iter().any(|n| n == network)
    }
}

pub fn hash_token(token: &str) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, token.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Constant-time bearer comparison against a pre-hashed token.
pub fn token_matches(provided: &str, expected_hash: &[u8; 32]) -> bool {
    let provided_hash = hash_token(provided);
    ring::constant_time::verify_slices_are_equal(&provided_hash, expected_hash).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_hash_compare() {
        let hash = hash_token("sekrit");
        assert!(token_matches("sekrit", &hash));
        assert!(!token_matches("guess", &hash));
    }

    #[test]
    fn sealed_network_default() {
        let config = Config::from_env();
        assert!(config.network_allowed("forge-1"));
        assert!(config.network_allowed("dev"));
        assert!(!config.network_allowed("prod-2"));
        assert_eq!(config.sealed_networks, vec!["forge-1".to_owned()]);
    }
}
