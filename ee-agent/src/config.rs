//! Agent configuration, read once at startup from `EE_*` variables.

use std::{path::PathBuf, time::Duration};

use ee_common::{env, ids};

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub main_port: u16,

    /// Control plane WebSocket URL; unset disables the tunnel client.
    pub control_ws: Option<String>,
    pub repo: String,
    pub release_tag: String,
    pub app_name: String,
    pub network: String,
    pub agent_id: String,
    /// Local workload the tunnel proxies into.
    pub backend_url: String,
    pub health_interval: Duration,
    pub reconnect_delay: Duration,

    pub ratls_enabled: bool,
    pub ratls_cert_ttl: Duration,
    pub ratls_skip_pccs: bool,
    pub ratls_allow_fake_quote: bool,
    pub ratls_dir: PathBuf,

    /// Directory whose tree is hashed into `agent_dir_sha256`.
    pub agent_dir: PathBuf,
    /// Where deployment state JSON lives.
    pub state_dir: PathBuf,
    /// Where workload bundles are installed.
    pub workload_dir: PathBuf,
    pub github_token: Option<String>,

    pub vm_image_id_path: PathBuf,
    pub sealed: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let agent_dir = env::var("EE_AGENT_DIR")
            .map(PathBuf::from)
            .or_else(default_agent_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            bind: env::var_or("EE_BIND", "0.0.0.0"),
            main_port: env::parse_or("EE_MAIN_PORT", 8000),

            control_ws: env::var("EE_CONTROL_WS"),
            repo: env::var_or("EE_REPO", ""),
            release_tag: env::var_or("EE_RELEASE_TAG", ""),
            app_name: env::var_or("EE_APP_NAME", ""),
            network: env::var_or("EE_NETWORK", "forge-1"),
            agent_id: env::var("EE_AGENT_ID").unwrap_or_else(ids::new_id),
            backend_url: env::var_or("EE_BACKEND_URL", "http://127.0.0.1:8080"),
            health_interval: Duration::from_secs(env::parse_or(
                "EE_HEALTH_INTERVAL_SEC",
                60,
            )),
            reconnect_delay: Duration::from_secs(env::parse_or(
                "EE_RECONNECT_DELAY_SEC",
                5,
            )),

            ratls_enabled: env::bool_or("EE_RATLS_ENABLED", true),
            ratls_cert_ttl: Duration::from_secs(env::parse_or(
                "EE_RATLS_CERT_TTL_SEC",
                3600,
            )),
            ratls_skip_pccs: env::bool_or("EE_RATLS_SKIP_PCCS", false),
            ratls_allow_fake_quote: env::bool_or("EE_RATLS_ALLOW_FAKE_QUOTE", false),
            ratls_dir: PathBuf::from(env::var_or(
                "EE_RATLS_DIR",
                "/var/lib/easy-enclave/ratls",
            )),

            agent_dir,
            state_dir: PathBuf::from(env::var_or(
                "EE_STATE_DIR",
                "/var/lib/easy-enclave/deployments",
            )),
            workload_dir: PathBuf::from(env::var_or("EE_WORKLOAD_DIR", "/opt/workload")),
            github_token: env::var("EE_GITHUB_TOKEN"),

            vm_image_id_path: PathBuf::from(env::var_or(
                "EE_VM_IMAGE_ID_PATH",
                "/etc/easy-enclave/vm_image_id",
            )),
            sealed: env::bool_or("SEAL_VM", false),
        }
    }

    /// The VM image identifier: `VM_IMAGE_ID` env, else the well-known file.
    pub fn vm_image_id(&self) -> anyhow::Result<String> {
        if let Some(id) = env::var("VM_IMAGE_ID") {
            return Ok(id);
        }
        let id = std::fs::read_to_string(&self.vm_image_id_path)
            .map_err(|e| anyhow::anyhow!("VM image id unavailable: {e}"))?;
        Ok(id.trim().to_owned())
    }
}

fn default_agent_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
}
