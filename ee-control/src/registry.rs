//! The in-memory app registry.
//!
//! Volatile by design: agents re-register on reconnect, so a restart costs
//! nothing but a reconnect storm. The registry is the only owner of
//! [`AppRecord`]s; everyone else sees cloned snapshots or derived
//! [`AppStatus`] payloads.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use chrono::{DateTime, Duration, Utc};
use ee_api::status::{AppStatus, AttestationStatus, HealthStatus, RegistrationState};

#[derive(Clone, Debug)]
pub struct AppRecord {
    pub app_name: String,
    pub repo: String,
    pub release_tag: String,
    pub network: String,
    pub agent_id: String,
    pub registered_at: DateTime<Utc>,
    pub registration_expires_at: DateTime<Utc>,
    pub last_attested_at: Option<DateTime<Utc>>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub sealed: bool,
    pub attestation_status: AttestationStatus,
    pub health_status: HealthStatus,
    pub ws_connected: bool,
    pub tunnel_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("app_name already bound to a different repo")]
    AppAlreadyBoundToRepo,
    #[error("unknown app")]
    UnknownApp,
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub ttl_days: i64,
    pub warn_days: i64,
    pub sealed_networks: Vec<String>,
}

pub struct Registry {
    config: RegistryConfig,
    apps: RwLock<HashMap<String, AppRecord>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            apps: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, app_name: &str) -> Option<AppRecord> {
        self.apps.read().expect("registry poisoned").get(app_name).cloned()
    }

    pub fn list(&self) -> Vec<AppRecord> {
        let mut records: Vec<_> = self
            .apps
            .read()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        records
    }

    /// Create or refresh a registration. Rebinding an app name to a
    /// different repo is refused; a repeat registration advances the TTL
    /// window and preserves attestation/health marks.
    pub fn register(
        &self,
        app_name: &str,
        repo: &str,
        release_tag: &str,
        network: &str,
        agent_id: &str,
    ) -> Result<AppRecord, RegistryError> {
        let now = Utc::now();
        let expires_at = now + Duration::days(self.config.ttl_days);
        let mut apps = self.apps.write().expect("registry poisoned");

        if let Some(record) = apps.get_mut(app_name) {
            if record.repo != repo {
                return Err(RegistryError::AppAlreadyBoundToRepo);
            }
            record.release_tag = release_tag.to_owned();
            record.network = network.to_owned();
            record.agent_id = agent_id.to_owned();
            record.registered_at = now;
            record.registration_expires_at = expires_at;
            return Ok(record.clone());
        }

        let record = AppRecord {
            app_name: app_name.to_owned(),
            repo: repo.to_owned(),
            release_tag: release_tag.to_owned(),
            network: network.to_owned(),
            agent_id: agent_id.to_owned(),
            registered_at: now,
            registration_expires_at: expires_at,
            last_attested_at: None,
            last_health_at: None,
            sealed: false,
            attestation_status: AttestationStatus::Unknown,
            health_status: HealthStatus::Unknown,
            ws_connected: false,
            tunnel_id: None,
        };
        apps.insert(app_name.to_owned(), record.clone());
        Ok(record)
    }

    pub fn mark_attested(
        &self,
        app_name: &str,
        sealed: bool,
        status: AttestationStatus,
    ) -> Result<(), RegistryError> {
        self.update(app_name, |record| {
            record.last_attested_at = Some(Utc::now());
            record.sealed = sealed;
            record.attestation_status = status;
        })
    }

    pub fn mark_health(
        &self,
        app_name: &str,
        status: HealthStatus,
    ) -> Result<(), RegistryError> {
        self.update(app_name, |record| {
            record.last_health_at = Some(Utc::now());
            record.health_status = status;
        })
    }

    pub fn mark_connection(
        &self,
        app_name: &str,
        connected: bool,
        tunnel_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.update(app_name, |record| {
            record.ws_connected = connected;
            record.tunnel_id = tunnel_id.map(str::to_owned);
        })
    }

    fn update(
        &self,
        app_name: &str,
        mutate: impl FnOnce(&mut AppRecord),
    ) -> Result<(), RegistryError> {
        let mut apps = self.apps.write().expect("registry poisoned");
        let record = apps.get_mut(app_name).ok_or(RegistryError::UnknownApp)?;
        mutate(record);
        Ok(())
    }

    pub fn registration_state(&self, record: &AppRecord) -> RegistrationState {
        registration_state_at(record, Utc::now(), self.config.warn_days)
    }

    /// The externally-observable view, with the derived `allowed` flag.
    pub fn status_payload(&self, record: &AppRecord) -> AppStatus {
        let state = self.registration_state(record);
        let sealed_required = self
            .config
            .sealed_networks
            .iter()
            .any(|n| n == &record.network);
        let allowed = state == RegistrationState::Active
            && record.attestation_status == AttestationStatus::Valid
            && record.health_status == HealthStatus::Pass
            && record.ws_connected
            && (!sealed_required || record.sealed);

        AppStatus {
            app_name: record.app_name.clone(),
            repo: record.repo.clone(),
            release_tag: record.release_tag.clone(),
            network: record.network.clone(),
            agent_id: record.agent_id.clone(),
            registered_at: record.registered_at,
            registration_expires_at: record.registration_expires_at,
            registration_state: state,
            sealed: record.sealed,
            attestation_status: record.attestation_status,
            health_status: record.health_status,
            ws_connected: record.ws_connected,
            last_attested_at: record.last_attested_at,
            last_health_at: record.last_health_at,
            allowed,
        }
    }
}

fn registration_state_at(
    record: &AppRecord,
    now: DateTime<Utc>,
    warn_days: i64,
) -> RegistrationState {
    if now >= record.registration_expires_at {
        return RegistrationState::Expired;
    }
    if now >= record.registration_expires_at - Duration::days(warn_days) {
        return RegistrationState::Warning;
    }
    RegistrationState::Active
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> Registry {
        Registry::new(RegistryConfig {
            ttl_days: 30,
            warn_days: 3,
            sealed_networks: vec!["forge-1".to_owned()],
        })
    }

    fn register_demo(registry: &Registry) -> AppRecord {
        registry
            .register("demo", "acme/app", "v1", "forge-1", "agent-1")
            .unwrap()
    }

    #[test]
    fn register_is_idempotent_but_repo_bound() {
        let registry = registry();
        let first = register_demo(&registry);

        // Same identity re-registers fine; timestamps advance.
        let again = registry
            .register("demo", "acme/app", "v2", "forge-1", "agent-1")
            .unwrap();
        assert!(again.registered_at >= first.registered_at);
        assert_eq!(again.release_tag, "v2");

        // A different repo may not steal the name.
        let err = registry
            .register("demo", "evil/app", "v1", "forge-1", "agent-2")
            .unwrap_err();
        assert_eq!(err, RegistryError::AppAlreadyBoundToRepo);
    }

    #[test]
    fn register_preserves_marks() {
        let registry = registry();
        register_demo(&registry);
        registry
            .mark_attested("demo", true, AttestationStatus::Valid)
            .unwrap();
        registry.mark_health("demo", HealthStatus::Pass).unwrap();

        registry
            .register("demo", "acme/app", "v2", "forge-1", "agent-1")
            .unwrap();
        let record = registry.get("demo").unwrap();
        assert_eq!(record.attestation_status, AttestationStatus::Valid);
        assert_eq!(record.health_status, HealthStatus::Pass);
        assert!(record.sealed);
    }

    #[test]
    fn allowed_requires_every_gate() {
        let registry = registry();
        register_demo(&registry);

        let not_yet = registry.status_payload(&registry.get("demo").unwrap());
        assert!(!not_yet.allowed);

        registry
            .mark_attested("demo", true, AttestationStatus::Valid)
            .unwrap();
        registry.mark_health("demo", HealthStatus::Pass).unwrap();
        registry
            .mark_connection("demo", true, Some("demo:abc"))
            .unwrap();

        let payload = registry.status_payload(&registry.get("demo").unwrap());
        assert!(payload.allowed);
        assert_eq!(payload.registration_state, RegistrationState::Active);

        // Sealed networks refuse unsealed attestations.
        registry
            .mark_attested("demo", false, AttestationStatus::Valid)
            .unwrap();
        let unsealed = registry.status_payload(&registry.get("demo").unwrap());
        assert!(!unsealed.allowed);

        // Non-sealed networks don't care.
        registry
            .register("dev-app", "acme/dev", "v1", "dev", "agent-9")
            .unwrap();
        registry
            .mark_attested("dev-app", false, AttestationStatus::Valid)
            .unwrap();
        registry.mark_health("dev-app", HealthStatus::Pass).unwrap();
        registry
            .mark_connection("dev-app", true, Some("dev-app:x"))
            .unwrap();
        assert!(
            registry
                .status_payload(&registry.get("dev-app").unwrap())
                .allowed
        );
    }

    #[test]
    fn expiry_is_a_pure_function_of_time() {
        let registry = registry();
        let record = register_demo(&registry);

        let just_registered = Utc::now();
        assert_eq!(
            registration_state_at(&record, just_registered, 3),
            RegistrationState::Active
        );
        let near_expiry = record.registration_expires_at - Duration::days(1);
        assert_eq!(
            registration_state_at(&record, near_expiry, 3),
            RegistrationState::Warning
        );
        let expired = record.registration_expires_at + Duration::seconds(1);
        assert_eq!(
            registration_state_at(&record, expired, 3),
            RegistrationState::Expired
        );
    }

    #[test]
    fn mark_requires_existing_record() {
        let registry = registry();
        assert_eq!(
            registry.mark_health("ghost", HealthStatus::Pass).unwrap_err(),
            RegistryError::UnknownApp
        );
    }
}
