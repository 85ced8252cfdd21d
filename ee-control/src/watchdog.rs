//! The health watchdog: a connected agent that stops reporting health is
//! marked failed so `allowed` flips off and settlement sees the gap.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ee_api::{reasons, status::HealthStatus};
use ee_common::shutdown::ShutdownSignal;
use tracing::{info, warn};

use crate::state::SharedState;

pub async fn run(state: SharedState, shutdown: ShutdownSignal) {
    let interval = state.config.health_timeout;
    loop {
        tokio::select! {
            () = shutdown.recv() => break,
            () = tokio::time::sleep(interval) => {}
        }
        sweep_at(&state, Utc::now());
    }
}

/// One watchdog pass at time `now`. Connected records whose last health
/// report (or registration, if none ever arrived) is older than the
/// timeout are failed, once.
pub fn sweep_at(state: &SharedState, now: DateTime<Utc>) {
    let timeout = ChronoDuration::from_std(state.config.health_timeout)
        .unwrap_or_else(|_| ChronoDuration::seconds(120));

    for record in state.registry.list() {
        if !record.ws_connected || record.health_status == HealthStatus::Fail {
            continue;
        }
        let last_seen = record.last_health_at.unwrap_or(record.registered_at);
        if now - last_seen <= timeout {
            continue;
        }

        info!(app = %record.app_name, "health report overdue, marking fail");
        let _ = state.registry.mark_health(&record.app_name, HealthStatus::Fail);
        if let Err(e) = state.ledger.mark_health(&record.agent_id, "fail") {
            warn!("mark_health failed: {e}");
        }
        if let Err(e) = state.ledger.record_node_event(
            &record.agent_id,
            reasons::EVENT_HEALTH_MISS,
            Some("timeout"),
        ) {
            warn!("failed to record health_miss: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{config::Config, state::ControlPlane};

    fn state() -> SharedState {
        Arc::new(ControlPlane::for_testing(Config::from_env()))
    }

    fn connect_app(state: &SharedState, app: &str) {
        state
            .registry
            .register(app, "acme/app", "v1", "forge-1", "agent-1")
            .unwrap();
        state
            .registry
            .mark_connection(app, true, Some("t:1"))
            .unwrap();
        state
            .registry
            .mark_health(app, HealthStatus::Pass)
            .unwrap();
    }

    #[test]
    fn overdue_connected_app_fails() {
        let state = state();
        connect_app(&state, "demo");

        // Fresh health report: nothing happens.
        sweep_at(&state, Utc::now());
        assert_eq!(
            state.registry.get("demo").unwrap().health_status,
            HealthStatus::Pass
        );

        // Well past the timeout: failed exactly once.
        let later = Utc::now() + ChronoDuration::hours(2);
        sweep_at(&state, later);
        assert_eq!(
            state.registry.get("demo").unwrap().health_status,
            HealthStatus::Fail
        );

        // A second pass is a no-op (already failed).
        sweep_at(&state, later + ChronoDuration::hours(1));
        assert_eq!(
            state.registry.get("demo").unwrap().health_status,
            HealthStatus::Fail
        );
    }

    #[test]
    fn disconnected_apps_are_ignored() {
        let state = state();
        connect_app(&state, "demo");
        state
            .registry
            .mark_connection("demo", false, None)
            .unwrap();

        sweep_at(&state, Utc::now() + ChronoDuration::hours(2));
        // Still whatever it was; the disconnect path owns failing it.
        assert_eq!(
            state.registry.get("demo").unwrap().health_status,
            HealthStatus::Pass
        );
    }
}
