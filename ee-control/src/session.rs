//! The per-WebSocket session state machine.
//!
//! One reader task per socket handles frames in receive order. A writer
//! task owns the socket's send half; everything else (attestation loop,
//! deadline watchdogs, proxy bridging) talks to the socket only through the
//! outbound mpsc channel. Closing the session is a [`ShutdownSignal`] so
//! every helper task observes it and exits; no work outlives the socket.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::extract::ws::{Message, WebSocket};
use ee_api::{
    reasons,
    status::{AttestationStatus, HealthStatus},
    tunnel::{
        AttestRequest, AttestResponse, Health, Register, TunnelFrame,
    },
};
use ee_common::{ids, shutdown::ShutdownSignal, task::EeTask};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{policy, state::SharedState, tunnels::SessionHandle};

/// Reason tag for an app name already owned by another repo.
pub const APP_ALREADY_BOUND: &str = "app_already_bound";

#[derive(Clone)]
struct PendingAttest {
    nonce: String,
    sent_at: Instant,
}

/// Session identity, populated by the `register` frame.
#[derive(Clone)]
struct Identity {
    repo: String,
    release_tag: String,
    app_name: String,
    agent_id: String,
    network: String,
    tunnel_id: String,
}

/// State shared between the reader task and the attestation timers.
struct Round {
    state: SharedState,
    out: mpsc::Sender<TunnelFrame>,
    close: ShutdownSignal,
    pending: Mutex<Option<PendingAttest>>,
    identity: Mutex<Option<Identity>>,
}

impl Round {
    async fn send(&self, frame: TunnelFrame) {
        if self.out.send(frame).await.is_err() {
            self.close.send();
        }
    }

    fn agent_id(&self) -> Option<String> {
        self.identity
            .lock()
            .expect("identity poisoned")
            .as_ref()
            .map(|identity| identity.agent_id.clone())
    }

    fn record_attest_miss(&self, detail: &str) {
        if let Some(agent_id) = self.agent_id() {
            if let Err(e) = self.state.ledger.record_node_event(
                &agent_id,
                reasons::EVENT_ATTEST_MISS,
                Some(detail),
            ) {
                warn!("failed to record attest_miss: {e}");
            }
        }
    }
}

/// Start an attestation round unless one is already in flight. Arms a
/// watchdog that closes the session if the nonce is still pending at the
/// deadline. Rounds are strictly sequential per session.
async fn start_attest_round(round: &Arc<Round>, reason: &str) {
    let deadline = round.state.config.attest_deadline;
    let nonce = {
        let mut pending = round.pending.lock().expect("pending attest poisoned");
        if pending.is_some() {
            return;
        }
        let nonce = ids::new_nonce();
        *pending = Some(PendingAttest {
            nonce: nonce.clone(),
            sent_at: Instant::now(),
        });
        nonce
    };

    round
        .send(TunnelFrame::AttestRequest(AttestRequest {
            nonce: nonce.clone(),
            deadline_s: deadline.as_secs(),
            reason: reason.to_owned(),
        }))
        .await;

    let watchdog = round.clone();
    EeTask::spawn("attest-watchdog", async move {
        tokio::select! {
            () = watchdog.close.recv() => return,
            () = tokio::time::sleep(deadline) => {}
        }
        let still_pending = watchdog
            .pending
            .lock()
            .expect("pending attest poisoned")
            .as_ref()
            .is_some_and(|pending| pending.nonce == nonce);
        if still_pending {
            watchdog
                .send(TunnelFrame::status_invalid(reasons::ATTESTATION_TIMEOUT))
                .await;
            watchdog.record_attest_miss("timeout");
            watchdog.close.send();
        }
    })
    .detach();
}

/// Serve one accepted control-channel WebSocket until it closes.
pub async fn serve_session(state: SharedState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<TunnelFrame>(64);
    let close = ShutdownSignal::new();

    let round = Arc::new(Round {
        state: state.clone(),
        out: out_tx.clone(),
        close: close.clone(),
        pending: Mutex::new(None),
        identity: Mutex::new(None),
    });

    // Writer task: the only owner of the socket's send half.
    let writer_close = close.clone();
    let writer = EeTask::spawn("session-writer", async move {
        loop {
            tokio::select! {
                biased;
                () = writer_close.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        let json = serde_json::to_string(&frame)
                            .expect("frames always serialize");
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            writer_close.send();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let mut session = Session {
        round: round.clone(),
        registered: false,
        handle: None,
        attest_loop: None,
    };

    loop {
        tokio::select! {
            () = close.recv() => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) =>
                    session.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong/binary: transport noise
                Some(Err(e)) => {
                    debug!("session socket error: {e}");
                    break;
                }
            }
        }
    }

    session.disconnect();
    close.send();
    let _ = writer.await;
}

struct Session {
    round: Arc<Round>,
    registered: bool,
    handle: Option<Arc<SessionHandle>>,
    attest_loop: Option<EeTask<()>>,
}

impl Session {
    async fn handle_text(&mut self, text: &str) {
        let frame: TunnelFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.round
                    .send(TunnelFrame::status_invalid(reasons::INVALID_JSON))
                    .await;
                return;
            }
        };

        match frame {
            TunnelFrame::Register(register) => self.handle_register(register).await,
            TunnelFrame::AttestResponse(response) =>
                self.handle_attest_response(response).await,
            TunnelFrame::Health(health) => self.handle_health(health).await,
            TunnelFrame::ProxyResponse(response) => {
                if let Some(handle) = &self.handle {
                    handle.complete(response);
                }
            }
            TunnelFrame::AttestRequest(_)
            | TunnelFrame::ProxyRequest(_)
            | TunnelFrame::Status(_)
            | TunnelFrame::Unknown => {
                self.round
                    .send(TunnelFrame::status_invalid(reasons::UNKNOWN_MESSAGE))
                    .await;
            }
        }
    }

    async fn handle_register(&mut self, register: Register) {
        let state = &self.round.state;
        if !state.config.network_allowed(&register.network) {
            self.round
                .send(TunnelFrame::status_invalid(reasons::INVALID_NETWORK))
                .await;
            return;
        }
        if register.repo.is_empty()
            || register.release_tag.is_empty()
            || register.app_name.is_empty()
            || register.agent_id.is_empty()
        {
            self.round
                .send(TunnelFrame::status_invalid(reasons::MISSING_FIELDS))
                .await;
            return;
        }

        let tunnel_id = format!("{}:{}", register.app_name, &ids::new_id()[..16]);
        *self.round.identity.lock().expect("identity poisoned") = Some(Identity {
            repo: register.repo.clone(),
            release_tag: register.release_tag.clone(),
            app_name: register.app_name.clone(),
            agent_id: register.agent_id.clone(),
            network: register.network.clone(),
            tunnel_id,
        });

        if let Err(e) = state.ledger.ensure_node(&register.agent_id) {
            warn!("ensure_node failed for {}: {e}", register.agent_id);
        }

        start_attest_round(&self.round, "register").await;
    }

    async fn handle_attest_response(&mut self, response: AttestResponse) {
        let pending = self
            .round
            .pending
            .lock()
            .expect("pending attest poisoned")
            .clone();
        let pending = match pending {
            Some(pending) => pending,
            None => {
                self.round
                    .send(TunnelFrame::status_invalid(reasons::UNEXPECTED_ATTESTATION))
                    .await;
                return;
            }
        };

        if response.nonce != pending.nonce {
            self.round
                .send(TunnelFrame::status_invalid(reasons::NONCE_MISMATCH))
                .await;
            self.round.record_attest_miss(reasons::NONCE_MISMATCH);
            self.round.close.send();
            return;
        }
        if pending.sent_at.elapsed() > self.round.state.config.attest_deadline {
            self.round
                .send(TunnelFrame::status_invalid(reasons::ATTESTATION_TIMEOUT))
                .await;
            self.round.record_attest_miss("timeout");
            self.round.close.send();
            return;
        }
        *self.round.pending.lock().expect("pending attest poisoned") = None;

        let identity = self
            .round
            .identity
            .lock()
            .expect("identity poisoned")
            .clone();
        let identity = match identity {
            Some(identity) => identity,
            None => {
                self.round
                    .send(TunnelFrame::status_invalid(reasons::UNEXPECTED_ATTESTATION))
                    .await;
                return;
            }
        };

        let outcome = self.verify(&identity, &response).await;
        let state = &self.round.state;

        if !outcome.verified {
            // Keep the record observable with its failed attestation.
            let _ = state.registry.register(
                &identity.app_name,
                &identity.repo,
                &identity.release_tag,
                &identity.network,
                &identity.agent_id,
            );
            let _ = state.registry.mark_attested(
                &identity.app_name,
                outcome.sealed,
                AttestationStatus::Invalid,
            );
            if let Err(e) = state.ledger.mark_attestation(&identity.agent_id, "invalid") {
                warn!("mark_attestation failed: {e}");
            }
            self.round.record_attest_miss(&outcome.reason);
            info!(
                app = %identity.app_name,
                reason = %outcome.reason,
                "attestation rejected"
            );
            self.round
                .send(TunnelFrame::status_invalid(&outcome.reason))
                .await;
            self.round.close.send();
            return;
        }

        if let Err(e) = state.registry.register(
            &identity.app_name,
            &identity.repo,
            &identity.release_tag,
            &identity.network,
            &identity.agent_id,
        ) {
            debug!("registration refused: {e}");
            self.round
                .send(TunnelFrame::status_invalid(APP_ALREADY_BOUND))
                .await;
            self.round.close.send();
            return;
        }
        let _ = state.registry.mark_attested(
            &identity.app_name,
            outcome.sealed,
            AttestationStatus::Valid,
        );
        let _ = state.registry.mark_connection(
            &identity.app_name,
            true,
            Some(&identity.tunnel_id),
        );
        let _ = state.registry.mark_health(&identity.app_name, HealthStatus::Pass);
        if let Err(e) = state.ledger.mark_attestation(&identity.agent_id, "valid") {
            warn!("mark_attestation failed: {e}");
        }
        if let Err(e) = state.ledger.mark_health(&identity.agent_id, "pass") {
            warn!("mark_health failed: {e}");
        }

        self.round.send(TunnelFrame::status_ok("attested")).await;
        info!(app = %identity.app_name, sealed = outcome.sealed, "agent admitted");

        if !self.registered {
            self.registered = true;
            let handle = Arc::new(SessionHandle::new(
                identity.tunnel_id.clone(),
                self.round.out.clone(),
            ));
            state.tunnels.insert(&identity.app_name, handle.clone());
            self.handle = Some(handle);

            let round = self.round.clone();
            let interval = state.config.attest_interval;
            self.attest_loop = Some(EeTask::spawn("attest-loop", async move {
                loop {
                    tokio::select! {
                        () = round.close.recv() => break,
                        () = tokio::time::sleep(interval) => {}
                    }
                    if round.close.is_sent() {
                        break;
                    }
                    start_attest_round(&round, "periodic").await;
                }
            }));
        }
    }

    async fn verify(
        &self,
        identity: &Identity,
        response: &AttestResponse,
    ) -> policy::AttestationOutcome {
        let state = &self.round.state;
        let allowlist = match state
            .allowlists
            .get(&identity.repo, &identity.release_tag)
            .await
        {
            Ok(allowlist) => allowlist,
            Err(e) =>
                return policy::AttestationOutcome {
                    verified: false,
                    reason: reasons::allowlist_fetch_failed(e),
                    sealed: false,
                    report_data: None,
                },
        };

        let require_sealed = state
            .config
            .sealed_networks
            .iter()
            .any(|network| network == &identity.network);
        policy::verify_attestation(
            response,
            &allowlist,
            require_sealed,
            state.config.pccs_url.as_deref(),
            state.config.ratls_skip_pccs,
            &state.http,
        )
        .await
    }

    async fn handle_health(&mut self, health: Health) {
        if !self.registered {
            self.round
                .send(TunnelFrame::status_invalid(reasons::NOT_REGISTERED))
                .await;
            return;
        }
        let status = match health.status.as_str() {
            "pass" => HealthStatus::Pass,
            _ => HealthStatus::Fail,
        };
        let identity = self
            .round
            .identity
            .lock()
            .expect("identity poisoned")
            .clone();
        if let Some(identity) = identity {
            let state = &self.round.state;
            let _ = state.registry.mark_health(&identity.app_name, status);
            let label = if status == HealthStatus::Pass { "pass" } else { "fail" };
            if let Err(e) = state.ledger.mark_health(&identity.agent_id, label) {
                warn!("mark_health failed: {e}");
            }
        }
    }

    /// Socket gone: fail pending proxies, mark the record disconnected and
    /// unhealthy, and let settlement know the period was interrupted.
    fn disconnect(&mut self) {
        if let Some(attest_loop) = self.attest_loop.take() {
            attest_loop.abort();
        }
        if let Some(handle) = self.handle.take() {
            handle.fail_all();
        }

        let identity = self
            .round
            .identity
            .lock()
            .expect("identity poisoned")
            .clone();
        let identity = match identity {
            Some(identity) => identity,
            None => return,
        };
        if !self.registered {
            return;
        }

        let state = &self.round.state;
        state
            .tunnels
            .remove(&identity.app_name, &identity.tunnel_id);
        let _ = state.registry.mark_connection(
            &identity.app_name,
            false,
            Some(&identity.tunnel_id),
        );
        let _ = state.registry.mark_health(&identity.app_name, HealthStatus::Fail);
        if let Err(e) = state.ledger.mark_health(&identity.agent_id, "fail") {
            warn!("mark_health failed: {e}");
        }
        if let Err(e) = state.ledger.record_node_event(
            &identity.agent_id,
            reasons::EVENT_HEALTH_MISS,
            Some("disconnect"),
        ) {
            warn!("failed to record health_miss: {e}");
        }
        info!(app = %identity.app_name, "session disconnected");
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::{config::Config, state::ControlPlane};

    fn round() -> (StdArc<Round>, mpsc::Receiver<TunnelFrame>) {
        let mut config = Config::from_env();
        config.attest_deadline = Duration::from_millis(100);
        let state = StdArc::new(ControlPlane::for_testing(config));
        let (out_tx, out_rx) = mpsc::channel(8);
        let round = StdArc::new(Round {
            state,
            out: out_tx,
            close: ShutdownSignal::new(),
            pending: Mutex::new(None),
            identity: Mutex::new(None),
        });
        (round, out_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn attestation_is_single_flight() {
        let (round, mut out_rx) = round();
        start_attest_round(&round, "register").await;
        start_attest_round(&round, "periodic").await;

        // Exactly one challenge in flight.
        let first = out_rx.recv().await.unwrap();
        assert!(matches!(first, TunnelFrame::AttestRequest(_)));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_closes_on_deadline() {
        let (round, mut out_rx) = round();
        start_attest_round(&round, "register").await;
        let _challenge = out_rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // The watchdog sent the timeout status and closed the session.
        match out_rx.recv().await.unwrap() {
            TunnelFrame::Status(status) => {
                assert_eq!(status.state, "invalid");
                assert_eq!(status.reason, reasons::ATTESTATION_TIMEOUT);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(round.close.is_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_round_quiesces_watchdog() {
        let (round, mut out_rx) = round();
        start_attest_round(&round, "register").await;
        let _challenge = out_rx.recv().await.unwrap();

        // The reader clears the pending nonce on a (validated) response.
        *round.pending.lock().unwrap() = None;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(out_rx.try_recv().is_err());
        assert!(!round.close.is_sent());
    }
}
