//! Live tunnel handles: the bridge between HTTP handlers and sessions.
//!
//! A [`SessionHandle`] is the only cross-task surface of a session: an
//! outbound frame channel plus the id-keyed map of pending proxy requests.
//! HTTP handlers insert a completion and send `proxy_request`; the session's
//! reader task completes it when `proxy_response` arrives.

use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
    time::Duration,
};

use ee_api::tunnel::{ProxyRequest, ProxyResponse, TunnelFrame};
use tokio::sync::{mpsc, oneshot};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxyError {
    /// The session is gone (socket closed before or during the request).
    NoTunnel,
    /// The agent did not answer within the proxy timeout.
    Timeout,
}

pub struct SessionHandle {
    pub tunnel_id: String,
    out: mpsc::Sender<TunnelFrame>,
    pending: Mutex<HashMap<String, oneshot::Sender<ProxyResponse>>>,
}

impl SessionHandle {
    pub fn new(tunnel_id: String, out: mpsc::Sender<TunnelFrame>) -> Self {
        Self {
            tunnel_id,
            out,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send one request through the tunnel and await the agent's response.
    pub async fn proxy(
        &self,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, ProxyError> {
        let request_id = request.request_id.clone();
        let (completion_tx, completion_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending proxy map poisoned")
            .insert(request_id.clone(), completion_tx);

        if self
            .out
            .send(TunnelFrame::ProxyRequest(request))
            .await
            .is_err()
        {
            self.forget(&request_id);
            return Err(ProxyError::NoTunnel);
        }

        match tokio::time::timeout(timeout, completion_rx).await {
            Ok(Ok(response)) => Ok(response),
            // Completion sender dropped: the session closed underneath us.
            Ok(Err(_)) => Err(ProxyError::NoTunnel),
            Err(_) => {
                self.forget(&request_id);
                Err(ProxyError::Timeout)
            }
        }
    }

    /// Complete a pending request. An unknown id is dropped silently; late
    /// responses after a timeout are expected.
    pub fn complete(&self, response: ProxyResponse) {
        let completion = self
            .pending
            .lock()
            .expect("pending proxy map poisoned")
            .remove(&response.request_id);
        if let Some(completion) = completion {
            let _ = completion.send(response);
        }
    }

    /// Fail every outstanding request; awaiting callers observe `no_tunnel`.
    pub fn fail_all(&self) {
        self.pending
            .lock()
            .expect("pending proxy map poisoned")
            .clear();
    }

    fn forget(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("pending proxy map poisoned")
            .remove(request_id);
    }
}

/// `app_name -> live session` map shared by the HTTP surface.
#[derive(Default)]
pub struct Tunnels {
    map: RwLock<HashMap<String, std::sync::Arc<SessionHandle>>>,
}

impl Tunnels {
    pub fn insert(&self, app_name: &str, handle: std::sync::Arc<SessionHandle>) {
        self.map
            .write()
            .expect("tunnels poisoned")
            .insert(app_name.to_owned(), handle);
    }

    pub fn get(&self, app_name: &str) -> Option<std::sync::Arc<SessionHandle>> {
        self.map.read().expect("tunnels poisoned").get(app_name).cloned()
    }

    /// Remove the app's handle, but only if it still belongs to the closing
    /// session; a newer session's handle must not be evicted by a stale one.
    pub fn remove(&self, app_name: &str, tunnel_id: &str) {
        let mut map = self.map.write().expect("tunnels poisoned");
        if map.get(app_name).is_some_and(|h| h.tunnel_id == tunnel_id) {
            map.remove(app_name);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, sync::Arc};

    use super::*;

    fn request(id: &str) -> ProxyRequest {
        ProxyRequest {
            request_id: id.to_owned(),
            method: "GET".to_owned(),
            path: "/hello".to_owned(),
            headers: BTreeMap::new(),
            body_b64: String::new(),
        }
    }

    fn response(id: &str) -> ProxyResponse {
        ProxyResponse {
            request_id: id.to_owned(),
            status: 200,
            headers: BTreeMap::new(),
            body_b64: "aGk=".to_owned(),
        }
    }

    #[tokio::test]
    async fn proxy_completes_roundtrip() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = Arc::new(SessionHandle::new("demo:1".to_owned(), out_tx));

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle.proxy(request("r1"), Duration::from_secs(1)).await
            })
        };

        // The session's reader side sees the outbound frame and answers.
        match out_rx.recv().await.unwrap() {
            TunnelFrame::ProxyRequest(outbound) => assert_eq!(outbound.request_id, "r1"),
            other => panic!("unexpected frame: {other:?}"),
        }
        handle.complete(response("r1"));

        let proxied = requester.await.unwrap().unwrap();
        assert_eq!(proxied.status, 200);
        assert_eq!(proxied.body_b64, "aGk=");
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_times_out_and_abandons() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handle = Arc::new(SessionHandle::new("demo:1".to_owned(), out_tx));

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle.proxy(request("r2"), Duration::from_millis(50)).await
            })
        };
        let err = requester.await.unwrap().unwrap_err();
        assert_eq!(err, ProxyError::Timeout);

        // A late completion is dropped silently.
        handle.complete(response("r2"));
    }

    #[tokio::test]
    async fn fail_all_fails_pending_with_no_tunnel() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handle = Arc::new(SessionHandle::new("demo:1".to_owned(), out_tx));

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle.proxy(request("r3"), Duration::from_secs(5)).await
            })
        };
        tokio::task::yield_now().await;
        handle.fail_all();
        let err = requester.await.unwrap().unwrap_err();
        assert_eq!(err, ProxyError::NoTunnel);
    }

    #[tokio::test]
    async fn unknown_completion_is_silent() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handle = SessionHandle::new("demo:1".to_owned(), out_tx);
        handle.complete(response("never-sent"));
    }

    #[test]
    fn stale_session_cannot_evict_newer_one() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let tunnels = Tunnels::default();
        let old = Arc::new(SessionHandle::new("demo:old".to_owned(), out_tx.clone()));
        let new = Arc::new(SessionHandle::new("demo:new".to_owned(), out_tx));
        tunnels.insert("demo", old);
        tunnels.insert("demo", new.clone());

        tunnels.remove("demo", "demo:old");
        assert_eq!(tunnels.get("demo").unwrap().tunnel_id, "demo:new");
        tunnels.remove("demo", "demo:new");
        assert!(tunnels.get("demo").is_none());
    }
}
