//! Bridge host - the privileged side of the AI bridge
//!
//! Agents have no network egress. The host polls every registered slot at a
//! fixed interval, takes pending requests, and performs the endpoint call on
//! their behalf. At most one request per session is in flight; sessions do
//! not wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::chat::{BridgeError, ChatBackend};
use super::slot::{AiRequest, AiResponse, BridgeSlot};
use crate::metrics::{BRIDGE_LATENCY, BRIDGE_REQUESTS};
use crate::session::SessionId;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

pub struct BridgeHost {
    backend: Arc<dyn ChatBackend>,
    slots: Mutex<HashMap<SessionId, Arc<BridgeSlot>>>,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl BridgeHost {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self::with_timing(backend, DEFAULT_POLL_INTERVAL, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timing(
        backend: Arc<dyn ChatBackend>,
        poll_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
            poll_interval,
            call_timeout,
        }
    }

    /// The session's slot, registering it on first use
    pub fn slot_for(&self, session_id: &SessionId) -> Arc<BridgeSlot> {
        match self.slots.lock() {
            Ok(mut slots) => Arc::clone(
                slots
                    .entry(session_id.clone())
                    .or_insert_with(|| Arc::new(BridgeSlot::new())),
            ),
            // A poisoned map still hands out a working, unpolled slot
            Err(_) => Arc::new(BridgeSlot::new()),
        }
    }

    pub fn unregister(&self, session_id: &SessionId) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(session_id);
        }
    }

    pub fn registered(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// One pass over every slot. Returns how many calls were started.
    pub fn poll_once(&self) -> usize {
        let slots: Vec<Arc<BridgeSlot>> = match self.slots.lock() {
            Ok(slots) => slots.values().cloned().collect(),
            Err(_) => return 0,
        };

        let mut started = 0;
        for slot in slots {
            if !slot.has_pending() || !slot.begin_flight() {
                continue;
            }
            let Some(request) = slot.take_pending() else {
                slot.end_flight();
                continue;
            };
            let backend = Arc::clone(&self.backend);
            let timeout = self.call_timeout;
            tokio::spawn(async move {
                let response = serve(backend.as_ref(), request, timeout).await;
                slot.write_response(response);
                slot.end_flight();
            });
            started += 1;
        }
        started
    }

    /// Run the poller until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once();
                    }
                }
            }
            tracing::debug!("bridge poller stopped");
        })
    }
}

/// Perform one endpoint call and turn it into exactly one response
async fn serve(backend: &dyn ChatBackend, request: AiRequest, timeout: Duration) -> AiResponse {
    let start = Instant::now();
    let span = tracing::info_span!(
        "bridge_call",
        request_id = %request.id,
        session_id = %request.session_id,
        model = %request.config.model,
    );

    let result = match tokio::time::timeout(
        timeout,
        backend.complete(&request.messages, &request.config, timeout),
    )
    .instrument(span.clone())
    .await
    {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout),
    };

    BRIDGE_LATENCY
        .with_label_values(&[&request.config.model])
        .observe(start.elapsed().as_secs_f64());

    match result {
        Ok(reply) => {
            BRIDGE_REQUESTS.with_label_values(&["ok"]).inc();
            tracing::info!(
                parent: &span,
                counterpart = %request.counterpart,
                latency_ms = start.elapsed().as_millis() as u64,
                "bridge reply ready"
            );
            AiResponse {
                id: request.id,
                reply: Some(reply),
                error: None,
            }
        }
        Err(e) => {
            BRIDGE_REQUESTS.with_label_values(&[e.outcome()]).inc();
            tracing::warn!(parent: &span, error = %e, "bridge call failed");
            AiResponse {
                id: request.id,
                reply: None,
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::chat::ChatMessage;
    use crate::bridge::slot::{BridgeClient, BridgeOutcome};
    use crate::session::AiConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the last message after a delay, tracking concurrency
    struct SlowEcho {
        delay: Duration,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl SlowEcho {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for SlowEcho {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _config: &AiConfig,
            _timeout: Duration,
        ) -> Result<String, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            messages
                .last()
                .map(|m| format!("echo: {}", m.content))
                .ok_or(BridgeError::EmptyContent)
        }
    }

    struct Failing;

    #[async_trait]
    impl ChatBackend for Failing {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _config: &AiConfig,
            _timeout: Duration,
        ) -> Result<String, BridgeError> {
            Err(BridgeError::Status(503))
        }
    }

    fn request(session: &str, text: &str) -> AiRequest {
        AiRequest::new(
            SessionId::from(session),
            "alice",
            vec![ChatMessage::user(text)],
            AiConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_through_poller() {
        let host = Arc::new(BridgeHost::new(Arc::new(SlowEcho::new(
            Duration::from_millis(500),
        ))));
        let cancel = CancellationToken::new();
        let poller = Arc::clone(&host).spawn(cancel.clone());

        let client = BridgeClient::new(host.slot_for(&SessionId::from("s1")));
        let outcome = client.request(request("s1", "hi"), &CancellationToken::new()).await;
        assert_eq!(outcome, BridgeOutcome::Reply("echo: hi".to_string()));

        cancel.cancel();
        poller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_per_session() {
        let backend = Arc::new(SlowEcho::new(Duration::from_secs(2)));
        let host = BridgeHost::new(backend.clone());
        let slot = host.slot_for(&SessionId::from("s1"));

        slot.post(request("s1", "first"));
        assert_eq!(host.poll_once(), 1);
        assert!(slot.in_flight());

        slot.post(request("s1", "second"));
        assert_eq!(host.poll_once(), 0);
        assert!(slot.has_pending());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!slot.in_flight());
        assert_eq!(host.poll_once(), 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_not_serialized_against_each_other() {
        let backend = Arc::new(SlowEcho::new(Duration::from_secs(2)));
        let host = BridgeHost::new(backend.clone());
        host.slot_for(&SessionId::from("s1")).post(request("s1", "a"));
        host.slot_for(&SessionId::from("s2")).post(request("s2", "b"));

        assert_eq!(host.poll_once(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.max_concurrent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_collapses_to_no_reply() {
        let host = BridgeHost::new(Arc::new(Failing));
        let slot = host.slot_for(&SessionId::from("s1"));
        let req = request("s1", "hi");
        let id = req.id.clone();
        slot.post(req);
        host.poll_once();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let response = slot.take_response_for(&id).unwrap();
        assert!(response.reply.is_none());
        assert!(response.error.unwrap().contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_produces_response() {
        let host = BridgeHost::with_timing(
            Arc::new(SlowEcho::new(Duration::from_secs(60))),
            DEFAULT_POLL_INTERVAL,
            Duration::from_secs(5),
        );
        let slot = host.slot_for(&SessionId::from("s1"));
        let req = request("s1", "hi");
        let id = req.id.clone();
        slot.post(req);
        host.poll_once();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let response = slot.take_response_for(&id).unwrap();
        assert!(response.reply.is_none());
        assert!(!slot.in_flight());
    }
}
