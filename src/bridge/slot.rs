//! Single-slot mailbox between an agent and the bridge host
//!
//! ```text
//! agent ──post(req r1)──► [pending] ──take──► host ──call──► [response r1] ──take_for(r1)──► agent
//! ```
//!
//! The agent only ever accepts a response carrying the id it posted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::chat::ChatMessage;
use crate::session::{AiConfig, SessionId};

/// Default ceiling an agent waits for a reply
pub const DEFAULT_WAIT_CEILING: Duration = Duration::from_secs(30);
/// Default gap between response-slot checks
pub const DEFAULT_WAIT_TICK: Duration = Duration::from_millis(250);

/// A generation request posted by an agent
#[derive(Debug, Clone, PartialEq)]
pub struct AiRequest {
    pub id: String,
    pub session_id: SessionId,
    pub counterpart: String,
    pub messages: Vec<ChatMessage>,
    pub config: AiConfig,
}

impl AiRequest {
    pub fn new(
        session_id: SessionId,
        counterpart: impl Into<String>,
        messages: Vec<ChatMessage>,
        config: AiConfig,
    ) -> Self {
        Self {
            id: format!("req-{}", uuid::Uuid::now_v7()),
            session_id,
            counterpart: counterpart.into(),
            messages,
            config,
        }
    }
}

/// The host's answer. `reply: None` covers every failure.
#[derive(Debug, Clone, PartialEq)]
pub struct AiResponse {
    pub id: String,
    pub reply: Option<String>,
    /// Failure description for the agent's log
    pub error: Option<String>,
}

/// What an agent gets back from a bridge round-trip
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    Reply(String),
    /// The host answered without content
    NoReply(String),
    /// Ceiling elapsed before our id showed up
    TimedOut,
    /// The agent stopped while waiting
    Cancelled,
}

/// One session's mailbox
#[derive(Debug, Default)]
pub struct BridgeSlot {
    pending: Mutex<Option<AiRequest>>,
    response: Mutex<Option<AiResponse>>,
    in_flight: AtomicBool,
}

impl BridgeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a request into the pending slot, replacing one nobody picked up
    pub fn post(&self, request: AiRequest) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(request);
        }
    }

    /// Take the pending request, clearing the slot
    pub fn take_pending(&self) -> Option<AiRequest> {
        self.pending.lock().ok().and_then(|mut p| p.take())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    pub fn write_response(&self, response: AiResponse) {
        if let Ok(mut slot) = self.response.lock() {
            *slot = Some(response);
        }
    }

    /// Take the response only if it answers `id`; stale responses stay put
    pub fn take_response_for(&self, id: &str) -> Option<AiResponse> {
        let mut slot = self.response.lock().ok()?;
        if slot.as_ref().map(|r| r.id == id).unwrap_or(false) {
            slot.take()
        } else {
            None
        }
    }

    /// Claim the in-flight flag. False if a request is already out.
    pub fn begin_flight(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_flight(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Agent-side handle on a session's mailbox
#[derive(Debug, Clone)]
pub struct BridgeClient {
    slot: std::sync::Arc<BridgeSlot>,
    ceiling: Duration,
    tick: Duration,
}

impl BridgeClient {
    pub fn new(slot: std::sync::Arc<BridgeSlot>) -> Self {
        Self {
            slot,
            ceiling: DEFAULT_WAIT_CEILING,
            tick: DEFAULT_WAIT_TICK,
        }
    }

    pub fn with_timing(mut self, ceiling: Duration, tick: Duration) -> Self {
        self.ceiling = ceiling;
        self.tick = tick;
        self
    }

    /// Post `request` and wait for the response carrying its id
    ///
    /// Waits with short sleeps so other tasks on the host keep running.
    pub async fn request(&self, request: AiRequest, cancel: &CancellationToken) -> BridgeOutcome {
        let id = request.id.clone();
        let deadline = Instant::now() + self.ceiling;
        self.slot.post(request);

        loop {
            if cancel.is_cancelled() {
                return BridgeOutcome::Cancelled;
            }
            if let Some(response) = self.slot.take_response_for(&id) {
                return match response.reply {
                    Some(reply) => BridgeOutcome::Reply(reply),
                    None => BridgeOutcome::NoReply(
                        response.error.unwrap_or_else(|| "no content".to_string()),
                    ),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(request_id = %id, "bridge wait ceiling reached");
                return BridgeOutcome::TimedOut;
            }
            let nap = self.tick.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return BridgeOutcome::Cancelled,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(id: &str) -> AiRequest {
        AiRequest {
            id: id.to_string(),
            session_id: SessionId::from("s1"),
            counterpart: "alice".to_string(),
            messages: vec![ChatMessage::user("hi")],
            config: AiConfig::default(),
        }
    }

    #[test]
    fn test_take_pending_clears_slot() {
        let slot = BridgeSlot::new();
        slot.post(request("r1"));
        assert!(slot.has_pending());
        assert_eq!(slot.take_pending().unwrap().id, "r1");
        assert!(slot.take_pending().is_none());
    }

    #[test]
    fn test_response_only_taken_by_matching_id() {
        let slot = BridgeSlot::new();
        slot.write_response(AiResponse {
            id: "r0".to_string(),
            reply: Some("old".to_string()),
            error: None,
        });
        assert!(slot.take_response_for("r1").is_none());
        assert_eq!(slot.take_response_for("r0").unwrap().reply.as_deref(), Some("old"));
    }

    #[test]
    fn test_single_flight_flag() {
        let slot = BridgeSlot::new();
        assert!(slot.begin_flight());
        assert!(!slot.begin_flight());
        slot.end_flight();
        assert!(slot.begin_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_at_ceiling() {
        let slot = Arc::new(BridgeSlot::new());
        let client = BridgeClient::new(Arc::clone(&slot))
            .with_timing(Duration::from_secs(30), Duration::from_millis(250));
        let started = Instant::now();
        let outcome = client.request(request("r1"), &CancellationToken::new()).await;
        assert_eq!(outcome, BridgeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_cancelled() {
        let slot = Arc::new(BridgeSlot::new());
        let client = BridgeClient::new(slot);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert_eq!(
            client.request(request("r1"), &cancel).await,
            BridgeOutcome::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_response_not_cross_delivered() {
        let slot = Arc::new(BridgeSlot::new());
        let client = BridgeClient::new(Arc::clone(&slot));

        let host_side = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let picked = host_side.take_pending().unwrap();
            assert_eq!(picked.id, "r1");
            // Late answer to an earlier request lands first
            host_side.write_response(AiResponse {
                id: "r0".to_string(),
                reply: Some("stale".to_string()),
                error: None,
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
            host_side.write_response(AiResponse {
                id: picked.id,
                reply: Some("fresh".to_string()),
                error: None,
            });
        });

        let outcome = client.request(request("r1"), &CancellationToken::new()).await;
        assert_eq!(outcome, BridgeOutcome::Reply("fresh".to_string()));
    }
}
