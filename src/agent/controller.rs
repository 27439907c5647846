//! Agent Controller - the per-session polling state machine
//!
//! One Agent runs per active session. It never touches session metadata;
//! it only reads its surface, writes replies into it, and reports to the
//! log aggregator.
//!
//! ```text
//! Idle ──tick──► Polling ──unread or open──► conversation ──► Processing
//!   ▲               │                                          │
//!   │               └─ not on inbox: navigate, back to Idle    ▼
//!   │                                               rule → AI → heuristic
//!   │                                                          │
//!   └──── mark seen ◄── skip gate ◄────────────────────────────┘
//!                           │
//!                           ▼
//!            pre-reply delay → type → submit → memory, mark seen
//! ```
//!
//! Cycles are serialized by the `processing` flag. Every delay observes the
//! agent's cancellation token, and page content is re-checked after each one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use super::event::{ConversationalEvent, EventId};
use super::memory::{AgentMemory, Direction};
use super::platform::{PlatformRegistry, PlatformStrategy};
use super::reply::{heuristic_reply, match_rule, ReplySource};
use crate::bridge::{AiRequest, BridgeClient, BridgeOutcome, ChatMessage};
use crate::governor::{pre_reply_delay, should_skip, typing_delay, ReplyRateLimiter};
use crate::logs::LogAggregator;
use crate::metrics::{AGENT_CYCLES, REPLIES_SKIPPED, REPLIES_SUBMITTED};
use crate::session::{AiConfig, RateLimits, SessionConfig, SessionId};
use crate::surface::{PageSnapshot, Surface, SurfaceError};

/// Error type for agent operations
///
/// Always contained to the cycle that raised it.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("surface error: {0}")]
    Surface(#[from] SurfaceError),
    #[error("memory record is corrupt: {0}")]
    Memory(#[from] serde_json::Error),
}

/// How one poll cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was mid-flight
    Busy,
    /// The agent was stopped during the cycle
    Stopped,
    /// Surface was not on the conversation list; navigated there
    Navigated(String),
    /// Nothing unread and nothing new in the open conversation
    Idle,
    /// Latest message is self-authored or already handled
    NoNewEvent,
    /// Page did not show the expected counterpart
    NoDataYet,
    /// Nothing to say; event marked seen
    NoReply,
    /// Deliberately left unanswered; event marked seen
    RandomSkip,
    /// Reply ceiling reached; event left for a later cycle
    RateLimited,
    Replied {
        counterpart: String,
        reply: String,
        source: ReplySource,
    },
    /// Input or submit failed; event left for a later cycle
    SubmitFailed(String),
    /// Cycle aborted on an error
    Failed(String),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Busy => "busy",
            CycleOutcome::Stopped => "stopped",
            CycleOutcome::Navigated(_) => "navigated",
            CycleOutcome::Idle => "idle",
            CycleOutcome::NoNewEvent => "no_new_event",
            CycleOutcome::NoDataYet => "no_data_yet",
            CycleOutcome::NoReply => "no_reply",
            CycleOutcome::RandomSkip => "random_skip",
            CycleOutcome::RateLimited => "rate_limited",
            CycleOutcome::Replied { .. } => "replied",
            CycleOutcome::SubmitFailed(_) => "submit_failed",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Default)]
struct AgentState {
    seen: HashSet<EventId>,
    last_replied: HashMap<String, EventId>,
}

struct Monitor {
    counterpart: String,
    cancel: CancellationToken,
}

/// Resets `processing` however the cycle ends, including being dropped
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Agent {
    session_id: SessionId,
    surface: Arc<dyn Surface>,
    memory: AgentMemory,
    config: watch::Receiver<SessionConfig>,
    bridge: BridgeClient,
    logs: Arc<LogAggregator>,
    platforms: Arc<PlatformRegistry>,
    state: Mutex<AgentState>,
    monitor: Mutex<Option<Monitor>>,
    processing: AtomicBool,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    limiter: Mutex<Arc<ReplyRateLimiter>>,
    rng: Mutex<StdRng>,
}

impl Agent {
    pub fn new(
        session_id: SessionId,
        surface: Arc<dyn Surface>,
        config: watch::Receiver<SessionConfig>,
        bridge: BridgeClient,
        logs: Arc<LogAggregator>,
    ) -> Self {
        let limits = config.borrow().limits;
        Self {
            session_id,
            memory: AgentMemory::new(Arc::clone(&surface)),
            surface,
            config,
            bridge,
            logs,
            platforms: Arc::new(PlatformRegistry::default()),
            state: Mutex::new(AgentState::default()),
            monitor: Mutex::new(None),
            processing: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            limiter: Mutex::new(Arc::new(ReplyRateLimiter::new(limits))),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_platforms(mut self, platforms: Arc<PlatformRegistry>) -> Self {
        self.platforms = platforms;
        self
    }

    /// Deterministic randomness for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    pub fn has_seen(&self, id: &EventId) -> bool {
        lock(&self.state).seen.contains(id)
    }

    /// Counterpart whose open conversation is being monitored
    pub fn monitored(&self) -> Option<String> {
        lock(&self.monitor).as_ref().map(|m| m.counterpart.clone())
    }

    fn token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Start the main poll loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = {
            let mut cancel = lock(&self.cancel);
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };

        let agent = Arc::clone(self);
        let span = info_span!("agent", session_id = %self.session_id);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = agent.run_cycle() => {}
                    }
                    let interval = Duration::from_millis(agent.config.borrow().poll_interval_ms);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                debug!("poll loop exited");
            }
            .instrument(span),
        );

        self.logs.success(&self.session_id, "Bot started");
    }

    /// Stop immediately: cancels the poll loop, the monitor and any pending delay
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.token().cancel();
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.cancel.cancel();
        }
        self.logs.info(&self.session_id, "Bot stopped");
    }

    /// One full poll cycle
    pub async fn run_cycle(self: &Arc<Self>) -> CycleOutcome {
        let Some(_guard) = ProcessingGuard::claim(&self.processing) else {
            return CycleOutcome::Busy;
        };
        let outcome = match self.poll().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.logs
                    .error(&self.session_id, format!("Poll cycle failed: {}", e));
                CycleOutcome::Failed(e.to_string())
            }
        };
        AGENT_CYCLES.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    /// One pass of the open-conversation monitor
    pub async fn run_monitor_tick(&self, counterpart: &str) -> CycleOutcome {
        let Some(_guard) = ProcessingGuard::claim(&self.processing) else {
            return CycleOutcome::Busy;
        };
        let config = self.config.borrow().clone();
        let outcome = match self.check_open_conversation(&config, counterpart).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.logs
                    .error(&self.session_id, format!("Monitor check failed: {}", e));
                CycleOutcome::Failed(e.to_string())
            }
        };
        AGENT_CYCLES.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    async fn poll(self: &Arc<Self>) -> Result<CycleOutcome, AgentError> {
        let config = self.config.borrow().clone();
        let page = self.surface.read_page().await?;
        let strategy = self.platforms.for_url(&page.url);

        if !strategy.is_conversation_view(&page) {
            let target = strategy
                .conversation_view_url(&page)
                .unwrap_or_else(|| config.entry_url.clone());
            self.logs
                .info(&self.session_id, format!("Not on the inbox, opening {}", target));
            self.surface.navigate(&target).await?;
            return Ok(CycleOutcome::Navigated(target));
        }

        let Some(conversation) = strategy.find_unread_conversations(&page).into_iter().next()
        else {
            return self
                .poll_open_conversation(&config, strategy.as_ref(), &page)
                .await;
        };

        self.retarget_monitor(&conversation.counterpart);
        if conversation.priority {
            self.logs.highlight(
                &self.session_id,
                format!("Priority activity from {}", conversation.counterpart),
            );
        } else {
            self.logs.info(
                &self.session_id,
                format!("New message from {}", conversation.counterpart),
            );
        }

        self.surface.click(&conversation.element).await?;
        let page = self.surface.read_page().await?;
        if strategy.active_counterpart(&page).as_deref() != Some(conversation.counterpart.as_str())
        {
            debug!(counterpart = %conversation.counterpart, "conversation pane not ready");
            return Ok(CycleOutcome::NoDataYet);
        }

        self.ensure_monitor(&conversation.counterpart);
        self.process_conversation(&config, strategy.as_ref(), &conversation.counterpart)
            .await
    }

    /// The open conversation never shows as unread, so with nothing unread
    /// it is checked directly. This also re-arms the monitor after a restart.
    async fn poll_open_conversation(
        self: &Arc<Self>,
        config: &SessionConfig,
        strategy: &dyn PlatformStrategy,
        page: &PageSnapshot,
    ) -> Result<CycleOutcome, AgentError> {
        let Some(counterpart) = strategy.active_counterpart(page) else {
            return Ok(CycleOutcome::Idle);
        };
        self.ensure_monitor(&counterpart);
        match self
            .process_conversation(config, strategy, &counterpart)
            .await?
        {
            CycleOutcome::NoNewEvent => Ok(CycleOutcome::Idle),
            outcome => Ok(outcome),
        }
    }

    async fn check_open_conversation(
        &self,
        config: &SessionConfig,
        counterpart: &str,
    ) -> Result<CycleOutcome, AgentError> {
        let page = self.surface.read_page().await?;
        let strategy = self.platforms.for_url(&page.url);
        if strategy.active_counterpart(&page).as_deref() != Some(counterpart) {
            return Ok(CycleOutcome::NoDataYet);
        }
        self.process_conversation(config, strategy.as_ref(), counterpart)
            .await
    }

    /// Processing through post-submit for the open conversation
    async fn process_conversation(
        &self,
        config: &SessionConfig,
        strategy: &dyn PlatformStrategy,
        counterpart: &str,
    ) -> Result<CycleOutcome, AgentError> {
        let page = self.surface.read_page().await?;
        let Some(event) =
            strategy.extract_latest_incoming(&page, counterpart, config.own_handle.as_deref())
        else {
            return Ok(CycleOutcome::NoNewEvent);
        };
        if event.from_self {
            return Ok(CycleOutcome::NoNewEvent);
        }
        if self.is_known(&event).await? {
            return Ok(CycleOutcome::NoNewEvent);
        }

        let (reply, source, suspended) = self.decide(config, &event).await;
        if self.is_cancelled() {
            return Ok(CycleOutcome::Stopped);
        }
        if suspended && !self.still_showing(strategy, counterpart).await? {
            return Ok(CycleOutcome::NoDataYet);
        }

        let Some(reply) = reply else {
            self.mark_handled(&event).await?;
            REPLIES_SKIPPED.with_label_values(&["no_reply"]).inc();
            self.logs.info(
                &self.session_id,
                format!("No reply for {}: \"{}\"", counterpart, event.text),
            );
            return Ok(CycleOutcome::NoReply);
        };

        let skip = should_skip(config.skip_probability, &mut *lock(&self.rng));
        if skip {
            self.mark_handled(&event).await?;
            REPLIES_SKIPPED.with_label_values(&["random_skip"]).inc();
            self.logs.info(
                &self.session_id,
                format!("Leaving {} unanswered this time", counterpart),
            );
            return Ok(CycleOutcome::RandomSkip);
        }

        let limiter = self.limiter(config.limits);
        if !limiter.try_acquire() {
            REPLIES_SKIPPED.with_label_values(&["rate_limited"]).inc();
            self.logs.info(
                &self.session_id,
                format!("Reply to {} held back by rate limits", counterpart),
            );
            return Ok(CycleOutcome::RateLimited);
        }

        let outcome = self
            .submit(config, strategy, &event, &reply, source)
            .await;
        if !matches!(outcome, Ok(CycleOutcome::Replied { .. })) {
            limiter.release();
        }
        if let Err(e) = &outcome {
            REPLIES_SKIPPED.with_label_values(&["submit_failed"]).inc();
            self.logs
                .error(&self.session_id, format!("Failed to send reply: {}", e));
            return Ok(CycleOutcome::SubmitFailed(e.to_string()));
        }
        outcome
    }

    /// Pick a reply: first matching rule, then AI, then heuristics.
    /// The flag reports whether the agent waited on the bridge.
    async fn decide(
        &self,
        config: &SessionConfig,
        event: &ConversationalEvent,
    ) -> (Option<String>, ReplySource, bool) {
        if let Some(rule) = match_rule(&config.rules, &event.text) {
            debug!(pattern = %rule.pattern, "rule matched");
            return (Some(rule.reply.clone()), ReplySource::Rule, false);
        }

        let mut suspended = false;
        if let Some(ai) = config.active_ai() {
            suspended = true;
            if let Some(reply) = self.ai_reply(ai, event).await {
                return (Some(reply), ReplySource::Ai, suspended);
            }
        }

        (
            heuristic_reply(&event.text).map(str::to_string),
            ReplySource::Heuristic,
            suspended,
        )
    }

    async fn ai_reply(&self, ai: &AiConfig, event: &ConversationalEvent) -> Option<String> {
        let mut messages = vec![ChatMessage::system(ai.system_prompt.clone())];
        if ai.include_history {
            match self.memory.history(&event.counterpart, ai.history_depth).await {
                Ok(history) => {
                    messages.extend(history.into_iter().map(|entry| match entry.direction {
                        Direction::Theirs => ChatMessage::user(entry.text),
                        Direction::Mine => ChatMessage::assistant(entry.text),
                    }));
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "history unavailable")
                }
            }
        }
        messages.push(ChatMessage::user(event.text.clone()));

        let request = AiRequest::new(
            self.session_id.clone(),
            event.counterpart.clone(),
            messages,
            ai.clone(),
        );
        self.logs.info(
            &self.session_id,
            format!("Asking AI for a reply to {}", event.counterpart),
        );

        match self.bridge.request(request, &self.token()).await {
            BridgeOutcome::Reply(reply) => Some(reply),
            BridgeOutcome::NoReply(reason) => {
                self.logs
                    .error(&self.session_id, format!("AI gave no reply: {}", reason));
                None
            }
            BridgeOutcome::TimedOut => {
                self.logs
                    .error(&self.session_id, "AI did not answer in time");
                None
            }
            BridgeOutcome::Cancelled => None,
        }
    }

    /// Pre-reply delay, typing, submit, post-submit bookkeeping
    async fn submit(
        &self,
        config: &SessionConfig,
        strategy: &dyn PlatformStrategy,
        event: &ConversationalEvent,
        reply: &str,
        source: ReplySource,
    ) -> Result<CycleOutcome, AgentError> {
        let counterpart = event.counterpart.as_str();
        let delay = pre_reply_delay(&config.timing, &mut *lock(&self.rng));
        if !self.pause(delay).await {
            return Ok(CycleOutcome::Stopped);
        }

        // Content may have changed while we waited
        let page = self.surface.read_page().await?;
        if strategy.active_counterpart(&page).as_deref() != Some(counterpart) {
            return Ok(CycleOutcome::NoDataYet);
        }
        let Some(input) = strategy.locate_input_control(&page) else {
            return Err(SurfaceError::ElementNotFound("message input".to_string()).into());
        };

        self.surface.clear_input(&input).await?;
        for ch in reply.chars() {
            self.surface.type_char(&input, ch).await?;
            let delay = typing_delay(&config.timing, &mut *lock(&self.rng));
            if !self.pause(delay).await {
                return Ok(CycleOutcome::Stopped);
            }
        }

        match strategy.locate_submit_control(&page) {
            Some(button) => self.surface.click(&button).await?,
            None => {
                debug!("no submit control, confirming with Enter");
                self.surface.press_enter(&input).await?
            }
        }

        {
            let mut state = lock(&self.state);
            state.seen.insert(event.id.clone());
            state
                .last_replied
                .insert(counterpart.to_string(), event.id.clone());
        }
        self.memory
            .append(counterpart, Direction::Theirs, &event.text)
            .await?;
        self.memory.append(counterpart, Direction::Mine, reply).await?;
        self.memory.record_handled(counterpart, &event.id).await?;

        REPLIES_SUBMITTED.with_label_values(&[source.as_str()]).inc();
        self.logs.success(
            &self.session_id,
            format!("Replied to {} ({}): {}", counterpart, source.as_str(), reply),
        );
        Ok(CycleOutcome::Replied {
            counterpart: counterpart.to_string(),
            reply: reply.to_string(),
            source,
        })
    }

    /// Decided by this agent, or by an earlier one on the same surface
    async fn is_known(&self, event: &ConversationalEvent) -> Result<bool, AgentError> {
        {
            let state = lock(&self.state);
            if state.seen.contains(&event.id)
                || state.last_replied.get(&event.counterpart) == Some(&event.id)
            {
                return Ok(true);
            }
        }
        let handled = self.memory.last_handled(&event.counterpart).await?;
        if handled.as_ref() != Some(&event.id) {
            return Ok(false);
        }
        lock(&self.state).seen.insert(event.id.clone());
        Ok(true)
    }

    async fn mark_handled(&self, event: &ConversationalEvent) -> Result<(), AgentError> {
        lock(&self.state).seen.insert(event.id.clone());
        self.memory
            .record_handled(&event.counterpart, &event.id)
            .await
    }

    async fn still_showing(
        &self,
        strategy: &dyn PlatformStrategy,
        counterpart: &str,
    ) -> Result<bool, AgentError> {
        let page = self.surface.read_page().await?;
        Ok(strategy.active_counterpart(&page).as_deref() == Some(counterpart))
    }

    /// Sleep unless stopped first. False when stopped.
    async fn pause(&self, duration: Duration) -> bool {
        let token = self.token();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Limiter for the current ceilings, rebuilt when they change
    fn limiter(&self, limits: RateLimits) -> Arc<ReplyRateLimiter> {
        let mut limiter = lock(&self.limiter);
        if limiter.limits() != limits {
            *limiter = Arc::new(ReplyRateLimiter::new(limits));
        }
        Arc::clone(&limiter)
    }

    /// Drop the monitor if it watches someone other than `counterpart`
    fn retarget_monitor(&self, counterpart: &str) {
        let mut monitor = lock(&self.monitor);
        if monitor
            .as_ref()
            .map_or(false, |m| m.counterpart != counterpart)
        {
            if let Some(old) = monitor.take() {
                debug!(from = %old.counterpart, to = %counterpart, "monitor retargeted");
                old.cancel.cancel();
            }
        }
    }

    fn ensure_monitor(self: &Arc<Self>, counterpart: &str) {
        let mut monitor = lock(&self.monitor);
        if monitor.as_ref().map_or(false, |m| m.counterpart == counterpart) {
            return;
        }
        if let Some(old) = monitor.take() {
            old.cancel.cancel();
        }

        let cancel = self.token().child_token();
        let agent = Arc::clone(self);
        let watched = counterpart.to_string();
        let token = cancel.clone();
        let span = info_span!("monitor", session_id = %self.session_id, counterpart = %watched);
        tokio::spawn(
            async move {
                loop {
                    let interval =
                        Duration::from_millis(agent.config.borrow().monitor_interval_ms);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = agent.run_monitor_tick(&watched) => {}
                    }
                }
                debug!("monitor exited");
            }
            .instrument(span),
        );

        *monitor = Some(Monitor {
            counterpart: counterpart.to_string(),
            cancel,
        });
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        lock(&self.cancel).cancel();
    }
}
