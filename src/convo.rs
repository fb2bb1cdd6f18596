//! Two-party automated conversation loop.
//!
//! One controller owns two sides (each a target plus its live document) and
//! relays responses between them: wait for side A to finish, extract, hand
//! the text to side B, and so on until a stop condition fires. External
//! control (pause, resume, stop) arrives through a cloneable handle; progress
//! is published through a watch channel and an event sink.

use crate::document::{Document, FileStore, NullFileStore};
use crate::error::CoreError;
use crate::inject;
use crate::monitor;
use crate::retry::RetryPolicy;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

const PAUSE_POLL: Duration = Duration::from_millis(500);
/// Settle time after role prompts are delivered before the opening message.
const ROLE_SETTLE: Duration = Duration::from_millis(1000);
/// Gap between extracting one side's response and delivering it to the other.
const INTER_TURN_DELAY: Duration = Duration::from_millis(1000);
const HISTORY_FILE: &str = "conversation-history.json";
const USER_SPEAKER: &str = "user";

// ========================= Public Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConvoState {
    Idle,
    Initializing,
    WaitingForA,
    WaitingForB,
    Processing,
    Paused,
    Error,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    MaxTurnsReached,
    Stopped,
    RepetitionDetected,
    ResponseUnavailable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub timestamp_ms: u128,
    pub speaker: String,
    pub message: String,
    pub turn: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoSummary {
    pub session_id: String,
    pub turns: u32,
    pub entries: usize,
    pub stop_reason: StopReason,
}

#[derive(Clone, Copy, Debug)]
pub struct ConvoStats {
    pub turn: u32,
    pub entries: usize,
    pub state: ConvoState,
}

#[derive(Clone, Copy, Debug)]
pub struct ConvoConfig {
    pub max_turns: u32,
    pub turn_delay: Duration,
    pub response_timeout: Duration,
    /// Consecutive identical messages (after trim + lowercase) that end the
    /// conversation as degenerate.
    pub repetition_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for ConvoConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            turn_delay: Duration::from_secs(3),
            response_timeout: Duration::from_secs(60),
            repetition_limit: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Progress sink. All methods default to no-ops so callers implement only
/// what they surface.
pub trait ConvoEvents: Send + Sync {
    fn on_state_change(&self, _state: ConvoState) {}
    fn on_turn_complete(&self, _entry: &TranscriptEntry) {}
    fn on_countdown(&self, _remaining_secs: u64) {}
    fn on_error(&self, _err: &CoreError) {}
    fn on_complete(&self, _summary: &ConvoSummary) {}
}

pub struct NullEvents;

impl ConvoEvents for NullEvents {}

/// One conversation participant: a target and its live document.
#[derive(Clone)]
pub struct ConvoSide {
    pub target: Arc<Target>,
    pub document: Arc<dyn Document>,
}

impl ConvoSide {
    pub fn new(target: Arc<Target>, document: Arc<dyn Document>) -> Self {
        Self { target, document }
    }
}

// ========================= Shared Control State =========================

struct ConvoShared {
    paused: AtomicBool,
    stop: AtomicBool,
    turn: AtomicU32,
    state: watch::Sender<ConvoState>,
    events: Arc<dyn ConvoEvents>,
}

impl ConvoShared {
    fn set_state(&self, state: ConvoState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            self.events.on_state_change(state);
            // Leaving a waiting state clears any countdown display.
            let was_waiting =
                matches!(prev, ConvoState::WaitingForA | ConvoState::WaitingForB);
            let is_waiting =
                matches!(state, ConvoState::WaitingForA | ConvoState::WaitingForB);
            if was_waiting && !is_waiting {
                self.events.on_countdown(0);
            }
        }
    }

    fn state(&self) -> ConvoState {
        *self.state.borrow()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn turn(&self) -> u32 {
        self.turn.load(Ordering::SeqCst)
    }
}

/// Cloneable remote control for a running conversation.
#[derive(Clone)]
pub struct ConvoHandle {
    shared: Arc<ConvoShared>,
}

impl ConvoHandle {
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Clears the pause flag and republishes whose response is being awaited.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        if self.shared.state() == ConvoState::Paused {
            let next = if self.shared.turn() % 2 == 0 {
                ConvoState::WaitingForA
            } else {
                ConvoState::WaitingForB
            };
            self.shared.set_state(next);
        }
    }

    /// Idempotent. The controller notices the flag at its next loop boundary.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            self.shared.set_state(ConvoState::Completed);
        }
    }

    pub fn state(&self) -> ConvoState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConvoState> {
        self.shared.state.subscribe()
    }
}

// ========================= Export =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Text,
    Markdown,
}

#[derive(Clone, Debug)]
pub struct ExportDocument {
    pub filename: String,
    pub content: String,
}

// ========================= Controller =========================

enum HalfTurn {
    Continue(String),
    Stop(StopReason),
}

pub struct ConversationController {
    side_a: ConvoSide,
    side_b: ConvoSide,
    config: ConvoConfig,
    store: Arc<dyn FileStore>,
    shared: Arc<ConvoShared>,
    transcript: Vec<TranscriptEntry>,
    session_id: Option<String>,
    retry_count: u32,
}

impl ConversationController {
    pub fn new(side_a: ConvoSide, side_b: ConvoSide) -> Self {
        Self::with_events(side_a, side_b, Arc::new(NullEvents))
    }

    pub fn with_events(side_a: ConvoSide, side_b: ConvoSide, events: Arc<dyn ConvoEvents>) -> Self {
        let (state, _) = watch::channel(ConvoState::Idle);
        Self {
            side_a,
            side_b,
            config: ConvoConfig::default(),
            store: Arc::new(NullFileStore),
            shared: Arc::new(ConvoShared {
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                turn: AtomicU32::new(0),
                state,
                events,
            }),
            transcript: Vec::new(),
            session_id: None,
            retry_count: 0,
        }
    }

    pub fn with_config(mut self, config: ConvoConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = store;
        self
    }

    pub fn handle(&self) -> ConvoHandle {
        ConvoHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConvoState {
        self.shared.state()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn stats(&self) -> ConvoStats {
        ConvoStats {
            turn: self.shared.turn(),
            entries: self.transcript.len(),
            state: self.shared.state(),
        }
    }

    /// Run a conversation to completion. `role_a` / `role_b` are optional
    /// system-style framing prompts delivered before the opening message;
    /// `{topic}` inside them is replaced with the opening prompt.
    pub async fn run(
        &mut self,
        opening_prompt: &str,
        role_a: Option<&str>,
        role_b: Option<&str>,
    ) -> Result<ConvoSummary, CoreError> {
        match self.shared.state() {
            ConvoState::Idle | ConvoState::Completed => {}
            other => {
                return Err(CoreError::Config(format!(
                    "conversation already active (state {:?})",
                    other
                )))
            }
        }
        self.transcript.clear();
        self.retry_count = 0;
        self.shared.turn.store(0, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        let session_id = nanoid::nanoid!();
        self.session_id = Some(session_id.clone());
        self.shared.set_state(ConvoState::Initializing);
        info!(
            session = %session_id,
            a = %self.side_a.target.id,
            b = %self.side_b.target.id,
            max_turns = self.config.max_turns,
            "conversation starting"
        );

        let roles_sent = role_a.is_some() || role_b.is_some();
        if let Some(role) = role_a {
            let framed = apply_topic(role, opening_prompt);
            let side = self.side_a.clone();
            self.deliver(&side, &framed).await?;
        }
        if let Some(role) = role_b {
            let framed = apply_topic(role, opening_prompt);
            let side = self.side_b.clone();
            self.deliver(&side, &framed).await?;
        }
        if roles_sent {
            sleep(ROLE_SETTLE).await;
            if !self.sleep_with_countdown(self.config.turn_delay).await {
                return Ok(self.finish(session_id, StopReason::Stopped));
            }
        }

        self.append_entry(USER_SPEAKER, opening_prompt, 0).await;
        let opener = self.side_a.clone();
        self.deliver(&opener, opening_prompt).await?;

        let reason = loop {
            let a = self.side_a.clone();
            let message = match self.half_turn(&a, ConvoState::WaitingForA).await? {
                HalfTurn::Stop(r) => break r,
                HalfTurn::Continue(m) => m,
            };
            self.shared.set_state(ConvoState::Processing);
            sleep(INTER_TURN_DELAY).await;
            let b = self.side_b.clone();
            self.deliver(&b, &message).await?;

            let message = match self.half_turn(&b, ConvoState::WaitingForB).await? {
                HalfTurn::Stop(r) => break r,
                HalfTurn::Continue(m) => m,
            };
            self.shared.set_state(ConvoState::Processing);
            sleep(INTER_TURN_DELAY).await;
            let a = self.side_a.clone();
            self.deliver(&a, &message).await?;
        };

        Ok(self.finish(session_id, reason))
    }

    fn finish(&mut self, session_id: String, reason: StopReason) -> ConvoSummary {
        self.shared.set_state(ConvoState::Completed);
        let summary = ConvoSummary {
            session_id,
            turns: self.shared.turn(),
            entries: self.transcript.len(),
            stop_reason: reason,
        };
        info!(
            session = %summary.session_id,
            turns = summary.turns,
            reason = ?reason,
            "conversation finished"
        );
        self.shared.events.on_complete(&summary);
        summary
    }

    /// Wait for one side's response, record it, and decide whether the loop
    /// continues.
    async fn half_turn(
        &mut self,
        side: &ConvoSide,
        waiting: ConvoState,
    ) -> Result<HalfTurn, CoreError> {
        if self.shared.stopped() {
            return Ok(HalfTurn::Stop(StopReason::Stopped));
        }
        self.wait_if_paused(waiting).await;
        self.shared.set_state(waiting);
        if !self.sleep_with_countdown(self.config.turn_delay).await {
            return Ok(HalfTurn::Stop(StopReason::Stopped));
        }

        let text = loop {
            let outcome = monitor::await_completion(
                side.document.as_ref(),
                &side.target,
                self.config.response_timeout,
            )
            .await;
            if !outcome.completed {
                warn!(target = %side.target.id, signal = ?outcome.signal, "response did not complete cleanly");
            }
            match inject::extract_response(side.document.as_ref(), &side.target).await {
                Ok(Some(text)) => break text,
                Ok(None) => {
                    warn!(target = %side.target.id, "no response could be extracted");
                    return Ok(HalfTurn::Stop(StopReason::ResponseUnavailable));
                }
                Err(err) => {
                    if !self.backoff_or_fail(&err).await {
                        return Err(err);
                    }
                }
            }
        };
        if self.shared.stopped() {
            return Ok(HalfTurn::Stop(StopReason::Stopped));
        }

        let turn = self.shared.turn.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = self.append_entry(&side.target.name, &text, turn).await;
        self.retry_count = 0;
        self.shared.events.on_turn_complete(&entry);

        if self.is_repetitive() {
            warn!(turn, "conversation has gone repetitive, stopping");
            return Ok(HalfTurn::Stop(StopReason::RepetitionDetected));
        }
        if turn >= self.config.max_turns {
            return Ok(HalfTurn::Stop(StopReason::MaxTurnsReached));
        }
        Ok(HalfTurn::Continue(text))
    }

    /// Deliver text to one side, retrying with backoff until the policy is
    /// exhausted.
    async fn deliver(&mut self, side: &ConvoSide, text: &str) -> Result<(), CoreError> {
        loop {
            match inject::send_text(side.document.as_ref(), &side.target, text).await {
                Ok(outcome) if outcome.success => {
                    self.retry_count = 0;
                    return Ok(());
                }
                Ok(outcome) => {
                    let err = CoreError::Script(
                        outcome
                            .error
                            .unwrap_or_else(|| "injection reported failure".to_string()),
                    );
                    if !self.backoff_or_fail(&err).await {
                        return Err(err);
                    }
                }
                Err(err) => {
                    if !self.backoff_or_fail(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Returns true when the caller should retry after the backoff sleep.
    /// On exhaustion the conversation is moved to the error state, which is
    /// terminal until `run` is invoked on a fresh state.
    async fn backoff_or_fail(&mut self, err: &CoreError) -> bool {
        self.retry_count += 1;
        if self.retry_count <= self.config.retry.max_attempts {
            let delay = self.config.retry.delay_for(self.retry_count);
            warn!(%err, attempt = self.retry_count, ?delay, "turn step failed, backing off");
            sleep(delay).await;
            true
        } else {
            self.shared.set_state(ConvoState::Error);
            self.shared.events.on_error(err);
            false
        }
    }

    async fn wait_if_paused(&self, resume_to: ConvoState) {
        if !self.shared.paused.load(Ordering::SeqCst) {
            return;
        }
        self.shared.set_state(ConvoState::Paused);
        while self.shared.paused.load(Ordering::SeqCst) && !self.shared.stopped() {
            sleep(PAUSE_POLL).await;
        }
        if !self.shared.stopped() {
            self.shared.set_state(resume_to);
        }
    }

    /// Per-second countdown toward the next turn. Returns false when stopped
    /// mid-wait.
    async fn sleep_with_countdown(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining >= Duration::from_secs(1) {
            if self.shared.stopped() {
                return false;
            }
            self.shared.events.on_countdown(remaining.as_secs());
            sleep(Duration::from_secs(1)).await;
            remaining -= Duration::from_secs(1);
        }
        if !remaining.is_zero() {
            sleep(remaining).await;
        }
        !self.shared.stopped()
    }

    async fn append_entry(&mut self, speaker: &str, message: &str, turn: u32) -> TranscriptEntry {
        let entry = TranscriptEntry {
            timestamp_ms: now_ms(),
            speaker: speaker.to_string(),
            message: message.to_string(),
            turn,
        };
        self.transcript.push(entry.clone());
        // Write-through autosave; history loss is not worth failing the turn.
        match serde_json::to_string_pretty(&self.transcript) {
            Ok(json) => {
                if let Err(err) = self.store.write_file(HISTORY_FILE, &json).await {
                    warn!(%err, "transcript autosave failed");
                }
            }
            Err(err) => warn!(%err, "transcript serialization failed"),
        }
        entry
    }

    /// Only response entries count toward the repetition window; the user's
    /// opening prompt is not a turn.
    fn is_repetitive(&self) -> bool {
        let limit = self.config.repetition_limit;
        if limit == 0 {
            return false;
        }
        let responses: Vec<&TranscriptEntry> = self
            .transcript
            .iter()
            .filter(|e| e.speaker != USER_SPEAKER)
            .collect();
        if responses.len() < limit {
            return false;
        }
        let tail = &responses[responses.len() - limit..];
        let first = normalize(&tail[0].message);
        tail.iter().all(|e| normalize(&e.message) == first)
    }

    /// Render the transcript for download. Pure; never touches the store.
    pub fn export(&self, format: ExportFormat) -> Result<ExportDocument, CoreError> {
        if self.transcript.is_empty() {
            return Err(CoreError::Config("no conversation to export".to_string()));
        }
        let ts = now_ms();
        let (content, ext) = match format {
            ExportFormat::Json => (
                serde_json::to_string_pretty(&self.transcript)
                    .map_err(|e| CoreError::Other(e.to_string()))?,
                "json",
            ),
            ExportFormat::Text => {
                let mut out = String::new();
                for e in &self.transcript {
                    out.push_str(&format!("[turn {}] {}: {}\n", e.turn, e.speaker, e.message));
                }
                (out, "txt")
            }
            ExportFormat::Markdown => {
                let mut out = String::from("# Conversation\n\n");
                for e in &self.transcript {
                    out.push_str(&format!(
                        "**{}** (turn {}):\n\n{}\n\n---\n\n",
                        e.speaker, e.turn, e.message
                    ));
                }
                (out, "md")
            }
        };
        Ok(ExportDocument {
            filename: format!("conversation-{}.{}", ts, ext),
            content,
        })
    }
}

fn apply_topic(role: &str, topic: &str) -> String {
    role.replace("{topic}", topic)
}

fn normalize(message: &str) -> String {
    message.trim().to_lowercase()
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDocument;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    fn target(id: &str, name: &str) -> Arc<Target> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "id": id,
                "name": name,
                "url": format!("https://{id}.example"),
                "inputSelectors": ["textarea"],
                "submitSelectors": ["button"],
                "responseSelectors": [".answer"],
                "responseStabilityWaitMs": 600
            }))
            .unwrap(),
        )
    }

    // Fake page: injections succeed, the response text is produced by
    // `reply`, and the stability probe sees it immediately.
    fn scripted_side(id: &str, name: &str, reply: impl Fn(u32) -> String + Send + Sync + 'static) -> ConvoSide {
        let extractions = AtomicU32::new(0);
        let doc = FakeDocument::new(move |script| {
            if script.contains(r#""editor""#) {
                Ok(serde_json::json!({ "success": true, "method": "button" }))
            } else if script.contains("elements.length - 1") {
                let n = extractions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Value::String(reply(n)))
            } else if script.contains("combinedText") {
                Ok(Value::String("streamed".to_string()))
            } else {
                Ok(Value::Bool(false))
            }
        });
        ConvoSide::new(target(id, name), Arc::new(doc))
    }

    fn quick_config(max_turns: u32) -> ConvoConfig {
        ConvoConfig {
            max_turns,
            turn_delay: Duration::from_secs(1),
            response_timeout: Duration::from_secs(30),
            ..ConvoConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_max_turns() {
        let a = scripted_side("alpha", "Alpha", |n| format!("alpha says {n}"));
        let b = scripted_side("beta", "Beta", |n| format!("beta says {n}"));
        let mut ctl = ConversationController::new(a, b).with_config(quick_config(4));

        let summary = ctl.run("Let's debate.", None, None).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::MaxTurnsReached);
        assert_eq!(summary.turns, 4);
        // Opening user entry plus one entry per turn.
        assert_eq!(ctl.transcript().len(), 5);
        assert_eq!(ctl.transcript()[0].speaker, USER_SPEAKER);
        assert_eq!(ctl.transcript()[1].speaker, "Alpha");
        assert_eq!(ctl.transcript()[2].speaker, "Beta");
        assert_eq!(ctl.state(), ConvoState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn detects_repetition() {
        let a = scripted_side("alpha", "Alpha", |_| "  Same answer. ".to_string());
        let b = scripted_side("beta", "Beta", |_| "same answer.".to_string());
        let mut ctl = ConversationController::new(a, b).with_config(quick_config(20));

        let summary = ctl.run("Start.", None, None).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::RepetitionDetected);
        // Three identical responses are needed, so the stop lands on turn 3.
        assert_eq!(summary.turns, 3);
        assert_eq!(ctl.transcript().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn opening_prompt_never_counts_toward_repetition() {
        let a = scripted_side("alpha", "Alpha", |_| "Same answer.".to_string());
        let b = scripted_side("beta", "Beta", |_| "Same answer.".to_string());
        let mut ctl = ConversationController::new(a, b).with_config(quick_config(20));

        // The opening prompt normalizes identically to every response; it
        // still takes three responses to trip the guard.
        let summary = ctl.run("same answer.", None, None).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::RepetitionDetected);
        assert_eq!(summary.turns, 3);
        assert_eq!(ctl.transcript().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_response_ends_the_conversation() {
        let a = ConvoSide::new(
            target("alpha", "Alpha"),
            Arc::new(FakeDocument::new(|script| {
                if script.contains(r#""editor""#) {
                    Ok(serde_json::json!({ "success": true, "method": "enter" }))
                } else if script.contains("elements.length - 1") {
                    // Extraction yields no value at all.
                    Ok(Value::Null)
                } else if script.contains("combinedText") {
                    Ok(Value::String("text".to_string()))
                } else {
                    Ok(Value::Bool(false))
                }
            })),
        );
        let b = scripted_side("beta", "Beta", |n| format!("beta {n}"));
        let mut ctl = ConversationController::new(a, b).with_config(quick_config(10));

        let summary = ctl.run("Hello.", None, None).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::ResponseUnavailable);
        assert_eq!(summary.turns, 0);
        assert_eq!(ctl.state(), ConvoState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_exhausts_retries_and_blocks_reruns() {
        let failing = ConvoSide::new(
            target("alpha", "Alpha"),
            Arc::new(FakeDocument::new(|script| {
                if script.contains(r#""editor""#) {
                    Err(CoreError::Script("context destroyed".to_string()))
                } else {
                    Ok(Value::Bool(false))
                }
            })),
        );
        let b = scripted_side("beta", "Beta", |n| format!("beta {n}"));
        let mut ctl = ConversationController::new(failing, b).with_config(quick_config(10));

        let err = ctl.run("Hello.", None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Script(_)));
        assert_eq!(ctl.state(), ConvoState::Error);

        // Error state is terminal for this controller instance.
        let gated = ctl.run("Again.", None, None).await.unwrap_err();
        assert!(matches!(gated, CoreError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_waiting_conversation() {
        let a = scripted_side("alpha", "Alpha", |n| format!("alpha {n}"));
        let b = scripted_side("beta", "Beta", |n| format!("beta {n}"));
        let mut ctl = ConversationController::new(a, b).with_config(ConvoConfig {
            max_turns: 50,
            turn_delay: Duration::from_secs(120),
            response_timeout: Duration::from_secs(30),
            ..ConvoConfig::default()
        });
        let handle = ctl.handle();

        let task = tokio::spawn(async move {
            let result = ctl.run("Hello.", None, None).await;
            (ctl, result)
        });
        sleep(Duration::from_secs(5)).await;
        handle.stop();
        handle.stop(); // idempotent
        assert_eq!(handle.state(), ConvoState::Completed);

        let (ctl, result) = task.await.unwrap();
        let summary = result.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Stopped);
        assert_eq!(ctl.state(), ConvoState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn role_prompts_carry_the_topic() {
        let a = scripted_side("alpha", "Alpha", |n| format!("alpha {n}"));
        let b = scripted_side("beta", "Beta", |n| format!("beta {n}"));
        let mut ctl = ConversationController::new(a, b).with_config(quick_config(2));
        let summary = ctl
            .run(
                "bird migration",
                Some("You argue in favor of {topic}."),
                Some("You argue against {topic}."),
            )
            .await
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::MaxTurnsReached);
        assert_eq!(ctl.transcript()[0].message, "bird migration");
    }

    #[tokio::test(start_paused = true)]
    async fn export_renders_all_formats() {
        let a = scripted_side("alpha", "Alpha", |n| format!("alpha {n}"));
        let b = scripted_side("beta", "Beta", |n| format!("beta {n}"));
        let mut ctl = ConversationController::new(a, b).with_config(quick_config(2));

        assert!(matches!(
            ctl.export(ExportFormat::Json),
            Err(CoreError::Config(_))
        ));

        ctl.run("Hello.", None, None).await.unwrap();

        let json = ctl.export(ExportFormat::Json).unwrap();
        assert!(json.filename.ends_with(".json"));
        let parsed: Vec<TranscriptEntry> = serde_json::from_str(&json.content).unwrap();
        assert_eq!(parsed.len(), 3);

        let text = ctl.export(ExportFormat::Text).unwrap();
        assert!(text.filename.ends_with(".txt"));
        assert!(text.content.contains("Alpha: alpha 1"));

        let md = ctl.export(ExportFormat::Markdown).unwrap();
        assert!(md.filename.ends_with(".md"));
        assert!(md.content.starts_with("# Conversation"));
        assert!(md.content.contains("**Beta**"));
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_is_autosaved_through_the_store() {
        use std::sync::Mutex;

        struct RecordingStore {
            writes: Mutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl FileStore for RecordingStore {
            async fn read_file(&self, _name: &str) -> Result<Option<String>, CoreError> {
                Ok(None)
            }
            async fn write_file(&self, name: &str, _text: &str) -> Result<(), CoreError> {
                self.writes.lock().unwrap().push(name.to_string());
                Ok(())
            }
        }

        let store = Arc::new(RecordingStore {
            writes: Mutex::new(Vec::new()),
        });
        let a = scripted_side("alpha", "Alpha", |n| format!("alpha {n}"));
        let b = scripted_side("beta", "Beta", |n| format!("beta {n}"));
        let mut ctl = ConversationController::new(a, b)
            .with_config(quick_config(2))
            .with_store(store.clone());
        ctl.run("Hello.", None, None).await.unwrap();

        let writes = store.writes.lock().unwrap();
        // One write per transcript entry.
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|n| n == HISTORY_FILE));
    }
}
