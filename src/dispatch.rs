//! Multi-target fan-out: broadcast, response collection, comparison prompts
//! and yes/no voting across every active target.

use crate::document::{Clipboard, Document, FileStore, NullFileStore};
use crate::error::CoreError;
use crate::inject::{self, InjectMethod};
use crate::target::{Target, TargetSet};
use crate::vote::{classify, Vote, VoteStrategy};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{info, warn};

const NATIVE_PASTE_SETTLE: Duration = Duration::from_millis(50);
const PROMPT_HISTORY_FILE: &str = "prompt-history.json";
const SESSION_HISTORY_FILE: &str = "session-history.json";
const MAX_PROMPT_HISTORY: usize = 100;
const MAX_SESSION_HISTORY: usize = 50;

/// Prompt scaffolding for the comparison operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparePrompts {
    pub compare_intro: String,
    pub cross_compare_intro: String,
    pub answer_prefix: String,
    /// Appended after the response blocks; empty by default since the intro
    /// already asks for a ranking.
    pub outro: String,
}

impl Default for ComparePrompts {
    fn default() -> Self {
        Self {
            compare_intro: "Compare the following responses from different AI assistants to the same question.\nRate each response by: Correctness, Completeness, Clarity.\nCreate a ranking and briefly explain the strengths/weaknesses.\n\nThe responses:\n\n".to_string(),
            cross_compare_intro: "Here are responses from other AI assistants to the same question.\nCompare them with your own response. What are the differences?\nWhich response is best and why?\n\n".to_string(),
            answer_prefix: "=== Response from".to_string(),
            outro: String::new(),
        }
    }
}

/// Per-target result of a fan-out operation. One failed target never aborts
/// the others.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub target_id: String,
    pub success: bool,
    pub method: Option<InjectMethod>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterRef {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct TargetResponse {
    pub voter: VoterRef,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TallyOutcome {
    MajorityYes,
    MajorityNo,
    Tie,
    Unclear,
    NoResponses,
}

/// Who voted which way in a yes/no evaluation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub yes: Vec<VoterRef>,
    pub no: Vec<VoterRef>,
    pub unclear: Vec<VoterRef>,
}

impl VoteTally {
    pub fn outcome(&self) -> TallyOutcome {
        if self.yes.is_empty() && self.no.is_empty() && self.unclear.is_empty() {
            return TallyOutcome::NoResponses;
        }
        match self.yes.len().cmp(&self.no.len()) {
            std::cmp::Ordering::Greater => TallyOutcome::MajorityYes,
            std::cmp::Ordering::Less => TallyOutcome::MajorityNo,
            std::cmp::Ordering::Equal if !self.yes.is_empty() => TallyOutcome::Tie,
            std::cmp::Ordering::Equal => TallyOutcome::Unclear,
        }
    }
}

/// One recorded set of per-target page URLs, for returning every target to
/// an earlier chat session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub timestamp_ms: u128,
    pub urls: BTreeMap<String, String>,
}

/// Owns the broadcast context: which targets exist, which are active, which
/// are muted for the next send, and each target's live document.
pub struct Dispatcher {
    targets: TargetSet,
    documents: HashMap<String, Arc<dyn Document>>,
    active: HashSet<String>,
    muted: HashSet<String>,
    vote_strategy: VoteStrategy,
    prompts: ComparePrompts,
    last_tally: Option<VoteTally>,
    store: Arc<dyn FileStore>,
    prompt_history: Vec<String>,
    session_history: Vec<SessionSnapshot>,
}

impl Dispatcher {
    /// All configured targets start active.
    pub fn new(targets: TargetSet) -> Self {
        let active = targets.ids().into_iter().collect();
        Self {
            targets,
            documents: HashMap::new(),
            active,
            muted: HashSet::new(),
            vote_strategy: VoteStrategy::Weighted,
            prompts: ComparePrompts::default(),
            last_tally: None,
            store: Arc::new(NullFileStore),
            prompt_history: Vec::new(),
            session_history: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_vote_strategy(mut self, strategy: VoteStrategy) -> Self {
        self.vote_strategy = strategy;
        self
    }

    pub fn with_prompts(mut self, prompts: ComparePrompts) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn attach_document(
        &mut self,
        target_id: &str,
        document: Arc<dyn Document>,
    ) -> Result<(), CoreError> {
        if self.targets.get(target_id).is_none() {
            return Err(CoreError::TargetNotFound(target_id.to_string()));
        }
        self.documents.insert(target_id.to_string(), document);
        Ok(())
    }

    pub fn set_active(&mut self, ids: impl IntoIterator<Item = String>) {
        self.active = ids.into_iter().collect();
    }

    pub fn is_active(&self, target_id: &str) -> bool {
        self.active.contains(target_id)
    }

    /// Exclude a target from the next text broadcast only. The mute set is
    /// cleared once that broadcast has run.
    pub fn mute(&mut self, target_id: &str) {
        self.muted.insert(target_id.to_string());
    }

    pub fn unmute(&mut self, target_id: &str) {
        self.muted.remove(target_id);
    }

    pub fn clear_muted(&mut self) {
        self.muted.clear();
    }

    pub fn muted(&self) -> &HashSet<String> {
        &self.muted
    }

    pub fn last_tally(&self) -> Option<&VoteTally> {
        self.last_tally.as_ref()
    }

    pub fn reset_votes(&mut self) {
        self.last_tally = None;
    }

    /// Active targets with an attached document, in configuration order.
    fn recipients(&self, honor_mute: bool) -> Vec<(Arc<Target>, Arc<dyn Document>)> {
        self.targets
            .iter()
            .filter(|t| self.active.contains(&t.id))
            .filter(|t| !honor_mute || !self.muted.contains(&t.id))
            .filter_map(|t| {
                self.documents
                    .get(&t.id)
                    .map(|doc| (t.clone(), doc.clone()))
            })
            .collect()
    }

    // ========================= Broadcast =========================

    /// Send `text` to every active, unmuted target concurrently. Mutes are
    /// one-shot and consumed here. The prompt is recorded in the persistent
    /// prompt history.
    pub async fn broadcast_send(&mut self, text: &str) -> Vec<DispatchResult> {
        self.record_prompt(text).await;
        self.dispatch_text(text).await
    }

    async fn dispatch_text(&mut self, text: &str) -> Vec<DispatchResult> {
        let recipients = self.recipients(true);
        info!(count = recipients.len(), "broadcasting text");
        let futures = recipients.into_iter().map(|(target, doc)| {
            let text = text.to_string();
            async move {
                match inject::send_text(doc.as_ref(), &target, &text).await {
                    Ok(outcome) => DispatchResult {
                        target_id: target.id.clone(),
                        success: outcome.success,
                        method: outcome.method,
                        error: outcome.error,
                    },
                    Err(err) => DispatchResult {
                        target_id: target.id.clone(),
                        success: false,
                        method: None,
                        error: Some(err.to_string()),
                    },
                }
            }
        });
        let results = join_all(futures).await;
        self.muted.clear();
        results
    }

    /// Attach an image to every active target. Mutes do not apply to images.
    /// Targets that signal `needs_native_paste` get a real focus-and-paste
    /// through their document handle.
    pub async fn broadcast_image(&mut self, bytes: &[u8], mime_type: &str) -> Vec<DispatchResult> {
        let recipients = self.recipients(false);
        info!(count = recipients.len(), mime = mime_type, "broadcasting image");
        let futures = recipients.into_iter().map(|(target, doc)| {
            let bytes = bytes.to_vec();
            let mime = mime_type.to_string();
            async move {
                let result = image_to_target(doc.as_ref(), &target, &bytes, &mime).await;
                match result {
                    Ok(r) => r,
                    Err(err) => DispatchResult {
                        target_id: target.id.clone(),
                        success: false,
                        method: None,
                        error: Some(err.to_string()),
                    },
                }
            }
        });
        join_all(futures).await
    }

    /// Read an image off the host clipboard and broadcast it.
    pub async fn paste_image_from_clipboard(
        &mut self,
        clipboard: &dyn Clipboard,
    ) -> Result<Vec<DispatchResult>, CoreError> {
        let (bytes, mime_type) = clipboard
            .read_image()
            .await?
            .ok_or_else(|| CoreError::Clipboard("no image on clipboard".to_string()))?;
        Ok(self.broadcast_image(&bytes, &mime_type).await)
    }

    // ========================= Responses =========================

    pub async fn latest_response(&self, target_id: &str) -> Result<Option<String>, CoreError> {
        let (target, doc) = self.lookup(target_id)?;
        inject::extract_response(doc.as_ref(), &target).await
    }

    /// Non-empty responses of all active targets. Targets that fail or have
    /// nothing to say are skipped, not errors.
    pub async fn collect_responses(&self) -> Vec<TargetResponse> {
        let mut responses = Vec::new();
        for (target, doc) in self.recipients(false) {
            match inject::extract_response(doc.as_ref(), &target).await {
                Ok(Some(text)) if !text.trim().is_empty() => responses.push(TargetResponse {
                    voter: VoterRef {
                        id: target.id.clone(),
                        name: target.name.clone(),
                    },
                    text,
                }),
                Ok(_) => {}
                Err(err) => warn!(target = %target.id, %err, "response collection failed"),
            }
        }
        responses
    }

    /// Copy one target's latest response to the host clipboard.
    pub async fn copy_response(
        &self,
        target_id: &str,
        clipboard: &dyn Clipboard,
    ) -> Result<String, CoreError> {
        let text = self
            .latest_response(target_id)
            .await?
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CoreError::EmptyExtraction(target_id.to_string()))?;
        clipboard.write_text(&text).await?;
        Ok(text)
    }

    // ========================= Comparison =========================

    /// Show one target everyone else's responses and ask it to compare them
    /// with its own.
    pub async fn cross_compare(&self, target_id: &str) -> Result<DispatchResult, CoreError> {
        let (target, doc) = self.lookup(target_id)?;
        let others: Vec<TargetResponse> = self
            .collect_responses()
            .await
            .into_iter()
            .filter(|r| r.voter.id != target_id)
            .collect();
        if others.is_empty() {
            return Err(CoreError::NotEnoughResponses(0));
        }
        let prompt = self.build_prompt(&self.prompts.cross_compare_intro, &others);
        let outcome = inject::send_text(doc.as_ref(), &target, &prompt).await?;
        Ok(DispatchResult {
            target_id: target_id.to_string(),
            success: outcome.success,
            method: outcome.method,
            error: outcome.error,
        })
    }

    /// Send every active target the full set of responses for ranking.
    pub async fn compare_all(&mut self) -> Result<Vec<DispatchResult>, CoreError> {
        let responses = self.collect_responses().await;
        if responses.len() < 2 {
            return Err(CoreError::NotEnoughResponses(responses.len()));
        }
        let prompt = self.build_prompt(&self.prompts.compare_intro, &responses);
        // Aggregate prompts are derived, not user input; they stay out of the
        // prompt history.
        Ok(self.dispatch_text(&prompt).await)
    }

    fn build_prompt(&self, intro: &str, responses: &[TargetResponse]) -> String {
        let mut prompt = intro.to_string();
        for r in responses {
            prompt.push_str(&format!(
                "{} {} ===\n{}\n\n",
                self.prompts.answer_prefix, r.voter.name, r.text
            ));
        }
        prompt.push_str(&self.prompts.outro);
        prompt
    }

    // ========================= History =========================

    pub fn prompt_history(&self) -> &[String] {
        &self.prompt_history
    }

    pub fn session_history(&self) -> &[SessionSnapshot] {
        &self.session_history
    }

    /// Load both histories from the store. Missing or unreadable files leave
    /// the in-memory history empty.
    pub async fn load_history(&mut self) {
        match self.store.read_file(PROMPT_HISTORY_FILE).await {
            Ok(Some(text)) => {
                self.prompt_history = serde_json::from_str(&text).unwrap_or_default();
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "prompt history load failed"),
        }
        match self.store.read_file(SESSION_HISTORY_FILE).await {
            Ok(Some(text)) => {
                self.session_history = serde_json::from_str(&text).unwrap_or_default();
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "session history load failed"),
        }
    }

    /// Append a broadcast prompt to the persistent history. Blank prompts and
    /// immediate repeats are skipped; the history is capped.
    async fn record_prompt(&mut self, prompt: &str) {
        if prompt.trim().is_empty() {
            return;
        }
        if self.prompt_history.last().map(String::as_str) == Some(prompt) {
            return;
        }
        self.prompt_history.push(prompt.to_string());
        if self.prompt_history.len() > MAX_PROMPT_HISTORY {
            let excess = self.prompt_history.len() - MAX_PROMPT_HISTORY;
            self.prompt_history.drain(..excess);
        }
        // Best-effort write-through, same policy as the transcript autosave.
        match serde_json::to_string_pretty(&self.prompt_history) {
            Ok(json) => {
                if let Err(err) = self.store.write_file(PROMPT_HISTORY_FILE, &json).await {
                    warn!(%err, "prompt history save failed");
                }
            }
            Err(err) => warn!(%err, "prompt history serialization failed"),
        }
    }

    /// Record where every active target currently is. Returns the new
    /// snapshot, or `None` when nothing usable was captured or nothing
    /// changed since the last snapshot.
    pub async fn snapshot_session(&mut self) -> Option<&SessionSnapshot> {
        let mut urls = BTreeMap::new();
        for (target, doc) in self.recipients(false) {
            match doc.current_url().await {
                Ok(url) if !url.is_empty() && !url.starts_with("about:") => {
                    urls.insert(target.id.clone(), url);
                }
                Ok(_) => {}
                Err(err) => warn!(target = %target.id, %err, "session url read failed"),
            }
        }
        if urls.is_empty() {
            return None;
        }
        if self.session_history.last().map(|s| &s.urls) == Some(&urls) {
            return None;
        }
        self.session_history.push(SessionSnapshot {
            timestamp_ms: now_ms(),
            urls,
        });
        if self.session_history.len() > MAX_SESSION_HISTORY {
            let excess = self.session_history.len() - MAX_SESSION_HISTORY;
            self.session_history.drain(..excess);
        }
        match serde_json::to_string_pretty(&self.session_history) {
            Ok(json) => {
                if let Err(err) = self.store.write_file(SESSION_HISTORY_FILE, &json).await {
                    warn!(%err, "session history save failed");
                }
            }
            Err(err) => warn!(%err, "session history serialization failed"),
        }
        self.session_history.last()
    }

    /// Navigate every known target back to the URLs in `snapshot`. Targets
    /// without a recorded URL or without a document are left where they are.
    pub async fn restore_session(&self, snapshot: &SessionSnapshot) {
        for (id, url) in &snapshot.urls {
            if let Some(doc) = self.documents.get(id) {
                if let Err(err) = doc.load_url(url).await {
                    warn!(target = %id, %err, "session url restore failed");
                }
            }
        }
    }

    // ========================= Voting =========================

    /// Classify every active target's latest response as yes/no/unclear.
    pub async fn evaluate_yes_no(&mut self) -> VoteTally {
        let responses = self.collect_responses().await;
        let mut tally = VoteTally::default();
        for r in responses {
            match classify(&r.text, self.vote_strategy) {
                Vote::Yes => tally.yes.push(r.voter),
                Vote::No => tally.no.push(r.voter),
                Vote::Unclear => tally.unclear.push(r.voter),
            }
        }
        info!(
            yes = tally.yes.len(),
            no = tally.no.len(),
            unclear = tally.unclear.len(),
            outcome = ?tally.outcome(),
            "yes/no evaluation"
        );
        self.last_tally = Some(tally.clone());
        tally
    }

    fn lookup(&self, target_id: &str) -> Result<(Arc<Target>, Arc<dyn Document>), CoreError> {
        let target = self
            .targets
            .get(target_id)
            .ok_or_else(|| CoreError::TargetNotFound(target_id.to_string()))?
            .clone();
        let doc = self
            .documents
            .get(target_id)
            .ok_or_else(|| CoreError::TargetNotFound(target_id.to_string()))?
            .clone();
        Ok((target, doc))
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

async fn image_to_target(
    doc: &dyn Document,
    target: &Target,
    bytes: &[u8],
    mime_type: &str,
) -> Result<DispatchResult, CoreError> {
    let outcome = inject::insert_image(doc, target, bytes, mime_type).await?;
    if outcome.needs_native_paste {
        inject::focus_input(doc, target).await?;
        doc.focus().await?;
        sleep(NATIVE_PASTE_SETTLE).await;
        doc.paste().await?;
        return Ok(DispatchResult {
            target_id: target.id.clone(),
            success: true,
            method: Some(InjectMethod::NativePaste),
            error: None,
        });
    }
    Ok(DispatchResult {
        target_id: target.id.clone(),
        success: outcome.success,
        method: outcome.method,
        error: outcome.error,
    })
}
