//! Multi-strategy response completion detection.
//!
//! Different target surfaces expose different observable completion signals
//! (a spinner, a "stop generating" control, or nothing at all), so four
//! independent strategies race against the same document and the first to
//! settle wins. Losing strategies are dropped with the race, so no poller
//! outlives the decision.

use crate::document::Document;
use crate::error::CoreError;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const TYPING_POLL: Duration = Duration::from_millis(500);
const STABILITY_POLL: Duration = Duration::from_millis(300);
const STREAMING_POLL: Duration = Duration::from_millis(500);
/// The indicator must be absent for this many consecutive polls before the
/// typing strategy settles; a single absent poll can be indicator flicker.
const REQUIRED_ABSENT_POLLS: u32 = 2;
/// Consecutive probe failures after which a strategy gives up on the
/// document instead of polling a dead page forever.
const PROBE_ERROR_CEILING: u32 = 20;

/// Which strategy decided that the response is complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionSignal {
    TypingIndicatorGone,
    DomStable,
    StreamingStopped,
    TimedOut,
    MonitorError,
}

#[derive(Clone, Copy, Debug)]
pub struct MonitorOutcome {
    pub completed: bool,
    pub signal: CompletionSignal,
    pub elapsed: Duration,
}

fn visibility_probe(selectors: &[String], check_disabled: bool) -> Result<String, CoreError> {
    let json = serde_json::to_string(selectors).map_err(|e| CoreError::Script(e.to_string()))?;
    let disabled_check = if check_disabled { " && !el.disabled" } else { "" };
    Ok(format!(
        r#"(function() {{
  const selectors = {json};
  for (const selector of selectors) {{
    try {{
      const elements = document.querySelectorAll(selector);
      for (const el of elements) {{
        const style = window.getComputedStyle(el);
        if (style.display !== 'none' && style.visibility !== 'hidden' && style.opacity !== '0'{disabled_check}) {{
          return true;
        }}
      }}
    }} catch (e) {{}}
  }}
  return false;
}})()"#
    ))
}

/// Combined text of all elements in the last response-selector group that
/// matches anything.
fn stability_probe(selectors: &[String]) -> Result<String, CoreError> {
    let json = serde_json::to_string(selectors).map_err(|e| CoreError::Script(e.to_string()))?;
    Ok(format!(
        r#"(function() {{
  const selectors = {json};
  let responseText = '';
  for (const selector of selectors) {{
    try {{
      const elements = document.querySelectorAll(selector);
      if (elements.length > 0) {{
        let combinedText = '';
        for (const el of elements) combinedText += el.textContent;
        responseText = combinedText;
      }}
    }} catch (e) {{}}
  }}
  return responseText;
}})()"#
    ))
}

struct ProbeErrors {
    consecutive: u32,
}

impl ProbeErrors {
    fn new() -> Self {
        Self { consecutive: 0 }
    }

    fn ok(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the ceiling is reached.
    fn failed(&mut self, context: &str, err: &CoreError) -> bool {
        self.consecutive += 1;
        warn!(%err, context, consecutive = self.consecutive, "response probe failed");
        self.consecutive >= PROBE_ERROR_CEILING
    }
}

/// Settles once the typing indicator has been absent for two consecutive
/// polls. Never settles when the target declares no indicator selectors.
async fn typing_indicator_gone(doc: &dyn Document, target: &Target) -> CompletionSignal {
    if target.typing_indicator_selectors.is_empty() {
        future::pending::<()>().await;
    }
    let script = match visibility_probe(&target.typing_indicator_selectors, false) {
        Ok(s) => s,
        Err(_) => future::pending().await,
    };
    let mut absent = 0u32;
    let mut errors = ProbeErrors::new();
    loop {
        sleep(TYPING_POLL).await;
        match doc.execute_script(&script).await {
            Ok(value) => {
                errors.ok();
                if value.as_bool().unwrap_or(false) {
                    absent = 0;
                } else {
                    absent += 1;
                    if absent >= REQUIRED_ABSENT_POLLS {
                        return CompletionSignal::TypingIndicatorGone;
                    }
                }
            }
            Err(e) => {
                if errors.failed("typing indicator", &e) {
                    return CompletionSignal::MonitorError;
                }
            }
        }
    }
}

/// Settles once the response text has been non-empty and unchanged for the
/// target's stability wait.
async fn dom_stable(doc: &dyn Document, target: &Target) -> CompletionSignal {
    let script = match stability_probe(&target.response_selectors) {
        Ok(s) => s,
        Err(_) => future::pending().await,
    };
    let wait = target.stability_wait();
    let mut last_text = String::new();
    let mut last_change = Instant::now();
    let mut errors = ProbeErrors::new();
    loop {
        sleep(STABILITY_POLL).await;
        match doc.execute_script(&script).await {
            Ok(value) => {
                errors.ok();
                let current = match value {
                    Value::String(s) => s,
                    _ => continue,
                };
                if current.is_empty() {
                    continue;
                }
                if current != last_text {
                    last_text = current;
                    last_change = Instant::now();
                } else if last_change.elapsed() >= wait {
                    return CompletionSignal::DomStable;
                }
            }
            Err(e) => {
                if errors.failed("dom stability", &e) {
                    return CompletionSignal::MonitorError;
                }
            }
        }
    }
}

/// Settles only on the transition from "stop control visible" to "stop
/// control gone"; sustained absence means generation may not have started.
async fn streaming_stopped(doc: &dyn Document, target: &Target) -> CompletionSignal {
    if target.streaming_stop_selectors.is_empty() {
        future::pending::<()>().await;
    }
    let script = match visibility_probe(&target.streaming_stop_selectors, true) {
        Ok(s) => s,
        Err(_) => future::pending().await,
    };
    let mut was_streaming = false;
    let mut errors = ProbeErrors::new();
    loop {
        sleep(STREAMING_POLL).await;
        match doc.execute_script(&script).await {
            Ok(value) => {
                errors.ok();
                let streaming = value.as_bool().unwrap_or(false);
                if streaming {
                    was_streaming = true;
                } else if was_streaming {
                    return CompletionSignal::StreamingStopped;
                }
            }
            Err(e) => {
                if errors.failed("streaming stop", &e) {
                    return CompletionSignal::MonitorError;
                }
            }
        }
    }
}

/// Decide when a response rendered by an uncooperative page is finished.
/// Always returns within `timeout` (plus one poll interval).
pub async fn await_completion(
    doc: &dyn Document,
    target: &Target,
    timeout: Duration,
) -> MonitorOutcome {
    debug!(target = %target.id, ?timeout, "awaiting response completion");
    let started = Instant::now();
    let signal = tokio::select! {
        s = typing_indicator_gone(doc, target) => s,
        s = dom_stable(doc, target) => s,
        s = streaming_stopped(doc, target) => s,
        _ = sleep(timeout) => CompletionSignal::TimedOut,
    };
    let elapsed = started.elapsed();
    let completed = matches!(
        signal,
        CompletionSignal::TypingIndicatorGone
            | CompletionSignal::DomStable
            | CompletionSignal::StreamingStopped
    );
    info!(target = %target.id, ?signal, ?elapsed, "response detection settled");
    MonitorOutcome {
        completed,
        signal,
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDocument;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn target(json: serde_json::Value) -> Target {
        serde_json::from_value(json).unwrap()
    }

    fn base_target() -> serde_json::Value {
        serde_json::json!({
            "id": "alpha",
            "name": "Alpha",
            "url": "https://alpha.example",
            "inputSelectors": ["textarea"],
            "submitSelectors": ["button"],
            "responseSelectors": [".answer"],
            "responseStabilityWaitMs": 600
        })
    }

    #[tokio::test(start_paused = true)]
    async fn dom_stability_settles_after_quiet_period() {
        let polls = Arc::new(AtomicU32::new(0));
        let polls2 = polls.clone();
        // Text grows for three polls, then stays put.
        let doc = FakeDocument::new(move |_script| {
            let n = polls2.fetch_add(1, Ordering::SeqCst).min(3);
            Ok(serde_json::Value::String("chunk ".repeat(n as usize + 1)))
        });
        let t = target(base_target());
        let outcome = await_completion(&doc, &t, Duration::from_secs(30)).await;
        assert!(outcome.completed);
        assert_eq!(outcome.signal, CompletionSignal::DomStable);
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_never_counts_as_stable() {
        let doc = FakeDocument::new(|_| Ok(serde_json::Value::String(String::new())));
        let t = target(base_target());
        let outcome = await_completion(&doc, &t, Duration::from_secs(5)).await;
        assert!(!outcome.completed);
        assert_eq!(outcome.signal, CompletionSignal::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_needs_two_consecutive_absent_polls() {
        let mut cfg = base_target();
        cfg["typingIndicatorSelectors"] = serde_json::json!([".spinner"]);
        // Disable the stability strategy for this test.
        cfg["responseSelectors"] = serde_json::json!([]);
        let polls = Arc::new(AtomicU32::new(0));
        let polls2 = polls.clone();
        // visible, flicker-absent, visible, then gone for good.
        let visibility = [true, false, true, false, false];
        let doc = FakeDocument::new(move |script| {
            if script.contains("getComputedStyle") {
                let n = polls2.fetch_add(1, Ordering::SeqCst) as usize;
                Ok(serde_json::Value::Bool(
                    *visibility.get(n).unwrap_or(&false),
                ))
            } else {
                Ok(serde_json::Value::String(String::new()))
            }
        });
        let t = target(cfg);
        let outcome = await_completion(&doc, &t, Duration::from_secs(30)).await;
        assert_eq!(outcome.signal, CompletionSignal::TypingIndicatorGone);
        // 5 polls at 500ms: the flicker at poll 2 must not have settled it.
        assert!(outcome.elapsed >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_stop_requires_a_visible_to_gone_transition() {
        let mut cfg = base_target();
        cfg["streamingStopSelectors"] = serde_json::json!(["button.stop"]);
        cfg["responseSelectors"] = serde_json::json!([]);
        let polls = Arc::new(AtomicU32::new(0));
        let polls2 = polls.clone();
        // Absent at first (generation not started), then visible, then gone.
        let visible = [false, false, true, true, false];
        let doc = FakeDocument::new(move |script| {
            if script.contains("getComputedStyle") {
                let n = polls2.fetch_add(1, Ordering::SeqCst) as usize;
                Ok(serde_json::Value::Bool(*visible.get(n).unwrap_or(&false)))
            } else {
                Ok(serde_json::Value::String(String::new()))
            }
        });
        let t = target(cfg);
        let outcome = await_completion(&doc, &t, Duration::from_secs(30)).await;
        assert_eq!(outcome.signal, CompletionSignal::StreamingStopped);
        assert!(outcome.elapsed >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_guarantees_progress_without_usable_markup() {
        let mut cfg = base_target();
        cfg["responseSelectors"] = serde_json::json!([]);
        let doc = FakeDocument::new(|_| Ok(serde_json::Value::String(String::new())));
        let t = target(cfg);
        let outcome = await_completion(&doc, &t, Duration::from_secs(3)).await;
        assert!(!outcome.completed);
        assert_eq!(outcome.signal, CompletionSignal::TimedOut);
        assert!(outcome.elapsed >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_probe_failure_settles_as_monitor_error() {
        let doc = FakeDocument::new(|_| Err(CoreError::Script("page went away".into())));
        let t = target(base_target());
        let outcome = await_completion(&doc, &t, Duration::from_secs(60)).await;
        assert!(!outcome.completed);
        assert_eq!(outcome.signal, CompletionSignal::MonitorError);
    }
}
