//! DOM-manipulation programs for placing text and images into a target's
//! input widget and reading responses back.
//!
//! The operation is described by a serde-serialized command struct embedded
//! as the single data value inside a fixed interpreter program. User text
//! only ever crosses the document boundary as JSON, so arbitrary content
//! cannot break out of the generated program.

use crate::document::Document;
use crate::error::CoreError;
use crate::target::{ImageInsertMethod, Target};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// Timing constants carried over from the proven injection flow.
const INPUT_RETRY_DELAY_MS: u64 = 1500;
const IMAGE_INPUT_RETRY_DELAY_MS: u64 = 500;
const INSERT_SETTLE_MS: u64 = 1000;
const SUBMIT_POLL_ATTEMPTS: u32 = 10;
const SUBMIT_POLL_INTERVAL_MS: u64 = 300;

/// How a payload ended up being delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InjectMethod {
    Button,
    Enter,
    FileInput,
    Drop,
    #[serde(rename = "paste")]
    PasteEvent,
    NativePaste,
}

/// Structured result returned by every injection program.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectionOutcome {
    pub success: bool,
    pub method: Option<InjectMethod>,
    pub error: Option<String>,
    pub needs_native_paste: bool,
}

impl InjectionOutcome {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|e| InjectionOutcome {
            success: false,
            method: None,
            error: Some(format!("unparseable injection result: {}", e)),
            needs_native_paste: false,
        })
    }
}

/// Command interpreted inside the target document to insert and submit text.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommand {
    pub text: String,
    pub input_selectors: Vec<String>,
    pub submit_selectors: Vec<String>,
    pub editor: crate::target::EditorFamily,
    pub input_retry_delay_ms: u64,
    pub insert_settle_ms: u64,
    pub submit_poll_attempts: u32,
    pub submit_poll_interval_ms: u64,
}

impl SendCommand {
    pub fn for_target(target: &Target, text: &str) -> Self {
        Self {
            text: text.to_string(),
            input_selectors: target.input_selectors.clone(),
            submit_selectors: target.submit_selectors.clone(),
            editor: target.editor,
            input_retry_delay_ms: INPUT_RETRY_DELAY_MS,
            insert_settle_ms: INSERT_SETTLE_MS,
            submit_poll_attempts: SUBMIT_POLL_ATTEMPTS,
            submit_poll_interval_ms: SUBMIT_POLL_INTERVAL_MS,
        }
    }
}

/// Command interpreted inside the target document to attach an image.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCommand {
    pub input_selectors: Vec<String>,
    pub methods: Vec<ImageInsertMethod>,
    pub mime_type: String,
    pub data_base64: String,
    pub input_retry_delay_ms: u64,
}

impl ImageCommand {
    pub fn for_target(target: &Target, bytes: &[u8], mime_type: &str) -> Self {
        Self {
            input_selectors: target.input_selectors.clone(),
            methods: target.image_insert_methods.clone(),
            mime_type: mime_type.to_string(),
            data_base64: B64.encode(bytes),
            input_retry_delay_ms: IMAGE_INPUT_RETRY_DELAY_MS,
        }
    }
}

/// Serialize a command to a JSON literal safe to embed in a JS program.
/// JSON is valid JS except for U+2028/U+2029, which serde_json does not
/// escape.
fn json_literal<T: Serialize>(value: &T) -> Result<String, CoreError> {
    let json = serde_json::to_string(value).map_err(|e| CoreError::Script(e.to_string()))?;
    Ok(json
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029"))
}

const SEND_INTERPRETER: &str = r#"
const sleep = (ms) => new Promise((r) => setTimeout(r, ms));
function findElement(selectors) {
  for (const selector of selectors) {
    try {
      const el = document.querySelector(selector);
      if (el) return el;
    } catch (e) {}
  }
  return null;
}
async function insertText(element, text) {
  element.focus();
  await sleep(100);
  if (element.tagName === 'TEXTAREA' || element.tagName === 'INPUT') {
    element.value = text;
    element.dispatchEvent(new Event('input', { bubbles: true }));
    element.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
  }
  const isQuill = cmd.editor === 'quill' || element.classList.contains('ql-editor');
  const isProseMirror = cmd.editor === 'proseMirror' || element.classList.contains('ProseMirror');
  const isLexical = cmd.editor === 'lexical' || element.hasAttribute('data-lexical-editor');
  if (isQuill || isProseMirror || isLexical || element.isContentEditable) {
    if (isProseMirror) {
      const selection = window.getSelection();
      const range = document.createRange();
      range.selectNodeContents(element);
      selection.removeAllRanges();
      selection.addRange(range);
    } else {
      document.execCommand('selectAll', false, null);
    }
    document.execCommand('delete', false, null);
    await sleep(50);
    document.execCommand('insertText', false, text);
    element.dispatchEvent(new Event('input', { bubbles: true, composed: true }));
    return true;
  }
  return false;
}
let inputEl = findElement(cmd.inputSelectors);
if (!inputEl) {
  await sleep(cmd.inputRetryDelayMs);
  inputEl = findElement(cmd.inputSelectors);
}
if (!inputEl) {
  return { success: false, error: 'input not found' };
}
await insertText(inputEl, cmd.text);
await sleep(cmd.insertSettleMs);
let submitBtn = null;
for (let i = 0; i < cmd.submitPollAttempts; i++) {
  submitBtn = findElement(cmd.submitSelectors);
  if (submitBtn && !submitBtn.disabled) break;
  await sleep(cmd.submitPollIntervalMs);
  submitBtn = null;
}
if (submitBtn && !submitBtn.disabled) {
  submitBtn.click();
  return { success: true, method: 'button' };
}
inputEl.dispatchEvent(new KeyboardEvent('keydown', {
  key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true
}));
return { success: true, method: 'enter' };
"#;

const IMAGE_INTERPRETER: &str = r#"
const sleep = (ms) => new Promise((r) => setTimeout(r, ms));
function findElement(selectors) {
  for (const selector of selectors) {
    try {
      const el = document.querySelector(selector);
      if (el) return el;
    } catch (e) {}
  }
  return null;
}
let inputEl = findElement(cmd.inputSelectors);
if (!inputEl) {
  await sleep(cmd.inputRetryDelayMs);
  inputEl = findElement(cmd.inputSelectors);
}
if (!inputEl) {
  return { success: false, error: 'input not found' };
}
try {
  const byteString = atob(cmd.dataBase64);
  const ab = new ArrayBuffer(byteString.length);
  const ia = new Uint8Array(ab);
  for (let i = 0; i < byteString.length; i++) ia[i] = byteString.charCodeAt(i);
  const blob = new Blob([ab], { type: cmd.mimeType });
  const file = new File([blob], 'image.' + cmd.mimeType.split('/')[1], { type: cmd.mimeType });
  inputEl.focus();
  await sleep(100);
  for (const method of cmd.methods) {
    if (method === 'nativePaste') {
      return { success: false, needsNativePaste: true };
    }
    if (method === 'fileInput') {
      const fileInput = document.querySelector('input[type="file"][accept*="image"]')
                     || document.querySelector('input[type="file"]');
      if (fileInput) {
        const dt = new DataTransfer();
        dt.items.add(file);
        fileInput.files = dt.files;
        fileInput.dispatchEvent(new Event('change', { bubbles: true }));
        return { success: true, method: 'fileInput' };
      }
    }
    if (method === 'drop') {
      const dropZone = inputEl.closest('fieldset') || inputEl.closest('form') || inputEl.parentElement;
      if (dropZone) {
        const dt = new DataTransfer();
        dt.items.add(file);
        dropZone.dispatchEvent(new DragEvent('drop', { bubbles: true, cancelable: true, dataTransfer: dt }));
        return { success: true, method: 'drop' };
      }
    }
    if (method === 'paste') {
      const dt = new DataTransfer();
      dt.items.add(file);
      inputEl.dispatchEvent(new ClipboardEvent('paste', { bubbles: true, cancelable: true, clipboardData: dt }));
      return { success: true, method: 'paste' };
    }
  }
  return { success: false, error: 'no insertion method applied' };
} catch (e) {
  return { success: false, error: e.message };
}
"#;

const FOCUS_INTERPRETER: &str = r#"
const sleep = (ms) => new Promise((r) => setTimeout(r, ms));
function findElement(selectors) {
  for (const selector of selectors) {
    try {
      const el = document.querySelector(selector);
      if (el) return el;
    } catch (e) {}
  }
  return null;
}
const el = findElement(cmd.inputSelectors);
if (el) {
  el.click();
  el.focus();
  await sleep(100);
  return true;
}
return false;
"#;

fn wrap(json: &str, body: &str) -> String {
    format!("(async function() {{\nconst cmd = {json};{body}}})()")
}

pub fn send_script(cmd: &SendCommand) -> Result<String, CoreError> {
    Ok(wrap(&json_literal(cmd)?, SEND_INTERPRETER))
}

pub fn image_script(cmd: &ImageCommand) -> Result<String, CoreError> {
    Ok(wrap(&json_literal(cmd)?, IMAGE_INTERPRETER))
}

pub fn focus_script(input_selectors: &[String]) -> Result<String, CoreError> {
    let cmd = serde_json::json!({ "inputSelectors": input_selectors });
    Ok(wrap(&json_literal(&cmd)?, FOCUS_INTERPRETER))
}

/// Program that reads the latest response text: last selector group that
/// matches wins, and within it the last element's text.
pub fn extract_script(response_selectors: &[String]) -> Result<String, CoreError> {
    let selectors = json_literal(&response_selectors)?;
    Ok(format!(
        r#"(function() {{
  const selectors = {selectors};
  let responseText = '';
  for (const selector of selectors) {{
    try {{
      const elements = document.querySelectorAll(selector);
      if (elements.length > 0) {{
        const last = elements[elements.length - 1];
        if (last) responseText = last.textContent || '';
      }}
    }} catch (e) {{}}
  }}
  return responseText.trim();
}})()"#
    ))
}

// ========================= Document-level operations =========================

/// Insert `text` into `target`'s input widget and submit it.
pub async fn send_text(
    doc: &dyn Document,
    target: &Target,
    text: &str,
) -> Result<InjectionOutcome, CoreError> {
    let cmd = SendCommand::for_target(target, text);
    let script = send_script(&cmd)?;
    let value = doc.execute_script(&script).await?;
    let outcome = InjectionOutcome::from_value(&value);
    debug!(target = %target.id, success = outcome.success, method = ?outcome.method, "text injection");
    Ok(outcome)
}

/// Attach an image using the target-declared capability order. A
/// `needs_native_paste` outcome means the caller must focus the input and
/// perform a real paste via the document handle.
pub async fn insert_image(
    doc: &dyn Document,
    target: &Target,
    bytes: &[u8],
    mime_type: &str,
) -> Result<InjectionOutcome, CoreError> {
    let cmd = ImageCommand::for_target(target, bytes, mime_type);
    let script = image_script(&cmd)?;
    let value = doc.execute_script(&script).await?;
    Ok(InjectionOutcome::from_value(&value))
}

/// Click and focus the input widget; used before a native paste.
pub async fn focus_input(doc: &dyn Document, target: &Target) -> Result<bool, CoreError> {
    let script = focus_script(&target.input_selectors)?;
    let value = doc.execute_script(&script).await?;
    Ok(value.as_bool().unwrap_or(false))
}

/// Extract the latest response text. `None` when the document yielded no
/// value at all (distinct from an empty string).
pub async fn extract_response(
    doc: &dyn Document,
    target: &Target,
) -> Result<Option<String>, CoreError> {
    let script = extract_script(&target.response_selectors)?;
    let value = doc.execute_script(&script).await?;
    Ok(match value {
        Value::String(s) => Some(s),
        _ => None,
    })
}
