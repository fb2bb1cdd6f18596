use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How a target's input widget must be driven to insert text. Resolved once
/// from configuration; the injection interpreter dispatches on the tag
/// instead of sniffing class names at every call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditorFamily {
    PlainControl,
    Quill,
    ProseMirror,
    Lexical,
    GenericEditable,
}

impl Default for EditorFamily {
    fn default() -> Self {
        EditorFamily::GenericEditable
    }
}

/// Image insertion techniques a target accepts, tried in declared order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageInsertMethod {
    FileInput,
    Drop,
    #[serde(rename = "paste")]
    PasteEvent,
    NativePaste,
}

fn default_image_methods() -> Vec<ImageInsertMethod> {
    vec![
        ImageInsertMethod::FileInput,
        ImageInsertMethod::Drop,
        ImageInsertMethod::PasteEvent,
    ]
}

/// Default minimum quiet period before a response is considered finished
/// streaming, for targets that do not declare their own.
pub const DEFAULT_STABILITY_WAIT: Duration = Duration::from_millis(2000);

/// One configured chat surface. Immutable after load; shared read-only
/// between the dispatcher and the conversation controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    pub url: String,
    #[serde(default)]
    pub editor: EditorFamily,
    pub input_selectors: Vec<String>,
    pub submit_selectors: Vec<String>,
    pub response_selectors: Vec<String>,
    #[serde(default)]
    pub typing_indicator_selectors: Vec<String>,
    #[serde(default)]
    pub streaming_stop_selectors: Vec<String>,
    /// Milliseconds of unchanged response text required by the DOM-stability
    /// detection strategy.
    #[serde(default)]
    pub response_stability_wait_ms: Option<u64>,
    #[serde(default = "default_image_methods")]
    pub image_insert_methods: Vec<ImageInsertMethod>,
}

impl Target {
    pub fn stability_wait(&self) -> Duration {
        self.response_stability_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STABILITY_WAIT)
    }

    /// Two clones of the same target for self-conversations, suffixed so the
    /// host can address the two live documents independently.
    pub fn dual_instances(&self) -> (Target, Target) {
        let mut a = self.clone();
        a.id = format!("{}-a", self.id);
        a.name = format!("{} A", self.name);
        let mut b = self.clone();
        b.id = format!("{}-b", self.id);
        b.name = format!("{} B", self.name);
        (a, b)
    }
}

/// The target configuration set, loaded once at startup and never mutated.
#[derive(Clone, Debug, Default)]
pub struct TargetSet {
    targets: Vec<Arc<Target>>,
}

impl TargetSet {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let targets: Vec<Target> =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(Self::new(targets))
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Target>> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
