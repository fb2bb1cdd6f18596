//! External collaborator seams: the embedded-page document handle, the
//! persistent key-value file store and the OS clipboard. The core only talks
//! to these traits; a chromiumoxide-backed document adapter and disk/null
//! store implementations are provided.

use crate::error::CoreError;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs as async_fs;
use tokio::time::sleep;
use tracing::debug;

/// One embedded, independently-navigable web page. `execute_script` crosses
/// into the page's own execution context; everything the core knows about a
/// target's state comes back through its JSON return value.
#[async_trait]
pub trait Document: Send + Sync {
    async fn execute_script(&self, program: &str) -> Result<Value, CoreError>;
    async fn reload(&self) -> Result<(), CoreError>;
    async fn load_url(&self, url: &str) -> Result<(), CoreError>;
    async fn current_url(&self) -> Result<String, CoreError>;
    async fn focus(&self) -> Result<(), CoreError>;
    /// Trigger a paste into whatever element currently has focus inside the
    /// page. Used for targets whose editors reject synthetic clipboard
    /// events.
    async fn paste(&self) -> Result<(), CoreError>;
}

/// Persistent key-value file store for transcript autosave and history.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_file(&self, name: &str) -> Result<Option<String>, CoreError>;
    async fn write_file(&self, name: &str, text: &str) -> Result<(), CoreError>;
}

/// Host clipboard access, including MIME-typed image reads for image paste.
#[async_trait]
pub trait Clipboard: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<(), CoreError>;
    async fn read_text(&self) -> Result<String, CoreError>;
    /// Returns `(bytes, mime_type)` for the first image item, if any.
    async fn read_image(&self) -> Result<Option<(Vec<u8>, String)>, CoreError>;
}

// ========================= Chromium Adapter =========================

#[derive(Clone)]
pub struct HostConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
        }
    }
}

/// Owns the Chromium process and hands out one `ChromiumDocument` per target
/// page.
pub struct ChromiumHost {
    browser: OxideBrowser,
    user_agent: Option<String>,
}

impl ChromiumHost {
    pub async fn launch(cfg: HostConfig) -> Result<Self, CoreError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when Chromium is restarted rapidly.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("multichat-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder
            .build()
            .map_err(|e| CoreError::Other(e.to_string()))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg)
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Ok(Self {
            browser,
            user_agent: cfg.user_agent,
        })
    }

    pub async fn connect(ws_url: &str) -> Result<Self, CoreError> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url)
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Ok(Self {
            browser,
            user_agent: None,
        })
    }

    /// Open a new page and navigate it to `url`.
    pub async fn open_document(&self, url: &str) -> Result<ChromiumDocument, CoreError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        if let Some(ua) = &self.user_agent {
            page.set_user_agent(ua.clone())
                .await
                .map_err(|e| CoreError::Other(e.to_string()))?;
        }
        // Non-zero viewport so layout-dependent selectors behave.
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(1280)
                    .height(800)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .map_err(CoreError::Other)?,
            )
            .await;
        let doc = ChromiumDocument { page };
        doc.load_url(url).await?;
        Ok(doc)
    }
}

/// `Document` adapter over one CDP page.
pub struct ChromiumDocument {
    page: Page,
}

impl ChromiumDocument {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

#[async_trait]
impl Document for ChromiumDocument {
    async fn execute_script(&self, program: &str) -> Result<Value, CoreError> {
        let eval = EvaluateParams::builder()
            .expression(program)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(CoreError::Script)?;
        let resp = self
            .page
            .execute(eval)
            .await
            .map_err(|e| CoreError::Script(e.to_string()))?;
        let returns = resp.result;
        if let Some(exc) = returns.exception_details {
            return Err(CoreError::Script(exc.text));
        }
        Ok(returns.result.value.unwrap_or(Value::Null))
    }

    async fn reload(&self) -> Result<(), CoreError> {
        self.page
            .reload()
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        Ok(())
    }

    async fn load_url(&self, url: &str) -> Result<(), CoreError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, CoreError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?
            .unwrap_or_default())
    }

    async fn focus(&self) -> Result<(), CoreError> {
        self.page
            .bring_to_front()
            .await
            .map_err(|e| CoreError::Other(e.to_string()))?;
        Ok(())
    }

    async fn paste(&self) -> Result<(), CoreError> {
        // CDP has no direct OS-paste primitive; a modifier keystroke into the
        // focused element is the closest available approximation.
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let ev = DispatchKeyEventParams::builder()
                .r#type(kind)
                .modifiers(2)
                .key("v")
                .code("KeyV")
                .windows_virtual_key_code(86)
                .build()
                .map_err(CoreError::Other)?;
            self.page
                .execute(ev)
                .await
                .map_err(|e| CoreError::Other(e.to_string()))?;
        }
        sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

// ========================= Store Implementations =========================

/// Disk-backed store rooted at a base directory.
pub struct DiskFileStore {
    base_dir: PathBuf,
}

impl DiskFileStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base_dir: base.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn read_file(&self, name: &str) -> Result<Option<String>, CoreError> {
        let path = self.base_dir.join(name);
        match async_fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::Store(format!("read {}: {}", name, e))),
        }
    }

    async fn write_file(&self, name: &str, text: &str) -> Result<(), CoreError> {
        async_fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| CoreError::Store(format!("create_dir: {}", e)))?;
        let path = self.base_dir.join(name);
        async_fs::write(&path, text)
            .await
            .map_err(|e| CoreError::Store(format!("write {}: {}", name, e)))?;
        debug!(file = name, "store write");
        Ok(())
    }
}

/// Store that remembers nothing. Default for sessions without persistence.
pub struct NullFileStore;

#[async_trait]
impl FileStore for NullFileStore {
    async fn read_file(&self, _name: &str) -> Result<Option<String>, CoreError> {
        Ok(None)
    }

    async fn write_file(&self, _name: &str, _text: &str) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct NullClipboard;

#[async_trait]
impl Clipboard for NullClipboard {
    async fn write_text(&self, _text: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn read_text(&self) -> Result<String, CoreError> {
        Ok(String::new())
    }

    async fn read_image(&self) -> Result<Option<(Vec<u8>, String)>, CoreError> {
        Ok(None)
    }
}
