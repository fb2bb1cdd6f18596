//! Shared test fakes.

use crate::document::Document;
use crate::error::CoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

/// In-memory `Document` whose script results come from a closure. Records
/// every executed script and every native paste for assertions.
pub struct FakeDocument {
    responder: Box<dyn Fn(&str) -> Result<Value, CoreError> + Send + Sync>,
    delay: Duration,
    scripts: Mutex<Vec<String>>,
    pastes: AtomicU32,
    url: Mutex<String>,
    loads: Mutex<Vec<String>>,
}

impl FakeDocument {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<Value, CoreError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            scripts: Mutex::new(Vec::new()),
            pastes: AtomicU32::new(0),
            url: Mutex::new("about:blank".to_string()),
            loads: Mutex::new(Vec::new()),
        }
    }

    /// Simulated page latency per script execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_url(self, url: &str) -> Self {
        *self.url.lock().unwrap() = url.to_string();
        self
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn paste_count(&self) -> u32 {
        self.pastes.load(Ordering::SeqCst)
    }

    pub fn loaded_urls(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Document for FakeDocument {
    async fn execute_script(&self, program: &str) -> Result<Value, CoreError> {
        self.scripts.lock().unwrap().push(program.to_string());
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        (self.responder)(program)
    }

    async fn reload(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn load_url(&self, url: &str) -> Result<(), CoreError> {
        self.loads.lock().unwrap().push(url.to_string());
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, CoreError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn focus(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn paste(&self) -> Result<(), CoreError> {
        self.pastes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
