use std::sync::Mutex;

use anyhow::Result;
use url::Url;

/// The host's navigation surface: where the user is now, and how to send
/// them to another page (the OAuth authorization endpoint).
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;

    /// Hand control to `url`. A browser host never returns from this in
    /// practice; other hosts open or print the URL.
    fn navigate(&self, url: &Url) -> Result<()>;
}

/// Navigator that records navigations instead of performing them.
#[derive(Debug)]
pub struct RecordingNavigator {
    current_path: String,
    visited: Mutex<Vec<Url>>,
}

impl RecordingNavigator {
    pub fn new(current_path: impl Into<String>) -> Self {
        Self {
            current_path: current_path.into(),
            visited: Mutex::new(Vec::new()),
        }
    }

    pub fn visited(&self) -> Vec<Url> {
        self.visited.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for RecordingNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for RecordingNavigator {
    fn current_path(&self) -> String {
        self.current_path.clone()
    }

    fn navigate(&self, url: &Url) -> Result<()> {
        self.visited
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.clone());
        Ok(())
    }
}
