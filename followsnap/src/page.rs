use std::fmt;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScrapeError;

/// The common interface for browser page backends.
///
/// Selector-taking methods operate on the top-level document; `frames`
/// exposes every reachable document root for code that has to search
/// inside iframes as well.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Navigate to `url` and wait for the page to finish loading.
    async fn goto(&self, url: &str) -> Result<(), ScrapeError>;

    /// Wait until the current document reports itself fully loaded.
    async fn wait_for_load(&self, timeout: Duration) -> Result<(), ScrapeError>;

    /// Wait for an element matching the CSS selector to appear.
    async fn wait_for_selector(
        &self,
        css: &str,
        timeout: Duration,
    ) -> Result<DomHandle, ScrapeError>;

    /// Set the value of the first element matching the selector.
    async fn fill(&self, css: &str, value: &str) -> Result<(), ScrapeError>;

    /// Click the first element matching the selector.
    async fn click(&self, css: &str) -> Result<(), ScrapeError>;

    /// Document roots of the page: the main document first, then every
    /// reachable iframe document in DOM order.
    async fn frames(&self) -> Result<Vec<DomHandle>, ScrapeError>;

    /// Capture the visible page as a PNG at `path`.
    async fn save_screenshot(&self, path: &Path) -> Result<(), ScrapeError>;

    /// Release the tab and any browser process owned by this session.
    async fn close(&self) -> Result<(), ScrapeError>;
}

/// A node in a live document: a document root or an element within one.
///
/// Handles stay valid only as long as the session that produced them.
#[async_trait]
pub trait DomNode: Send + Sync + Debug {
    /// All descendant elements matching the CSS selector, in DOM order.
    async fn find_all(&self, css: &str) -> Result<Vec<DomHandle>, ScrapeError>;

    /// First descendant element matching the CSS selector, if any.
    async fn find_first(&self, css: &str) -> Result<Option<DomHandle>, ScrapeError>;

    /// Visible text content of the node, trimmed.
    async fn text(&self) -> Result<String, ScrapeError>;
}

/// Cheaply cloneable handle to a [`DomNode`].
#[derive(Clone)]
pub struct DomHandle {
    inner: Arc<dyn DomNode>,
}

impl DomHandle {
    pub fn new(inner: Arc<dyn DomNode>) -> Self {
        Self { inner }
    }

    pub async fn find_all(&self, css: &str) -> Result<Vec<DomHandle>, ScrapeError> {
        self.inner.find_all(css).await
    }

    pub async fn find_first(&self, css: &str) -> Result<Option<DomHandle>, ScrapeError> {
        self.inner.find_first(css).await
    }

    pub async fn text(&self) -> Result<String, ScrapeError> {
        self.inner.text().await
    }
}

impl fmt::Debug for DomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
