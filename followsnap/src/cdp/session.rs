use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cdp::transport::{CdpConnection, DevtoolsEndpoint, TabInfo};
use crate::error::ScrapeError;
use crate::page::{DomHandle, DomNode, PageSession};

const BROWSER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(200);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(200);

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// How to obtain the browser this session drives.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Browser binary to launch.
    pub binary: PathBuf,
    /// Remote debugging port to launch on or attach to.
    pub debug_port: u16,
    /// Run without a visible window.
    pub headless: bool,
    /// Attach to an already-running browser instead of launching one.
    pub attach: bool,
    /// Window size passed at launch.
    pub window_size: (u32, u32),
    /// User agent passed at launch.
    pub user_agent: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("chromium"),
            debug_port: 9222,
            headless: true,
            attach: false,
            window_size: (1920, 1080),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// A live page driven over the Chrome DevTools Protocol.
///
/// Drives one tab and owns the browser process unless attached; attaching
/// reuses an already-open page tab when there is one. Element handles
/// returned from this session are remote object references; they die with
/// the tab.
pub struct ChromeSession {
    conn: Arc<CdpConnection>,
    endpoint: DevtoolsEndpoint,
    tab_id: String,
    owns_tab: bool,
    child: Mutex<Option<Child>>,
}

impl ChromeSession {
    /// Launch (or attach to) a browser and open a fresh tab.
    pub async fn start(config: BrowserConfig) -> Result<Self, ScrapeError> {
        let endpoint = DevtoolsEndpoint::new(config.debug_port);

        let child = if config.attach {
            if !endpoint.is_available().await {
                return Err(ScrapeError::Driver(format!(
                    "no browser listening on port {}; launch one with --remote-debugging-port={}",
                    config.debug_port, config.debug_port
                )));
            }
            None
        } else {
            info!(binary = %config.binary.display(), headless = config.headless, "launching browser");
            let mut command = Command::new(&config.binary);
            command
                .arg(format!("--remote-debugging-port={}", config.debug_port))
                .arg(format!(
                    "--window-size={},{}",
                    config.window_size.0, config.window_size.1
                ))
                .arg(format!("--user-agent={}", config.user_agent))
                .arg("--no-first-run")
                .arg("--no-default-browser-check")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if config.headless {
                command.arg("--headless=new");
            }
            let child = command.spawn().map_err(|e| {
                ScrapeError::Driver(format!(
                    "failed to launch {}: {e}",
                    config.binary.display()
                ))
            })?;
            endpoint.wait_until_available(BROWSER_STARTUP_TIMEOUT).await?;
            Some(child)
        };

        // attached browsers usually have the dashboard open already; drive
        // that tab instead of opening a throwaway one
        let (tab, owns_tab) = if config.attach {
            match reusable_tab(endpoint.tabs().await?) {
                Some(tab) => {
                    info!(tab = %tab.id, url = %tab.url, "reusing open tab");
                    (tab, false)
                }
                None => (endpoint.open_tab("about:blank").await?, true),
            }
        } else {
            (endpoint.open_tab("about:blank").await?, true)
        };
        let ws_url = tab.websocket_url.clone().ok_or_else(|| {
            ScrapeError::Driver("tab exposed no webSocketDebuggerUrl".to_string())
        })?;

        let conn = CdpConnection::connect(&ws_url).await?;
        conn.command("Page.enable", json!({})).await?;
        conn.command("Runtime.enable", json!({})).await?;
        info!(tab = %tab.id, "devtools session established");

        Ok(Self {
            conn: Arc::new(conn),
            endpoint,
            tab_id: tab.id,
            owns_tab,
            child: Mutex::new(child),
        })
    }

    fn handle_for(&self, object_id: String) -> DomHandle {
        DomHandle::new(Arc::new(ChromeNode {
            conn: self.conn.clone(),
            object_id,
        }))
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn goto(&self, url: &str) -> Result<(), ScrapeError> {
        info!(url, "navigating");
        let result = self
            .conn
            .command("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(ScrapeError::Driver(format!(
                    "navigation to {url} failed: {error_text}"
                )));
            }
        }
        self.wait_for_load(NAVIGATION_TIMEOUT).await
    }

    async fn wait_for_load(&self, timeout: Duration) -> Result<(), ScrapeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // the execution context vanishes mid-navigation, so probe errors
            // just mean "not yet"
            match self.conn.evaluate("document.readyState").await {
                Ok(Value::String(state)) if state == "complete" => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!("readyState probe failed: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::Timeout(format!(
                    "page load did not finish within {timeout:?}"
                )));
            }
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_selector(
        &self,
        css: &str,
        timeout: Duration,
    ) -> Result<DomHandle, ScrapeError> {
        debug!(selector = css, ?timeout, "waiting for selector");
        let script = format!("document.querySelector({})", js_string(css));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.conn.evaluate_object(&script).await {
                Ok(Some(object_id)) => return Ok(self.handle_for(object_id)),
                Ok(None) => {}
                Err(e) => debug!("selector probe failed: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::Timeout(format!(
                    "selector {css:?} did not appear within {timeout:?}"
                )));
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn fill(&self, css: &str, value: &str) -> Result<(), ScrapeError> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return false;
    el.focus();
    el.value = {val};
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
}})()"#,
            sel = js_string(css),
            val = js_string(value),
        );
        match self.conn.evaluate(&script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(ScrapeError::Driver(format!(
                "no element matching {css:?} to fill"
            ))),
        }
    }

    async fn click(&self, css: &str) -> Result<(), ScrapeError> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return false;
    el.click();
    return true;
}})()"#,
            sel = js_string(css),
        );
        match self.conn.evaluate(&script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(ScrapeError::Driver(format!(
                "no element matching {css:?} to click"
            ))),
        }
    }

    async fn frames(&self) -> Result<Vec<DomHandle>, ScrapeError> {
        const COLLECT_DOCUMENTS: &str = r#"(() => {
    const docs = [document];
    for (const frame of document.querySelectorAll('iframe')) {
        try {
            if (frame.contentDocument) {
                docs.push(frame.contentDocument);
            }
        } catch (_) {
            // cross-origin frame, not reachable from here
        }
    }
    return docs;
})()"#;

        let array_id = self
            .conn
            .evaluate_object(COLLECT_DOCUMENTS)
            .await?
            .ok_or_else(|| {
                ScrapeError::Driver("document collection script returned nothing".to_string())
            })?;
        let ids = self.conn.array_object_ids(&array_id).await?;
        debug!(frames = ids.len(), "collected document roots");
        Ok(ids.into_iter().map(|id| self.handle_for(id)).collect())
    }

    async fn save_screenshot(&self, path: &Path) -> Result<(), ScrapeError> {
        let result = self
            .conn
            .command("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ScrapeError::Driver("screenshot reply had no data".to_string()))?;
        let bytes = general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ScrapeError::Driver(format!("screenshot was not valid base64: {e}")))?;
        tokio::fs::write(path, bytes).await.map_err(|e| {
            ScrapeError::Driver(format!("could not write {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "screenshot saved");
        Ok(())
    }

    async fn close(&self) -> Result<(), ScrapeError> {
        // a reused tab belongs to whoever opened the browser
        if self.owns_tab {
            if let Err(e) = self.endpoint.close_tab(&self.tab_id).await {
                debug!("tab close failed: {}", e);
            }
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("browser process kill failed: {}", e);
            }
        }
        Ok(())
    }
}

/// A single remote DOM node inside the session's tab.
pub(crate) struct ChromeNode {
    conn: Arc<CdpConnection>,
    object_id: String,
}

impl fmt::Debug for ChromeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromeNode")
            .field("object_id", &self.object_id)
            .finish()
    }
}

impl ChromeNode {
    fn handle_for(&self, object_id: String) -> DomHandle {
        DomHandle::new(Arc::new(ChromeNode {
            conn: self.conn.clone(),
            object_id,
        }))
    }
}

#[async_trait]
impl DomNode for ChromeNode {
    async fn find_all(&self, css: &str) -> Result<Vec<DomHandle>, ScrapeError> {
        let result = self
            .conn
            .call_function(
                &self.object_id,
                "function(sel) { return Array.from(this.querySelectorAll(sel)); }",
                json!([{ "value": css }]),
                false,
            )
            .await?;
        let Some(array_id) = result.get("objectId").and_then(Value::as_str) else {
            return Ok(Vec::new());
        };
        let ids = self.conn.array_object_ids(array_id).await?;
        Ok(ids.into_iter().map(|id| self.handle_for(id)).collect())
    }

    async fn find_first(&self, css: &str) -> Result<Option<DomHandle>, ScrapeError> {
        let result = self
            .conn
            .call_function(
                &self.object_id,
                "function(sel) { return this.querySelector(sel); }",
                json!([{ "value": css }]),
                false,
            )
            .await?;
        Ok(result
            .get("objectId")
            .and_then(Value::as_str)
            .map(|id| self.handle_for(id.to_string())))
    }

    async fn text(&self) -> Result<String, ScrapeError> {
        let result = self
            .conn
            .call_function(
                &self.object_id,
                "function() { const t = this.innerText !== undefined ? this.innerText : this.textContent; return t || ''; }",
                json!([]),
                true,
            )
            .await?;
        Ok(result
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

/// First ordinary page tab that can be driven. Workers and extension
/// targets also show up in discovery but have no document to scrape.
fn reusable_tab(tabs: Vec<TabInfo>) -> Option<TabInfo> {
    tabs.into_iter()
        .find(|tab| tab.kind == "page" && tab.websocket_url.is_some())
}

fn js_string(s: &str) -> String {
    // serde_json string escaping doubles as a JS string literal
    Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string("input[name=\"username\"]"), r#""input[name=\"username\"]""#);
        assert_eq!(js_string("plain"), r#""plain""#);
    }

    #[test]
    fn test_default_config_is_headless_on_standard_port() {
        let config = BrowserConfig::default();
        assert!(config.headless);
        assert!(!config.attach);
        assert_eq!(config.debug_port, 9222);
        assert_eq!(config.window_size, (1920, 1080));
    }

    #[test]
    fn test_reusable_tab_skips_non_page_targets() {
        let tab = |id: &str, kind: &str, ws: Option<&str>| TabInfo {
            id: id.to_string(),
            kind: kind.to_string(),
            title: String::new(),
            url: "https://dash.example/".to_string(),
            websocket_url: ws.map(str::to_string),
        };
        let tabs = vec![
            tab("w1", "service_worker", Some("ws://127.0.0.1:9222/devtools/page/w1")),
            tab("t1", "page", None),
            tab("t2", "page", Some("ws://127.0.0.1:9222/devtools/page/t2")),
        ];

        assert_eq!(reusable_tab(tabs).unwrap().id, "t2");
        assert!(reusable_tab(Vec::new()).is_none());
    }
}
