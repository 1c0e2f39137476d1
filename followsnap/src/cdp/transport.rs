use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::ScrapeError;

// Reduce type complexity for Clippy
type CommandResult = Result<Value, String>;
type PendingMap = HashMap<u64, oneshot::Sender<CommandResult>>;
type Pending = Arc<Mutex<PendingMap>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
pub struct TabInfo {
    pub id: String,
    /// Target kind: "page" for ordinary tabs, others are workers/extensions.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub websocket_url: Option<String>,
}

/// Discovery endpoints a browser exposes on its remote debugging port.
#[derive(Debug, Clone)]
pub struct DevtoolsEndpoint {
    base_url: String,
    client: reqwest::Client,
}

impl DevtoolsEndpoint {
    pub fn new(debug_port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{debug_port}"),
            client: reqwest::Client::new(),
        }
    }

    /// Check if a browser is listening with DevTools enabled.
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/json/version", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Poll the version endpoint until the browser answers.
    pub async fn wait_until_available(&self, timeout: Duration) -> Result<(), ScrapeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_available().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::Timeout(format!(
                    "browser devtools endpoint {} did not come up within {timeout:?}",
                    self.base_url
                )));
            }
            tokio::time::sleep(AVAILABILITY_POLL_INTERVAL).await;
        }
    }

    /// Get list of all open tabs.
    pub async fn tabs(&self) -> Result<Vec<TabInfo>, ScrapeError> {
        let response = self
            .client
            .get(format!("{}/json", self.base_url))
            .send()
            .await
            .map_err(|e| ScrapeError::Driver(format!("Failed to get tabs: {e}")))?;

        let tabs: Vec<TabInfo> = response
            .json()
            .await
            .map_err(|e| ScrapeError::Driver(format!("Failed to parse tabs: {e}")))?;

        debug!("Found {} open tabs", tabs.len());
        Ok(tabs)
    }

    /// Open a fresh tab. Newer browsers require PUT here.
    pub async fn open_tab(&self, url: &str) -> Result<TabInfo, ScrapeError> {
        let response = self
            .client
            .put(format!("{}/json/new?{url}", self.base_url))
            .send()
            .await
            .map_err(|e| ScrapeError::Driver(format!("Failed to open tab: {e}")))?;

        response
            .json()
            .await
            .map_err(|e| ScrapeError::Driver(format!("Failed to parse new tab info: {e}")))
    }

    /// Close a tab by id. Best effort; the browser may already be gone.
    pub async fn close_tab(&self, tab_id: &str) -> Result<(), ScrapeError> {
        self.client
            .get(format!("{}/json/close/{tab_id}", self.base_url))
            .send()
            .await
            .map_err(|e| ScrapeError::Driver(format!("Failed to close tab: {e}")))?;
        Ok(())
    }
}

/// JSON-RPC connection to one tab's DevTools websocket.
///
/// Commands are correlated to replies through a pending map of oneshot
/// senders; a writer task owns the sink and a reader task drains the stream.
#[derive(Debug)]
pub struct CdpConnection {
    sender: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    _writer_task: JoinHandle<()>,
    _reader_task: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self, ScrapeError> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| ScrapeError::Driver(format!("devtools websocket connect failed: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // writer task
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("devtools send error: {}", e);
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        // reader loop
        let reader_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                if !msg.is_text() {
                    continue;
                }
                let txt = msg.into_text().unwrap_or_default();
                let value: Value = match serde_json::from_str(&txt) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("unparseable devtools message: {}", e);
                        continue;
                    }
                };
                // replies carry an id; protocol events do not and nothing waits on them
                let Some(id) = value.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                if let Some(tx) = reader_pending.lock().await.remove(&id) {
                    let outcome = match value.get("error") {
                        Some(error) => Err(error.to_string()),
                        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
            }
            // connection is gone, fail anything still waiting
            for (_, tx) in reader_pending.lock().await.drain() {
                let _ = tx.send(Err("devtools connection closed".to_string()));
            }
        });

        Ok(Self {
            sender: tx,
            pending,
            next_id: AtomicU64::new(1),
            _writer_task: writer_task,
            _reader_task: reader_task,
        })
    }

    /// Send a protocol command and wait for its reply.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value, ScrapeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method, "sending devtools command");
        if self.sender.send(Message::Text(payload.to_string())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ScrapeError::Driver(
                "devtools writer task is gone".to_string(),
            ));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(ScrapeError::Driver(format!("{method} failed: {e}"))),
            Ok(Err(_)) => Err(ScrapeError::Driver(format!(
                "{method} reply channel dropped"
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ScrapeError::Timeout(format!(
                    "{method} got no reply within {COMMAND_TIMEOUT:?}"
                )))
            }
        }
    }

    /// Evaluate an expression in the page, returning its JSON value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, ScrapeError> {
        let envelope = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        reject_exception(&envelope)?;
        Ok(envelope
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Evaluate an expression, keeping the result in the page as a remote
    /// object. `None` when the expression produced null or undefined.
    pub async fn evaluate_object(&self, expression: &str) -> Result<Option<String>, ScrapeError> {
        let envelope = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": false,
                }),
            )
            .await?;
        reject_exception(&envelope)?;
        Ok(envelope
            .pointer("/result/objectId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Call a function with a remote object as `this`. Returns the raw
    /// RemoteObject describing the result.
    pub async fn call_function(
        &self,
        object_id: &str,
        declaration: &str,
        arguments: Value,
        by_value: bool,
    ) -> Result<Value, ScrapeError> {
        let envelope = self
            .command(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": declaration,
                    "arguments": arguments,
                    "returnByValue": by_value,
                }),
            )
            .await?;
        reject_exception(&envelope)?;
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Object ids of an array-valued remote object, in index order.
    pub async fn array_object_ids(
        &self,
        array_object_id: &str,
    ) -> Result<Vec<String>, ScrapeError> {
        let envelope = self
            .command(
                "Runtime.getProperties",
                json!({
                    "objectId": array_object_id,
                    "ownProperties": true,
                }),
            )
            .await?;

        let mut indexed: Vec<(usize, String)> = Vec::new();
        if let Some(props) = envelope.get("result").and_then(Value::as_array) {
            for prop in props {
                let Some(idx) = prop
                    .get("name")
                    .and_then(Value::as_str)
                    .and_then(|name| name.parse::<usize>().ok())
                else {
                    continue;
                };
                if let Some(object_id) = prop.pointer("/value/objectId").and_then(Value::as_str) {
                    indexed.push((idx, object_id.to_string()));
                }
            }
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        Ok(indexed.into_iter().map(|(_, id)| id).collect())
    }
}

fn reject_exception(envelope: &Value) -> Result<(), ScrapeError> {
    if let Some(details) = envelope.get("exceptionDetails") {
        let description = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .unwrap_or("unknown exception");
        return Err(ScrapeError::Driver(format!(
            "script threw in page: {description}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_info_parses_discovery_payload() {
        let payload = r#"[{
            "id": "DAB7FB6187B554E10B0BD18821265734",
            "type": "page",
            "title": "about:blank",
            "url": "about:blank",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/DAB7FB6187B554E10B0BD18821265734"
        }]"#;
        let tabs: Vec<TabInfo> = serde_json::from_str(payload).unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].kind, "page");
        assert!(tabs[0].websocket_url.as_deref().unwrap().starts_with("ws://"));
    }

    #[test]
    fn test_reject_exception_surfaces_description() {
        let envelope = serde_json::json!({
            "result": { "type": "undefined" },
            "exceptionDetails": {
                "exception": { "description": "ReferenceError: nope is not defined" }
            }
        });
        match reject_exception(&envelope) {
            Err(ScrapeError::Driver(msg)) => assert!(msg.contains("ReferenceError")),
            other => panic!("expected Driver error, got {other:?}"),
        }
    }
}
