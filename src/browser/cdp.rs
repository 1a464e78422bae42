//! DevTools protocol connection
//!
//! Features:
//! - JSON commands over the browser's local WebSocket endpoint
//! - Responses correlated by auto-incrementing request ID
//! - Session-scoped commands for attached pages (flattened target mode)
//! - Event fan-out to any number of subscribers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Events buffered per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// An event pushed by the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    /// Set for events that belong to an attached page session.
    pub session_id: Option<String>,
}

/// DevTools client over a WebSocket.
///
/// A reader task routes command replies to their callers and broadcasts
/// events; a writer task serializes outgoing frames.
pub struct CdpConnection {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpConnection {
    /// Connect to a `ws://` DevTools endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, response) = connect_async(url).await?;
        debug!("DevTools connected: {:?}", response.status());

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("DevTools send failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let pending = Arc::clone(&pending);
            let events = events.clone();
            let connected = Arc::clone(&connected);
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Text(text)) => dispatch(&text, &pending, &events),
                        Ok(Message::Close(frame)) => {
                            info!("DevTools connection closed: {:?}", frame);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("DevTools receive failed: {e}");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every caller still waiting.
                pending.lock().clear();
            })
        };

        Ok(Self {
            url: url.to_string(),
            outbound,
            pending,
            events,
            next_id: AtomicU64::new(0),
            connected,
            reader,
            writer,
        })
    }

    /// Send a command and wait for its reply.
    ///
    /// `session_id` scopes the command to an attached page.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(RelayError::Upstream(format!(
                "DevTools connection closed before '{method}'"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = command(id, method, params, session_id);
        if self.outbound.send(Message::Text(request.to_string())).is_err() {
            self.pending.lock().remove(&id);
            return Err(RelayError::Upstream(format!(
                "DevTools connection closed while sending '{method}'"
            )));
        }
        debug!(id, method, "DevTools command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RelayError::Upstream(format!(
                "DevTools connection closed while waiting for '{method}'"
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RelayError::Timeout(format!(
                    "DevTools method '{method}' did not answer within {timeout:?}"
                )))
            }
        }
    }

    /// Receive every event pushed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Returns `false` once the socket has closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a close frame.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn command(id: u64, method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut request = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(session_id) = session_id {
        request["sessionId"] = Value::String(session_id.to_string());
    }
    request
}

/// Route one incoming frame to its waiting caller or to event subscribers.
fn dispatch(text: &str, pending: &Pending, events: &broadcast::Sender<CdpEvent>) {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed DevTools frame: {e}");
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let Some(tx) = pending.lock().remove(&id) else {
            debug!(id, "reply for abandoned DevTools command");
            return;
        };
        let reply = match message.get("error") {
            Some(error) => Err(RelayError::Upstream(format!("DevTools error: {error}"))),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
    } else if let Some(method) = message.get("method").and_then(Value::as_str) {
        let event = CdpEvent {
            method: method.to_string(),
            params: message.get("params").cloned().unwrap_or(Value::Null),
            session_id: message
                .get("sessionId")
                .and_then(Value::as_str)
                .map(String::from),
        };
        // No subscribers is fine.
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const CALL_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn command_carries_session_id() {
        let cmd = command(3, "Page.navigate", json!({"url": "about:blank"}), Some("S1"));
        assert_eq!(cmd["id"], 3);
        assert_eq!(cmd["method"], "Page.navigate");
        assert_eq!(cmd["params"]["url"], "about:blank");
        assert_eq!(cmd["sessionId"], "S1");

        let browser_cmd = command(4, "Browser.close", json!({}), None);
        assert!(browser_cmd.get("sessionId").is_none());
    }

    #[tokio::test]
    async fn dispatch_routes_replies_and_events() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, mut rx) = broadcast::channel(8);

        let (ok_tx, ok_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        pending.lock().insert(1, ok_tx);
        pending.lock().insert(2, err_tx);

        dispatch(r#"{"id":1,"result":{"frameId":"F"}}"#, &pending, &events);
        dispatch(
            r#"{"id":2,"error":{"code":-32000,"message":"No node"}}"#,
            &pending,
            &events,
        );
        dispatch(
            r#"{"method":"Network.requestWillBeSent","params":{"request":{"url":"https://h/a.ts"}},"sessionId":"S1"}"#,
            &pending,
            &events,
        );
        dispatch("not json", &pending, &events);

        assert_eq!(ok_rx.await.unwrap().unwrap()["frameId"], "F");
        assert!(matches!(err_rx.await.unwrap(), Err(RelayError::Upstream(_))));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.method, "Network.requestWillBeSent");
        assert_eq!(event.session_id.as_deref(), Some("S1"));
        assert_eq!(event.params["request"]["url"], "https://h/a.ts");
        assert!(pending.lock().is_empty());
    }

    /// Minimal DevTools endpoint: answers every command with its own method
    /// name and emits one event first.
    async fn fake_devtools() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                if request["method"] == "Browser.close" {
                    let _ = ws.close(None).await;
                    break;
                }
                let event = json!({
                    "method": "Page.lifecycleEvent",
                    "params": {"name": "networkAlmostIdle"},
                    "sessionId": request["sessionId"],
                });
                ws.send(Message::Text(event.to_string())).await.unwrap();
                let reply = json!({
                    "id": request["id"],
                    "result": {"echo": request["method"]},
                });
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
        });
        format!("ws://{addr}/devtools/browser/test")
    }

    #[tokio::test]
    async fn round_trip_against_fake_endpoint() {
        let url = fake_devtools().await;
        let conn = CdpConnection::connect(&url).await.unwrap();
        assert_eq!(conn.url(), url);
        let mut events = conn.subscribe();

        let reply = conn
            .call("Page.enable", json!({}), Some("S1"), CALL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply["echo"], "Page.enable");

        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "Page.lifecycleEvent");
        assert_eq!(event.session_id.as_deref(), Some("S1"));

        let second = conn
            .call("Network.enable", json!({}), Some("S1"), CALL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(second["echo"], "Network.enable");
    }

    #[tokio::test]
    async fn closed_connection_fails_calls() {
        let url = fake_devtools().await;
        let conn = CdpConnection::connect(&url).await.unwrap();

        // The fake endpoint hangs up on Browser.close without replying.
        let result = conn
            .call("Browser.close", json!({}), None, CALL_TIMEOUT)
            .await;
        assert!(matches!(result, Err(RelayError::Upstream(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.is_connected());
        let after = conn
            .call("Page.enable", json!({}), None, CALL_TIMEOUT)
            .await;
        assert!(matches!(after, Err(RelayError::Upstream(_))));
    }
}
