//! Chrome/Chromium over the DevTools protocol
//!
//! Launches a headless browser with sandboxing disabled (containers rarely
//! allow the setuid sandbox), reads the DevTools WebSocket address from its
//! stderr, and drives pages as flattened target sessions.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cdp::{CdpConnection, CdpEvent};
use super::{Browser, BrowserLauncher, NetworkEvent, Page};
use crate::error::{RelayError, Result};

/// Binary names tried, in order, when no executable is configured.
const CANDIDATE_BINARIES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

/// Flags for a headless browser in a constrained host.
const DEFAULT_ARGS: &[&str] = &[
    "--headless=new",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-first-run",
    "--no-default-browser-check",
    "--mute-audio",
    "--autoplay-policy=no-user-gesture-required",
    "--disable-background-networking",
    "--remote-debugging-port=0",
];

/// Per-command bound for DevTools calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Line prefix Chrome prints once DevTools is ready.
const DEVTOOLS_BANNER: &str = "DevTools listening on ";

/// Launches Chrome processes.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    executable: Option<PathBuf>,
    extra_args: Vec<String>,
    user_agent: Option<String>,
}

impl ChromeLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self {
            executable,
            extra_args: Vec::new(),
            user_agent: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// User agent applied to every page.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Configured executable, or the first candidate found in `PATH`.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = &self.executable {
            return Ok(path.clone());
        }
        CANDIDATE_BINARIES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                RelayError::Upstream(format!(
                    "no browser executable configured and none of {CANDIDATE_BINARIES:?} found in PATH"
                ))
            })
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>> {
        let executable = self.resolve_executable()?;
        let profile_dir = std::env::temp_dir().join(format!("hlsrelay-{}", uuid::Uuid::new_v4()));

        info!("Launching browser: {}", executable.display());
        let mut child = Command::new(&executable)
            .args(DEFAULT_ARGS)
            .args(&self.extra_args)
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::Upstream(format!("failed to start {}: {e}", executable.display()))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::Upstream("browser stderr unavailable".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        let ws_url = loop {
            match lines.next_line().await? {
                Some(line) => {
                    if let Some(url) = devtools_url(&line) {
                        break url.to_string();
                    }
                    debug!(target: "hlsrelay::chrome", "{line}");
                }
                None => {
                    let status = child.wait().await.ok();
                    remove_profile(&profile_dir).await;
                    return Err(RelayError::Upstream(format!(
                        "browser exited before DevTools was ready ({status:?})"
                    )));
                }
            }
        };

        // Keep draining stderr so the pipe never fills.
        let log_drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "hlsrelay::chrome", "{line}");
            }
        });

        let conn = match CdpConnection::connect(&ws_url).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = child.kill().await;
                remove_profile(&profile_dir).await;
                return Err(e);
            }
        };
        info!("Browser ready at {ws_url}");

        Ok(Arc::new(ChromeBrowser {
            conn: Arc::new(conn),
            child: Mutex::new(Some(child)),
            profile_dir,
            user_agent: self.user_agent.clone(),
            log_drain,
        }))
    }
}

/// Extract the WebSocket address from Chrome's startup banner.
fn devtools_url(line: &str) -> Option<&str> {
    let url = line.trim().strip_prefix(DEVTOOLS_BANNER)?.trim();
    url.starts_with("ws://").then_some(url)
}

async fn remove_profile(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!("Could not remove browser profile {}: {e}", dir.display());
    }
}

/// A running Chrome process.
pub struct ChromeBrowser {
    conn: Arc<CdpConnection>,
    child: Mutex<Option<Child>>,
    profile_dir: PathBuf,
    user_agent: Option<String>,
    log_drain: JoinHandle<()>,
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_page(&self) -> Result<Box<dyn Page>> {
        let target = self
            .conn
            .call(
                "Target.createTarget",
                json!({"url": "about:blank"}),
                None,
                CALL_TIMEOUT,
            )
            .await?;
        let target_id = string_field(&target, "targetId")?;

        let attached = self
            .conn
            .call(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
                None,
                CALL_TIMEOUT,
            )
            .await?;
        let session_id = string_field(&attached, "sessionId")?;

        let page = ChromePage::attach(
            Arc::clone(&self.conn),
            target_id,
            session_id,
            self.user_agent.clone(),
        );
        page.enable().await?;
        Ok(Box::new(page))
    }

    async fn close(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if self.conn.is_connected() {
            if let Err(e) = self
                .conn
                .call("Browser.close", json!({}), None, Duration::from_secs(5))
                .await
            {
                debug!("Browser.close: {e}");
            }
        }
        self.conn.close();

        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("Browser exited: {status}"),
            _ => {
                warn!("Browser did not exit, killing it");
                let _ = child.kill().await;
            }
        }
        self.log_drain.abort();
        remove_profile(&self.profile_dir).await;
        info!("Browser closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| RelayError::Upstream(format!("DevTools reply missing '{field}'")))
}

/// Frame id to the loader id whose network has gone idle in that frame.
type SettledLoaders = HashMap<String, String>;

/// One attached page session.
///
/// Out-of-process iframes and workers spawned by the page are auto-attached
/// as child sessions, and their network traffic is merged into the page's
/// event stream.
pub struct ChromePage {
    conn: Arc<CdpConnection>,
    target_id: String,
    session_id: String,
    user_agent: Option<String>,
    network: mpsc::UnboundedReceiver<NetworkEvent>,
    settled: Arc<watch::Sender<SettledLoaders>>,
    pump: JoinHandle<()>,
    children: JoinHandle<()>,
}

impl ChromePage {
    fn attach(
        conn: Arc<CdpConnection>,
        target_id: String,
        session_id: String,
        user_agent: Option<String>,
    ) -> Self {
        let events = conn.subscribe();
        let (network_tx, network) = mpsc::unbounded_channel();
        let (attached_tx, attached) = mpsc::unbounded_channel();
        let settled = Arc::new(watch::Sender::new(SettledLoaders::new()));
        let pump = tokio::spawn(pump_events(
            events,
            session_id.clone(),
            network_tx,
            Arc::clone(&settled),
            attached_tx,
        ));
        let children = tokio::spawn(observe_children(
            Arc::clone(&conn),
            attached,
            user_agent.clone(),
        ));
        Self {
            conn,
            target_id,
            session_id,
            user_agent,
            network,
            settled,
            pump,
            children,
        }
    }

    async fn enable(&self) -> Result<()> {
        self.call("Page.enable", json!({})).await?;
        self.call("Page.setLifecycleEventsEnabled", json!({"enabled": true}))
            .await?;
        for (method, params) in observe_commands(self.user_agent.as_deref()) {
            self.call(method, params).await?;
        }
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.conn
            .call(method, params, Some(&self.session_id), CALL_TIMEOUT)
            .await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let reply = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = reply.get("exceptionDetails") {
            return Err(RelayError::Upstream(format!(
                "page script failed: {}",
                details.get("text").and_then(Value::as_str).unwrap_or("exception")
            )));
        }
        Ok(reply
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Network observation commands, sent to the page and to every child
/// session it spawns.
fn observe_commands(user_agent: Option<&str>) -> Vec<(&'static str, Value)> {
    let mut commands = vec![("Network.enable", json!({}))];
    if let Some(user_agent) = user_agent {
        commands.push((
            "Network.setUserAgentOverride",
            json!({"userAgent": user_agent}),
        ));
    }
    commands.push((
        "Target.setAutoAttach",
        json!({"autoAttach": true, "flatten": true, "waitForDebuggerOnStart": false}),
    ));
    commands
}

/// Enable network observation on each child session as it attaches.
async fn observe_children(
    conn: Arc<CdpConnection>,
    mut attached: mpsc::UnboundedReceiver<String>,
    user_agent: Option<String>,
) {
    while let Some(child) = attached.recv().await {
        let conn = Arc::clone(&conn);
        let user_agent = user_agent.clone();
        tokio::spawn(async move {
            for (method, params) in observe_commands(user_agent.as_deref()) {
                // Workers reject some domains; the rest still apply.
                if let Err(e) = conn.call(method, params, Some(&child), CALL_TIMEOUT).await {
                    debug!(session = %child, "{method} on child target: {e}");
                }
            }
        });
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut settled = self.settled.subscribe();

        let started = self.call("Page.navigate", json!({"url": url}));
        let reply = tokio::time::timeout_at(deadline, started)
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "navigation to {url} did not start within {timeout:?}"
                ))
            })??;
        if let Some(error) = reply.get("errorText").and_then(Value::as_str) {
            if !error.is_empty() {
                return Err(RelayError::Upstream(format!("navigation to {url} failed: {error}")));
            }
        }

        let frame_id = string_field(&reply, "frameId")?;
        // Same-document navigations start no new loader.
        let Some(loader_id) = reply.get("loaderId").and_then(Value::as_str) else {
            return Ok(());
        };

        let waited = tokio::time::timeout_at(
            deadline,
            settled.wait_for(|loaders| {
                loaders.get(&frame_id).map(String::as_str) == Some(loader_id)
            }),
        )
        .await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RelayError::Upstream(format!(
                "page closed while loading {url}"
            ))),
            Err(_) => Err(RelayError::Timeout(format!(
                "network did not settle on {url} within {timeout:?}"
            ))),
        }
    }

    async fn click(&mut self, selector: &str) -> Result<bool> {
        let selector = serde_json::to_string(selector)?;
        let clicked = self
            .evaluate(&format!(
                "(() => {{ const el = document.querySelector({selector}); \
                 if (!el) return false; el.click(); return true; }})()"
            ))
            .await?;
        Ok(clicked.as_bool().unwrap_or(false))
    }

    async fn play_media(&mut self) -> Result<usize> {
        let count = self
            .evaluate(
                "(() => { const media = document.querySelectorAll('video, audio'); \
                 media.forEach(m => { m.muted = true; const p = m.play(); \
                 if (p && p.catch) p.catch(() => {}); }); return media.length; })()",
            )
            .await?;
        Ok(count
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0))
    }

    async fn next_network_event(&mut self) -> Result<Option<NetworkEvent>> {
        Ok(self.network.recv().await)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.pump.abort();
        self.children.abort();
        self.conn
            .call(
                "Target.closeTarget",
                json!({"targetId": self.target_id}),
                None,
                CALL_TIMEOUT,
            )
            .await?;
        Ok(())
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        self.pump.abort();
        self.children.abort();
    }
}

/// Translate the DevTools events of a page and its child sessions into
/// network events and per-frame load state.
///
/// Lifecycle events only count for the page session itself. Network events
/// are accepted from the page and from any child it auto-attached.
async fn pump_events(
    mut events: broadcast::Receiver<CdpEvent>,
    session_id: String,
    network: mpsc::UnboundedSender<NetworkEvent>,
    settled: Arc<watch::Sender<SettledLoaders>>,
    attached: mpsc::UnboundedSender<String>,
) {
    let mut children: HashSet<String> = HashSet::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "page event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(signal) = translate(&event) else {
            continue;
        };

        // Reported on the parent session (the root for the page itself).
        if let PageSignal::SessionDetached(detached) = &signal {
            if *detached == session_id {
                break;
            }
            children.remove(detached);
            continue;
        }

        let Some(from) = event.session_id.as_deref() else {
            continue;
        };
        let own = from == session_id;
        if !own && !children.contains(from) {
            continue;
        }

        match signal {
            PageSignal::Network(ev) => {
                if network.send(ev).is_err() {
                    break;
                }
            }
            PageSignal::Lifecycle {
                frame_id,
                loader_id,
                idle,
            } if own => {
                settled.send_modify(|loaders| {
                    if idle {
                        loaders.insert(frame_id, loader_id);
                    } else {
                        loaders.remove(&frame_id);
                    }
                });
            }
            PageSignal::Lifecycle { .. } | PageSignal::SessionDetached(_) => {}
            PageSignal::Attached(child) => {
                debug!(session = %child, "Child target attached");
                if children.insert(child.clone()) {
                    let _ = attached.send(child);
                }
            }
            PageSignal::InspectorDetached => {
                if own {
                    break;
                }
                children.remove(from);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PageSignal {
    Network(NetworkEvent),
    Lifecycle {
        frame_id: String,
        loader_id: String,
        idle: bool,
    },
    Attached(String),
    SessionDetached(String),
    InspectorDetached,
}

fn translate(event: &CdpEvent) -> Option<PageSignal> {
    let param = |name: &str| event.params.get(name).and_then(Value::as_str);
    match event.method.as_str() {
        "Network.requestWillBeSent" => event
            .params
            .pointer("/request/url")
            .and_then(Value::as_str)
            .map(|url| PageSignal::Network(NetworkEvent::Request(url.to_string()))),
        "Network.responseReceived" => {
            let response = event.params.get("response")?;
            let url = response.get("url").and_then(Value::as_str)?;
            let status = response
                .get("status")
                .and_then(Value::as_f64)
                .map_or(0, |s| s as u16);
            Some(PageSignal::Network(NetworkEvent::Response {
                url: url.to_string(),
                status,
            }))
        }
        "Page.lifecycleEvent" => {
            let idle = match param("name")? {
                "init" => false,
                // Closest equivalent of "at most two connections in flight".
                "networkAlmostIdle" | "networkIdle" => true,
                _ => return None,
            };
            Some(PageSignal::Lifecycle {
                frame_id: param("frameId")?.to_string(),
                loader_id: param("loaderId")?.to_string(),
                idle,
            })
        }
        "Target.attachedToTarget" => {
            param("sessionId").map(|id| PageSignal::Attached(id.to_string()))
        }
        "Target.detachedFromTarget" => {
            param("sessionId").map(|id| PageSignal::SessionDetached(id.to_string()))
        }
        "Inspector.detached" => Some(PageSignal::InspectorDetached),
        _ => None,
    }
}
