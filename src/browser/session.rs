//! Shared browser session with idle teardown
//!
//! One browser serves every resolution. It is launched on first use,
//! handed out as leases, and closed once it has had no active lease for the
//! idle window. Launches are serialized so concurrent first callers share a
//! single process.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Browser, BrowserLauncher};
use crate::error::{RelayError, Result};

/// Default inactivity window before the browser is closed (5 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default bound on starting the browser.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

struct SessionState {
    browser: Option<Arc<dyn Browser>>,
    /// Bumped on every launch; leases remember which browser they hold.
    generation: u64,
    active: usize,
    /// Bumped on every acquire and release; an idle timer only fires if the
    /// epoch it was armed with is still current.
    epoch: u64,
}

struct Inner {
    launcher: Arc<dyn BrowserLauncher>,
    idle_timeout: Duration,
    launch_timeout: Duration,
    launch_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub ready: bool,
    pub active_leases: usize,
    pub launches: u64,
}

/// Owner of the single shared browser.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self::with_timeouts(launcher, DEFAULT_IDLE_TIMEOUT, DEFAULT_LAUNCH_TIMEOUT)
    }

    pub fn with_timeouts(
        launcher: Arc<dyn BrowserLauncher>,
        idle_timeout: Duration,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                idle_timeout,
                launch_timeout,
                launch_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(SessionState {
                    browser: None,
                    generation: 0,
                    active: 0,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Lease the browser, launching it if absent.
    ///
    /// The browser is never closed while any lease is alive.
    pub async fn acquire(&self) -> Result<SessionLease> {
        if let Some(lease) = self.try_lease() {
            return Ok(lease);
        }

        let _launching = self.inner.launch_lock.lock().await;
        // Another caller may have finished launching while we waited.
        if let Some(lease) = self.try_lease() {
            return Ok(lease);
        }

        debug!("No live browser session, launching");
        let browser = tokio::time::timeout(self.inner.launch_timeout, self.inner.launcher.launch())
            .await
            .map_err(|_| {
                RelayError::Timeout(format!(
                    "browser did not start within {:?}",
                    self.inner.launch_timeout
                ))
            })??;

        let mut state = self.inner.state.lock();
        state.browser = Some(Arc::clone(&browser));
        state.generation += 1;
        state.active += 1;
        state.epoch += 1;
        info!(generation = state.generation, "Browser session ready");
        Ok(SessionLease {
            browser,
            generation: state.generation,
            inner: Arc::clone(&self.inner),
        })
    }

    fn try_lease(&self) -> Option<SessionLease> {
        let stale = {
            let mut state = self.inner.state.lock();
            match state.browser.clone() {
                Some(browser) if browser.is_connected() => {
                    state.active += 1;
                    state.epoch += 1;
                    return Some(SessionLease {
                        browser,
                        generation: state.generation,
                        inner: Arc::clone(&self.inner),
                    });
                }
                Some(_) => {
                    warn!("Browser session lost its connection, discarding it");
                    state.active = 0;
                    state.browser.take()
                }
                None => None,
            }
        };
        if let Some(browser) = stale {
            spawn_close(browser);
        }
        None
    }

    /// Close the browser now, regardless of leases. Used on shutdown.
    pub async fn shutdown(&self) {
        let browser = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.active = 0;
            state.browser.take()
        };
        if let Some(browser) = browser {
            info!("Closing browser session");
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {e}");
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.inner.state.lock();
        SessionStatus {
            ready: state.browser.is_some(),
            active_leases: state.active,
            launches: state.generation,
        }
    }
}

/// Access to the shared browser. Dropping it releases the session.
pub struct SessionLease {
    browser: Arc<dyn Browser>,
    generation: u64,
    inner: Arc<Inner>,
}

impl SessionLease {
    pub fn browser(&self) -> &dyn Browser {
        self.browser.as_ref()
    }

    /// Launch generation of the leased browser, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.generation != self.generation || state.browser.is_none() {
            return;
        }
        state.active = state.active.saturating_sub(1);
        if state.active > 0 {
            return;
        }
        state.epoch += 1;
        let epoch = state.epoch;
        drop(state);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let idle = self.inner.idle_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(idle).await;
            expire(&inner, epoch).await;
        });
    }
}

/// Close the browser if nothing touched the session since `epoch`.
async fn expire(inner: &Weak<Inner>, epoch: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let browser = {
        let mut state = inner.state.lock();
        if state.epoch != epoch || state.active > 0 {
            return;
        }
        state.browser.take()
    };
    if let Some(browser) = browser {
        info!("Browser idle for {:?}, closing it", inner.idle_timeout);
        if let Err(e) = browser.close().await {
            warn!("Browser close failed: {e}");
        }
    }
}

fn spawn_close(browser: Arc<dyn Browser>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = browser.close().await {
                debug!("Closing disconnected browser: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::ScriptedLauncher;

    const IDLE: Duration = Duration::from_secs(300);

    fn manager(launcher: &Arc<ScriptedLauncher>) -> SessionManager {
        SessionManager::with_timeouts(
            Arc::clone(launcher) as Arc<dyn BrowserLauncher>,
            IDLE,
            Duration::from_secs(30),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_launch_once() {
        let launcher = Arc::new(ScriptedLauncher::new().with_launch_delay(Duration::from_millis(50)));
        let sessions = manager(&launcher);

        let (a, b, c) = tokio::join!(sessions.acquire(), sessions.acquire(), sessions.acquire());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(launcher.launches(), 1);
        assert_eq!(a.generation(), 1);
        assert_eq!(b.generation(), 1);
        assert_eq!(c.generation(), 1);
        assert_eq!(sessions.status().active_leases, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_before_idle_window() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let sessions = manager(&launcher);

        for _ in 0..5 {
            let lease = sessions.acquire().await.unwrap();
            drop(lease);
            tokio::time::sleep(IDLE / 2).await;
        }
        assert_eq!(launcher.launches(), 1);
        assert!(sessions.status().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_window_tears_down_and_relaunches() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let sessions = manager(&launcher);

        drop(sessions.acquire().await.unwrap());
        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;

        assert!(!sessions.status().ready);
        assert_eq!(launcher.closed(), 1);

        let lease = sessions.acquire().await.unwrap();
        assert_eq!(lease.generation(), 2);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn active_lease_blocks_teardown() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let sessions = manager(&launcher);

        let long_running = sessions.acquire().await.unwrap();
        drop(sessions.acquire().await.unwrap());
        tokio::time::sleep(IDLE * 3).await;

        assert!(sessions.status().ready);
        assert_eq!(launcher.closed(), 0);

        drop(long_running);
        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert!(!sessions.status().ready);
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_launch_leaves_session_absent() {
        let launcher = Arc::new(ScriptedLauncher::new().failing_launches(1));
        let sessions = manager(&launcher);

        assert!(matches!(sessions.acquire().await, Err(RelayError::Upstream(_))));
        assert!(!sessions.status().ready);

        let lease = sessions.acquire().await.unwrap();
        assert_eq!(lease.generation(), 1);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_launch_times_out() {
        let launcher = Arc::new(ScriptedLauncher::new().with_launch_delay(Duration::from_secs(60)));
        let sessions = manager(&launcher);

        assert!(matches!(sessions.acquire().await, Err(RelayError::Timeout(_))));
        assert!(!sessions.status().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_browser_is_replaced() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let sessions = manager(&launcher);

        drop(sessions.acquire().await.unwrap());
        launcher.disconnect_all();

        let lease = sessions.acquire().await.unwrap();
        assert_eq!(lease.generation(), 2);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_browser() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let sessions = manager(&launcher);

        let lease = sessions.acquire().await.unwrap();
        sessions.shutdown().await;
        assert!(!sessions.status().ready);
        assert_eq!(launcher.closed(), 1);

        // Releasing a lease from the closed generation is harmless.
        drop(lease);
        assert_eq!(sessions.status().active_leases, 0);
    }
}
