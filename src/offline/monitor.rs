//! Client connectivity monitor.
//!
//! Combines the browser's online/offline signal with a periodic liveness
//! probe. Leaving the offline state yields a [`ConnectivityEvent::Reload`].

use anyhow::{Context, Result, bail};
use reqwest::Client;
use serde::Serialize;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::APP_USER_AGENT;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STABILIZATION_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_PROBE_PATH: &str = "/connection-test";

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    base_url: Url,
    interval: Duration,
    timeout: Duration,
    stabilization_delay: Duration,
    probe_path: String,
}

impl MonitorConfig {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            stabilization_delay: DEFAULT_STABILIZATION_DELAY,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stabilization_delay(mut self, delay: Duration) -> Self {
        self.stabilization_delay = delay;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn stabilization_delay(&self) -> Duration {
        self.stabilization_delay
    }

    #[must_use]
    pub fn probe_path(&self) -> &str {
        &self.probe_path
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Lightweight reachability check against the server.
pub trait Probe: Send + Sync {
    fn probe(&self) -> ProbeFuture<'_>;
}

/// `HEAD {base}/connection-test?nocache=<millis>`. Any HTTP answer counts as reachable.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: Client,
    url: Url,
}

impl HttpProbe {
    /// # Errors
    /// Returns an error if the probe URL is invalid or the client cannot be built.
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let url = config
            .base_url
            .join(&config.probe_path)
            .with_context(|| format!("invalid probe path: {}", config.probe_path))?;
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, url })
    }

    fn cache_busted_url(&self) -> Url {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("nocache", &millis.to_string());
        url
    }
}

impl Probe for HttpProbe {
    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let url = self.cache_busted_url();
            self.client
                .head(url.clone())
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .send()
                .await
                .with_context(|| format!("connection check failed: {url}"))?;
            Ok(())
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Connectivity came back; the page should reload.
    Reload,
}

/// Debug view of the monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectivityStatus {
    pub browser_online: bool,
    pub server_reachable: bool,
    pub offline: bool,
    pub consecutive_failures: u32,
    /// Unix millis of the last completed probe.
    pub last_check: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    browser_online: bool,
    server_reachable: bool,
    was_offline: bool,
    consecutive_failures: u32,
    last_check: Option<u64>,
}

impl Inner {
    fn offline(&self) -> bool {
        !self.browser_online || !self.server_reachable
    }

    fn settle(&mut self) -> Option<ConnectivityEvent> {
        let offline = self.offline();
        let reconnected = self.was_offline && !offline;
        self.was_offline = offline;
        reconnected.then_some(ConnectivityEvent::Reload)
    }
}

pub struct ConnectivityMonitor {
    config: MonitorConfig,
    probe: Arc<dyn Probe>,
    inner: Mutex<Inner>,
}

impl ConnectivityMonitor {
    /// `browser_online` is the browser's state when the page loads.
    #[must_use]
    pub fn new(config: MonitorConfig, probe: Arc<dyn Probe>, browser_online: bool) -> Self {
        Self {
            config,
            probe,
            inner: Mutex::new(Inner {
                browser_online,
                server_reachable: true,
                was_offline: !browser_online,
                consecutive_failures: 0,
                last_check: None,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Feed a browser `online`/`offline` event.
    pub async fn browser_event(&self, online: bool) -> Option<ConnectivityEvent> {
        let mut inner = self.inner.lock().await;
        inner.browser_online = online;
        // The browser just regained a link; give the server the benefit of the doubt.
        if online {
            inner.server_reachable = true;
        }
        info!(
            "connection status changed: {}",
            if online { "ONLINE" } else { "OFFLINE" }
        );
        inner.settle()
    }

    /// Probe the server unless the browser already reports offline.
    pub async fn check(&self) -> Option<ConnectivityEvent> {
        if !self.inner.lock().await.browser_online {
            debug!("browser offline, skipping connection check");
            return None;
        }

        let result = match timeout(self.config.timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "connection check timed out after {:?}",
                self.config.timeout
            )),
        };

        let mut inner = self.inner.lock().await;
        inner.last_check = Some(unix_millis());
        match result {
            Ok(()) => {
                inner.server_reachable = true;
                inner.consecutive_failures = 0;
            }
            Err(err) => {
                warn!("connection check failed: {err:#}");
                inner.server_reachable = false;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
        let event = inner.settle();
        if event.is_some() {
            info!("server connection restored");
        }
        event
    }

    /// Manual "try again" from the offline page.
    pub async fn retry(&self) -> Option<ConnectivityEvent> {
        info!("manual connection retry");
        self.check().await
    }

    pub async fn status(&self) -> ConnectivityStatus {
        let inner = self.inner.lock().await;
        ConnectivityStatus {
            browser_online: inner.browser_online,
            server_reachable: inner.server_reachable,
            offline: inner.offline(),
            consecutive_failures: inner.consecutive_failures,
            last_check: inner.last_check,
        }
    }

    /// Check on a fixed interval and send reload signals after the stabilization delay.
    ///
    /// The task ends when the receiver is dropped.
    pub fn run(self: Arc<Self>, events: mpsc::Sender<ConnectivityEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if events.is_closed() {
                    break;
                }
                if let Some(event) = self.check().await {
                    sleep(self.config.stabilization_delay).await;
                    if let Err(err) = notify(&events, event).await {
                        debug!("{err}");
                        break;
                    }
                }
            }
        })
    }
}

async fn notify(events: &mpsc::Sender<ConnectivityEvent>, event: ConnectivityEvent) -> Result<()> {
    if events.send(event).await.is_err() {
        bail!("connectivity listener dropped, stopping monitor");
    }
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
