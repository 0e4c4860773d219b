//! Offline worker: precaching, cache-first fetches and the offline page.
//!
//! Lifecycle:
//!
//! ```text
//! Parsed -> Installing -> Installed -> Activating -> Active
//!                                      (any) -> Redundant once superseded
//! ```

use anyhow::{Context, Result, bail};
use reqwest::{
    Client, Method, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::Serialize;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::cache::{CacheStorage, Request, RequestMode, Response, ResponseKind};
use crate::APP_USER_AGENT;

pub const CACHE_NAME: &str = "mcismartspace-v1.0.1";
pub const OFFLINE_URL: &str = "/offline.html";
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";
pub const CACHE_INVALIDATE_COOKIE: &str = "cache_invalidate";

const PRECACHE: [&str; 9] = [
    "/",
    "/index.php",
    "/public/css/login.css",
    "/public/js/alert.js",
    "/public/assets/final_logo.svg",
    "/public/assets/logo.webp",
    "/partials/terms.css",
    "/manifest.json",
    OFFLINE_URL,
];

const NOTIFICATION_TITLE: &str = "MCiSmartSpace";
const DEFAULT_NOTIFICATION_BODY: &str = "New notification from MCiSmartSpace";
const NOTIFICATION_ICON: &str = "/public/assets/final_logo.svg";
const NOTIFICATION_BADGE: &str = "/public/assets/logo.webp";
const OFFLINE_RESOURCE_BODY: &str = "Offline - Resource unavailable";
const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

const FALLBACK_OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Offline - MCiSmartSpace</title>
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <style>
    body { font-family: Arial, sans-serif; text-align: center; padding: 50px; }
    .container { max-width: 400px; margin: 0 auto; }
    button { background: #007bff; color: white; border: none; padding: 10px 20px; border-radius: 4px; cursor: pointer; }
  </style>
</head>
<body>
  <div class="container">
    <h1>You're Offline</h1>
    <p>Please check your connection and try again.</p>
    <button onclick="window.location.reload()">Retry</button>
  </div>
  <script>
    setInterval(() => { if (navigator.onLine) { window.location.reload(); } }, 3000);
  </script>
</body>
</html>
"#;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    cache_name: String,
    offline_url: String,
    precache: Vec<String>,
    origin: Url,
}

impl WorkerConfig {
    #[must_use]
    pub fn new(origin: Url) -> Self {
        Self {
            cache_name: CACHE_NAME.to_string(),
            offline_url: OFFLINE_URL.to_string(),
            precache: PRECACHE.iter().map(ToString::to_string).collect(),
            origin,
        }
    }

    #[must_use]
    pub fn with_cache_name(mut self, name: String) -> Self {
        self.cache_name = name;
        self
    }

    #[must_use]
    pub fn with_precache(mut self, paths: Vec<String>) -> Self {
        self.precache = paths;
        self
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    #[must_use]
    pub fn offline_url(&self) -> &str {
        &self.offline_url
    }

    #[must_use]
    pub fn precache(&self) -> &[String] {
        &self.precache
    }

    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .with_context(|| format!("invalid worker path: {path}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Active,
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Redundant => "redundant",
        };
        f.write_str(state)
    }
}

pub type NetworkFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// Where cache misses go. An `Err` means the network is unreachable.
pub trait Network: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> NetworkFuture<'a>;
}

/// [`Network`] backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpNetwork {
    client: Client,
    origin: Url,
}

impl HttpNetwork {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(origin: Url) -> Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(NETWORK_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, origin })
    }

    fn kind_for(&self, request: &Request) -> ResponseKind {
        if request.url.origin() == self.origin.origin() {
            ResponseKind::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseKind::Opaque
        } else {
            ResponseKind::Cors
        }
    }
}

impl Network for HttpNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> NetworkFuture<'a> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method.clone(), request.url.clone());
            if let Some(accept) = &request.accept {
                builder = builder.header(ACCEPT, accept);
            }
            let response = builder
                .send()
                .await
                .with_context(|| format!("network request failed: {}", request.url))?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes()
                .await
                .with_context(|| format!("failed to read body: {}", request.url))?;
            Ok(Response {
                status,
                content_type,
                body: body.to_vec(),
                kind: self.kind_for(request),
            })
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub date_of_arrival: u64,
    pub primary_key: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    fn from_push(text: Option<String>) -> Self {
        let action = |action: &str, title: &str| NotificationAction {
            action: action.to_string(),
            title: title.to_string(),
            icon: NOTIFICATION_ICON.to_string(),
        };
        let date_of_arrival = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            body: text.unwrap_or_else(|| DEFAULT_NOTIFICATION_BODY.to_string()),
            icon: NOTIFICATION_ICON.to_string(),
            badge: NOTIFICATION_BADGE.to_string(),
            vibrate: vec![100, 50, 100],
            data: NotificationData {
                date_of_arrival,
                primary_key: 1,
            },
            actions: vec![action("explore", "Open App"), action("close", "Close")],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<String>),
    /// Action chosen on the notification, `None` for a click on its body.
    NotificationClick(Option<String>),
    Sync(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Installed { precached: usize },
    Activated { deleted: Vec<String> },
    Respond(Response),
    /// The worker declined the request; the browser handles it natively.
    Passthrough,
    ShowNotification(Notification),
    OpenWindow(Url),
    NotificationClosed,
    Synced { performed: bool },
}

/// Counts work in flight; released on drop.
struct PendingWork(Arc<AtomicUsize>);

impl PendingWork {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct OfflineWorker {
    config: WorkerConfig,
    caches: CacheStorage,
    network: Arc<dyn Network>,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
    controls_clients: AtomicBool,
    pending: Arc<AtomicUsize>,
}

impl OfflineWorker {
    #[must_use]
    pub fn new(config: WorkerConfig, caches: CacheStorage, network: Arc<dyn Network>) -> Self {
        Self {
            config,
            caches,
            network,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            controls_clients: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    #[must_use]
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Whether the worker asked to replace the previous version without waiting.
    #[must_use]
    pub fn skip_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Whether open pages are controlled by this worker.
    #[must_use]
    pub fn controls_clients(&self) -> bool {
        self.controls_clients.load(Ordering::SeqCst)
    }

    /// No event is still being handled.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// Mark the worker as superseded; later events are rejected.
    pub async fn retire(&self) {
        *self.state.write().await = WorkerState::Redundant;
        self.controls_clients.store(false, Ordering::SeqCst);
    }

    /// Handle one lifecycle or functional event.
    ///
    /// # Errors
    /// Returns an error if the worker is redundant or the event is out of order.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
        let _pending = PendingWork::new(&self.pending);

        if self.state().await == WorkerState::Redundant {
            bail!("worker is redundant");
        }

        match event {
            WorkerEvent::Install => self.install().await,
            WorkerEvent::Activate => self.activate().await,
            WorkerEvent::Fetch(request) => Ok(self.fetch(&request).await),
            WorkerEvent::Push(text) => {
                debug!("push received");
                Ok(EventOutcome::ShowNotification(Notification::from_push(text)))
            }
            WorkerEvent::NotificationClick(action) => self.notification_click(action.as_deref()),
            WorkerEvent::Sync(tag) => Ok(self.sync(&tag)),
        }
    }

    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    async fn install(&self) -> Result<EventOutcome> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)
            .await?;

        let precached = match self.precache().await {
            Ok(count) => {
                info!("installation complete, {count} assets cached");
                self.skip_waiting.store(true, Ordering::SeqCst);
                count
            }
            Err(err) => {
                error!("installation failed: {err:#}");
                0
            }
        };

        *self.state.write().await = WorkerState::Installed;
        Ok(EventOutcome::Installed { precached })
    }

    /// All-or-nothing: one bad asset leaves the cache untouched.
    async fn precache(&self) -> Result<usize> {
        let cache = self.caches.open(&self.config.cache_name).await;
        let mut entries = Vec::with_capacity(self.config.precache.len());
        for path in &self.config.precache {
            let request = Request::get(self.config.resolve(path)?);
            let response = self.network.fetch(&request).await?;
            if !response.status.is_success() {
                bail!("precache of {path} returned {}", response.status);
            }
            entries.push((request, response));
        }
        let count = entries.len();
        cache.put_all(entries).await;
        Ok(count)
    }

    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    async fn activate(&self) -> Result<EventOutcome> {
        self.transition(WorkerState::Installed, WorkerState::Activating)
            .await?;

        let mut deleted = Vec::new();
        for name in self.caches.keys().await {
            if name != self.config.cache_name {
                info!("deleting old cache {name}");
                self.caches.delete(&name).await;
                deleted.push(name);
            }
        }

        *self.state.write().await = WorkerState::Active;
        self.controls_clients.store(true, Ordering::SeqCst);
        info!("activation complete");
        Ok(EventOutcome::Activated { deleted })
    }

    async fn fetch(&self, request: &Request) -> EventOutcome {
        if request.method != Method::GET || !matches!(request.url.scheme(), "http" | "https") {
            return EventOutcome::Passthrough;
        }

        if let Some(cached) = self.caches.matches(request).await {
            debug!("serving from cache {}", request.url);
            return EventOutcome::Respond(cached);
        }

        debug!("fetching from network {}", request.url);
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK && response.kind == ResponseKind::Basic {
                    self.caches
                        .open(&self.config.cache_name)
                        .await
                        .put(request, response.clone())
                        .await;
                }
                EventOutcome::Respond(response)
            }
            Err(err) => {
                warn!("fetch failed: {err:#}");
                EventOutcome::Respond(self.offline_response(request).await)
            }
        }
    }

    async fn offline_response(&self, request: &Request) -> Response {
        if !request.wants_page() {
            return Response::synthetic(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                OFFLINE_RESOURCE_BODY,
            );
        }

        debug!("serving offline page");
        let cached = match self.config.resolve(&self.config.offline_url) {
            Ok(url) => self.caches.matches(&Request::get(url)).await,
            Err(err) => {
                error!("{err:#}");
                None
            }
        };
        cached.unwrap_or_else(|| {
            Response::synthetic(StatusCode::OK, "text/html", FALLBACK_OFFLINE_PAGE)
        })
    }

    fn notification_click(&self, action: Option<&str>) -> Result<EventOutcome> {
        debug!("notification clicked");
        if action == Some("explore") {
            return Ok(EventOutcome::OpenWindow(self.config.resolve("/")?));
        }
        Ok(EventOutcome::NotificationClosed)
    }

    fn sync(&self, tag: &str) -> EventOutcome {
        debug!("background sync {tag}");
        let performed = tag == BACKGROUND_SYNC_TAG;
        if performed {
            info!("performing background sync");
        }
        EventOutcome::Synced { performed }
    }

    async fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != from {
            bail!("cannot move to {to} from {}", *state);
        }
        *state = to;
        Ok(())
    }
}

/// Drop every cache if the login response left the `cache_invalidate` cue.
///
/// Returns the names of the deleted caches.
pub async fn clear_after_login(caches: &CacheStorage, cookie_header: Option<&str>) -> Vec<String> {
    let has_cue = cookie_header.is_some_and(|header| {
        header
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .any(|(name, _)| name.trim() == CACHE_INVALIDATE_COOKIE)
    });
    if !has_cue {
        return Vec::new();
    }

    let mut deleted = Vec::new();
    for name in caches.keys().await {
        if caches.delete(&name).await {
            debug!("deleted cache {name}");
            deleted.push(name);
        }
    }
    info!("cleared {} caches after login", deleted.len());
    deleted
}
