//! Named response caches for the offline worker.
//!
//! Entries are keyed by method and absolute URL. Only `GET` responses are
//! ever stored.

use reqwest::{Method, StatusCode};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use url::Url;

/// How the browser issued the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    SameOrigin,
    NoCors,
    Cors,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub accept: Option<String>,
}

impl Request {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::NoCors,
            accept: None,
        }
    }

    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::Navigate,
            accept: Some("text/html".to_string()),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_accept(mut self, accept: &str) -> Self {
        self.accept = Some(accept.to_string());
        self
    }

    /// Page loads get the offline page when the network is gone.
    #[must_use]
    pub fn wants_page(&self) -> bool {
        self.mode == RequestMode::Navigate
            || (self.method == Method::GET
                && self
                    .accept
                    .as_deref()
                    .is_some_and(|accept| accept.contains("text/html")))
    }

    fn cache_key(&self) -> String {
        self.url.to_string()
    }
}

/// Response tainting, as seen by a worker script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// Same-origin response.
    Basic,
    Cors,
    Opaque,
    /// Generated by the worker itself.
    Synthetic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub kind: ResponseKind,
}

impl Response {
    #[must_use]
    pub fn synthetic(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            body: body.into(),
            kind: ResponseKind::Synthetic,
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A single named cache.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    entries: Arc<RwLock<HashMap<String, Response>>>,
}

impl Cache {
    pub async fn put(&self, request: &Request, response: Response) {
        if request.method != Method::GET {
            return;
        }
        self.entries
            .write()
            .await
            .insert(request.cache_key(), response);
    }

    /// Store every pair under a single lock.
    pub async fn put_all(&self, entries: Vec<(Request, Response)>) {
        let mut cache = self.entries.write().await;
        for (request, response) in entries {
            if request.method == Method::GET {
                cache.insert(request.cache_key(), response);
            }
        }
    }

    pub async fn matches(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        self.entries.read().await.get(&request.cache_key()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Every cache owned by one origin, by name.
#[derive(Clone, Debug, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
}

impl CacheStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name`, creating it if missing.
    pub async fn open(&self, name: &str) -> Cache {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Returns `true` if a cache was removed.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// First match across all caches.
    pub async fn matches(&self, request: &Request) -> Option<Response> {
        let caches: Vec<Cache> = self.caches.read().await.values().cloned().collect();
        for cache in caches {
            if let Some(response) = cache.matches(request).await {
                return Some(response);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn ok(body: &str) -> Response {
        Response {
            status: StatusCode::OK,
            content_type: Some("text/plain".to_string()),
            body: body.as_bytes().to_vec(),
            kind: ResponseKind::Basic,
        }
    }

    #[tokio::test]
    async fn put_and_match_by_url() -> Result<()> {
        let storage = CacheStorage::new();
        let cache = storage.open("v1").await;
        let request = Request::get(Url::parse("https://app.test/public/js/alert.js")?);
        cache.put(&request, ok("js")).await;

        assert_eq!(
            storage.matches(&request).await.map(|r| r.text()),
            Some("js".to_string())
        );
        let other = Request::get(Url::parse("https://app.test/other.js")?);
        assert!(storage.matches(&other).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn non_get_requests_are_never_cached() -> Result<()> {
        let storage = CacheStorage::new();
        let cache = storage.open("v1").await;
        let request =
            Request::get(Url::parse("https://app.test/auth/login")?).with_method(Method::POST);
        cache.put(&request, ok("nope")).await;
        assert!(cache.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn delete_and_keys() {
        let storage = CacheStorage::new();
        storage.open("b").await;
        storage.open("a").await;
        assert_eq!(storage.keys().await, vec!["a".to_string(), "b".to_string()]);
        assert!(storage.delete("a").await);
        assert!(!storage.delete("a").await);
        assert!(!storage.has("a").await);
        assert!(storage.has("b").await);
    }

    #[test]
    fn page_requests() -> Result<()> {
        let url = Url::parse("https://app.test/index.php")?;
        assert!(Request::navigate(url.clone()).wants_page());
        assert!(
            Request::get(url.clone())
                .with_accept("text/html,application/xhtml+xml")
                .wants_page()
        );
        assert!(!Request::get(url).with_accept("image/webp").wants_page());
        Ok(())
    }
}
