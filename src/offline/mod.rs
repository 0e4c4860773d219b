//! Browser-side offline support.
//!
//! [`worker::OfflineWorker`] is the cache-first worker that serves the
//! precached shell and the offline page, [`monitor::ConnectivityMonitor`]
//! watches connectivity and asks the page to reload once the server is back.

pub mod cache;
pub mod monitor;
pub mod worker;

pub use cache::{Cache, CacheStorage, Request, RequestMode, Response, ResponseKind};
pub use monitor::{ConnectivityEvent, ConnectivityMonitor, ConnectivityStatus, HttpProbe, MonitorConfig, Probe};
pub use worker::{
    EventOutcome, HttpNetwork, Network, Notification, OfflineWorker, WorkerConfig, WorkerEvent,
    WorkerState, clear_after_login,
};
