//! Weibo harvester back end
//!
//! Obtains, validates, and persists Weibo session credentials through
//! QR-code login, then drives long-running keyword-search crawls that walk
//! backwards through history and follow the tail incrementally. Credentials,
//! task state, and crawled posts live in Redis; the upstream service is
//! reached exclusively through a browser-automation sidecar spoken to over a
//! local WebSocket.

pub mod api;
pub mod config;
pub mod crawl;
pub mod credentials;
pub mod error;
pub mod events;
pub mod export;
pub mod logging;
pub mod login;
pub mod posts;
pub mod sidecar;
pub mod storage;

pub use api::AppContext;
pub use config::HarvesterConfig;
pub use crawl::{
    CrawlCheckpoint, CrawlEngine, CrawlTask, Direction, TimeRange, TimeShard, TimeSharder,
    PAGE_CAP,
};
pub use credentials::{CredentialRecord, CredentialStore, CredentialValidator};
pub use error::{HarvestError, Result, ValidationFailure};
pub use events::{EventBus, HarvestEvent};
pub use export::{ExportFormat, ExportReceipt};
pub use login::{LoginOrchestrator, LoginSession, LoginState};
pub use posts::{CrawledPost, PostStore};
pub use sidecar::{CookieMap, SidecarBridge};
