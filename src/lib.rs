//! Offline-first request caching layer for a storefront site.
//!
//! Every outgoing resource request of the site is handed to a
//! [`ServiceWorker`](worker::ServiceWorker), which classifies it and answers
//! from a durable partition store, the network, or a synthetic fallback.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod network;
pub mod worker;

pub use cache::{PartitionStore, SqliteStorage};
pub use config::Config;
pub use error::{FetchError, LifecycleError};
pub use http::{Destination, Request, Response};
pub use worker::{Interception, ServiceWorker, WorkerSettings};
