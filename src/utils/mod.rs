//! # Utility Modules
//!
//! Supporting utilities for caching, logging, metrics and timing.
//!
//! ## Components
//! - **LRU Cache**: fixed-capacity cache behind the bencode decode cache
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Default deadlines and async timeout wrappers

pub mod logging;
pub mod lru_cache;
pub mod metrics;
pub mod timeout;

pub use lru_cache::{LruCache, LruStats};
pub use metrics::{Metrics, MetricsSnapshot};
