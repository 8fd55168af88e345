//! Watch-cache and workqueue building blocks shared by both controllers.

pub mod watch;
pub mod workqueue;

pub use watch::{spawn_watcher, CacheCore, CacheError, CacheEvent};
pub use workqueue::{RateLimiter, WorkQueue};
