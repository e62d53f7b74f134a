//! # Request/Response Correlation
//!
//! Every outbound request registers its [`Cookie`] here together with a
//! single-shot reply sink. When a response arrives, the receive path looks the
//! cookie up and delivers the datagram into the sink; the caller blocked on
//! the other end wakes up.
//!
//! Entries are never removed on delivery. A background sweep runs every
//! [`SWEEP_INTERVAL`], walks the age-ordered queue from the oldest end, and
//! closes every sink older than [`REQUEST_TIMEOUT`]; a closed sink is the only
//! timeout signal a waiting caller observes. Because the queue is in insertion
//! order the sweep stops at the first still-young entry, bounding the critical
//! section to the number of expired cookies.
//!
//! Sinks hold a single buffered slot, so a late duplicate response finds the
//! slot occupied and is dropped by the delivering side's non-blocking send.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::datagram::Datagram;
use crate::identity::Cookie;

/// How long a registered cookie is guaranteed to stay alive. Doubles as the
/// effective request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the sweep task looks for expired cookies.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Where responses for one outstanding request are delivered.
pub type ReplySink = mpsc::Sender<Datagram>;

/// The cookie is already registered.
///
/// Vanishingly rare under a cryptographic RNG; callers treat it as a
/// transient allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collision;

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cookie already registered")
    }
}

impl std::error::Error for Collision {}

/// Timeouts for one table. The defaults match live operation; tests shrink
/// them to keep the sweep observable.
#[derive(Debug, Clone, Copy)]
pub struct CookieTableConfig {
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for CookieTableConfig {
    fn default() -> Self {
        Self { request_timeout: REQUEST_TIMEOUT, sweep_interval: SWEEP_INTERVAL }
    }
}

/// The map and the queue always describe the same set of live cookies; queue
/// timestamps are non-decreasing front to back.
struct TableState {
    map: HashMap<Cookie, ReplySink>,
    queue: VecDeque<(Cookie, Instant)>,
}

/// Table of outstanding requests, swept periodically.
pub struct CookieTable {
    state: Arc<Mutex<TableState>>,
    sweeper: JoinHandle<()>,
}

impl CookieTable {
    pub fn new() -> Self {
        Self::with_config(CookieTableConfig::default())
    }

    pub fn with_config(config: CookieTableConfig) -> Self {
        let state = Arc::new(Mutex::new(TableState {
            map: HashMap::new(),
            queue: VecDeque::new(),
        }));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&state), config));
        Self { state, sweeper }
    }

    /// Register a reply sink under a fresh cookie. An existing entry is left
    /// untouched and the caller gets [`Collision`].
    pub async fn register(&self, cookie: Cookie, sink: ReplySink) -> Result<(), Collision> {
        let mut state = self.state.lock().await;
        if state.map.contains_key(&cookie) {
            return Err(Collision);
        }
        state.map.insert(cookie, sink);
        state.queue.push_back((cookie, Instant::now()));
        Ok(())
    }

    /// Look up the sink for a cookie without consuming the entry. Removal is
    /// the sweep's job alone.
    pub async fn lookup(&self, cookie: &Cookie) -> Option<ReplySink> {
        self.state.lock().await.map.get(cookie).cloned()
    }

    /// Number of outstanding cookies.
    pub async fn outstanding(&self) -> usize {
        self.state.lock().await.map.len()
    }

    /// Stop the sweep task. Outstanding sinks stay open until dropped.
    pub fn shutdown(&self) {
        self.sweeper.abort();
    }
}

impl Default for CookieTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CookieTable {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep_loop(state: Arc<Mutex<TableState>>, config: CookieTableConfig) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    interval.tick().await; // the first tick fires immediately
    loop {
        interval.tick().await;
        let now = Instant::now();
        let mut state = state.lock().await;
        let mut expired = 0usize;
        while let Some(&(cookie, registered)) = state.queue.front() {
            if now.duration_since(registered) <= config.request_timeout {
                break;
            }
            state.queue.pop_front();
            // Dropping the sender is what closes the sink and wakes the caller.
            state.map.remove(&cookie);
            expired += 1;
        }
        if expired > 0 {
            debug!(expired, outstanding = state.map.len(), "swept expired cookies");
        }
    }
}
