//! Shared daemon state.
//!
//! Everything mutable is owned by [`Context`] and handed to each loop as an
//! `Arc`; there are no module-level variables. One coarse mutex guards the
//! packet-filter handles together with the ledger and the operator lists:
//! the filter control path is not thread-safe, and the event path must see
//! allowlist, ledger, and filter state move together.

use crate::config::Config;
use crate::engine::ledger::BanLedger;
use crate::firewall::FilterTable;
use crate::store::Store;
use ipnet::IpNet;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// Lock holds longer than this get a debug log line; the 10-second poller
/// loops must never starve the event path.
const SLOW_HOLD: Duration = Duration::from_millis(50);

/// State guarded by the global mutex.
pub struct Shared {
    pub v4: Box<dyn FilterTable>,
    pub v6: Box<dyn FilterTable>,
    pub ledger: BanLedger,
    pub allowlist: HashSet<IpNet>,
    pub blocklist: HashSet<IpNet>,
}

impl Shared {
    /// The family handle responsible for `net`.
    pub fn table_for(&self, net: &IpNet) -> &dyn FilterTable {
        match net {
            IpNet::V4(_) => self.v4.as_ref(),
            IpNet::V6(_) => self.v6.as_ref(),
        }
    }
}

/// Shutdown flag, propagated exit code, and the broadcast that wakes
/// sleeping loops.
pub struct Lifecycle {
    shutdown_tx: broadcast::Sender<()>,
    quit: AtomicBool,
    exit_code: AtomicI32,
}

impl Default for Lifecycle {
    fn default() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Lifecycle {
            shutdown_tx,
            quit: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        }
    }
}

impl Lifecycle {
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Request shutdown with the given exit code. The first caller wins;
    /// later triggers keep the original code.
    pub fn trigger(&self, code: i32) {
        if !self.quit.swap(true, Ordering::SeqCst) {
            self.exit_code.store(code, Ordering::SeqCst);
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Fatal condition: exit code 2, supervisor restarts us.
    pub fn fatal(&self) {
        self.trigger(2);
    }

    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

pub struct Context {
    pub config: Config,
    pub store: Store,
    pub lifecycle: Lifecycle,
    shared: Mutex<Shared>,
}

impl Context {
    pub fn new(
        config: Config,
        store: Store,
        v4: Box<dyn FilterTable>,
        v6: Box<dyn FilterTable>,
    ) -> Self {
        Context {
            config,
            store,
            lifecycle: Lifecycle::default(),
            shared: Mutex::new(Shared {
                v4,
                v6,
                ledger: BanLedger::default(),
                allowlist: HashSet::new(),
                blocklist: HashSet::new(),
            }),
        }
    }

    /// Acquire the global lock. The returned guard times its own hold.
    pub fn lock(&self) -> SharedGuard<'_> {
        SharedGuard {
            guard: self.shared.lock(),
            acquired: Instant::now(),
        }
    }
}

pub struct SharedGuard<'a> {
    guard: MutexGuard<'a, Shared>,
    acquired: Instant,
}

impl Deref for SharedGuard<'_> {
    type Target = Shared;

    fn deref(&self) -> &Shared {
        &self.guard
    }
}

impl DerefMut for SharedGuard<'_> {
    fn deref_mut(&mut self) -> &mut Shared {
        &mut self.guard
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > SLOW_HOLD {
            debug!(held_ms = held.as_millis() as u64, "slow global lock hold");
        }
    }
}
