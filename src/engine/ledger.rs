//! In-memory attempt ledger.
//!
//! One record per banned-or-counting network. A record exists only after at
//! least one observed attempt, so `attempts >= 1` always holds; records at
//! or above the threshold correspond to an installed reject rule.

use ipnet::IpNet;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanRecord {
    pub attempts: u32,
    /// Wall-clock seconds of the most recent attempt.
    pub last_attempt: i64,
}

#[derive(Debug, Default)]
pub struct BanLedger {
    entries: HashMap<IpNet, BanRecord>,
}

impl BanLedger {
    /// Record one attempt against `net` under the sliding window: a missing
    /// record, or one idle for longer than `retry_window`, restarts the
    /// count at 1.
    pub fn observe(&mut self, net: IpNet, retry_window: i64, now: i64) -> BanRecord {
        let entry = self.entries.entry(net).or_insert(BanRecord {
            attempts: 0,
            last_attempt: now,
        });
        if now - entry.last_attempt > retry_window {
            entry.attempts = 0;
        }
        entry.attempts += 1;
        entry.last_attempt = now;
        *entry
    }

    pub fn get(&self, net: &IpNet) -> Option<&BanRecord> {
        self.entries.get(net)
    }

    pub fn contains(&self, net: &IpNet) -> bool {
        self.entries.contains_key(net)
    }

    pub fn remove(&mut self, net: &IpNet) -> bool {
        self.entries.remove(net).is_some()
    }

    pub fn nets(&self) -> Vec<IpNet> {
        self.entries.keys().copied().collect()
    }

    /// Networks banned past their expiry: at or over the threshold and idle
    /// for longer than `ban_time`.
    pub fn expired(&self, max_attempts: u32, ban_time: i64, now: i64) -> Vec<IpNet> {
        self.entries
            .iter()
            .filter(|(_, rec)| rec.attempts >= max_attempts && now - rec.last_attempt > ban_time)
            .map(|(net, _)| *net)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
