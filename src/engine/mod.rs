//! Ban engine: the policy core.
//!
//! The decision path for one event is pure and synchronous
//! ([`register_attempt`] and friends operate on the locked [`Shared`] state
//! with an injected clock); [`BanEngine`] wraps it with the per-call options
//! read, the single lock acquisition, and the store mirroring that happens
//! after the lock is released.

pub mod ledger;

#[cfg(test)]
mod tests;

use crate::context::{Context, Shared};
use crate::error::EngineError;
use crate::firewall;
use crate::lists::parse_net_literal;
use crate::store::Options;
use chrono::Utc;
use ipnet::{IpNet, Ipv4Net, Ipv6Net, PrefixLenError};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};

/// Collapse an IPv4-mapped IPv6 address to its IPv4 form. Every policy
/// decision happens on the canonical address.
pub fn canonicalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Private, loopback, link-local, and unspecified addresses are never
/// counted or banned.
pub fn is_public(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            let unique_local = (head & 0xfe00) == 0xfc00;
            let link_local = (head & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// Widen an address to its ban key using the configured prefix width for
/// its family.
fn widen(addr: IpAddr, opts: &Options) -> Result<IpNet, PrefixLenError> {
    let net = match addr {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new(v4, prefix_len(opts.netban_ipv4, 32)?)?),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new(v6, prefix_len(opts.netban_ipv6, 128)?)?),
    };
    Ok(net.trunc())
}

fn prefix_len(raw: i64, max: u8) -> Result<u8, PrefixLenError> {
    u8::try_from(raw)
        .ok()
        .filter(|len| *len <= max)
        .ok_or(PrefixLenError)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Private or loopback source; never counted.
    NotPublic,
    /// Overlapped by an allowlisted network.
    Whitelisted { host: IpNet, rule: IpNet },
    /// Below threshold; counted toward it.
    Counted { net: IpNet, remaining: i64 },
    /// At or over threshold; reject rule in place.
    Banned { net: IpNet, expires_at: i64 },
}

/// One matched attempt: allowlist check, widening, sliding-window
/// accounting, threshold evaluation, idempotent rule install. The caller
/// holds the global lock for the whole sequence.
pub fn register_attempt(
    shared: &mut Shared,
    addr: IpAddr,
    opts: &Options,
    now: i64,
) -> Result<AttemptOutcome, EngineError> {
    let addr = canonicalize(addr);
    if !is_public(&addr) {
        return Ok(AttemptOutcome::NotPublic);
    }

    let host = IpNet::from(addr);
    if let Some(rule) = shared.allowlist.iter().find(|net| net.contains(&addr)) {
        return Ok(AttemptOutcome::Whitelisted { host, rule: *rule });
    }

    let net = widen(addr, opts)?;
    let record = shared.ledger.observe(net, opts.retry_window, now);

    if i64::from(record.attempts) >= opts.max_attempts {
        firewall::ensure_reject(shared.table_for(&net), &net)?;
        Ok(AttemptOutcome::Banned {
            net,
            expires_at: now + opts.ban_time,
        })
    } else {
        Ok(AttemptOutcome::Counted {
            net,
            remaining: opts.max_attempts - i64::from(record.attempts),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbanOutcome {
    /// No ledger entry; nothing to release.
    NotBanned,
    Removed,
}

/// Release a transient ban: delete the reject rule (idempotent) and forget
/// the ledger entry.
pub fn apply_unban(shared: &mut Shared, net: &IpNet) -> Result<UnbanOutcome, EngineError> {
    if !shared.ledger.contains(net) {
        return Ok(UnbanOutcome::NotBanned);
    }
    firewall::remove_reject(shared.table_for(net), net)?;
    shared.ledger.remove(net);
    Ok(UnbanOutcome::Removed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermBanOutcome {
    Added,
    Removed,
    /// Already in the requested state; the existing rule keeps its position.
    Unchanged,
}

/// Install or remove a blocklist rule. No private/loopback filtering here:
/// operators may blocklist anything.
pub fn apply_perm_ban(
    shared: &mut Shared,
    net: &IpNet,
    unban: bool,
) -> Result<PermBanOutcome, EngineError> {
    let table = shared.table_for(net);
    let present = firewall::reject_present(table, net)?;
    if !unban && !present {
        firewall::ensure_reject(table, net)?;
        Ok(PermBanOutcome::Added)
    } else if unban && present {
        firewall::remove_reject(table, net)?;
        Ok(PermBanOutcome::Removed)
    } else {
        Ok(PermBanOutcome::Unchanged)
    }
}

/// Async wrapper binding the pure core to the store and the global lock.
#[derive(Clone)]
pub struct BanEngine {
    ctx: Arc<Context>,
}

impl BanEngine {
    pub fn new(ctx: Arc<Context>) -> Self {
        BanEngine { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Entry point for one matched attempt.
    pub async fn attempt(&self, addr: IpAddr) -> Result<(), EngineError> {
        let opts = self.ctx.store.options().await?;
        let now = Utc::now().timestamp();
        let outcome = {
            let mut shared = self.ctx.lock();
            register_attempt(&mut shared, addr, &opts, now)?
        };
        match outcome {
            AttemptOutcome::NotPublic => {}
            AttemptOutcome::Whitelisted { host, rule } => {
                self.ctx
                    .store
                    .log_info(format!("Address {} is whitelisted by rule {}", host, rule))
                    .await;
            }
            AttemptOutcome::Counted { net, remaining } => {
                self.ctx
                    .store
                    .log_warn(format!(
                        "{} more attempts in the next {} seconds until {} is banned",
                        remaining, opts.retry_window, net
                    ))
                    .await;
            }
            AttemptOutcome::Banned { net, expires_at } => {
                self.ctx
                    .store
                    .log_crit(format!("Banning {} for {} minutes", net, opts.ban_time / 60))
                    .await;
                self.ctx
                    .store
                    .set_active_ban(&net.to_string(), expires_at)
                    .await?;
            }
        }
        Ok(())
    }

    /// Release a transient ban and clean every mirror of it.
    pub async fn unban(&self, net: IpNet) -> Result<(), EngineError> {
        let outcome = {
            let mut shared = self.ctx.lock();
            apply_unban(&mut shared, &net)?
        };
        let key = net.to_string();
        match outcome {
            UnbanOutcome::NotBanned => {
                self.ctx
                    .store
                    .log_info(format!(
                        "{} is not banned, skipping unban and deleting from queue (if any)",
                        net
                    ))
                    .await;
                self.ctx.store.del_unban_queue(&key).await?;
            }
            UnbanOutcome::Removed => {
                self.ctx.store.log_info(format!("Unbanning {}", net)).await;
                self.ctx.store.del_active_ban(&key).await?;
                self.ctx.store.del_unban_queue(&key).await?;
            }
        }
        Ok(())
    }

    /// Install or remove a blocklist entry, mirroring the permanent-ban map.
    pub async fn perm_ban(&self, net: IpNet, unban: bool) -> Result<(), EngineError> {
        if !unban && !is_public(&net.addr()) {
            self.ctx
                .store
                .log_warn(format!("Blacklisting non-public network {}", net))
                .await;
        }
        let outcome = {
            let mut shared = self.ctx.lock();
            apply_perm_ban(&mut shared, &net, unban)?
        };
        let key = net.to_string();
        match outcome {
            PermBanOutcome::Added => {
                self.ctx
                    .store
                    .log_crit(format!("Add host/network {} to blacklist", net))
                    .await;
                self.ctx
                    .store
                    .set_perm_ban(&key, Utc::now().timestamp())
                    .await?;
            }
            PermBanOutcome::Removed => {
                self.ctx
                    .store
                    .log_crit(format!("Remove host/network {} from blacklist", net))
                    .await;
                self.ctx.store.del_perm_ban(&key).await?;
            }
            PermBanOutcome::Unchanged => {}
        }
        Ok(())
    }

    /// Startup/exit cleanup: release every ban, remove the policy chains,
    /// and drop both store mirrors.
    pub async fn clear(&self) -> Result<(), EngineError> {
        self.ctx.store.log_info("Clearing all bans".to_string()).await;
        for net in {
            let shared = self.ctx.lock();
            shared.ledger.nets()
        } {
            self.unban(net).await?;
        }
        {
            let shared = self.ctx.lock();
            firewall::teardown(shared.v4.as_ref())?;
            firewall::teardown(shared.v6.as_ref())?;
        }
        self.ctx.store.clear_ban_state().await?;
        Ok(())
    }

    /// Create the policy chains and their jump rules on both families.
    pub async fn init_chain(&self) -> Result<(), EngineError> {
        info!("Initializing policy chains");
        let shared = self.ctx.lock();
        firewall::init_chain(shared.v4.as_ref())?;
        firewall::init_chain(shared.v6.as_ref())?;
        Ok(())
    }
}

/// Expire transient bans and drain the operator unban queue every 10
/// seconds. Store and filter hiccups are retried next tick; only malformed
/// configuration is fatal.
pub async fn autopurge_loop(engine: BanEngine) {
    let mut shutdown = engine.ctx.lifecycle.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => autopurge_tick(&engine).await,
            _ = shutdown.recv() => break,
        }
    }
}

async fn autopurge_tick(engine: &BanEngine) {
    let opts = match engine.ctx.store.options().await {
        Ok(opts) => opts,
        Err(err) if err.is_fatal() => {
            engine
                .ctx
                .store
                .log_crit(format!("Error loading netfilter options: {}", err))
                .await;
            engine.ctx.lifecycle.fatal();
            return;
        }
        Err(err) => {
            warn!(error = %err, "autopurge: options unavailable, retrying next tick");
            return;
        }
    };

    match engine.ctx.store.unban_queue().await {
        Ok(queue) => {
            for entry in queue {
                match parse_net_literal(&entry) {
                    Some(net) => {
                        if let Err(err) = engine.unban(net).await {
                            warn!(net = %net, error = %err, "autopurge: unban failed");
                        }
                    }
                    None => {
                        warn!(entry = %entry, "autopurge: unparseable unban queue entry");
                        if let Err(err) = engine.ctx.store.del_unban_queue(&entry).await {
                            warn!(error = %err, "autopurge: failed to drop queue entry");
                        }
                    }
                }
            }
        }
        Err(err) => warn!(error = %err, "autopurge: unban queue unavailable"),
    }

    let now = Utc::now().timestamp();
    let max_attempts = u32::try_from(opts.max_attempts.max(0)).unwrap_or(u32::MAX);
    let expired = {
        let shared = engine.ctx.lock();
        shared.ledger.expired(max_attempts, opts.ban_time, now)
    };
    for net in expired {
        if let Err(err) = engine.unban(net).await {
            warn!(net = %net, error = %err, "autopurge: expiry unban failed");
        }
    }
}
