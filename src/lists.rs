//! Operator name-set resolution and the allow/blocklist loops.
//!
//! Both lists are hashes of literals (CIDRs, addresses) and hostnames.
//! Hostnames resolve through A and AAAA lookups with a short timeout; a
//! hostname that fails to resolve is logged and skipped, never fatal. The
//! allowlist swaps in atomically; the blocklist is diffed so unchanged
//! entries keep their installed rules untouched.

use crate::context::Context;
use crate::engine::BanEngine;
use crate::store::{BLACKLIST_KEY, Store, WHITELIST_KEY};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Timeout per DNS query; slow resolvers must not stall reconciliation.
const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Parse a CIDR or bare-address literal into a network, truncating host
/// bits. `None` for anything that needs DNS.
pub fn parse_net_literal(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net.trunc());
    }
    entry.parse::<IpAddr>().ok().map(IpNet::from)
}

/// System resolver, falling back to defaults when the host configuration is
/// unreadable.
pub fn system_resolver() -> TokioResolver {
    TokioResolver::builder_tokio()
        .map(|builder| builder.build())
        .unwrap_or_else(|_| {
            TokioResolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .build()
        })
}

/// Resolve one hostname to its A and AAAA records. Timeouts abandon the
/// hostname entirely; empty answers are not an error.
async fn resolve_hostname(resolver: &TokioResolver, store: &Store, host: &str) -> Vec<IpAddr> {
    let mut addrs = Vec::new();

    match tokio::time::timeout(DNS_TIMEOUT, resolver.ipv4_lookup(host)).await {
        Ok(Ok(lookup)) => addrs.extend(lookup.iter().map(|a| IpAddr::V4(a.0))),
        Ok(Err(err)) => {
            if !is_no_records(&err.to_string()) {
                store.log_info(format!("{}", err)).await;
            }
        }
        Err(_) => {
            store
                .log_info(format!("Hostname {} timed out on resolve", host))
                .await;
            return addrs;
        }
    }

    match tokio::time::timeout(DNS_TIMEOUT, resolver.ipv6_lookup(host)).await {
        Ok(Ok(lookup)) => addrs.extend(lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0))),
        Ok(Err(err)) => {
            if !is_no_records(&err.to_string()) {
                store.log_info(format!("{}", err)).await;
            }
        }
        Err(_) => {
            store
                .log_info(format!("Hostname {} timed out on resolve", host))
                .await;
        }
    }

    addrs
}

fn is_no_records(message: &str) -> bool {
    message.contains("no record") || message.contains("NXDomain")
}

/// Turn a name-set hash into a normalized network set.
pub async fn build_network_list(
    resolver: &TokioResolver,
    store: &Store,
    entries: Vec<String>,
) -> HashSet<IpNet> {
    let mut networks = HashSet::new();
    let mut hostnames = Vec::new();
    for entry in entries {
        match parse_net_literal(&entry) {
            Some(net) => {
                networks.insert(net);
            }
            None => hostnames.push(entry),
        }
    }
    for host in hostnames {
        for addr in resolve_hostname(resolver, store, &host).await {
            networks.insert(IpNet::from(addr));
        }
    }
    networks
}

/// Re-resolve the allowlist every minute and swap it in atomically when it
/// changed.
pub async fn allowlist_loop(ctx: Arc<Context>) {
    let resolver = system_resolver();
    let mut shutdown = ctx.lifecycle.subscribe();
    loop {
        let started = Instant::now();
        allowlist_tick(&ctx, &resolver).await;
        tokio::select! {
            _ = tokio::time::sleep(minute_remainder(started.elapsed())) => {}
            _ = shutdown.recv() => break,
        }
    }
}

async fn allowlist_tick(ctx: &Arc<Context>, resolver: &TokioResolver) {
    let entries = match ctx.store.name_set(WHITELIST_KEY).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "allowlist: store unavailable, retrying next minute");
            return;
        }
    };
    let fresh = build_network_list(resolver, &ctx.store, entries).await;
    let count = fresh.len();
    let changed = {
        let mut shared = ctx.lock();
        if shared.allowlist != fresh {
            shared.allowlist = fresh;
            true
        } else {
            false
        }
    };
    if changed {
        ctx.store
            .log_info(format!("Whitelist was changed, it has {} entries", count))
            .await;
    }
}

/// Re-resolve the blocklist every minute and reconcile by diff: additions
/// install permanent bans, removals lift them, common entries are left
/// alone.
pub async fn blocklist_loop(engine: BanEngine) {
    let resolver = system_resolver();
    let ctx = engine.context().clone();
    let mut shutdown = ctx.lifecycle.subscribe();
    loop {
        let started = Instant::now();
        blocklist_tick(&ctx, &engine, &resolver).await;
        tokio::select! {
            _ = tokio::time::sleep(minute_remainder(started.elapsed())) => {}
            _ = shutdown.recv() => break,
        }
    }
}

async fn blocklist_tick(ctx: &Arc<Context>, engine: &BanEngine, resolver: &TokioResolver) {
    let entries = match ctx.store.name_set(BLACKLIST_KEY).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "blocklist: store unavailable, retrying next minute");
            return;
        }
    };
    let fresh = build_network_list(resolver, &ctx.store, entries).await;
    let (additions, removals) = {
        let mut shared = ctx.lock();
        if shared.blocklist == fresh {
            return;
        }
        let additions: Vec<IpNet> = fresh.difference(&shared.blocklist).copied().collect();
        let removals: Vec<IpNet> = shared.blocklist.difference(&fresh).copied().collect();
        shared.blocklist = fresh.clone();
        (additions, removals)
    };
    ctx.store
        .log_info(format!("Blacklist was changed, it has {} entries", fresh.len()))
        .await;
    for net in additions {
        if let Err(err) = engine.perm_ban(net, false).await {
            warn!(net = %net, error = %err, "blocklist: failed to install ban");
        }
    }
    for net in removals {
        if let Err(err) = engine.perm_ban(net, true).await {
            warn!(net = %net, error = %err, "blocklist: failed to lift ban");
        }
    }
}

/// Sleep until the next minute boundary relative to the tick's start.
fn minute_remainder(elapsed: Duration) -> Duration {
    Duration::from_secs_f64(60.0 - (elapsed.as_secs_f64() % 60.0))
}
