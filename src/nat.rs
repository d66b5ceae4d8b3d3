//! Source-NAT position guards.
//!
//! Each enabled family runs a convergence loop keeping exactly one
//! canonical SNAT rule at the head of the NAT POSTROUTING chain: traffic
//! from the internal network, destined anywhere else, rewritten to the
//! operator's address. External tools (container runtimes chiefly) insert
//! and reorder rules in this chain, so the loop re-asserts the invariant
//! every tick rather than reacting to changes.

use crate::config::Snat;
use crate::context::Context;
use crate::error::FirewallError;
use crate::firewall::{self, FilterTable, NAT, POSTROUTING, rule};
use chrono::Utc;
use ipnet::IpNet;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::warn;

pub async fn snat_loop(ctx: Arc<Context>, snat: Snat) {
    let mut shutdown = ctx.lifecycle.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = {
                    let shared = ctx.lock();
                    converge(shared.table_for(&snat.source), &snat, Utc::now().timestamp())
                };
                match outcome {
                    Ok(messages) => {
                        for message in messages {
                            ctx.store.log_info(message).await;
                        }
                    }
                    Err(err) => warn!(error = %err, "Error running SNAT guard, retrying"),
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// One convergence pass over POSTROUTING. Returns the log lines describing
/// what changed; an empty vec means the chain was already converged.
///
/// The v4 canonical rule carries the tick's timestamp as a comment so rules
/// rewritten by external tools remain distinguishable; comments never count
/// toward rule identity.
pub fn converge(
    table: &dyn FilterTable,
    snat: &Snat,
    now: i64,
) -> Result<Vec<String>, FirewallError> {
    let rules = firewall::parsed_rules(table, NAT, POSTROUTING)?;
    let mut messages = Vec::new();

    let head_ok = rules
        .first()
        .is_some_and(|r| r.is_canonical_snat(&snat.source, &snat.to));

    let mut offset = 0;
    if !head_ok {
        let comment = matches!(snat.source, IpNet::V4(_)).then_some(now);
        table.insert(
            NAT,
            POSTROUTING,
            &rule::render_snat(&snat.source, &snat.to, comment),
            1,
        )?;
        offset = 1;
        messages.push(format!(
            "Added POSTROUTING rule for source network {} to SNAT target {}",
            snat.source, snat.to
        ));
    }

    // Duplicates past the head go, back-to-front so positions stay valid.
    let doomed: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter(|(position, r)| {
            !(head_ok && *position == 0) && r.is_canonical_snat(&snat.source, &snat.to)
        })
        .map(|(position, _)| position + offset + 1)
        .collect();
    for position in doomed.into_iter().rev() {
        table.delete_at(NAT, POSTROUTING, position)?;
        messages.push(format!(
            "Removed rule for source network {} to SNAT target {} from POSTROUTING chain at position {}",
            snat.source,
            snat.to,
            position - 1
        ));
    }

    table.commit(NAT)?;
    Ok(messages)
}
