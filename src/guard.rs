//! Chain-order guard.
//!
//! An upstream container subsystem may rewrite the built-in chains and push
//! our jump rule down; past position 2 (or gone entirely) traffic reaches
//! its targets before our policy does. That state is unrecoverable from
//! inside the process, so the guard raises a fatal restart instead of
//! trying to repair it.

use crate::context::Context;
use crate::firewall::{self, GUARDED_CHAINS, POLICY_CHAIN};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::warn;

/// Highest acceptable 0-based position for the jump rule.
const MAX_JUMP_POSITION: usize = 2;

pub async fn chain_order_loop(ctx: Arc<Context>) {
    let mut shutdown = ctx.lifecycle.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(violation) = scan(&ctx) {
                    ctx.store.log_crit(violation).await;
                    ctx.lifecycle.fatal();
                    return;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Walk both families' guarded chains; the first violation found is
/// returned as the fatal message. Listing errors are transient and retried
/// next tick.
fn scan(ctx: &Arc<Context>) -> Option<String> {
    let shared = ctx.lock();
    for (family, table) in [("IPv4", shared.v4.as_ref()), ("IPv6", shared.v6.as_ref())] {
        for chain in GUARDED_CHAINS {
            let positions = match firewall::jump_positions(table, chain) {
                Ok(positions) => positions,
                Err(err) => {
                    warn!(family, chain, error = %err, "chain guard: listing failed, retrying next tick");
                    continue;
                }
            };
            if positions.is_empty() {
                return Some(format!(
                    "Error in {} chain: {} target not found, restarting daemon",
                    chain, POLICY_CHAIN
                ));
            }
            if let Some(position) = positions.iter().find(|p| **p > MAX_JUMP_POSITION) {
                return Some(format!(
                    "Error in {} chain order: {} on position {}, restarting daemon",
                    chain, POLICY_CHAIN, position
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::mock::MockTable;
    use crate::firewall::{FILTER, FilterTable, init_chain};

    #[test]
    fn jump_at_head_passes() {
        let table = MockTable::new_v4();
        init_chain(&table).unwrap();
        let positions = firewall::jump_positions(&table, "INPUT").unwrap();
        assert!(positions.iter().all(|p| *p <= MAX_JUMP_POSITION));
    }

    #[test]
    fn jump_pushed_past_position_two_is_a_violation() {
        let table = MockTable::new_v4();
        init_chain(&table).unwrap();
        for i in 0..3 {
            table.plant(FILTER, "INPUT", "-i eth0 -j ACCEPT", i);
        }
        let positions = firewall::jump_positions(&table, "INPUT").unwrap();
        assert_eq!(positions, vec![3]);
        assert!(positions.iter().any(|p| *p > MAX_JUMP_POSITION));
    }

    #[test]
    fn missing_jump_is_a_violation() {
        let table = MockTable::new_v4();
        // Chain created but jump rules never installed.
        table.new_chain(FILTER, POLICY_CHAIN).unwrap();
        let positions = firewall::jump_positions(&table, "INPUT").unwrap();
        assert!(positions.is_empty());
    }
}
