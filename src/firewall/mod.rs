//! Packet-filter adapter.
//!
//! Generalizes the host's packet-filter tables behind the [`FilterTable`]
//! trait so the daemon talks to one surface whether the backing is the real
//! kernel (`iptables.rs`) or the in-memory table used by tests (`mock.rs`).
//! One handle exists per address family; the filter and NAT tables are
//! addressed per call.
//!
//! Every write path in the daemon serializes through the global mutex in
//! [`crate::context`] before touching a handle.

pub mod iptables;
#[cfg(test)]
pub mod mock;
pub mod rule;

use crate::error::FirewallError;
use ipnet::IpNet;
use rule::ParsedRule;
use tracing::info;

/// Our exclusive policy chain on both filter tables.
pub const POLICY_CHAIN: &str = "MAILCOW";
/// Built-in chains that must jump into the policy chain.
pub const GUARDED_CHAINS: [&str; 2] = ["FORWARD", "INPUT"];

pub const FILTER: &str = "filter";
pub const NAT: &str = "nat";
pub const POSTROUTING: &str = "POSTROUTING";

/// Capability surface of one family's packet-filter tables.
///
/// Mirrors the shape of the `iptables` crate so the real backend is a thin
/// proxy; `commit` only has an effect on backends that batch.
pub trait FilterTable: Send {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FirewallError>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError>;
    /// Rules of a chain in `-S` form (policy and declaration lines included).
    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>, FirewallError>;
    /// Insert at a 1-based position; 1 is the head.
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32)
    -> Result<(), FirewallError>;
    /// Delete the rule at a 1-based position.
    fn delete_at(&self, table: &str, chain: &str, position: usize) -> Result<(), FirewallError>;
    fn commit(&self, table: &str) -> Result<(), FirewallError>;
}

/// Parsed rules of a chain, in position order (0-based).
pub fn parsed_rules(
    table: &dyn FilterTable,
    table_name: &str,
    chain: &str,
) -> Result<Vec<ParsedRule>, FirewallError> {
    Ok(table
        .list_rules(table_name, chain)?
        .iter()
        .filter_map(|line| rule::parse_rule(line))
        .collect())
}

/// Position (0-based) of the first REJECT rule for `net` in the policy chain.
fn reject_position(table: &dyn FilterTable, net: &IpNet) -> Result<Option<usize>, FirewallError> {
    Ok(parsed_rules(table, FILTER, POLICY_CHAIN)?
        .iter()
        .position(|r| r.is_reject_of(net)))
}

/// Whether a REJECT rule for `net` is present.
pub fn reject_present(table: &dyn FilterTable, net: &IpNet) -> Result<bool, FirewallError> {
    Ok(reject_position(table, net)?.is_some())
}

/// Install a REJECT rule for `net` at the head of the policy chain unless an
/// equal rule already exists. Returns whether a rule was inserted.
pub fn ensure_reject(table: &dyn FilterTable, net: &IpNet) -> Result<bool, FirewallError> {
    if reject_position(table, net)?.is_some() {
        return Ok(false);
    }
    table.insert(FILTER, POLICY_CHAIN, &rule::render_reject(net), 1)?;
    Ok(true)
}

/// Remove the REJECT rule for `net` if present. Returns whether one existed.
pub fn remove_reject(table: &dyn FilterTable, net: &IpNet) -> Result<bool, FirewallError> {
    match reject_position(table, net)? {
        Some(position) => {
            table.delete_at(FILTER, POLICY_CHAIN, position + 1)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// 0-based positions of every jump-to-policy-chain rule in a built-in chain.
pub fn jump_positions(
    table: &dyn FilterTable,
    chain: &str,
) -> Result<Vec<usize>, FirewallError> {
    Ok(parsed_rules(table, FILTER, chain)?
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_jump_to(POLICY_CHAIN))
        .map(|(i, _)| i)
        .collect())
}

/// Create the policy chain and put a jump to it at the head of each guarded
/// built-in chain. Idempotent.
pub fn init_chain(table: &dyn FilterTable) -> Result<(), FirewallError> {
    if !table.chain_exists(FILTER, POLICY_CHAIN)? {
        table.new_chain(FILTER, POLICY_CHAIN)?;
    }
    for chain in GUARDED_CHAINS {
        if jump_positions(table, chain)?.is_empty() {
            table.insert(FILTER, chain, &rule::render_jump(POLICY_CHAIN), 1)?;
        }
    }
    Ok(())
}

/// Remove the policy chain and every jump to it. Idempotent; a no-op when
/// the chain was never created.
pub fn teardown(table: &dyn FilterTable) -> Result<(), FirewallError> {
    if !table.chain_exists(FILTER, POLICY_CHAIN)? {
        return Ok(());
    }
    table.flush_chain(FILTER, POLICY_CHAIN)?;
    for chain in GUARDED_CHAINS {
        // Positions shift as rules are deleted; walk back-to-front.
        for position in jump_positions(table, chain)?.into_iter().rev() {
            table.delete_at(FILTER, chain, position + 1)?;
        }
    }
    table.delete_chain(FILTER, POLICY_CHAIN)?;
    table.commit(FILTER)?;
    info!(chain = POLICY_CHAIN, "Removed policy chain");
    Ok(())
}
