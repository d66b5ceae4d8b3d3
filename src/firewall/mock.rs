//! In-memory filter tables for tests.
//!
//! Behaves like the kernel surface the real backend wraps: built-in chains
//! pre-exist, listings come back in `-S` form, user chains must be flushed
//! before deletion, and REJECT rules grow the kernel's default parameters.

use super::FilterTable;
use crate::error::FirewallError;
use std::collections::BTreeMap;
use std::sync::Mutex;

type ChainKey = (String, String);

pub struct MockTable {
    chains: Mutex<BTreeMap<ChainKey, Vec<String>>>,
}

impl MockTable {
    fn with_builtins(builtins: &[(&str, &str)]) -> Self {
        let chains = builtins
            .iter()
            .map(|(table, chain)| ((table.to_string(), chain.to_string()), Vec::new()))
            .collect();
        MockTable {
            chains: Mutex::new(chains),
        }
    }

    pub fn new_v4() -> Self {
        Self::with_builtins(&[
            ("filter", "INPUT"),
            ("filter", "FORWARD"),
            ("filter", "OUTPUT"),
            ("nat", "PREROUTING"),
            ("nat", "INPUT"),
            ("nat", "OUTPUT"),
            ("nat", "POSTROUTING"),
        ])
    }

    pub fn new_v6() -> Self {
        Self::new_v4()
    }

    /// Plant a rule without going through the adapter, the way an external
    /// tool would.
    pub fn plant(&self, table: &str, chain: &str, rule: &str, position: usize) {
        let mut chains = self.chains.lock().expect("mock lock");
        let rules = chains
            .get_mut(&(table.to_string(), chain.to_string()))
            .expect("chain exists");
        rules.insert(position.min(rules.len()), rule.to_string());
    }

    fn key(table: &str, chain: &str) -> ChainKey {
        (table.to_string(), chain.to_string())
    }
}

impl FilterTable for MockTable {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FirewallError> {
        let chains = self.chains.lock().expect("mock lock");
        Ok(chains.contains_key(&Self::key(table, chain)))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        let mut chains = self.chains.lock().expect("mock lock");
        chains.insert(Self::key(table, chain), Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        let mut chains = self.chains.lock().expect("mock lock");
        match chains.get_mut(&Self::key(table, chain)) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(FirewallError::NoSuchChain(chain.to_string())),
        }
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        let mut chains = self.chains.lock().expect("mock lock");
        match chains.get(&Self::key(table, chain)) {
            Some(rules) if rules.is_empty() => {
                chains.remove(&Self::key(table, chain));
                Ok(())
            }
            Some(_) => Err(FirewallError::Command(format!(
                "chain {} is not empty",
                chain
            ))),
            None => Err(FirewallError::NoSuchChain(chain.to_string())),
        }
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>, FirewallError> {
        let chains = self.chains.lock().expect("mock lock");
        let rules = chains
            .get(&Self::key(table, chain))
            .ok_or_else(|| FirewallError::NoSuchChain(chain.to_string()))?;
        let mut lines = vec![format!("-P {} ACCEPT", chain)];
        lines.extend(rules.iter().map(|r| format!("-A {} {}", chain, decorate(r))));
        Ok(lines)
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), FirewallError> {
        let mut chains = self.chains.lock().expect("mock lock");
        let rules = chains
            .get_mut(&Self::key(table, chain))
            .ok_or_else(|| FirewallError::NoSuchChain(chain.to_string()))?;
        let index = (position.max(1) as usize - 1).min(rules.len());
        rules.insert(index, rule.to_string());
        Ok(())
    }

    fn delete_at(&self, table: &str, chain: &str, position: usize) -> Result<(), FirewallError> {
        let mut chains = self.chains.lock().expect("mock lock");
        let rules = chains
            .get_mut(&Self::key(table, chain))
            .ok_or_else(|| FirewallError::NoSuchChain(chain.to_string()))?;
        if position == 0 || position > rules.len() {
            return Err(FirewallError::Command(format!(
                "no rule at position {} in {}",
                position, chain
            )));
        }
        rules.remove(position - 1);
        Ok(())
    }

    fn commit(&self, _table: &str) -> Result<(), FirewallError> {
        Ok(())
    }
}

/// The kernel echoes REJECT rules back with their default parameters.
fn decorate(rule: &str) -> String {
    if rule.ends_with("-j REJECT") {
        format!("{} --reject-with icmp-port-unreachable", rule)
    } else {
        rule.to_string()
    }
}
