//! Real backend over the host's `iptables`/`ip6tables` binaries.
//!
//! The underlying crate applies every command immediately, so `commit` is a
//! no-op here; callers still bracket multi-rule walks with it for backends
//! that batch.

use super::FilterTable;
use crate::error::FirewallError;

pub struct IptablesBackend {
    handle: iptables::IPTables,
}

impl IptablesBackend {
    pub fn new(ipv6: bool) -> Result<Self, FirewallError> {
        let handle = iptables::new(ipv6).map_err(command_error)?;
        Ok(IptablesBackend { handle })
    }
}

fn command_error(err: Box<dyn std::error::Error>) -> FirewallError {
    FirewallError::Command(err.to_string())
}

impl FilterTable for IptablesBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FirewallError> {
        self.handle.chain_exists(table, chain).map_err(command_error)
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.handle
            .new_chain(table, chain)
            .map(|_| ())
            .map_err(command_error)
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.handle
            .flush_chain(table, chain)
            .map(|_| ())
            .map_err(command_error)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.handle
            .delete_chain(table, chain)
            .map(|_| ())
            .map_err(command_error)
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>, FirewallError> {
        self.handle.list(table, chain).map_err(command_error)
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), FirewallError> {
        self.handle
            .insert(table, chain, rule, position)
            .map(|_| ())
            .map_err(command_error)
    }

    fn delete_at(&self, table: &str, chain: &str, position: usize) -> Result<(), FirewallError> {
        self.handle
            .execute(table, &format!("-D {} {}", chain, position))
            .map(|_| ())
            .map_err(command_error)
    }

    fn commit(&self, _table: &str) -> Result<(), FirewallError> {
        Ok(())
    }
}
