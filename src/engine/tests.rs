//! End-to-end policy scenarios against the in-memory filter tables.
//!
//! Time is injected, so window and expiry behavior is exercised without
//! sleeping.

use super::ledger::BanLedger;
use super::*;
use crate::context::Shared;
use crate::error::EngineError;
use crate::firewall;
use crate::firewall::mock::MockTable;
use crate::firewall::{FILTER, POLICY_CHAIN};
use crate::store::Options;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

fn options(max_attempts: i64, retry_window: i64, ban_time: i64) -> Options {
    Options {
        ban_time,
        max_attempts,
        retry_window,
        netban_ipv4: 32,
        netban_ipv6: 128,
    }
}

fn shared() -> Shared {
    let shared = Shared {
        v4: Box::new(MockTable::new_v4()),
        v6: Box::new(MockTable::new_v6()),
        ledger: BanLedger::default(),
        allowlist: HashSet::new(),
        blocklist: HashSet::new(),
    };
    firewall::init_chain(shared.v4.as_ref()).unwrap();
    firewall::init_chain(shared.v6.as_ref()).unwrap();
    shared
}

fn reject_count(shared: &Shared, net: &IpNet) -> usize {
    firewall::parsed_rules(shared.table_for(net), FILTER, POLICY_CHAIN)
        .unwrap()
        .iter()
        .filter(|r| r.is_reject_of(net))
        .count()
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

#[test]
fn third_attempt_crosses_the_threshold() {
    let mut shared = shared();
    let opts = options(3, 600, 60);
    let target = net("203.0.113.5/32");

    let first = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000).unwrap();
    assert_eq!(
        first,
        AttemptOutcome::Counted {
            net: target,
            remaining: 2
        }
    );
    let second = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1001).unwrap();
    assert_eq!(
        second,
        AttemptOutcome::Counted {
            net: target,
            remaining: 1
        }
    );
    assert_eq!(reject_count(&shared, &target), 0);

    let third = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1002).unwrap();
    assert_eq!(
        third,
        AttemptOutcome::Banned {
            net: target,
            expires_at: 1062
        }
    );
    assert_eq!(reject_count(&shared, &target), 1);

    // Further attempts refresh the ban without duplicating the rule.
    let fourth = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1003).unwrap();
    assert_eq!(
        fourth,
        AttemptOutcome::Banned {
            net: target,
            expires_at: 1063
        }
    );
    assert_eq!(reject_count(&shared, &target), 1);
}

#[test]
fn idle_past_the_window_restarts_counting() {
    let mut shared = shared();
    let opts = options(3, 10, 60);
    let target = net("203.0.113.5/32");

    register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000).unwrap();
    register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1005).unwrap();
    // 11 seconds of silence with a 10-second window.
    let outcome = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1016).unwrap();
    assert_eq!(
        outcome,
        AttemptOutcome::Counted {
            net: target,
            remaining: 2
        }
    );
    assert_eq!(shared.ledger.get(&target).unwrap().attempts, 1);
    assert_eq!(reject_count(&shared, &target), 0);
}

#[test]
fn private_and_loopback_sources_are_never_counted() {
    let mut shared = shared();
    let opts = options(1, 600, 60);

    for source in ["10.0.0.1", "127.0.0.1", "192.168.1.9", "169.254.0.5", "::1", "fe80::1", "fd00::1"] {
        let outcome = register_attempt(&mut shared, addr(source), &opts, 1000).unwrap();
        assert_eq!(outcome, AttemptOutcome::NotPublic, "{}", source);
    }
    assert!(shared.ledger.is_empty());
    assert!(
        firewall::parsed_rules(shared.v4.as_ref(), FILTER, POLICY_CHAIN)
            .unwrap()
            .is_empty()
    );
    assert!(
        firewall::parsed_rules(shared.v6.as_ref(), FILTER, POLICY_CHAIN)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn allowlisted_sources_are_never_banned() {
    let mut shared = shared();
    let opts = options(3, 600, 60);
    shared.allowlist.insert(net("203.0.113.0/24"));

    for t in 0..5 {
        let outcome = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000 + t).unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Whitelisted {
                host: net("203.0.113.5/32"),
                rule: net("203.0.113.0/24")
            }
        );
    }
    assert!(shared.ledger.is_empty());
    assert_eq!(reject_count(&shared, &net("203.0.113.5/32")), 0);
}

#[test]
fn mapped_ipv6_is_banned_as_ipv4() {
    let mut shared = shared();
    let opts = options(1, 600, 60);

    let outcome = register_attempt(&mut shared, addr("::ffff:203.0.113.5"), &opts, 1000).unwrap();
    assert_eq!(
        outcome,
        AttemptOutcome::Banned {
            net: net("203.0.113.5/32"),
            expires_at: 1060
        }
    );
    assert_eq!(reject_count(&shared, &net("203.0.113.5/32")), 1);
    assert!(
        firewall::parsed_rules(shared.v6.as_ref(), FILTER, POLICY_CHAIN)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn wide_prefixes_share_one_ban_key() {
    let mut shared = shared();
    let opts = Options {
        netban_ipv4: 24,
        ..options(2, 600, 60)
    };
    let target = net("203.0.113.0/24");

    register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000).unwrap();
    let outcome = register_attempt(&mut shared, addr("203.0.113.99"), &opts, 1001).unwrap();
    assert_eq!(
        outcome,
        AttemptOutcome::Banned {
            net: target,
            expires_at: 1061
        }
    );
    assert_eq!(reject_count(&shared, &target), 1);
}

#[test]
fn invalid_prefix_width_is_an_error() {
    let mut shared = shared();
    let opts = Options {
        netban_ipv4: 64,
        ..options(1, 600, 60)
    };
    let result = register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000);
    assert!(matches!(result, Err(EngineError::Prefix(_))));
}

#[test]
fn unban_releases_rule_and_ledger() {
    let mut shared = shared();
    let opts = options(1, 600, 60);
    let target = net("203.0.113.5/32");

    register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000).unwrap();
    assert_eq!(reject_count(&shared, &target), 1);

    assert_eq!(
        apply_unban(&mut shared, &target).unwrap(),
        UnbanOutcome::Removed
    );
    assert_eq!(reject_count(&shared, &target), 0);
    assert!(!shared.ledger.contains(&target));

    assert_eq!(
        apply_unban(&mut shared, &target).unwrap(),
        UnbanOutcome::NotBanned
    );
}

#[test]
fn expiry_scan_feeds_unban_within_one_tick() {
    let mut shared = shared();
    let opts = options(3, 600, 60);
    let target = net("203.0.113.5/32");

    for t in 0..3 {
        register_attempt(&mut shared, addr("203.0.113.5"), &opts, 1000 + t).unwrap();
    }
    assert_eq!(reject_count(&shared, &target), 1);

    // Not yet expired.
    assert!(shared.ledger.expired(3, opts.ban_time, 1050).is_empty());

    // Past last_attempt + ban_time.
    let expired = shared.ledger.expired(3, opts.ban_time, 1063);
    assert_eq!(expired, vec![target]);
    for net in expired {
        apply_unban(&mut shared, &net).unwrap();
    }
    assert_eq!(reject_count(&shared, &target), 0);
    assert!(shared.ledger.is_empty());
}

#[test]
fn perm_ban_round_trips_the_filter_state() {
    let mut shared = shared();
    let target = net("198.51.100.0/24");
    let before = firewall::parsed_rules(shared.v4.as_ref(), FILTER, POLICY_CHAIN).unwrap();

    assert_eq!(
        apply_perm_ban(&mut shared, &target, false).unwrap(),
        PermBanOutcome::Added
    );
    assert_eq!(reject_count(&shared, &target), 1);

    assert_eq!(
        apply_perm_ban(&mut shared, &target, true).unwrap(),
        PermBanOutcome::Removed
    );
    assert_eq!(
        firewall::parsed_rules(shared.v4.as_ref(), FILTER, POLICY_CHAIN).unwrap(),
        before
    );

    // Removing an absent entry changes nothing.
    assert_eq!(
        apply_perm_ban(&mut shared, &target, true).unwrap(),
        PermBanOutcome::Unchanged
    );
}

#[test]
fn rebanned_blocklist_entries_keep_their_rule_position() {
    let mut shared = shared();
    let first = net("198.51.100.0/24");
    let second = net("192.0.2.0/24");

    apply_perm_ban(&mut shared, &first, false).unwrap();
    apply_perm_ban(&mut shared, &second, false).unwrap();
    let before = firewall::parsed_rules(shared.v4.as_ref(), FILTER, POLICY_CHAIN).unwrap();

    // An entry present in both old and new blocklists is re-applied as a
    // no-op: no reinsertion, position unchanged.
    assert_eq!(
        apply_perm_ban(&mut shared, &first, false).unwrap(),
        PermBanOutcome::Unchanged
    );
    assert_eq!(
        firewall::parsed_rules(shared.v4.as_ref(), FILTER, POLICY_CHAIN).unwrap(),
        before
    );
}

#[test]
fn perm_ban_accepts_private_space() {
    let mut shared = shared();
    let target = net("10.0.0.0/8");
    assert_eq!(
        apply_perm_ban(&mut shared, &target, false).unwrap(),
        PermBanOutcome::Added
    );
    assert_eq!(reject_count(&shared, &target), 1);
}

#[test]
fn ipv6_bans_use_the_v6_table_and_prefix() {
    let mut shared = shared();
    let opts = Options {
        netban_ipv6: 64,
        ..options(1, 600, 60)
    };
    let outcome = register_attempt(&mut shared, addr("2001:db8:1:2:3:4:5:6"), &opts, 1000).unwrap();
    let target = net("2001:db8:1:2::/64");
    assert_eq!(
        outcome,
        AttemptOutcome::Banned {
            net: target,
            expires_at: 1060
        }
    );
    assert_eq!(reject_count(&shared, &target), 1);
    assert!(
        firewall::parsed_rules(shared.v4.as_ref(), FILTER, POLICY_CHAIN)
            .unwrap()
            .is_empty()
    );
}
