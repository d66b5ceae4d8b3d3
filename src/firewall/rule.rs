//! Structural rule parsing and rendering.
//!
//! Rule identity must never depend on the textual rendering the kernel hands
//! back: `iptables -S` adds defaults we did not write (`--reject-with`,
//! normalized masks, quoted comments). Listings are parsed into
//! [`ParsedRule`] values and compared field by field.

use ipnet::IpNet;
use std::net::IpAddr;

/// One rule from a chain listing, reduced to the fields that carry identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedRule {
    pub src: Option<IpNet>,
    pub src_negated: bool,
    pub dst: Option<IpNet>,
    pub dst_negated: bool,
    pub target: Option<String>,
    pub to_source: Option<String>,
    pub comment: Option<String>,
}

impl ParsedRule {
    /// True when this is a REJECT of traffic from `net`.
    pub fn is_reject_of(&self, net: &IpNet) -> bool {
        self.target.as_deref() == Some("REJECT") && !self.src_negated && self.src == Some(*net)
    }

    /// True when this jumps to the named chain.
    pub fn is_jump_to(&self, chain: &str) -> bool {
        self.target.as_deref() == Some(chain)
    }

    /// True when this is the canonical SNAT rule for `source` → `to`.
    ///
    /// The destination must be the negation of the source network; the
    /// timestamp comment attached by the v4 guard is ignored.
    pub fn is_canonical_snat(&self, source: &IpNet, to: &IpAddr) -> bool {
        self.target.as_deref() == Some("SNAT")
            && !self.src_negated
            && self.src == Some(*source)
            && self.dst_negated
            && self.dst == Some(*source)
            && self.to_source.as_deref() == Some(to.to_string().as_str())
    }
}

/// Parse one `iptables -S` line. Returns `None` for policy (`-P`) and
/// chain-declaration (`-N`) lines.
pub fn parse_rule(line: &str) -> Option<ParsedRule> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "-A" {
        return None;
    }
    let _chain = tokens.next()?;

    let mut rule = ParsedRule::default();
    let mut negate = false;
    while let Some(token) = tokens.next() {
        match token {
            "!" => {
                negate = true;
                continue;
            }
            "-s" | "--source" => {
                rule.src = tokens.next().and_then(parse_net);
                rule.src_negated = negate;
            }
            "-d" | "--destination" => {
                rule.dst = tokens.next().and_then(parse_net);
                rule.dst_negated = negate;
            }
            "-j" | "--jump" => {
                rule.target = tokens.next().map(str::to_string);
            }
            "--to-source" => {
                rule.to_source = tokens.next().map(str::to_string);
            }
            "--comment" => {
                rule.comment = tokens.next().map(|c| c.trim_matches('"').to_string());
            }
            // Module selectors and value-less flags.
            "-m" | "--match" => {
                tokens.next();
            }
            "--random" | "--random-fully" | "--persistent" => {}
            // Anything else is an option we do not model; skip its value
            // unless the next token starts a new option.
            other if other.starts_with('-') => {
                let mut lookahead = tokens.clone();
                if let Some(next) = lookahead.next() {
                    if !next.starts_with('-') && next != "!" {
                        tokens.next();
                    }
                }
            }
            _ => {}
        }
        negate = false;
    }
    Some(rule)
}

/// `1.2.3.4` and `1.2.3.0/24` both parse; host bits are truncated the way
/// the kernel reports them.
fn parse_net(token: &str) -> Option<IpNet> {
    if let Ok(net) = token.parse::<IpNet>() {
        return Some(net.trunc());
    }
    token.parse::<IpAddr>().ok().map(IpNet::from)
}

/// `-s <net> -j REJECT`
pub fn render_reject(net: &IpNet) -> String {
    format!("-s {} -j REJECT", net)
}

/// `-j <chain>`
pub fn render_jump(chain: &str) -> String {
    format!("-j {}", chain)
}

/// `-s <src> ! -d <src> [-m comment --comment <ts>] -j SNAT --to-source <to>`
pub fn render_snat(source: &IpNet, to: &IpAddr, comment: Option<i64>) -> String {
    match comment {
        Some(ts) => format!(
            "-s {src} ! -d {src} -m comment --comment {ts} -j SNAT --to-source {to}",
            src = source,
            ts = ts,
            to = to
        ),
        None => format!(
            "-s {src} ! -d {src} -j SNAT --to-source {to}",
            src = source,
            to = to
        ),
    }
}
