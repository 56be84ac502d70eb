//! Exit policies
//!
//! A policy is an ordered list of `accept`/`reject` rules. The first rule
//! matching a target decides; a target matching no rule is rejected.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    Accept,
    Reject,
}

/// Address half of a rule: `*`, `*4`, `*6`, an address, or `addr/prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressPattern {
    Any,
    AnyV4,
    AnyV6,
    Network { base: IpAddr, prefix: u8 },
}

impl AddressPattern {
    fn is_wildcard(&self) -> bool {
        matches!(self, AddressPattern::Any)
    }

    fn matches(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (AddressPattern::Any, _) => true,
            (AddressPattern::AnyV4, IpAddr::V4(_)) => true,
            (AddressPattern::AnyV6, IpAddr::V6(_)) => true,
            (AddressPattern::Network { base, prefix }, _) => prefix_match(base, addr, *prefix),
            _ => false,
        }
    }
}

fn prefix_match(base: &IpAddr, addr: &IpAddr, prefix: u8) -> bool {
    match (base, addr) {
        (IpAddr::V4(b), IpAddr::V4(a)) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix.min(32) as u32) };
            (u32::from(*b) & mask) == (u32::from(*a) & mask)
        }
        (IpAddr::V6(b), IpAddr::V6(a)) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix.min(128) as u32) };
            (u128::from(*b) & mask) == (u128::from(*a) & mask)
        }
        _ => false,
    }
}

/// One `accept|reject addr:port[-port]` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub action: PolicyAction,
    pub address: AddressPattern,
    pub port_low: u16,
    pub port_high: u16,
}

impl PolicyRule {
    fn covers_port(&self, port: u16) -> bool {
        self.port_low <= port && port <= self.port_high
    }
}

impl FromStr for PolicyRule {
    type Err = TorError;

    /// Parses `accept 18.0.0.0/8:*` style lines (`accept6`/`reject6` too)
    fn from_str(line: &str) -> Result<Self> {
        let bad = || TorError::ParseError(format!("bad policy rule: {}", line));
        let (keyword, rest) = line.trim().split_once(char::is_whitespace).ok_or_else(bad)?;
        let action = match keyword {
            "accept" | "accept6" => PolicyAction::Accept,
            "reject" | "reject6" => PolicyAction::Reject,
            _ => return Err(bad()),
        };
        let rest = rest.trim();
        let (addr_part, port_part) = rest.rsplit_once(':').ok_or_else(bad)?;

        let address = match addr_part {
            "*" => AddressPattern::Any,
            "*4" => AddressPattern::AnyV4,
            "*6" => AddressPattern::AnyV6,
            other => {
                let (ip_str, prefix) = match other.split_once('/') {
                    Some((ip, bits)) => (ip, Some(bits)),
                    None => (other, None),
                };
                let ip_str = ip_str.trim_start_matches('[').trim_end_matches(']');
                let base: IpAddr = ip_str.parse().map_err(|_| bad())?;
                let max = if base.is_ipv4() { 32 } else { 128 };
                let prefix = match prefix {
                    None => max,
                    Some(bits) => {
                        if let Ok(n) = bits.parse::<u8>() {
                            n
                        } else {
                            // Old-style dotted netmask
                            let mask: std::net::Ipv4Addr = bits.parse().map_err(|_| bad())?;
                            u32::from(mask).count_ones() as u8
                        }
                    }
                };
                if prefix > max {
                    return Err(bad());
                }
                AddressPattern::Network { base, prefix }
            }
        };

        let (port_low, port_high) = parse_port_range(port_part).ok_or_else(bad)?;
        Ok(PolicyRule {
            action,
            address,
            port_low,
            port_high,
        })
    }
}

fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    if s == "*" {
        return Some((1, 65535));
    }
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo = lo.parse().ok()?;
            let hi = hi.parse().ok()?;
            (lo <= hi).then_some((lo, hi))
        }
        None => {
            let p = s.parse().ok()?;
            Some((p, p))
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            PolicyAction::Accept => "accept",
            PolicyAction::Reject => "reject",
        };
        let addr = match &self.address {
            AddressPattern::Any => "*".to_string(),
            AddressPattern::AnyV4 => "*4".to_string(),
            AddressPattern::AnyV6 => "*6".to_string(),
            AddressPattern::Network { base, prefix } => match base {
                IpAddr::V4(_) if *prefix == 32 => base.to_string(),
                IpAddr::V6(_) if *prefix == 128 => format!("[{}]", base),
                IpAddr::V4(_) => format!("{}/{}", base, prefix),
                IpAddr::V6(_) => format!("[{}]/{}", base, prefix),
            },
        };
        if self.port_low == 1 && self.port_high == 65535 {
            write!(f, "{} {}:*", action, addr)
        } else if self.port_low == self.port_high {
            write!(f, "{} {}:{}", action, addr, self.port_low)
        } else {
            write!(f, "{} {}:{}-{}", action, addr, self.port_low, self.port_high)
        }
    }
}

/// Ordered rule list, default deny
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Policy that rejects everything
    pub fn reject_all() -> Self {
        Self::default()
    }

    /// Policy that accepts everything
    pub fn accept_all() -> Self {
        Self::new(vec![PolicyRule {
            action: PolicyAction::Accept,
            address: AddressPattern::Any,
            port_low: 1,
            port_high: 65535,
        }])
    }

    pub fn push(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Whether a connection to `address:port` leaves this relay
    ///
    /// With an unknown address (a hostname target) only rules covering
    /// every address can decide, so `reject 10.0.0.0/8:*` is skipped
    /// while `reject *:25` still applies.
    pub fn accepts(&self, address: Option<IpAddr>, port: u16) -> bool {
        for rule in &self.rules {
            if !rule.covers_port(port) {
                continue;
            }
            let matches = match &address {
                Some(addr) => rule.address.matches(addr),
                None => rule.address.is_wildcard(),
            };
            if matches {
                return rule.action == PolicyAction::Accept;
            }
        }
        false
    }

    /// Whether some address is accepted on `port`
    pub fn accepts_port(&self, port: u16) -> bool {
        for rule in &self.rules {
            if !rule.covers_port(port) {
                continue;
            }
            match rule.action {
                PolicyAction::Accept => return true,
                PolicyAction::Reject if rule.address.is_wildcard() => return false,
                PolicyAction::Reject => {}
            }
        }
        false
    }

    /// Build a policy from a consensus port summary (`p accept 80,443,1000-2000`)
    pub fn from_port_summary(summary: &str) -> Result<Self> {
        let bad = || TorError::ParseError(format!("bad port summary: {}", summary));
        let (keyword, ports) = summary.trim().split_once(' ').ok_or_else(bad)?;
        let action = match keyword {
            "accept" => PolicyAction::Accept,
            "reject" => PolicyAction::Reject,
            _ => return Err(bad()),
        };
        let mut rules = Vec::new();
        for item in ports.trim().split(',') {
            let (low, high) = parse_port_range(item).ok_or_else(bad)?;
            rules.push(PolicyRule {
                action,
                address: AddressPattern::Any,
                port_low: low,
                port_high: high,
            });
        }
        if action == PolicyAction::Reject {
            rules.push(PolicyRule {
                action: PolicyAction::Accept,
                address: AddressPattern::Any,
                port_low: 1,
                port_high: 65535,
            });
        }
        Ok(Self { rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(lines: &[&str]) -> ExitPolicy {
        ExitPolicy::new(lines.iter().map(|l| l.parse().unwrap()).collect())
    }

    #[test]
    fn test_first_match_wins() {
        let p = policy(&["reject *:25", "accept *:*"]);
        assert!(!p.accepts(Some("1.2.3.4".parse().unwrap()), 25));
        assert!(p.accepts(Some("1.2.3.4".parse().unwrap()), 443));

        let p = policy(&["accept *:*", "reject *:25"]);
        assert!(p.accepts(Some("1.2.3.4".parse().unwrap()), 25));
    }

    #[test]
    fn test_default_deny() {
        let p = policy(&["accept *:80"]);
        assert!(!p.accepts(Some("1.2.3.4".parse().unwrap()), 443));
        assert!(!ExitPolicy::reject_all().accepts(None, 80));
    }

    #[test]
    fn test_network_rules() {
        let p = policy(&["reject 10.0.0.0/8:*", "reject 192.168.1.0/255.255.255.0:*", "accept *:443"]);
        assert!(!p.accepts(Some("10.20.30.40".parse().unwrap()), 443));
        assert!(!p.accepts(Some("192.168.1.9".parse().unwrap()), 443));
        assert!(p.accepts(Some("192.168.2.9".parse().unwrap()), 443));
        // Unknown address skips the network rules
        assert!(p.accepts(None, 443));
    }

    #[test]
    fn test_ipv6_rules() {
        let p = policy(&["reject6 [2001:db8::]/32:*", "accept *6:*"]);
        assert!(!p.accepts(Some("2001:db8::1".parse().unwrap()), 80));
        assert!(p.accepts(Some("2001:db9::1".parse().unwrap()), 80));
        assert!(!p.accepts(Some("1.2.3.4".parse().unwrap()), 80));
    }

    #[test]
    fn test_port_ranges() {
        let p = policy(&["accept *:1000-2000"]);
        assert!(p.accepts(None, 1000));
        assert!(p.accepts(None, 2000));
        assert!(!p.accepts(None, 2001));
        assert!("accept *:2000-1000".parse::<PolicyRule>().is_err());
    }

    #[test]
    fn test_port_summary() {
        let p = ExitPolicy::from_port_summary("accept 80,443,6660-6669").unwrap();
        assert!(p.accepts_port(443));
        assert!(p.accepts_port(6665));
        assert!(!p.accepts_port(22));

        let p = ExitPolicy::from_port_summary("reject 25,119").unwrap();
        assert!(!p.accepts_port(25));
        assert!(p.accepts_port(443));
    }

    #[test]
    fn test_display() {
        for line in ["accept *:*", "reject 10.0.0.0/8:*", "accept 1.2.3.4:80", "reject *:6660-6669"] {
            let rule: PolicyRule = line.parse().unwrap();
            assert_eq!(rule.to_string(), line);
        }
    }
}
