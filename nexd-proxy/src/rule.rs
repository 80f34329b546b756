//! Proxy rule parsing, formatting, and the listener index key.
//!
//! Wire form: `<protocol>:<listen_port>:<destination_ip>:<destination_port>` — four required,
//! colon-separated fields (spec §6). `Type` (ingress/egress) is not part of the wire string; it
//! is carried alongside it, since the same string is accepted on either the `ProxyAddIngress` or
//! `ProxyAddEgress` RPC method.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

impl FromStr for Protocol {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(RuleParseError::InvalidProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("rule must have exactly four colon-separated fields: {0}")]
    WrongFieldCount(String),

    #[error("invalid protocol `{0}`, expected tcp or udp")]
    InvalidProtocol(String),

    #[error("invalid port `{0}`")]
    InvalidPort(String),

    #[error("invalid destination IP `{0}`")]
    InvalidDestination(String),
}

/// Uniquely indexed, together with `Direction`, by `(type, protocol, listen_port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub stored: bool,
}

/// `(type, protocol, listen_port)` — the listener index key. Distinct rules sharing a listener
/// are only permitted when their `(destination_ip, destination_port)` differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub direction: Direction,
    pub protocol: Protocol,
    pub listen_port: u16,
}

// `Direction`/`Protocol` need a total order for `ListenerKey`'s derived `Ord`.
impl PartialOrd for Direction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Direction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}
impl PartialOrd for Protocol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Protocol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl ProxyRule {
    pub fn listener_key(&self) -> ListenerKey {
        ListenerKey {
            direction: self.direction,
            protocol: self.protocol,
            listen_port: self.listen_port,
        }
    }

    /// Parses the four-field wire string for the given direction. Boundary cases per spec §8:
    /// empty protocol, port 0, or port 65536 (out of `u16` range, so simply fails to parse) are
    /// all rejected.
    pub fn parse(direction: Direction, s: &str, stored: bool) -> Result<Self, RuleParseError> {
        let fields: Vec<&str> = s.split(':').collect();
        let [protocol, listen_port, destination_ip, destination_port] = fields.as_slice() else {
            return Err(RuleParseError::WrongFieldCount(s.to_string()));
        };

        if protocol.is_empty() || listen_port.is_empty() || destination_ip.is_empty() || destination_port.is_empty() {
            return Err(RuleParseError::WrongFieldCount(s.to_string()));
        }

        let protocol: Protocol = protocol.parse()?;

        let listen_port: u16 = listen_port
            .parse()
            .map_err(|_| RuleParseError::InvalidPort((*listen_port).to_string()))?;
        if listen_port == 0 {
            return Err(RuleParseError::InvalidPort((*listen_port).to_string()));
        }

        let destination_port: u16 = destination_port
            .parse()
            .map_err(|_| RuleParseError::InvalidPort((*destination_port).to_string()))?;
        if destination_port == 0 {
            return Err(RuleParseError::InvalidPort((*destination_port).to_string()));
        }

        let destination_ip: IpAddr = destination_ip
            .parse()
            .map_err(|_| RuleParseError::InvalidDestination((*destination_ip).to_string()))?;

        Ok(Self {
            direction,
            protocol,
            listen_port,
            destination_ip,
            destination_port,
            stored,
        })
    }

    /// Equality ignoring `stored`, for rule lookup/removal where a caller may not know (or care)
    /// whether the rule they're naming was persisted.
    pub fn same_rule(&self, other: &ProxyRule) -> bool {
        self.direction == other.direction
            && self.protocol == other.protocol
            && self.listen_port == other.listen_port
            && self.destination_ip == other.destination_ip
            && self.destination_port == other.destination_port
    }

    /// The canonical wire string. `Parse(Format(r)) == r` for any valid rule.
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.protocol, self.listen_port, self.destination_ip, self.destination_port
        )
    }
}

impl fmt::Display for ProxyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_rule() {
        let rule = ProxyRule::parse(Direction::Ingress, "tcp:8080:10.0.0.5:80", true).unwrap();
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.listen_port, 8080);
        assert_eq!(rule.destination_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(rule.destination_port, 80);
    }

    #[test]
    fn rejects_missing_field() {
        let err = ProxyRule::parse(Direction::Ingress, "udp:53::9.9.9.9", true).unwrap_err();
        assert!(matches!(err, RuleParseError::WrongFieldCount(_)));
    }

    #[test]
    fn rejects_port_zero_and_overflow() {
        assert!(ProxyRule::parse(Direction::Ingress, "tcp:0:10.0.0.5:80", true).is_err());
        assert!(ProxyRule::parse(Direction::Ingress, "tcp:65536:10.0.0.5:80", true).is_err());
    }

    #[test]
    fn rejects_empty_protocol() {
        assert!(ProxyRule::parse(Direction::Ingress, ":8080:10.0.0.5:80", true).is_err());
    }

    #[test]
    fn round_trips_through_canonical_form() {
        let rule = ProxyRule::parse(Direction::Egress, "tcp:7000:127.0.0.1:22", false).unwrap();
        let reparsed = ProxyRule::parse(Direction::Egress, &rule.canonical(), false).unwrap();
        assert_eq!(rule, reparsed);
    }
}
