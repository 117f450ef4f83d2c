use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use shared::error::{Error, Result};

/// ICE candidate type, in decreasing order of preference.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CandidateType {
    #[default]
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        };
        f.write_str(s)
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            _ => Err(Error::ErrSdpInvalidCandidate(s.to_owned())),
        }
    }
}

/// One ICE candidate, as carried on an `a=candidate` attribute.
///
/// The address may be a hostname (mDNS obfuscation); such candidates are
/// unresolved until a lookup substitutes an IP literal.
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub typ: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    /// Remaining extension att-value tokens (generation, network-id, ...),
    /// preserved verbatim.
    pub extensions: Vec<String>,
    /// The mid this candidate belongs to, when known from signaling.
    pub mid: Option<String>,
}

impl Candidate {
    /// Whether the address is an IP literal rather than a hostname.
    pub fn is_resolved(&self) -> bool {
        self.address.parse::<IpAddr>().is_ok()
    }

    /// Substitutes a resolved IP address.
    pub fn resolve(&mut self, addr: IpAddr) {
        self.address = addr.to_string();
    }

    /// Renders the candidate attribute value, without the `a=` or
    /// `candidate:` prefixes.
    pub fn value(&self) -> String {
        let mut s = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.typ
        );
        if let (Some(raddr), Some(rport)) = (&self.related_address, self.related_port) {
            s.push_str(&format!(" raddr {raddr} rport {rport}"));
        }
        for ext in &self.extensions {
            s.push(' ');
            s.push_str(ext);
        }
        s
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate:{}", self.value())
    }
}

impl FromStr for Candidate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Accept "a=candidate:...", "candidate:..." and the bare value.
        let s = s.trim();
        let s = s.strip_prefix("a=").unwrap_or(s);
        let s = s.strip_prefix("candidate:").unwrap_or(s);

        let mut tokens = s.split_whitespace();
        let invalid = || Error::ErrSdpInvalidCandidate(s.to_owned());

        let foundation = tokens.next().ok_or_else(invalid)?.to_owned();
        let component = tokens.next().ok_or_else(invalid)?.parse()?;
        let transport = tokens.next().ok_or_else(invalid)?.to_owned();
        let priority = tokens.next().ok_or_else(invalid)?.parse()?;
        let address = tokens.next().ok_or_else(invalid)?.to_owned();
        let port = tokens.next().ok_or_else(invalid)?.parse()?;
        if tokens.next() != Some("typ") {
            return Err(invalid());
        }
        let typ = tokens.next().ok_or_else(invalid)?.parse()?;

        let mut candidate = Candidate {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            typ,
            ..Default::default()
        };

        let mut rest = tokens.peekable();
        while let Some(token) = rest.next() {
            match token {
                "raddr" => {
                    candidate.related_address = Some(rest.next().ok_or_else(invalid)?.to_owned());
                }
                "rport" => {
                    candidate.related_port = Some(rest.next().ok_or_else(invalid)?.parse()?);
                }
                _ => candidate.extensions.push(token.to_owned()),
            }
        }

        Ok(candidate)
    }
}

#[cfg(test)]
mod candidate_test {
    use super::*;

    #[test]
    fn test_parse_host() {
        let c: Candidate = "candidate:1 1 UDP 2122260223 192.168.1.5 56143 typ host"
            .parse()
            .unwrap();
        assert_eq!(c.foundation, "1");
        assert_eq!(c.component, 1);
        assert_eq!(c.transport, "UDP");
        assert_eq!(c.priority, 2_122_260_223);
        assert_eq!(c.address, "192.168.1.5");
        assert_eq!(c.port, 56143);
        assert_eq!(c.typ, CandidateType::Host);
        assert!(c.is_resolved());
    }

    #[test]
    fn test_parse_srflx_with_related() {
        let c: Candidate =
            "a=candidate:4234997325 1 udp 1686052607 203.0.113.7 62537 typ srflx raddr 10.0.0.2 rport 62537 generation 0"
                .parse()
                .unwrap();
        assert_eq!(c.typ, CandidateType::ServerReflexive);
        assert_eq!(c.related_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(c.related_port, Some(62537));
        assert_eq!(c.extensions, vec!["generation".to_owned(), "0".to_owned()]);
    }

    #[test]
    fn test_unresolved_hostname() {
        let c: Candidate = "candidate:1 1 UDP 1 abcd.local 40000 typ host"
            .parse()
            .unwrap();
        assert!(!c.is_resolved());
        let mut c = c;
        c.resolve("192.0.2.1".parse().unwrap());
        assert!(c.is_resolved());
    }

    #[test]
    fn test_round_trip() {
        let line = "candidate:4234997325 1 udp 1686052607 203.0.113.7 62537 typ srflx raddr 10.0.0.2 rport 62537 generation 0";
        let c: Candidate = line.parse().unwrap();
        assert_eq!(c.to_string(), line);
    }

    #[test]
    fn test_reject_garbage() {
        assert!("candidate:1 1 UDP".parse::<Candidate>().is_err());
        assert!("candidate:1 1 UDP x y z typ host".parse::<Candidate>().is_err());
    }
}
