use std::fmt;
use std::net::Ipv4Addr;

use dns_types::protocol::types::*;

/// TTL of the A record in answers, in seconds.
pub const DEFAULT_TTL: u32 = 60;

/// Error returned for names which are not the portal's, when not
/// forwarding.
pub const DEFAULT_ERROR_RCODE: Rcode = Rcode::NameError;

/// Configuration of a running responder.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    pub listen_port: u16,
    pub domain: DomainPattern,
    pub resolved_ip: Ipv4Addr,
    /// Host order: it is converted when the answer is encoded.
    pub ttl: u32,
    pub error_rcode: Rcode,
    /// `None` disables forwarding.
    pub upstream: Option<Ipv4Addr>,
}

impl Settings {
    pub fn new(domain: &str, resolved_ip: Ipv4Addr) -> Self {
        Self {
            listen_port: DNS_PORT,
            domain: DomainPattern::new(domain),
            resolved_ip,
            ttl: DEFAULT_TTL,
            error_rcode: DEFAULT_ERROR_RCODE,
            upstream: None,
        }
    }

    pub fn is_forwarding(&self) -> bool {
        self.upstream.is_some()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new("*", Ipv4Addr::UNSPECIFIED)
    }
}

/// The name the portal answers for.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum DomainPattern {
    /// `*`: every name.
    Wildcard,
    /// A single name, lower-cased, without a leading `www.` or a
    /// trailing `.`.  An empty name matches nothing, so every query
    /// gets the error reply or is forwarded.
    Exact(String),
}

impl DomainPattern {
    pub fn new(name: &str) -> Self {
        let lowered = name.trim().to_ascii_lowercase();
        if lowered == "*" {
            return DomainPattern::Wildcard;
        }

        let name = lowered.strip_suffix('.').unwrap_or(&lowered);
        let name = name.strip_prefix("www.").unwrap_or(name);
        DomainPattern::Exact(name.to_string())
    }

    /// Compare the name of a question against this pattern, label by
    /// label and ignoring ASCII case.  A single leading `www` label in
    /// the question is skipped, mirroring the normalisation done in
    /// `new`.
    pub fn matches(&self, question: &Question) -> bool {
        let domain = match self {
            DomainPattern::Wildcard => return true,
            DomainPattern::Exact(domain) if domain.is_empty() => return false,
            DomainPattern::Exact(domain) => domain,
        };

        let mut labels = question.labels().peekable();
        if labels
            .peek()
            .is_some_and(|label| label.eq_ignore_ascii_case(b"www"))
        {
            labels.next();
        }

        let mut expected = domain.split('.');
        loop {
            match (labels.next(), expected.next()) {
                (None, None) => return true,
                (Some(label), Some(wanted)) if label.eq_ignore_ascii_case(wanted.as_bytes()) => (),
                _ => return false,
            }
        }
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DomainPattern::Wildcard => write!(f, "*"),
            DomainPattern::Exact(domain) => write!(f, "{domain}"),
        }
    }
}
