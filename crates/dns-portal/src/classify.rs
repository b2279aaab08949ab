//! Sorting an incoming datagram into one of three buckets: a query the
//! portal answers itself, a well-formed query for some other name, or
//! something which cannot be answered normally.

use std::fmt;

use dns_types::protocol::deserialise::{ConsumableBuffer, Error as ParseError};
use dns_types::protocol::types::*;

use crate::settings::DomainPattern;

/// A query which passed every structural check.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ParsedQuery<'a> {
    pub header: Header,
    pub question: Question<'a>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome<'a> {
    /// The question is for the portal's domain.
    Matched(ParsedQuery<'a>),
    /// The question is well-formed but for some other name.
    NoMatch(ParsedQuery<'a>),
    /// The datagram is not something the portal answers or forwards.
    Malformed(Malformed<'a>),
}

/// Why a datagram was rejected, along with whatever was parsed before
/// the problem was found.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Malformed<'a> {
    pub reason: Reason,
    pub header: Option<Header>,
    /// Only present when the question itself should be echoed in the
    /// error reply.
    pub question: Option<Question<'a>>,
}

impl Malformed<'_> {
    /// The error code to reply with, or `None` if the datagram should
    /// be dropped without a reply.  There is never a reply without a
    /// header to take the ID from.
    pub fn rcode(&self) -> Option<Rcode> {
        self.header.and(self.reason.rcode())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Reason {
    HeaderTooShort,
    NotAQuery,
    UnsupportedOpcode(Opcode),
    QuestionCount(u16),
    UnexpectedRecords,
    InvalidQuestion(ParseError),
    UnsupportedClass(QueryClass),
    UnsupportedType(QueryType),
}

impl Reason {
    pub fn rcode(self) -> Option<Rcode> {
        match self {
            Reason::NotAQuery => None,
            Reason::UnsupportedOpcode(_) => Some(Rcode::NotImplemented),
            Reason::HeaderTooShort
            | Reason::QuestionCount(_)
            | Reason::UnexpectedRecords
            | Reason::InvalidQuestion(_) => Some(Rcode::FormatError),
            Reason::UnsupportedClass(_) | Reason::UnsupportedType(_) => Some(Rcode::NameError),
        }
    }

    /// Short label, suitable for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::HeaderTooShort => "header_too_short",
            Reason::NotAQuery => "not_a_query",
            Reason::UnsupportedOpcode(_) => "unsupported_opcode",
            Reason::QuestionCount(_) => "question_count",
            Reason::UnexpectedRecords => "unexpected_records",
            Reason::InvalidQuestion(_) => "invalid_question",
            Reason::UnsupportedClass(_) => "unsupported_class",
            Reason::UnsupportedType(_) => "unsupported_type",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reason::HeaderTooShort => write!(f, "datagram shorter than header"),
            Reason::NotAQuery => write!(f, "QR flag set"),
            Reason::UnsupportedOpcode(opcode) => write!(f, "opcode {} not supported", u8::from(*opcode)),
            Reason::QuestionCount(n) => write!(f, "expected one question, got {n}"),
            Reason::UnexpectedRecords => write!(f, "query carries answer, authority, or additional records"),
            Reason::InvalidQuestion(error) => write!(f, "invalid question: {error}"),
            Reason::UnsupportedClass(qclass) => write!(f, "query class {qclass} not supported"),
            Reason::UnsupportedType(qtype) => write!(f, "query type {qtype} not supported"),
        }
    }
}

/// Classify a datagram.  This never fails and never panics: anything
/// which can't be parsed is `Outcome::Malformed`.
///
/// Checks happen in a fixed order, so a query with both an unsupported
/// type and a non-matching name gets an error reply rather than being
/// forwarded.
pub fn classify<'a>(octets: &'a [u8], domain: &DomainPattern) -> Outcome<'a> {
    let mut buffer = ConsumableBuffer::new(octets);

    let Ok(header) = Header::deserialise(&mut buffer) else {
        return malformed(Reason::HeaderTooShort, None, None);
    };

    if header.is_response {
        return malformed(Reason::NotAQuery, Some(header), None);
    }
    if header.opcode != Opcode::Standard {
        return malformed(Reason::UnsupportedOpcode(header.opcode), Some(header), None);
    }
    if header.qdcount != 1 {
        return malformed(Reason::QuestionCount(header.qdcount), Some(header), None);
    }
    if header.ancount != 0 || header.nscount != 0 || header.arcount != 0 {
        return malformed(Reason::UnexpectedRecords, Some(header), None);
    }

    let question = match Question::deserialise(&mut buffer) {
        Ok(question) => question,
        Err(error) => return malformed(Reason::InvalidQuestion(error), Some(header), None),
    };

    match question.qclass {
        QueryClass::Record(RecordClass::IN) | QueryClass::Wildcard => (),
        qclass => {
            return malformed(Reason::UnsupportedClass(qclass), Some(header), Some(question));
        }
    }
    match question.qtype {
        QueryType::Record(RecordType::A) | QueryType::Wildcard => (),
        qtype => {
            return malformed(Reason::UnsupportedType(qtype), Some(header), Some(question));
        }
    }

    let query = ParsedQuery { header, question };
    if domain.matches(&question) {
        Outcome::Matched(query)
    } else {
        Outcome::NoMatch(query)
    }
}

fn malformed<'a>(reason: Reason, header: Option<Header>, question: Option<Question<'a>>) -> Outcome<'a> {
    Outcome::Malformed(Malformed {
        reason,
        header,
        question,
    })
}
