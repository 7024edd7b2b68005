//! Questions as the scheduler tracks them.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use crate::dispatch::{Requester, RequesterId};
use crate::message::{QuestionRecord, RecordType};

/// Identifies a question for its whole life, queued or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuestionId(pub(crate) u64);

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// What the scheduler needs to know about a question to schedule it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// A single question answered by a single message.
    Lookup,
    /// AXFR/IXFR: many messages over one session.
    ZoneTransfer,
    /// NS query; referrals in the authority section count as the answer.
    Discovery,
}

impl QueryKind {
    pub fn of(record: &QuestionRecord) -> Self {
        if record.qtype.is_zone_transfer() {
            Self::ZoneTransfer
        } else if record.qtype == RecordType::NS {
            Self::Discovery
        } else {
            Self::Lookup
        }
    }

    /// Whether identical questions may share one wire exchange.
    pub fn coalesces(self) -> bool {
        self != Self::ZoneTransfer
    }
}

pub(crate) struct Question {
    pub id: QuestionId,
    pub server: SocketAddr,
    pub record: QuestionRecord,
    pub kind: QueryKind,
    pub high_priority: bool,
    /// Callers riding this question. Empty for fire-and-forget questions.
    pub requesters: Vec<Requester>,
    /// Servers to fall back to, in order, once `server` gives up.
    pub alternates: VecDeque<SocketAddr>,
}

impl Question {
    pub fn key(&self) -> (SocketAddr, QuestionRecord) {
        (self.server, self.record.clone())
    }

    /// Attach a requester unless it is already attached.
    pub fn attach(&mut self, requester: Requester) {
        if !self.requesters.iter().any(|r| r.id() == requester.id()) {
            self.requesters.push(requester);
        }
    }

    pub fn attach_all(&mut self, requesters: Vec<Requester>) {
        for requester in requesters {
            self.attach(requester);
        }
    }

    /// Returns true if the requester was attached.
    pub fn detach(&mut self, requester: RequesterId) -> bool {
        let before = self.requesters.len();
        self.requesters.retain(|r| r.id() != requester);
        self.requesters.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_question_type() {
        let axfr = QuestionRecord::new("example.com", RecordType::AXFR).unwrap();
        let ns = QuestionRecord::new("example.com", RecordType::NS).unwrap();
        let mx = QuestionRecord::new("example.com", RecordType::MX).unwrap();

        assert_eq!(QueryKind::of(&axfr), QueryKind::ZoneTransfer);
        assert_eq!(QueryKind::of(&ns), QueryKind::Discovery);
        assert_eq!(QueryKind::of(&mx), QueryKind::Lookup);
        assert!(!QueryKind::ZoneTransfer.coalesces());
        assert!(QueryKind::Discovery.coalesces());
    }

    #[test]
    fn attach_is_idempotent_per_requester() {
        let record = QuestionRecord::new("example.com", RecordType::A).unwrap();
        let mut q = Question {
            id: QuestionId(3),
            server: "192.0.2.1:53".parse().unwrap(),
            kind: QueryKind::of(&record),
            record,
            high_priority: false,
            requesters: Vec::new(),
            alternates: VecDeque::new(),
        };
        let (a, _rx) = Requester::new();

        q.attach(a.clone());
        q.attach(a.clone());
        assert_eq!(q.requesters.len(), 1);

        assert!(q.detach(a.id()));
        assert!(!q.detach(a.id()));
        assert!(q.requesters.is_empty());
    }
}
