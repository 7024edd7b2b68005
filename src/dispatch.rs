//! Delivery of answers to requesters.
//!
//! Every question ends with exactly one [`Answer::End`] per attached
//! requester. The [`Status`] it carries keeps "no records" apart from
//! "failed", which look the same if only the record stream is considered.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::events::Event;
use crate::message::{QuestionRecord, Rcode, Record};
use crate::question::Question;

static NEXT_REQUESTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one caller interested in answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequesterId(u64);

/// A caller's handle. Cloning it keeps the same identity.
#[derive(Debug, Clone)]
pub struct Requester {
    id: RequesterId,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Requester {
    /// Create a requester and the receiving end of its deliveries.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = RequesterId(NEXT_REQUESTER.fetch_add(1, Ordering::Relaxed));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> RequesterId {
        self.id
    }

    pub(crate) fn deliver(&self, delivery: Delivery) {
        // A requester that went away simply stops listening.
        let _ = self.tx.send(delivery);
    }
}

/// One item delivered to a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub server: SocketAddr,
    pub question: QuestionRecord,
    pub answer: Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Record(Record),
    /// End of answer. Always the last delivery for a question.
    End(Status),
}

/// How a question completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// At least one record was delivered.
    Answered,
    /// The server answered without records, e.g. NXDOMAIN.
    Empty(Rcode),
    /// No usable answer was obtained.
    Failed(Failure),
}

impl Status {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Why a question failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error("server unreachable")]
    Unreachable,

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("connection closed by server")]
    Closed,

    #[error("network error: {0}")]
    Io(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response truncated")]
    Truncated,

    #[error("query refused")]
    Refused,

    #[error("zone transfer denied")]
    Denied,

    #[error("server failure: {0}")]
    ServerFailure(Rcode),

    #[error("cancelled")]
    Cancelled,

    #[error("resolver stopped")]
    Stopped,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Routes records and completions to the requesters of a question and
/// publishes lifecycle events.
pub(crate) struct Dispatcher {
    events: broadcast::Sender<Event>,
}

impl Dispatcher {
    pub(crate) fn new(events: broadcast::Sender<Event>) -> Self {
        Self { events }
    }

    pub(crate) fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn records(&self, question: &Question, records: &[Record]) {
        for requester in &question.requesters {
            for record in records {
                requester.deliver(Delivery {
                    server: question.server,
                    question: question.record.clone(),
                    answer: Answer::Record(record.clone()),
                });
            }
        }
    }

    /// Send the end-of-answer sentinel and retire the question.
    pub(crate) fn finish(&self, question: &Question, status: Status) {
        trace!(id = ?question.id, server = %question.server, ?status, "question finished");
        for requester in &question.requesters {
            requester.deliver(Delivery {
                server: question.server,
                question: question.record.clone(),
                answer: Answer::End(status.clone()),
            });
        }
        self.publish(Event::Discarded {
            id: question.id,
            server: question.server,
            question: question.record.clone(),
            status,
        });
    }
}
