//! Lifecycle events for observers such as progress displays.

use std::net::SocketAddr;

use crate::dispatch::Status;
use crate::message::QuestionRecord;
use crate::question::QuestionId;

/// State of a slot's exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Connecting,
    Sent,
    Answering,
}

/// Published through [`Resolver::subscribe`](crate::Resolver::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Queued {
        id: QuestionId,
        server: SocketAddr,
        question: QuestionRecord,
    },
    Discarded {
        id: QuestionId,
        server: SocketAddr,
        question: QuestionRecord,
        status: Status,
    },
    SlotStatus {
        slot: usize,
        server: Option<SocketAddr>,
        status: SlotStatus,
    },
}
