//! Matching idle slots to queued questions.
//!
//! The scheduler owns all shared state: the queue, the server ledger, the
//! slot table and the in-flight exchanges. It never performs I/O; the
//! resolver actor calls it and forwards its decisions to the workers.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ResolverConfig;
use crate::dispatch::{Answer, Delivery, Dispatcher, Failure, Requester, RequesterId, Status};
use crate::events::{Event, SlotStatus};
use crate::ledger::Ledger;
use crate::message::{QuestionRecord, Rcode, Record};
use crate::queue::QueryQueue;
use crate::question::{QueryKind, Question, QuestionId};
use crate::session::Fault;
use crate::stats::{Stats, StatsSnapshot};

/// A request to resolve one question.
pub(crate) struct Submission {
    /// The first server is asked first; the rest are fallbacks.
    pub servers: Vec<SocketAddr>,
    pub record: QuestionRecord,
    pub high_priority: bool,
    pub requester: Option<Requester>,
}

pub(crate) struct Slot {
    pub id: usize,
    pub server: Option<SocketAddr>,
    pub status: SlotStatus,
    pub exchange: Option<QuestionId>,
    pub idle_since: Instant,
    /// Beyond `max_connections` after a reconfiguration.
    pub retiring: bool,
}

impl Slot {
    fn new(id: usize, now: Instant) -> Self {
        Self {
            id,
            server: None,
            status: SlotStatus::Idle,
            exchange: None,
            idle_since: now,
            retiring: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.exchange.is_none()
    }
}

/// A question bound to a slot.
struct Active {
    question: Question,
    slot: usize,
    abort: Option<oneshot::Sender<()>>,
    delivered: usize,
    /// Its last requester cancelled; never sent again.
    abandoned: bool,
}

/// Work handed to a worker.
#[derive(Debug)]
pub(crate) struct Assignment {
    pub id: QuestionId,
    pub server: SocketAddr,
    pub record: QuestionRecord,
    pub kind: QueryKind,
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
    pub abort: oneshot::Receiver<()>,
}

#[derive(Debug)]
pub(crate) enum Activation {
    Assign(Assignment),
    /// Close the slot's connection; it no longer counts against any server.
    Disconnect,
    Wait,
}

/// How a worker's exchange ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Answered(Rcode),
    Fault(Fault),
    /// The exchange was abandoned because nobody wanted the answer anymore.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub address: SocketAddr,
    pub active_connections: usize,
    pub queued: usize,
    pub in_flight_transfers: usize,
    /// Zero means the server is skipped until retried.
    pub connection_budget: usize,
}

/// Read-only view of the scheduler for tests and progress displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub queued: usize,
    pub active_slots: usize,
    pub connected_slots: usize,
    pub servers: Vec<ServerSnapshot>,
    pub stats: StatsSnapshot,
    pub suspended: bool,
    pub stopping: bool,
}

impl Snapshot {
    pub fn server(&self, address: SocketAddr) -> Option<&ServerSnapshot> {
        self.servers.iter().find(|s| s.address == address)
    }
}

pub(crate) struct Scheduler {
    config: ResolverConfig,
    queue: QueryQueue,
    ledger: Ledger,
    slots: Vec<Slot>,
    active: FxHashMap<QuestionId, Active>,
    /// Coalescable questions on the wire, by (server, question).
    in_flight: FxHashMap<(SocketAddr, QuestionRecord), QuestionId>,
    dispatcher: Dispatcher,
    stats: Arc<Stats>,
    next_id: u64,
    /// Last server picked by cross-server selection, for tie-breaking.
    cursor: Option<SocketAddr>,
    suspended: bool,
    stopping: bool,
}

impl Scheduler {
    pub fn new(
        config: ResolverConfig,
        stats: Arc<Stats>,
        events: broadcast::Sender<Event>,
        now: Instant,
    ) -> Self {
        let slots = (0..config.max_connections).map(|id| Slot::new(id, now)).collect();
        Self {
            ledger: Ledger::new(config.max_connections_per_server),
            config,
            queue: QueryQueue::new(),
            slots,
            active: FxHashMap::default(),
            in_flight: FxHashMap::default(),
            dispatcher: Dispatcher::new(events),
            stats,
            next_id: 1,
            cursor: None,
            suspended: false,
            stopping: false,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: usize) -> &Slot {
        &self.slots[slot]
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Queue a question, or attach its requester to an identical one.
    pub fn submit(&mut self, submission: Submission) {
        let Submission {
            servers,
            record,
            high_priority,
            requester,
        } = submission;
        let kind = QueryKind::of(&record);
        let mut candidates: VecDeque<SocketAddr> = servers.into_iter().collect();
        // Nothing was asked; report against the first server given.
        let first = candidates
            .front()
            .copied()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        if self.stopping {
            Self::finish_unqueued(requester, first, record, Failure::Stopped);
            return;
        }
        let Some(server) = self.first_reachable(&mut candidates) else {
            Self::finish_unqueued(requester, first, record, Failure::Unreachable);
            return;
        };
        if kind == QueryKind::ZoneTransfer && !self.ledger.transfers_allowed(server) {
            self.stats.record_transfer_denied();
            Self::finish_unqueued(requester, server, record, Failure::Denied);
            return;
        }

        let mut requesters: Vec<Requester> = requester.into_iter().collect();
        if kind.coalesces() {
            match self.join_existing(server, &record, requesters, high_priority) {
                Ok(()) => return,
                Err(unjoined) => requesters = unjoined,
            }
        }

        let id = QuestionId(self.next_id);
        self.next_id += 1;
        let question = Question {
            id,
            server,
            record,
            kind,
            high_priority,
            requesters,
            alternates: candidates,
        };
        self.enqueue(question);
    }

    /// Attach requesters to an identical question already queued or in
    /// flight on `server`. Hands the requesters back if there is none.
    fn join_existing(
        &mut self,
        server: SocketAddr,
        record: &QuestionRecord,
        requesters: Vec<Requester>,
        high_priority: bool,
    ) -> Result<(), Vec<Requester>> {
        if let Some(id) = self.in_flight.get(&(server, record.clone())).copied() {
            if let Some(active) = self.active.get_mut(&id) {
                trace!(%id, %server, "joining exchange in flight");
                active.question.attach_all(requesters);
                return Ok(());
            }
        }
        if let Some(id) = self.queue.find_coalescable(server, record) {
            if let Some(queued) = self.queue.get_mut(id) {
                trace!(%id, %server, "joining queued question");
                queued.attach_all(requesters);
                if high_priority {
                    self.queue.promote(id);
                }
                return Ok(());
            }
        }
        Err(requesters)
    }

    /// Pop servers until one is not known to be unreachable.
    fn first_reachable(&self, candidates: &mut VecDeque<SocketAddr>) -> Option<SocketAddr> {
        while let Some(server) = candidates.pop_front() {
            if self.ledger.is_reachable(server) {
                return Some(server);
            }
            debug!(%server, "skipping unreachable server");
        }
        None
    }

    fn enqueue(&mut self, question: Question) {
        self.ledger.reference(question.server);
        self.dispatcher.publish(Event::Queued {
            id: question.id,
            server: question.server,
            question: question.record.clone(),
        });
        self.queue.push(question);
    }

    fn finish_unqueued(
        requester: Option<Requester>,
        server: SocketAddr,
        record: QuestionRecord,
        failure: Failure,
    ) {
        if let Some(requester) = requester {
            requester.deliver(Delivery {
                server,
                question: record,
                answer: Answer::End(Status::Failed(failure)),
            });
        }
    }

    /// Decide what an idle slot should do next.
    pub fn activate(&mut self, slot_id: usize, now: Instant) -> Activation {
        if self.suspended || self.stopping {
            return Activation::Wait;
        }
        let slot = &self.slots[slot_id];
        if !slot.is_idle() || slot.retiring {
            return Activation::Wait;
        }
        let current = slot.server;
        let idle_for = now.saturating_duration_since(slot.idle_since);

        // Same-server continuation, unless another server has work and no
        // slot left to serve it.
        if let Some(server) = current {
            if self.starving_elsewhere(server) {
                if let Some(activation) = self.switch(slot_id) {
                    return activation;
                }
            }
            if let Some(question) = self.take_for(server) {
                return self.bind(slot_id, question);
            }
            // Idle but recent: keep the connection for its own server a while.
            if idle_for < self.config.switch_delay {
                return Activation::Wait;
            }
        }

        if let Some(activation) = self.switch(slot_id) {
            return activation;
        }

        if current.is_some() && idle_for >= self.config.disconnect_delay {
            debug!(slot = slot_id, server = ?current, "disconnecting idle slot");
            self.purge_connection(slot_id);
            return Activation::Disconnect;
        }

        Activation::Wait
    }

    /// Cross-server selection.
    fn switch(&mut self, slot_id: usize) -> Option<Activation> {
        let server = self.pick_server(slot_id)?;
        let question = self.take_for(server)?;
        self.move_slot(slot_id, server);
        self.cursor = Some(server);
        Some(self.bind(slot_id, question))
    }

    /// `own` still has work, every slot holds a connection, and some other
    /// server has sendable work but none of them.
    fn starving_elsewhere(&self, own: SocketAddr) -> bool {
        if self.ledger.total_active() < self.config.max_connections || !self.has_sendable(own) {
            return false;
        }
        self.queue.servers().any(|server| {
            server != own
                && self.ledger.active(server) == 0
                && self
                    .ledger
                    .capacity(server, self.config.max_connections_per_server)
                    > 0
                && self.has_sendable(server)
        })
    }

    fn transfer_slot_free(&self, server: SocketAddr) -> bool {
        self.ledger.transfers(server) < self.config.max_transfers_per_server
    }

    fn has_sendable(&self, server: SocketAddr) -> bool {
        let transfers_ok = self.transfer_slot_free(server);
        self.queue
            .has_match(server, |q| q.kind != QueryKind::ZoneTransfer || transfers_ok)
    }

    /// Take the next question for `server` that can go out now, folding
    /// duplicates of exchanges already in flight into those exchanges.
    fn take_for(&mut self, server: SocketAddr) -> Option<Question> {
        let transfers_ok = self.transfer_slot_free(server);
        loop {
            let question = self
                .queue
                .take_next(server, |q| q.kind != QueryKind::ZoneTransfer || transfers_ok)?;
            if question.kind.coalesces() {
                if let Some(id) = self.in_flight.get(&question.key()).copied() {
                    if let Some(active) = self.active.get_mut(&id) {
                        trace!(%id, %server, "coalescing queued duplicate");
                        active.question.attach_all(question.requesters);
                        self.ledger.release(server);
                        continue;
                    }
                }
            }
            return Some(question);
        }
    }

    /// The most under-served server this slot may connect to.
    fn pick_server(&self, slot_id: usize) -> Option<SocketAddr> {
        if self.queue.is_empty() {
            return None;
        }
        let own = self.slots[slot_id].server;
        let total = self.ledger.total_active() - usize::from(own.is_some());
        if total >= self.config.max_connections {
            return None;
        }

        let mut candidates: Vec<(SocketAddr, usize, usize)> = self
            .queue
            .servers()
            .filter(|server| Some(*server) != own)
            .filter_map(|server| {
                let active = self.ledger.active(server);
                let cap = self
                    .ledger
                    .capacity(server, self.config.max_connections_per_server);
                if active >= cap {
                    return None;
                }
                if !self.has_sendable(server) {
                    return None;
                }
                Some((server, active, self.queue.depth(server)))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // Round-robin order starting after the last pick breaks ties.
        candidates.sort_by_key(|(server, _, _)| *server);
        let start = match self.cursor {
            Some(cursor) => candidates.partition_point(|(server, _, _)| *server <= cursor),
            None => 0,
        };
        let len = candidates.len();
        candidates.rotate_left(start % len);

        candidates
            .into_iter()
            .reduce(|best, candidate| {
                // Fewer active connections per queued question wins.
                let (_, best_active, best_depth) = best;
                let (_, active, depth) = candidate;
                match (active * best_depth).cmp(&(best_active * depth)) {
                    Ordering::Less => candidate,
                    _ => best,
                }
            })
            .map(|(server, _, _)| server)
    }

    fn move_slot(&mut self, slot_id: usize, server: SocketAddr) {
        if self.slots[slot_id].server == Some(server) {
            return;
        }
        self.purge_connection(slot_id);
        self.ledger.connect(server);
        self.slots[slot_id].server = Some(server);
    }

    fn bind(&mut self, slot_id: usize, question: Question) -> Activation {
        let (abort_tx, abort_rx) = oneshot::channel();
        let server = question.server;
        if question.kind == QueryKind::ZoneTransfer {
            self.ledger.begin_transfer(server);
            self.stats.record_transfer_requested();
        }
        if question.kind.coalesces() {
            self.in_flight.insert(question.key(), question.id);
        }
        let slot = &mut self.slots[slot_id];
        slot.exchange = Some(question.id);
        debug!(id = %question.id, slot = slot_id, %server, question = %question.record, "assigned");

        let assignment = Assignment {
            id: question.id,
            server,
            record: question.record.clone(),
            kind: question.kind,
            connect_timeout: self.config.connect_timeout,
            receive_timeout: self.config.receive_timeout,
            abort: abort_rx,
        };
        self.active.insert(
            question.id,
            Active {
                question,
                slot: slot_id,
                abort: Some(abort_tx),
                delivered: 0,
                abandoned: false,
            },
        );
        Activation::Assign(assignment)
    }

    /// Release the slot's association with its server. Every connection
    /// counted in the ledger is uncounted here and nowhere else.
    pub fn purge_connection(&mut self, slot_id: usize) {
        if let Some(server) = self.slots[slot_id].server.take() {
            self.ledger.disconnect(server);
        }
    }

    pub fn set_status(&mut self, slot_id: usize, status: SlotStatus) {
        let slot = &mut self.slots[slot_id];
        if slot.status == status {
            return;
        }
        slot.status = status;
        self.dispatcher.publish(Event::SlotStatus {
            slot: slot_id,
            server: slot.server,
            status,
        });
    }

    /// Records from a zone transfer still in progress.
    pub fn progress(&mut self, id: QuestionId, records: Vec<Record>) {
        if let Some(active) = self.active.get_mut(&id) {
            active.delivered += records.len();
            self.dispatcher.records(&active.question, &records);
        }
    }

    /// A worker finished an exchange.
    pub fn finish(
        &mut self,
        slot_id: usize,
        id: QuestionId,
        records: Vec<Record>,
        outcome: Outcome,
        connected: bool,
        now: Instant,
    ) {
        let slot = &mut self.slots[slot_id];
        if slot.exchange == Some(id) {
            slot.exchange = None;
            slot.idle_since = now;
        }
        if !connected {
            self.purge_connection(slot_id);
        }
        self.set_status(slot_id, SlotStatus::Idle);

        let Some(mut active) = self.active.remove(&id) else {
            warn!(%id, slot = slot_id, "finish for unknown exchange");
            return;
        };
        let server = active.question.server;
        if self.in_flight.get(&active.question.key()) == Some(&id) {
            self.in_flight.remove(&active.question.key());
        }
        if active.question.kind == QueryKind::ZoneTransfer {
            self.ledger.end_transfer(server);
        }

        match outcome {
            Outcome::Answered(rcode) => {
                self.ledger.record_answer(server);
                active.delivered += records.len();
                self.dispatcher.records(&active.question, &records);
                if active.question.kind == QueryKind::ZoneTransfer {
                    self.stats.record_transfer_completed();
                }
                let status = if active.delivered > 0 {
                    Status::Answered
                } else {
                    Status::Empty(rcode)
                };
                self.retire(active.question, status);
            }
            Outcome::Aborted => {
                self.retire(active.question, Status::Failed(Failure::Cancelled));
            }
            Outcome::Fault(fault) => self.handle_fault(active, fault),
        }
    }

    fn handle_fault(&mut self, active: Active, fault: Fault) {
        let Active {
            mut question,
            delivered,
            abandoned,
            ..
        } = active;
        let server = question.server;
        debug!(id = %question.id, %server, ?fault, "exchange failed");

        if let Fault::Rcode(Rcode::Refused) = fault {
            let left = self.ledger.record_refusal(server);
            if question.kind == QueryKind::ZoneTransfer {
                self.stats.record_transfer_denied();
            }
            if left == 0 {
                self.deny_transfers(server);
            }
        }

        if fault.charges_budget() {
            let budget = self.ledger.record_failure(server);
            if budget == 0 {
                warn!(%server, "server unreachable");
                self.server_unreachable(server);
            } else if fault.before_query() && !self.stopping && !abandoned {
                // Nothing reached the server: try it again.
                question.high_priority = true;
                self.requeue(question);
                return;
            }
        }

        if abandoned {
            self.retire(question, Status::Failed(Failure::Cancelled));
        } else if delivered == 0 {
            self.reroute(question, fault.failure());
        } else {
            self.retire(question, Status::Failed(fault.failure()));
        }
    }

    /// Put a question back in the queue after a failed attempt.
    fn requeue(&mut self, question: Question) {
        // The question keeps its ledger reference.
        self.dispatcher.publish(Event::Queued {
            id: question.id,
            server: question.server,
            question: question.record.clone(),
        });
        self.queue.push(question);
    }

    /// Move a question to its next usable alternate server, or fail it.
    fn reroute(&mut self, mut question: Question, failure: Failure) {
        if !self.stopping {
            if let Some(next) = self.first_reachable(&mut question.alternates) {
                debug!(id = %question.id, from = %question.server, to = %next, "trying alternate server");
                self.ledger.release(question.server);
                if question.kind.coalesces() {
                    let requesters = std::mem::take(&mut question.requesters);
                    match self.join_existing(next, &question.record, requesters, true) {
                        Ok(()) => return,
                        Err(unjoined) => question.requesters = unjoined,
                    }
                }
                question.server = next;
                question.high_priority = true;
                self.enqueue(question);
                return;
            }
        }
        self.retire(question, Status::Failed(failure));
    }

    /// Deliver the sentinel and drop the question's ledger reference.
    fn retire(&mut self, question: Question, status: Status) {
        let server = question.server;
        self.dispatcher.finish(&question, status);
        self.ledger.release(server);
    }

    /// Fail or reroute everything queued for a server that gave up.
    fn server_unreachable(&mut self, server: SocketAddr) {
        for question in self.queue.drain_server(server, |_| true) {
            self.reroute(question, Failure::Unreachable);
        }
    }

    fn deny_transfers(&mut self, server: SocketAddr) {
        for question in self
            .queue
            .drain_server(server, |q| q.kind == QueryKind::ZoneTransfer)
        {
            self.stats.record_transfer_denied();
            self.retire(question, Status::Failed(Failure::Denied));
        }
    }

    /// A worker went away without reporting; release what it held.
    pub fn abandon_slot(&mut self, slot_id: usize, now: Instant) {
        if let Some(id) = self.slots[slot_id].exchange {
            self.finish(
                slot_id,
                id,
                Vec::new(),
                Outcome::Fault(Fault::Internal("worker lost".into())),
                false,
                now,
            );
        }
        self.purge_connection(slot_id);
        self.set_status(slot_id, SlotStatus::Idle);
    }

    /// Give a question back to the queue when its directive could not be
    /// delivered to the worker.
    pub fn unassign(&mut self, slot_id: usize, id: QuestionId) {
        self.slots[slot_id].exchange = None;
        self.purge_connection(slot_id);
        if let Some(active) = self.active.remove(&id) {
            if self.in_flight.get(&active.question.key()) == Some(&id) {
                self.in_flight.remove(&active.question.key());
            }
            if active.question.kind == QueryKind::ZoneTransfer {
                self.ledger.end_transfer(active.question.server);
            }
            if active.abandoned {
                self.retire(active.question, Status::Failed(Failure::Cancelled));
            } else {
                self.requeue(active.question);
            }
        }
    }

    /// Detach a requester everywhere. Exchanges left without any requester
    /// are aborted.
    pub fn cancel(&mut self, requester: RequesterId) {
        for question in self.queue.detach_requester(requester) {
            self.retire(question, Status::Failed(Failure::Cancelled));
        }
        for (id, active) in self.active.iter_mut() {
            if active.question.detach(requester) && active.question.requesters.is_empty() {
                debug!(%id, slot = active.slot, "aborting exchange nobody waits for");
                active.abandoned = true;
                if self.in_flight.get(&active.question.key()) == Some(id) {
                    self.in_flight.remove(&active.question.key());
                }
                if let Some(abort) = active.abort.take() {
                    let _ = abort.send(());
                }
            }
        }
    }

    pub fn retry_server(&mut self, server: SocketAddr) {
        debug!(%server, "retrying server");
        self.ledger.retry(server);
    }

    /// Stop accepting work and fail everything still queued.
    pub fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        for question in self.queue.drain_all() {
            self.retire(question, Status::Failed(Failure::Stopped));
        }
    }

    /// Apply new limits. Returns the new slot count.
    pub fn reconfigure(&mut self, config: ResolverConfig, now: Instant) -> usize {
        let slots = config.max_connections;
        for slot in &mut self.slots {
            slot.retiring = slot.id >= slots;
        }
        while self.slots.len() < slots {
            let id = self.slots.len();
            self.slots.push(Slot::new(id, now));
        }
        self.ledger.set_full_budget(config.max_connections_per_server);
        self.config = config;
        slots
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut servers: Vec<ServerSnapshot> = self
            .ledger
            .iter()
            .map(|(address, entry)| ServerSnapshot {
                address: *address,
                active_connections: entry.active,
                queued: self.queue.depth(*address),
                in_flight_transfers: entry.transfers,
                connection_budget: entry.budget,
            })
            .collect();
        servers.sort_by_key(|s| s.address);

        Snapshot {
            queued: self.queue.len(),
            active_slots: self.slots.iter().filter(|s| !s.is_idle()).count(),
            connected_slots: self.slots.iter().filter(|s| s.server.is_some()).count(),
            servers,
            stats: self.stats.snapshot(),
            suspended: self.suspended,
            stopping: self.stopping,
        }
    }

    #[cfg(test)]
    fn assert_caps(&self) {
        let total = self.ledger.total_active();
        assert!(total <= self.config.max_connections, "total {} over cap", total);
        for (server, entry) in self.ledger.iter() {
            assert!(
                entry.active <= self.config.max_connections_per_server,
                "{} holds {} connections",
                server,
                entry.active
            );
        }
        let associated = self.slots.iter().filter(|s| s.server.is_some()).count();
        assert_eq!(associated, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CLASS_IN, RecordType};
    use tokio::sync::mpsc;

    fn server(n: u8) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, n], 53))
    }

    fn scheduler(config: ResolverConfig) -> (Scheduler, Instant) {
        let (events, _) = broadcast::channel(1024);
        let now = Instant::now();
        (Scheduler::new(config, Arc::new(Stats::new()), events, now), now)
    }

    fn config(slots: usize) -> ResolverConfig {
        ResolverConfig {
            max_connections: slots,
            ..Default::default()
        }
    }

    fn submit(
        s: &mut Scheduler,
        to: SocketAddr,
        name: &str,
        qtype: RecordType,
        requester: Option<&Requester>,
    ) {
        s.submit(Submission {
            servers: vec![to],
            record: QuestionRecord::new(name, qtype).unwrap(),
            high_priority: false,
            requester: requester.cloned(),
        });
    }

    fn assigned(activation: Activation) -> Assignment {
        match activation {
            Activation::Assign(a) => a,
            other => panic!("expected an assignment, got {:?}", other),
        }
    }

    fn a_record(name: &str) -> Record {
        Record {
            name: name.into(),
            rtype: RecordType::A,
            class: CLASS_IN,
            ttl: 60,
            data: vec![192, 0, 2, 80],
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<Answer> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|d| d.answer).collect()
    }

    #[test]
    fn same_server_continuation_keeps_connection() {
        let (mut s, t0) = scheduler(config(1));
        submit(&mut s, server(1), "a.test", RecordType::A, None);
        submit(&mut s, server(1), "b.test", RecordType::A, None);

        let first = assigned(s.activate(0, t0));
        s.finish(0, first.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);
        let second = assigned(s.activate(0, t0));

        assert_eq!(second.server, server(1));
        assert_eq!(s.slot(0).server, Some(server(1)));
        assert_eq!(s.ledger.active(server(1)), 1);
        s.assert_caps();
    }

    #[test]
    fn recent_idle_slot_waits_before_switching() {
        let (mut s, t0) = scheduler(config(1));
        submit(&mut s, server(1), "a.test", RecordType::A, None);
        let first = assigned(s.activate(0, t0));
        s.finish(0, first.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);

        submit(&mut s, server(2), "b.test", RecordType::A, None);

        assert!(matches!(s.activate(0, t0 + Duration::from_secs(4)), Activation::Wait));
        let second = assigned(s.activate(0, t0 + Duration::from_secs(5)));
        assert_eq!(second.server, server(2));
        assert_eq!(s.ledger.active(server(1)), 0);
        assert_eq!(s.ledger.active(server(2)), 1);
        s.assert_caps();
    }

    #[test]
    fn idle_slot_disconnects_only_after_delay() {
        let (mut s, t0) = scheduler(config(1));
        submit(&mut s, server(1), "a.test", RecordType::A, None);
        let first = assigned(s.activate(0, t0));
        s.finish(0, first.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);

        assert!(matches!(s.activate(0, t0 + Duration::from_secs(29)), Activation::Wait));
        assert_eq!(s.slot(0).server, Some(server(1)));

        assert!(matches!(
            s.activate(0, t0 + Duration::from_secs(30)),
            Activation::Disconnect
        ));
        assert_eq!(s.slot(0).server, None);
        assert!(s.ledger.get(server(1)).is_none());
    }

    #[test]
    fn per_server_cap_bounds_assignments() {
        let (mut s, t0) = scheduler(config(30));
        for i in 0..50 {
            submit(&mut s, server(1), &format!("host{}.test", i), RecordType::A, None);
        }

        let assigned = (0..30)
            .filter(|slot| matches!(s.activate(*slot, t0), Activation::Assign(_)))
            .count();

        assert_eq!(assigned, 4);
        assert_eq!(s.ledger.active(server(1)), 4);
        assert_eq!(s.queue.len(), 46);
        s.assert_caps();
    }

    #[test]
    fn all_questions_complete_under_cap() {
        let (mut s, t0) = scheduler(config(30));
        for i in 0..50 {
            submit(&mut s, server(1), &format!("host{}.test", i), RecordType::A, None);
        }

        let mut completed = 0;
        for _ in 0..100 {
            for slot in 0..30 {
                if let Activation::Assign(a) = s.activate(slot, t0) {
                    s.assert_caps();
                    s.finish(slot, a.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);
                    completed += 1;
                }
            }
        }

        assert_eq!(completed, 50);
        assert!(s.queue.is_empty());
    }

    #[test]
    fn fresh_slots_spread_over_servers() {
        let (mut s, t0) = scheduler(config(4));
        for i in 0..20 {
            submit(&mut s, server(1), &format!("a{}.test", i), RecordType::A, None);
            submit(&mut s, server(2), &format!("b{}.test", i), RecordType::A, None);
        }

        let picks: Vec<SocketAddr> = (0..4).map(|slot| assigned(s.activate(slot, t0)).server).collect();

        assert_eq!(picks.iter().filter(|p| **p == server(1)).count(), 2);
        assert_eq!(picks.iter().filter(|p| **p == server(2)).count(), 2);
    }

    #[test]
    fn ties_rotate_between_servers() {
        let (mut s, t0) = scheduler(config(1));
        for i in 0..20 {
            submit(&mut s, server(1), &format!("a{}.test", i), RecordType::A, None);
            submit(&mut s, server(2), &format!("b{}.test", i), RecordType::A, None);
        }

        let mut seen = Vec::new();
        let mut now = t0;
        for _ in 0..4 {
            let a = assigned(s.activate(0, now));
            seen.push(a.server);
            s.finish(0, a.id, vec![], Outcome::Answered(Rcode::NoError), false, now);
            now += Duration::from_secs(1);
        }

        assert!(seen.contains(&server(1)));
        assert!(seen.contains(&server(2)));
    }

    #[test]
    fn busy_server_yields_slot_to_starved_server() {
        let (mut s, t0) = scheduler(config(2));
        for i in 0..20 {
            submit(&mut s, server(1), &format!("a{}.test", i), RecordType::A, None);
        }
        let mut running: Vec<Assignment> = (0..2).map(|slot| assigned(s.activate(slot, t0))).collect();
        for i in 0..20 {
            submit(&mut s, server(2), &format!("b{}.test", i), RecordType::A, None);
        }

        let mut picks = Vec::new();
        for round in 0..6 {
            let slot = round % 2;
            let done = running[slot].id;
            s.finish(slot, done, vec![], Outcome::Answered(Rcode::NoError), true, t0);
            let next = assigned(s.activate(slot, t0));
            picks.push(next.server);
            running[slot] = next;
            s.assert_caps();
        }

        assert_eq!(picks[0], server(2));
        assert!(picks.contains(&server(1)));
        assert_eq!(s.ledger.active(server(1)), 1);
        assert_eq!(s.ledger.active(server(2)), 1);
    }

    #[test]
    fn global_cap_holds_across_servers() {
        let (mut s, t0) = scheduler(config(3));
        for n in 1..=5 {
            submit(&mut s, server(n), "a.test", RecordType::A, None);
            submit(&mut s, server(n), "b.test", RecordType::A, None);
        }

        for slot in 0..3 {
            assigned(s.activate(slot, t0));
        }

        assert_eq!(s.ledger.total_active(), 3);
        s.assert_caps();
    }

    #[test]
    fn connect_failures_exhaust_budget() {
        let (mut s, t0) = scheduler(config(1));
        let (requester, mut rx) = Requester::new();
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&requester));

        for attempt in 1..=4 {
            let a = assigned(s.activate(0, t0));
            s.finish(
                0,
                a.id,
                vec![],
                Outcome::Fault(Fault::Connect("refused".into())),
                false,
                t0,
            );
            s.assert_caps();
            let budget = s.ledger.get(server(1)).map(|e| e.budget);
            assert_eq!(budget, Some(4 - attempt));
        }

        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Unreachable))]);
        assert!(matches!(s.activate(0, t0), Activation::Wait));

        // Skipped until explicitly retried.
        submit(&mut s, server(1), "b.test", RecordType::A, Some(&requester));
        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Unreachable))]);

        s.retry_server(server(1));
        submit(&mut s, server(1), "c.test", RecordType::A, Some(&requester));
        assert!(matches!(s.activate(0, t0), Activation::Assign(_)));
    }

    #[test]
    fn answer_restores_budget() {
        let (mut s, t0) = scheduler(config(1));
        submit(&mut s, server(1), "a.test", RecordType::A, None);

        let a = assigned(s.activate(0, t0));
        s.finish(0, a.id, vec![], Outcome::Fault(Fault::Connect("refused".into())), false, t0);
        assert_eq!(s.ledger.get(server(1)).unwrap().budget, 3);

        let a = assigned(s.activate(0, t0));
        s.finish(0, a.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);
        assert_eq!(s.ledger.get(server(1)).unwrap().budget, 4);
    }

    #[test]
    fn unreachable_server_falls_back_to_alternate() {
        let (mut s, t0) = scheduler(ResolverConfig {
            max_connections: 1,
            max_connections_per_server: 1,
            ..Default::default()
        });
        let (requester, mut rx) = Requester::new();
        s.submit(Submission {
            servers: vec![server(1), server(2)],
            record: QuestionRecord::new("a.test", RecordType::A).unwrap(),
            high_priority: false,
            requester: Some(requester),
        });

        let a = assigned(s.activate(0, t0));
        assert_eq!(a.server, server(1));
        s.finish(0, a.id, vec![], Outcome::Fault(Fault::Connect("refused".into())), false, t0);

        let a = assigned(s.activate(0, t0));
        assert_eq!(a.server, server(2));
        s.finish(0, a.id, vec![a_record("a.test")], Outcome::Answered(Rcode::NoError), true, t0);

        let answers = drain(&mut rx);
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[1], Answer::End(Status::Answered));
    }

    #[test]
    fn rerouted_question_joins_identical_one_on_alternate() {
        let (mut s, t0) = scheduler(ResolverConfig {
            max_connections: 1,
            max_connections_per_server: 1,
            ..Default::default()
        });
        let (first, mut rx1) = Requester::new();
        let (second, mut rx2) = Requester::new();
        s.submit(Submission {
            servers: vec![server(1), server(2)],
            record: QuestionRecord::new("a.test", RecordType::A).unwrap(),
            high_priority: false,
            requester: Some(first),
        });
        submit(&mut s, server(2), "a.test", RecordType::A, Some(&second));

        let a = assigned(s.activate(0, t0));
        assert_eq!(a.server, server(1));
        s.finish(0, a.id, vec![], Outcome::Fault(Fault::Timeout), false, t0);
        assert_eq!(s.queue.len(), 1);

        let a = assigned(s.activate(0, t0));
        assert_eq!(a.server, server(2));
        s.finish(0, a.id, vec![a_record("a.test")], Outcome::Answered(Rcode::NoError), true, t0);

        let one = drain(&mut rx1);
        assert_eq!(one.last(), Some(&Answer::End(Status::Answered)));
        assert_eq!(one, drain(&mut rx2));
    }

    #[test]
    fn duplicate_question_rides_exchange_in_flight() {
        let (mut s, t0) = scheduler(config(2));
        let (first, mut rx1) = Requester::new();
        let (second, mut rx2) = Requester::new();
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&first));
        let a = assigned(s.activate(0, t0));

        submit(&mut s, server(1), "a.test", RecordType::A, Some(&second));
        assert!(matches!(s.activate(1, t0), Activation::Wait));

        s.finish(0, a.id, vec![a_record("a.test")], Outcome::Answered(Rcode::NoError), true, t0);

        let one = drain(&mut rx1);
        let two = drain(&mut rx2);
        assert_eq!(one.len(), 2);
        assert_eq!(one, two);
    }

    #[test]
    fn zone_transfers_are_never_coalesced() {
        let (mut s, t0) = scheduler(ResolverConfig {
            max_connections: 2,
            max_transfers_per_server: 2,
            ..Default::default()
        });
        let (first, _rx1) = Requester::new();
        let (second, _rx2) = Requester::new();
        submit(&mut s, server(1), "zone.test", RecordType::AXFR, Some(&first));
        submit(&mut s, server(1), "zone.test", RecordType::AXFR, Some(&second));

        let a = assigned(s.activate(0, t0));
        let b = assigned(s.activate(1, t0));

        assert_ne!(a.id, b.id);
        assert_eq!(s.ledger.transfers(server(1)), 2);
    }

    #[test]
    fn transfer_cap_holds_back_second_transfer() {
        let (mut s, t0) = scheduler(config(2));
        submit(&mut s, server(1), "zone.test", RecordType::AXFR, None);
        submit(&mut s, server(1), "zone.test", RecordType::AXFR, None);

        let a = assigned(s.activate(0, t0));
        assert!(matches!(s.activate(1, t0), Activation::Wait));

        s.finish(0, a.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);
        assert!(matches!(s.activate(0, t0), Activation::Assign(_)));
    }

    #[test]
    fn refusals_deny_transfers_but_not_lookups() {
        let (mut s, t0) = scheduler(ResolverConfig {
            max_connections: 1,
            max_connections_per_server: 1,
            ..Default::default()
        });
        let (requester, mut rx) = Requester::new();
        submit(&mut s, server(1), "zone.test", RecordType::AXFR, Some(&requester));

        let a = assigned(s.activate(0, t0));
        s.finish(0, a.id, vec![], Outcome::Fault(Fault::Rcode(Rcode::Refused)), false, t0);
        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Refused))]);

        submit(&mut s, server(1), "zone.test", RecordType::AXFR, Some(&requester));
        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Denied))]);
        assert_eq!(s.stats.snapshot().transfers_denied, 2);

        submit(&mut s, server(1), "www.zone.test", RecordType::A, Some(&requester));
        assert!(matches!(s.activate(0, t0), Activation::Assign(_)));
    }

    #[test]
    fn cancel_detaches_and_aborts_sole_requester() {
        let (mut s, t0) = scheduler(config(2));
        let (first, mut rx1) = Requester::new();
        let (second, mut rx2) = Requester::new();
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&first));
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&second));
        submit(&mut s, server(1), "b.test", RecordType::A, Some(&first));
        let mut shared = assigned(s.activate(0, t0));
        let mut solo = assigned(s.activate(1, t0));

        s.cancel(first.id());

        assert!(shared.abort.try_recv().is_err());
        assert!(solo.abort.try_recv().is_ok());

        s.finish(1, solo.id, vec![], Outcome::Aborted, false, t0);
        s.finish(0, shared.id, vec![a_record("a.test")], Outcome::Answered(Rcode::NoError), true, t0);

        assert!(drain(&mut rx1).is_empty());
        assert_eq!(drain(&mut rx2).last(), Some(&Answer::End(Status::Answered)));
        s.assert_caps();
    }

    #[test]
    fn cancelled_question_is_not_resent_after_connect_failure() {
        let (mut s, t0) = scheduler(config(1));
        let (requester, mut rx) = Requester::new();
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&requester));
        let a = assigned(s.activate(0, t0));

        s.cancel(requester.id());
        s.finish(0, a.id, vec![], Outcome::Fault(Fault::Connect("refused".into())), false, t0);

        assert!(s.queue.is_empty());
        assert!(matches!(s.activate(0, t0), Activation::Wait));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(s.ledger.get(server(1)).map(|e| e.budget), Some(3));
    }

    #[test]
    fn reconfigure_moves_healthy_servers_to_new_budget() {
        let (mut s, t0) = scheduler(config(1));
        submit(&mut s, server(1), "a.test", RecordType::A, None);
        let a = assigned(s.activate(0, t0));
        s.finish(0, a.id, vec![], Outcome::Answered(Rcode::NoError), true, t0);

        s.reconfigure(
            ResolverConfig {
                max_connections: 1,
                max_connections_per_server: 8,
                ..Default::default()
            },
            t0,
        );
        assert!(matches!(
            s.activate(0, t0 + Duration::from_secs(30)),
            Activation::Disconnect
        ));

        assert!(s.snapshot().servers.is_empty());
    }

    #[test]
    fn cancel_unknown_requester_is_noop() {
        let (mut s, _) = scheduler(config(1));
        let (stranger, _rx) = Requester::new();

        s.cancel(stranger.id());
        s.cancel(stranger.id());

        assert_eq!(s.snapshot().queued, 0);
    }

    #[test]
    fn suspended_scheduler_assigns_nothing() {
        let (mut s, t0) = scheduler(config(1));
        submit(&mut s, server(1), "a.test", RecordType::A, None);

        s.set_suspended(true);
        assert!(matches!(s.activate(0, t0), Activation::Wait));

        s.set_suspended(false);
        assert!(matches!(s.activate(0, t0), Activation::Assign(_)));
    }

    #[test]
    fn stop_fails_queued_and_refuses_new_work() {
        let (mut s, t0) = scheduler(config(1));
        let (requester, mut rx) = Requester::new();
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&requester));
        submit(&mut s, server(1), "b.test", RecordType::A, Some(&requester));
        let a = assigned(s.activate(0, t0));

        s.begin_stop();
        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Stopped))]);

        submit(&mut s, server(1), "c.test", RecordType::A, Some(&requester));
        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Stopped))]);

        s.finish(0, a.id, vec![], Outcome::Answered(Rcode::NxDomain), true, t0);
        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Empty(Rcode::NxDomain))]);
    }

    #[test]
    fn timeout_after_query_fails_without_retry() {
        let (mut s, t0) = scheduler(config(1));
        let (requester, mut rx) = Requester::new();
        submit(&mut s, server(1), "a.test", RecordType::A, Some(&requester));

        let a = assigned(s.activate(0, t0));
        s.finish(0, a.id, vec![], Outcome::Fault(Fault::Timeout), false, t0);

        assert_eq!(drain(&mut rx), vec![Answer::End(Status::Failed(Failure::Timeout))]);
        assert_eq!(s.ledger.get(server(1)).unwrap().budget, 3);
        assert!(s.queue.is_empty());
    }

    #[test]
    fn shrinking_retires_extra_slots() {
        let (mut s, t0) = scheduler(config(3));
        submit(&mut s, server(1), "a.test", RecordType::A, None);

        let slots = s.reconfigure(config(1), t0);

        assert_eq!(slots, 1);
        assert!(matches!(s.activate(2, t0), Activation::Wait));
        assert!(matches!(s.activate(0, t0), Activation::Assign(_)));
    }
}
