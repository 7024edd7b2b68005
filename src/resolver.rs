//! The public resolver handle.
//!
//! All scheduling state lives in a single actor task. The [`Resolver`]
//! handle only sends it commands, so every method returns immediately and
//! the handle can be cloned freely. Network I/O happens on the worker
//! tasks, one per slot, never on the actor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::ResolverConfig;
use crate::dispatch::{Answer, Delivery, Failure, Requester, RequesterId, Status};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::message::QuestionRecord;
use crate::scheduler::{Activation, Scheduler, Snapshot, Submission};
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::Connector;
use crate::worker::{Directive, Report, Worker};

/// How often idle slots are re-examined when nothing else happens.
const IDLE_TICK: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 1024;

enum Command {
    Submit(Submission),
    Cancel(RequesterId),
    Retry(SocketAddr),
    Suspend,
    Resume,
    Reconfigure(ResolverConfig),
    Snapshot(oneshot::Sender<Snapshot>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running resolver.
///
/// Dropping every handle stops the resolver the same way [`stop`] does.
///
/// [`stop`]: Resolver::stop
#[derive(Clone)]
pub struct Resolver {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<Stats>,
    events: broadcast::Sender<Event>,
}

impl Resolver {
    /// Start a resolver on the current tokio runtime.
    pub fn new<C: Connector>(config: ResolverConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(Stats::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let actor = Actor::new(
            config,
            Arc::new(connector),
            stats.clone(),
            events.clone(),
            command_rx,
        );
        tokio::spawn(actor.run());

        Ok(Self {
            commands,
            stats,
            events,
        })
    }

    /// Ask `server` a question.
    ///
    /// Without a requester the question is fire-and-forget: it is still
    /// resolved, and shows up in statistics and events.
    pub fn submit(
        &self,
        server: SocketAddr,
        question: QuestionRecord,
        high_priority: bool,
        requester: Option<&Requester>,
    ) {
        self.send_submission(Submission {
            servers: vec![server],
            record: question,
            high_priority,
            requester: requester.cloned(),
        });
    }

    /// Ask every server the same question. Returns the number of
    /// questions submitted.
    pub fn submit_all(
        &self,
        servers: &[SocketAddr],
        question: &QuestionRecord,
        high_priority: bool,
        requester: Option<&Requester>,
    ) -> usize {
        for server in servers {
            self.submit(*server, question.clone(), high_priority, requester);
        }
        servers.len()
    }

    /// Ask the first server, falling back to the next ones in order when
    /// a server cannot answer.
    pub fn submit_any(
        &self,
        servers: &[SocketAddr],
        question: QuestionRecord,
        high_priority: bool,
        requester: Option<&Requester>,
    ) {
        self.send_submission(Submission {
            servers: servers.to_vec(),
            record: question,
            high_priority,
            requester: requester.cloned(),
        });
    }

    fn send_submission(&self, submission: Submission) {
        if let Err(mpsc::error::SendError(Command::Submit(submission))) =
            self.commands.send(Command::Submit(submission))
        {
            fail_stopped(submission);
        }
    }

    /// Withdraw every question of a requester. It receives nothing further.
    pub fn cancel(&self, requester: RequesterId) {
        let _ = self.commands.send(Command::Cancel(requester));
    }

    /// Forget a server's failures so it is tried again.
    pub fn retry_server(&self, server: SocketAddr) {
        let _ = self.commands.send(Command::Retry(server));
    }

    /// Stop handing out new work. Open connections stay open.
    pub fn suspend(&self) {
        let _ = self.commands.send(Command::Suspend);
    }

    /// Undo [`suspend`](Self::suspend) and restart slots whose worker died.
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Apply new limits. Work in flight is not disturbed.
    pub fn reconfigure(&self, config: ResolverConfig) -> Result<()> {
        config.validate()?;
        self.commands
            .send(Command::Reconfigure(config))
            .map_err(|_| Error::Stopped)
    }

    /// Fail queued questions, let exchanges in flight finish, then shut
    /// down. Resolves once everything is closed.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Observe lifecycle events. Slow subscribers lag; they never hold up
    /// resolution.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

fn fail_stopped(submission: Submission) {
    let Some(requester) = submission.requester else {
        return;
    };
    let server = submission
        .servers
        .first()
        .copied()
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    requester.deliver(Delivery {
        server,
        question: submission.record,
        answer: Answer::End(Status::Failed(Failure::Stopped)),
    });
}

struct WorkerHandle {
    directives: mpsc::UnboundedSender<Directive>,
    task: JoinHandle<()>,
}

struct Actor<C: Connector> {
    scheduler: Scheduler,
    connector: Arc<C>,
    stats: Arc<Stats>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    report_tx: mpsc::UnboundedSender<Report>,
    reports: mpsc::UnboundedReceiver<Report>,
    /// One entry per slot. `None` once a worker is shut down or lost.
    workers: Vec<Option<WorkerHandle>>,
    /// Workers told to shut down, awaited before `stop` resolves.
    draining: Vec<JoinHandle<()>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl<C: Connector> Actor<C> {
    fn new(
        config: ResolverConfig,
        connector: Arc<C>,
        stats: Arc<Stats>,
        events: broadcast::Sender<Event>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (report_tx, reports) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(config, stats.clone(), events, Instant::now());
        let mut actor = Self {
            scheduler,
            connector,
            stats,
            commands,
            commands_closed: false,
            report_tx,
            reports,
            workers: Vec::new(),
            draining: Vec::new(),
            stop_waiters: Vec::new(),
        };
        actor.spawn_missing();
        actor
    }

    async fn run(mut self) {
        let mut tick = time::interval(IDLE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.pump();
            if self.scheduler.is_stopping() && self.workers.iter().all(Option::is_none) {
                break;
            }

            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all resolver handles dropped");
                        self.commands_closed = true;
                        self.scheduler.begin_stop();
                    }
                },
                Some(report) = self.reports.recv() => self.on_report(report),
                _ = tick.tick() => {}
            }
        }

        // Refuse anything sent while shutting down.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Submit(submission) => fail_stopped(submission),
                Command::Stop(waiter) => self.stop_waiters.push(waiter),
                _ => {}
            }
        }
        join_all(self.draining.drain(..)).await;

        debug!(stats = ?self.stats.snapshot(), "resolver stopped");
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(submission) => self.scheduler.submit(submission),
            Command::Cancel(requester) => self.scheduler.cancel(requester),
            Command::Retry(server) => self.scheduler.retry_server(server),
            Command::Suspend => {
                debug!("suspending");
                self.scheduler.set_suspended(true);
            }
            Command::Resume => {
                debug!("resuming");
                self.scheduler.set_suspended(false);
                self.spawn_missing();
            }
            Command::Reconfigure(config) => {
                debug!(?config, "reconfiguring");
                self.scheduler.reconfigure(config, Instant::now());
                self.spawn_missing();
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.scheduler.snapshot());
            }
            Command::Stop(waiter) => {
                debug!("stopping");
                self.stop_waiters.push(waiter);
                self.scheduler.begin_stop();
            }
        }
    }

    fn on_report(&mut self, report: Report) {
        match report {
            Report::Status { slot, status } => self.scheduler.set_status(slot, status),
            Report::Progress { slot, id, records } => {
                trace!(slot, %id, records = records.len(), "transfer progress");
                self.scheduler.progress(id, records);
            }
            Report::Finished {
                slot,
                id,
                records,
                outcome,
                connected,
            } => {
                self.scheduler
                    .finish(slot, id, records, outcome, connected, Instant::now());
            }
        }
    }

    /// Start a worker for every live slot that has none.
    fn spawn_missing(&mut self) {
        if self.scheduler.is_stopping() {
            return;
        }
        let now = Instant::now();
        self.workers
            .resize_with(self.scheduler.slot_count(), || None);
        for slot in 0..self.workers.len() {
            if self.scheduler.slot(slot).retiring {
                continue;
            }
            let alive = self.workers[slot]
                .as_ref()
                .is_some_and(|w| !w.task.is_finished());
            if alive {
                continue;
            }
            if self.workers[slot].is_some() {
                warn!(slot, "restarting dead worker");
            }
            self.scheduler.abandon_slot(slot, now);
            self.workers[slot] = Some(self.spawn_worker(slot));
        }
    }

    fn spawn_worker(&self, slot: usize) -> WorkerHandle {
        let (directives, directive_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            slot,
            self.connector.clone(),
            self.stats.clone(),
            directive_rx,
            self.report_tx.clone(),
        );
        WorkerHandle {
            directives,
            task: tokio::spawn(worker.run()),
        }
    }

    /// Give every idle slot a chance to pick up work.
    fn pump(&mut self) {
        let now = Instant::now();
        for slot in 0..self.workers.len() {
            let Some(worker) = &self.workers[slot] else {
                continue;
            };

            if worker.task.is_finished() {
                // Lost outside any exchange; its slot stays down until resumed.
                warn!(slot, "worker died");
                self.scheduler.abandon_slot(slot, now);
                self.workers[slot] = None;
                continue;
            }
            if !self.scheduler.slot(slot).is_idle() {
                continue;
            }
            if self.scheduler.is_stopping() || self.scheduler.slot(slot).retiring {
                self.retire_worker(slot);
                continue;
            }

            match self.scheduler.activate(slot, now) {
                Activation::Assign(assignment) => {
                    if let Err(mpsc::error::SendError(Directive::Exchange(assignment))) =
                        worker.directives.send(Directive::Exchange(assignment))
                    {
                        warn!(slot, "worker gone, requeueing");
                        self.scheduler.unassign(slot, assignment.id);
                        self.workers[slot] = None;
                    }
                }
                Activation::Disconnect => {
                    let _ = worker.directives.send(Directive::Disconnect);
                }
                Activation::Wait => {}
            }
        }
    }

    fn retire_worker(&mut self, slot: usize) {
        self.scheduler.purge_connection(slot);
        if let Some(worker) = self.workers[slot].take() {
            let _ = worker.directives.send(Directive::Shutdown);
            self.draining.push(worker.task);
        }
    }
}
