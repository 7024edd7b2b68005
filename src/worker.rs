//! The per-slot worker task.
//!
//! A worker owns at most one connection and runs one exchange at a time.
//! It never decides what to do next; it waits for a [`Directive`] and
//! reports back to the resolver actor.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::events::SlotStatus;
use crate::message::{self, Header, QuestionRecord, Rcode, Record};
use crate::question::{QueryKind, QuestionId};
use crate::scheduler::{Assignment, Outcome};
use crate::session::{Fault, Session};
use crate::stats::Stats;
use crate::transport::{Connector, Transport};

#[derive(Debug)]
pub(crate) enum Directive {
    Exchange(Assignment),
    /// Close the connection, if any.
    Disconnect,
    /// Close the connection and end the task.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Report {
    Status {
        slot: usize,
        status: SlotStatus,
    },
    /// Records of a zone transfer that has not finished yet.
    Progress {
        slot: usize,
        id: QuestionId,
        records: Vec<Record>,
    },
    Finished {
        slot: usize,
        id: QuestionId,
        records: Vec<Record>,
        outcome: Outcome,
        /// Whether the worker still holds its connection.
        connected: bool,
    },
}

struct Job {
    id: QuestionId,
    server: SocketAddr,
    record: QuestionRecord,
    kind: QueryKind,
    connect_timeout: Duration,
    receive_timeout: Duration,
}

pub(crate) struct Worker<C: Connector> {
    slot: usize,
    connector: Arc<C>,
    stats: Arc<Stats>,
    directives: mpsc::UnboundedReceiver<Directive>,
    reports: mpsc::UnboundedSender<Report>,
    connection: Option<(SocketAddr, C::Transport)>,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        slot: usize,
        connector: Arc<C>,
        stats: Arc<Stats>,
        directives: mpsc::UnboundedReceiver<Directive>,
        reports: mpsc::UnboundedSender<Report>,
    ) -> Self {
        Self {
            slot,
            connector,
            stats,
            directives,
            reports,
            connection: None,
        }
    }

    pub async fn run(mut self) {
        trace!(slot = self.slot, "worker started");
        while let Some(directive) = self.directives.recv().await {
            match directive {
                Directive::Exchange(assignment) => self.exchange(assignment).await,
                Directive::Disconnect => self.disconnect().await,
                Directive::Shutdown => break,
            }
        }
        self.disconnect().await;
        trace!(slot = self.slot, "worker exiting");
    }

    async fn exchange(&mut self, assignment: Assignment) {
        let Assignment {
            id,
            server,
            record,
            kind,
            connect_timeout,
            receive_timeout,
            mut abort,
        } = assignment;
        let job = Job {
            id,
            server,
            record,
            kind,
            connect_timeout,
            receive_timeout,
        };

        let result = {
            let work = AssertUnwindSafe(self.perform(&job)).catch_unwind();
            tokio::select! {
                // A dropped sender is not an abort.
                Ok(()) = &mut abort => None,
                result = work => Some(result),
            }
        };

        let (records, outcome) = match result {
            None => {
                debug!(slot = self.slot, %id, "exchange aborted");
                self.drop_connection();
                (Vec::new(), Outcome::Aborted)
            }
            Some(Err(panic)) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".into());
                warn!(slot = self.slot, %id, %reason, "exchange panicked");
                self.drop_connection();
                (Vec::new(), Outcome::Fault(Fault::Internal(reason)))
            }
            Some(Ok(Ok((records, rcode)))) => (records, Outcome::Answered(rcode)),
            Some(Ok(Err(fault))) => {
                // An error code leaves the stream in a known state.
                if !matches!(fault, Fault::Rcode(_)) {
                    self.disconnect().await;
                }
                (Vec::new(), Outcome::Fault(fault))
            }
        };

        let _ = self.reports.send(Report::Finished {
            slot: self.slot,
            id,
            records,
            outcome,
            connected: self.connection.is_some(),
        });
    }

    /// Run one exchange. Returns the final batch of records.
    async fn perform(&mut self, job: &Job) -> Result<(Vec<Record>, Rcode), Fault> {
        let slot = self.slot;
        let reports = self.reports.clone();
        let stats = self.stats.clone();
        let status = |status| {
            let _ = reports.send(Report::Status { slot, status });
        };

        if !self.is_connected_to(job.server) {
            self.disconnect().await;
            status(SlotStatus::Connecting);
            self.connect(job.server, job.connect_timeout).await?;
        }
        let Some((_, transport)) = self.connection.as_mut() else {
            return Err(Fault::Internal("connection missing after connect".into()));
        };

        let txid = loop {
            let id: u16 = rand::random();
            if id != 0 {
                break id;
            }
        };
        let query = message::encode(
            &Header::query(txid),
            std::slice::from_ref(&job.record),
            &[],
        );
        transport
            .send(&query)
            .await
            .map_err(|e| Fault::Send(e.to_string()))?;
        stats.record_sent(query.len());
        status(SlotStatus::Sent);
        trace!(slot, id = %job.id, server = %job.server, txid, "query sent");

        let mut session = Session::new(txid, job.record.clone(), job.kind);
        let mut answering = false;
        loop {
            let bytes = match timeout(job.receive_timeout, transport.receive()).await {
                Err(_) => match session.up_to_date() {
                    Some(rcode) => {
                        trace!(slot, id = %job.id, "zone up to date");
                        return Ok((Vec::new(), rcode));
                    }
                    None => return Err(Fault::Timeout),
                },
                Ok(Err(e)) => return Err(Fault::Receive(e.to_string())),
                Ok(Ok(None)) => match session.up_to_date() {
                    Some(rcode) => {
                        trace!(slot, id = %job.id, "zone up to date, server closed");
                        self.drop_connection();
                        return Ok((Vec::new(), rcode));
                    }
                    None => return Err(Fault::Closed),
                },
                Ok(Ok(Some(bytes))) => bytes,
            };
            stats.record_bytes_received(bytes.len());
            if !answering {
                answering = true;
                status(SlotStatus::Answering);
            }

            let msg = session.accept(&bytes)?;
            let step = session.absorb(msg)?;
            stats.record_answer(step.records.len());
            if step.done {
                trace!(slot, id = %job.id, records = session.delivered(), "exchange complete");
                return Ok((step.records, step.rcode));
            }
            if !step.records.is_empty() {
                let _ = reports.send(Report::Progress {
                    slot,
                    id: job.id,
                    records: step.records,
                });
            }
        }
    }

    fn is_connected_to(&self, server: SocketAddr) -> bool {
        matches!(&self.connection, Some((current, _)) if *current == server)
    }

    async fn connect(&mut self, server: SocketAddr, limit: Duration) -> Result<(), Fault> {
        match timeout(limit, self.connector.open(server)).await {
            Ok(Ok(transport)) => {
                self.stats.record_connect();
                debug!(slot = self.slot, %server, "connected");
                self.connection = Some((server, transport));
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.record_connect_failure();
                Err(Fault::Connect(e.to_string()))
            }
            Err(_) => {
                self.stats.record_connect_failure();
                Err(Fault::Connect("connect timed out".into()))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some((server, transport)) = self.connection.take() {
            debug!(slot = self.slot, %server, "disconnecting");
            transport.close().await;
        }
    }

    /// Forget the connection without a graceful close.
    fn drop_connection(&mut self) {
        self.connection = None;
    }
}
