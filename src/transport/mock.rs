//! In-memory name servers for tests.
//!
//! Each server address gets a scripted [`Behaviour`]. The connector keeps
//! count of connections so tests can check the concurrency limits.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;

use super::{Connector, Transport};
use crate::message::{self, Header, QuestionRecord, Rcode, Record};

#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    /// Every connection attempt fails.
    Refuse,
    /// Answer every query with these records after a delay.
    Answer(Vec<Record>, Duration),
    /// Answer with an error code and no records.
    Rcode(Rcode),
    /// Stream these messages, the first carrying the query id, the rest id 0.
    Transfer(Vec<Vec<Record>>),
    /// Accept queries and never answer.
    Silent,
    /// Reply with a transaction id that does not match.
    WrongId,
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub opened: FxHashMap<SocketAddr, usize>,
    pub open_now: FxHashMap<SocketAddr, usize>,
    pub max_open: FxHashMap<SocketAddr, usize>,
    pub max_total_open: usize,
    pub queries: Vec<(SocketAddr, QuestionRecord)>,
}

impl MockState {
    fn total_open(&self) -> usize {
        self.open_now.values().sum()
    }

    pub fn queries_to(&self, server: SocketAddr) -> usize {
        self.queries.iter().filter(|(s, _)| *s == server).count()
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    behaviours: Arc<Mutex<FxHashMap<SocketAddr, Behaviour>>>,
    pub state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, server: SocketAddr, behaviour: Behaviour) -> &Self {
        self.behaviours.lock().unwrap().insert(server, behaviour);
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn open(&self, server: SocketAddr) -> io::Result<MockTransport> {
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&server)
            .cloned()
            .unwrap_or(Behaviour::Refuse);
        if matches!(behaviour, Behaviour::Refuse) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }

        {
            let mut state = self.state.lock().unwrap();
            *state.opened.entry(server).or_default() += 1;
            let now = {
                let open = state.open_now.entry(server).or_default();
                *open += 1;
                *open
            };
            let max = state.max_open.entry(server).or_default();
            *max = (*max).max(now);
            let total = state.total_open();
            state.max_total_open = state.max_total_open.max(total);
        }

        Ok(MockTransport {
            server,
            behaviour,
            state: self.state.clone(),
            pending: VecDeque::new(),
            delay: Duration::ZERO,
            closed: false,
        })
    }
}

pub(crate) struct MockTransport {
    server: SocketAddr,
    behaviour: Behaviour,
    state: Arc<Mutex<MockState>>,
    pending: VecDeque<Vec<u8>>,
    delay: Duration,
    closed: bool,
}

impl MockTransport {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        if let Some(open) = state.open_now.get_mut(&self.server) {
            *open = open.saturating_sub(1);
        }
    }
}

impl Transport for MockTransport {
    async fn send(&mut self, query: &[u8]) -> io::Result<()> {
        let msg = message::decode(query)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad query"))?;
        let question = msg.questions.first().cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "query without question")
        })?;
        self.state
            .lock()
            .unwrap()
            .queries
            .push((self.server, question.clone()));

        let id = msg.header.id;
        let questions = [question];
        match &self.behaviour {
            Behaviour::Answer(records, delay) => {
                self.delay = *delay;
                self.pending.push_back(message::encode(
                    &Header::response(id, Rcode::NoError),
                    &questions,
                    records,
                ));
            }
            Behaviour::Rcode(rcode) => {
                self.pending
                    .push_back(message::encode(&Header::response(id, *rcode), &questions, &[]));
            }
            Behaviour::Transfer(messages) => {
                for (i, records) in messages.iter().enumerate() {
                    let bytes = if i == 0 {
                        message::encode(&Header::response(id, Rcode::NoError), &questions, records)
                    } else {
                        message::encode(&Header::response(0, Rcode::NoError), &[], records)
                    };
                    self.pending.push_back(bytes);
                }
            }
            Behaviour::WrongId => {
                self.pending.push_back(message::encode(
                    &Header::response(id.wrapping_add(1), Rcode::NoError),
                    &questions,
                    &[],
                ));
            }
            Behaviour::Silent | Behaviour::Refuse => {}
        }
        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.pending.pop_front() {
            Some(bytes) => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(Some(bytes))
            }
            None => std::future::pending().await,
        }
    }

    async fn close(mut self) {
        self.release();
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release();
    }
}
