//! Pending questions, partitioned per server.
//!
//! Within a server, high-priority questions are served before normal ones
//! and each class is FIFO. Nothing orders questions across servers; that is
//! the scheduler's call.

use std::collections::VecDeque;
use std::net::SocketAddr;

use rustc_hash::FxHashMap;

use crate::dispatch::RequesterId;
use crate::message::QuestionRecord;
use crate::question::{Question, QuestionId};

#[derive(Default)]
struct ServerQueue {
    high: VecDeque<QuestionId>,
    normal: VecDeque<QuestionId>,
}

impl ServerQueue {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn iter(&self) -> impl Iterator<Item = &QuestionId> {
        self.high.iter().chain(self.normal.iter())
    }

    fn remove(&mut self, id: QuestionId) {
        self.high.retain(|q| *q != id);
        self.normal.retain(|q| *q != id);
    }
}

#[derive(Default)]
pub(crate) struct QueryQueue {
    questions: FxHashMap<QuestionId, Question>,
    servers: FxHashMap<SocketAddr, ServerQueue>,
    coalesce: FxHashMap<(SocketAddr, QuestionRecord), QuestionId>,
}

impl QueryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Number of questions queued for a server.
    pub fn depth(&self, server: SocketAddr) -> usize {
        self.servers.get(&server).map_or(0, ServerQueue::len)
    }

    /// Servers with at least one queued question.
    pub fn servers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.servers
            .iter()
            .filter(|(_, q)| q.len() > 0)
            .map(|(addr, _)| *addr)
    }

    pub fn push(&mut self, question: Question) {
        let id = question.id;
        let queue = self.servers.entry(question.server).or_default();
        if question.high_priority {
            queue.high.push_back(id);
        } else {
            queue.normal.push_back(id);
        }
        if question.kind.coalesces() {
            // An identical question already queued keeps the index.
            self.coalesce.entry(question.key()).or_insert(id);
        }
        self.questions.insert(id, question);
    }

    /// A queued question an identical new one can ride along with.
    pub fn find_coalescable(&self, server: SocketAddr, record: &QuestionRecord) -> Option<QuestionId> {
        self.coalesce.get(&(server, record.clone())).copied()
    }

    pub fn get_mut(&mut self, id: QuestionId) -> Option<&mut Question> {
        self.questions.get_mut(&id)
    }

    /// Move a normal question to the back of its server's priority line.
    pub fn promote(&mut self, id: QuestionId) {
        let Some(question) = self.questions.get_mut(&id) else {
            return;
        };
        if question.high_priority {
            return;
        }
        question.high_priority = true;
        if let Some(queue) = self.servers.get_mut(&question.server) {
            queue.normal.retain(|q| *q != id);
            queue.high.push_back(id);
        }
    }

    pub fn remove(&mut self, id: QuestionId) -> Option<Question> {
        let question = self.questions.remove(&id)?;
        if let Some(queue) = self.servers.get_mut(&question.server) {
            queue.remove(id);
            if queue.len() == 0 {
                self.servers.remove(&question.server);
            }
        }
        if self.coalesce.get(&question.key()) == Some(&id) {
            self.coalesce.remove(&question.key());
        }
        Some(question)
    }

    /// Whether any queued question for the server passes `accept`.
    pub fn has_match(&self, server: SocketAddr, mut accept: impl FnMut(&Question) -> bool) -> bool {
        self.servers.get(&server).is_some_and(|queue| {
            queue
                .iter()
                .filter_map(|id| self.questions.get(id))
                .any(|q| accept(q))
        })
    }

    /// Take the oldest question for the server that passes `accept`,
    /// high priority first.
    pub fn take_next(
        &mut self,
        server: SocketAddr,
        mut accept: impl FnMut(&Question) -> bool,
    ) -> Option<Question> {
        let id = self
            .servers
            .get(&server)?
            .iter()
            .find(|id| self.questions.get(*id).is_some_and(|q| accept(q)))
            .copied()?;
        self.remove(id)
    }

    /// Remove every question for a server that passes `accept`.
    pub fn drain_server(
        &mut self,
        server: SocketAddr,
        mut accept: impl FnMut(&Question) -> bool,
    ) -> Vec<Question> {
        let ids: Vec<QuestionId> = match self.servers.get(&server) {
            Some(queue) => queue
                .iter()
                .filter(|id| self.questions.get(*id).is_some_and(|q| accept(q)))
                .copied()
                .collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove everything, oldest first per server.
    pub fn drain_all(&mut self) -> Vec<Question> {
        let mut ids: Vec<QuestionId> = self.questions.keys().copied().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Detach a requester from every queued question. Questions left with
    /// no requester are removed and returned.
    pub fn detach_requester(&mut self, requester: RequesterId) -> Vec<Question> {
        let orphaned: Vec<QuestionId> = self
            .questions
            .values_mut()
            .filter_map(|q| (q.detach(requester) && q.requesters.is_empty()).then_some(q.id))
            .collect();
        orphaned.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
