//! Validation of the messages received during one exchange.

use crate::dispatch::Failure;
use crate::message::{self, Message, QuestionRecord, Rcode, Record, RecordType};
use crate::question::QueryKind;

/// Why an exchange was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    Connect(String),
    Send(String),
    Receive(String),
    Timeout,
    /// The server closed the connection before the answer was complete.
    Closed,
    Malformed(String),
    Truncated,
    Rcode(Rcode),
    /// The exchange panicked.
    Internal(String),
}

impl Fault {
    /// Faults raised before the question reached the server.
    pub fn before_query(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Send(_))
    }

    /// Faults that count against the server's connection budget.
    pub fn charges_budget(&self) -> bool {
        !matches!(self, Self::Rcode(_) | Self::Internal(_))
    }

    pub fn failure(&self) -> Failure {
        match self {
            Self::Connect(_) => Failure::Unreachable,
            Self::Send(e) | Self::Receive(e) => Failure::Io(e.clone()),
            Self::Timeout => Failure::Timeout,
            Self::Closed => Failure::Closed,
            Self::Malformed(reason) => Failure::Malformed(reason.clone()),
            Self::Truncated => Failure::Truncated,
            Self::Rcode(Rcode::Refused) => Failure::Refused,
            Self::Rcode(rcode) => Failure::ServerFailure(*rcode),
            Self::Internal(reason) => Failure::Internal(reason.clone()),
        }
    }
}

/// Records extracted from one message.
#[derive(Debug)]
pub(crate) struct Step {
    pub records: Vec<Record>,
    pub done: bool,
    pub rcode: Rcode,
}

/// State of one exchange, from the first response to the last.
pub(crate) struct Session {
    id: u16,
    question: QuestionRecord,
    kind: QueryKind,
    established: bool,
    opening_soa: Option<Record>,
    soas_seen: usize,
    delivered: usize,
    /// Set while an IXFR has produced nothing but its opening SOA.
    lone_soa: Option<Rcode>,
}

impl Session {
    pub fn new(id: u16, question: QuestionRecord, kind: QueryKind) -> Self {
        Self {
            id,
            question,
            kind,
            established: false,
            opening_soa: None,
            soas_seen: 0,
            delivered: 0,
            lone_soa: None,
        }
    }

    /// Decode and validate a received message.
    pub fn accept(&mut self, bytes: &[u8]) -> Result<Message, Fault> {
        let msg = message::decode(bytes)
            .ok_or_else(|| Fault::Malformed("undecodable message".into()))?;
        let header = &msg.header;

        if !header.response {
            return Err(Fault::Malformed("not a response".into()));
        }
        let continuation = self.established && self.kind == QueryKind::ZoneTransfer;
        if header.id != self.id && !(continuation && header.id == 0) {
            return Err(Fault::Malformed(format!(
                "transaction id {} does not match {}",
                header.id, self.id
            )));
        }
        if msg.questions.len() > 1 {
            return Err(Fault::Malformed("more than one question".into()));
        }
        if let Some(q) = msg.questions.first() {
            if *q != self.question {
                return Err(Fault::Malformed(format!("answers {} instead", q)));
            }
        } else if !self.established {
            return Err(Fault::Malformed("question section missing".into()));
        }
        if header.truncated && self.kind != QueryKind::ZoneTransfer {
            return Err(Fault::Truncated);
        }
        if header.rcode.is_hard_error() {
            return Err(Fault::Rcode(header.rcode));
        }

        self.established = true;
        Ok(msg)
    }

    /// Pick the records to deliver and tell whether the exchange is over.
    pub fn absorb(&mut self, msg: Message) -> Result<Step, Fault> {
        let rcode = msg.header.rcode;
        let step = match self.kind {
            QueryKind::Lookup => Step {
                records: msg.answers,
                done: true,
                rcode,
            },
            QueryKind::Discovery => {
                let records = if msg.answers.is_empty() {
                    msg.authority.into_iter().chain(msg.additional).collect()
                } else {
                    msg.answers
                };
                Step {
                    records,
                    done: true,
                    rcode,
                }
            }
            QueryKind::ZoneTransfer => self.absorb_transfer(msg.answers, rcode)?,
        };
        self.delivered += step.records.len();
        Ok(step)
    }

    fn absorb_transfer(&mut self, answers: Vec<Record>, rcode: Rcode) -> Result<Step, Fault> {
        let first_message = self.opening_soa.is_none();
        if first_message && answers.is_empty() {
            // NXDOMAIN or an empty NOERROR: nothing to transfer.
            return Ok(Step {
                records: Vec::new(),
                done: true,
                rcode,
            });
        }

        self.lone_soa = None;
        let lone_soa = first_message
            && self.question.qtype == RecordType::IXFR
            && answers.len() == 1;

        let mut records = Vec::with_capacity(answers.len());
        for record in answers {
            let Some(opening) = &self.opening_soa else {
                if record.rtype != RecordType::SOA {
                    return Err(Fault::Malformed("zone transfer must begin with SOA".into()));
                }
                self.opening_soa = Some(record.clone());
                records.push(record);
                continue;
            };

            let terminates = if record.rtype == RecordType::SOA {
                self.soas_seen += 1;
                // AXFR repeats the opening SOA once. IXFR pairs old and new
                // SOAs per difference, so only an odd repeat ends the stream.
                record.data == opening.data && self.soas_seen % 2 == 1
            } else {
                false
            };
            records.push(record);
            if terminates {
                return Ok(Step {
                    records,
                    done: true,
                    rcode,
                });
            }
        }

        // Either "up to date" or the first part of a longer answer; the
        // next message or the end of the stream tells which.
        if lone_soa {
            self.lone_soa = Some(rcode);
        }
        Ok(Step {
            records,
            done: false,
            rcode,
        })
    }

    /// The rcode of a lone-SOA IXFR answer nothing has followed yet.
    /// Once the server goes quiet or closes, the zone is up to date.
    pub fn up_to_date(&self) -> Option<Rcode> {
        self.lone_soa
    }

    /// Records delivered so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}
