//! dnsq - Concurrent DNS query scheduler.
//!
//! Issues many simultaneous questions, zone transfers included, against many
//! name servers while bounding connections globally and per server, keeping
//! servers fairly served and folding identical questions into one exchange.
//!
//! ```no_run
//! use dnsq::{Answer, QuestionRecord, RecordType, Requester, Resolver, ResolverConfig};
//! use dnsq::transport::TcpConnector;
//!
//! # async fn demo() -> dnsq::Result<()> {
//! let resolver = Resolver::new(ResolverConfig::default(), TcpConnector)?;
//! let (requester, mut answers) = Requester::new();
//! let question = QuestionRecord::new("example.com", RecordType::MX)?;
//! resolver.submit("192.0.2.53:53".parse().unwrap(), question, false, Some(&requester));
//!
//! while let Some(delivery) = answers.recv().await {
//!     match delivery.answer {
//!         Answer::Record(record) => println!("{}", record),
//!         Answer::End(status) => {
//!             println!("{:?}", status);
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod question;
pub mod resolver;
pub mod stats;
pub mod transport;

mod ledger;
mod queue;
mod scheduler;
mod session;
mod worker;

pub use config::ResolverConfig;
pub use dispatch::{Answer, Delivery, Failure, Requester, RequesterId, Status};
pub use error::{Error, Result};
pub use events::{Event, SlotStatus};
pub use message::{QuestionRecord, Rcode, Record, RecordType};
pub use question::{QueryKind, QuestionId};
pub use resolver::Resolver;
pub use scheduler::{ServerSnapshot, Snapshot};
pub use stats::StatsSnapshot;
