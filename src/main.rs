use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use dnsq::transport::{Connector, TcpConnector, UdpConnector};
use dnsq::{
    Answer, Error, QuestionRecord, RecordType, Requester, Resolver, ResolverConfig, Result,
    Status, logging,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "dnsq")]
#[command(about = "Ask many name servers many questions at once", long_about = None)]
struct Args {
    /// Name server (ip or ip:port), may be repeated
    #[arg(short, long = "server", default_value = "8.8.8.8:53")]
    servers: Vec<String>,

    /// Record type, e.g. A, MX, AXFR or TYPE65
    #[arg(short = 't', long = "type", default_value = "A")]
    qtype: RecordType,

    /// Query over UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// Ask the servers in turn until one answers, instead of asking all
    #[arg(long)]
    any: bool,

    /// Maximum open connections
    #[arg(long, default_value_t = 30)]
    max_connections: usize,

    /// Maximum open connections per server
    #[arg(long, default_value_t = 4)]
    max_per_server: usize,

    /// Maximum concurrent zone transfers per server
    #[arg(long, default_value_t = 1)]
    max_transfers: usize,

    /// Seconds an idle connection waits for its own server before switching
    #[arg(long, default_value_t = 5)]
    switch_delay: u64,

    /// Seconds before an idle connection is closed
    #[arg(long, default_value_t = 30)]
    disconnect_delay: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Receive timeout in seconds
    #[arg(long, default_value_t = 10)]
    receive_timeout: u64,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Names to look up
    #[arg(required = true)]
    names: Vec<String>,
}

impl Args {
    fn config(&self) -> ResolverConfig {
        ResolverConfig {
            max_connections: self.max_connections,
            max_connections_per_server: self.max_per_server,
            max_transfers_per_server: self.max_transfers,
            switch_delay: Duration::from_secs(self.switch_delay),
            disconnect_delay: Duration::from_secs(self.disconnect_delay),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            receive_timeout: Duration::from_secs(self.receive_timeout),
        }
    }
}

fn parse_server(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| Error::Config(format!("invalid server address: {}", server)))
}

/// Returns true if every question got an answer, even an empty one.
async fn run<C: Connector>(args: &Args, servers: &[SocketAddr], connector: C) -> Result<bool> {
    let resolver = Resolver::new(args.config(), connector)?;
    let (requester, mut answers) = Requester::new();

    let mut pending = 0;
    for name in &args.names {
        let question = QuestionRecord::new(name, args.qtype)?;
        if args.any {
            resolver.submit_any(servers, question, false, Some(&requester));
            pending += 1;
        } else {
            pending += resolver.submit_all(servers, &question, false, Some(&requester));
        }
    }

    let mut all_ok = true;
    while pending > 0 {
        let Some(delivery) = answers.recv().await else {
            break;
        };
        match delivery.answer {
            Answer::Record(record) => println!("{}", record),
            Answer::End(status) => {
                pending -= 1;
                match status {
                    Status::Answered => {}
                    Status::Empty(rcode) => {
                        println!(";; {} @{}: no records ({})", delivery.question, delivery.server, rcode)
                    }
                    Status::Failed(failure) => {
                        all_ok = false;
                        eprintln!(";; {} @{}: {}", delivery.question, delivery.server, failure);
                    }
                }
            }
        }
    }

    resolver.stop().await;
    info!(stats = ?resolver.stats(), "done");
    Ok(all_ok)
}

fn resolve(args: &Args) -> Result<bool> {
    let servers = args
        .servers
        .iter()
        .map(|s| parse_server(s))
        .collect::<Result<Vec<_>>>()?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if args.udp {
        rt.block_on(run(args, &servers, UdpConnector))
    } else {
        rt.block_on(run(args, &servers, TcpConnector))
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    match resolve(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(2)
        }
    }
}
