//! Acceptance harness for fixgate.
//!
//! Runs either side of a FIX conversation over real TCP:
//!
//! * `--listen` hosts an engine behind a minimal TCP transport collaborator
//!   (the socket glue the library deliberately does not own).
//! * without `--listen`, acts as a scripted counterparty: logon, a few
//!   orders, a resend request, logout; every inbound frame is printed.

use clap::Parser;
use fixgate::fix::decode::parse_message;
use fixgate::fix::encode::MessageBuilder;
use fixgate::fix::fields::Tags;
use fixgate::fix::mem::MsgBuf;
use fixgate::fix::message::Message;
use fixgate::fix::store::MessageStore;
use fixgate::fix::vec_store::VecStore;
use fixgate::{
    ApplicationHandler, ApplicationRouter, BusinessReject, ConnId, Engine, EngineConfig,
    TransportSink,
};

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = s.parse()?;
    Ok(Duration::from_secs(seconds))
}

#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// CompID of this side
    #[arg(short, long)]
    comp_id: String,

    /// CompID of the peer (client mode only)
    #[arg(short, long, default_value = "EXCH")]
    target_comp_id: String,

    /// Address to listen on or connect to
    #[arg(short, long)]
    addr: SocketAddr,

    /// Listen (opposite is connect-and-run-script)
    #[arg(short, long)]
    listen: bool,

    /// SQLite store path; omit for the in-memory store
    #[arg(short = 'r', long)]
    store: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30", value_parser = parse_duration)]
    heartbeat: Duration,
}

/// Outbound half of the transport: one writer channel per connection.
#[derive(Default)]
struct TcpSink {
    writers: Mutex<HashMap<ConnId, mpsc::Sender<Vec<u8>>>>,
}

impl TcpSink {
    fn register(&self, conn: ConnId, tx: mpsc::Sender<Vec<u8>>) {
        self.writers.lock().unwrap().insert(conn, tx);
    }
}

#[async_trait::async_trait]
impl TransportSink for TcpSink {
    async fn send(&self, conn: ConnId, bytes: Vec<u8>) -> std::io::Result<()> {
        let tx = {
            let writers = self.writers.lock().unwrap();
            writers.get(&conn).cloned()
        };
        match tx {
            Some(tx) => tx
                .send(bytes)
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer gone")),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection has no writer",
            )),
        }
    }

    async fn close(&self, conn: ConnId) {
        self.writers.lock().unwrap().remove(&conn);
    }
}

/// Answers every NewOrderSingle with a filled ExecutionReport.
#[derive(Default)]
struct FillEverything {
    exec_counter: AtomicU64,
}

#[async_trait::async_trait]
impl ApplicationHandler for FillEverything {
    async fn on_message(
        &self,
        session_id: &str,
        msg: Message,
    ) -> Result<Vec<MessageBuilder>, BusinessReject> {
        let exec_id = self.exec_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let qty = msg.get(Tags::OrderQty).unwrap_or(b"0").to_vec();
        info!(session = session_id, exec_id, "filling order");
        let fill = MessageBuilder::new("FIX.4.4", '8')
            .push(Tags::OrderID, format!("o-{exec_id}").as_bytes())
            .push(Tags::ExecID, format!("e-{exec_id}").as_bytes())
            .push(Tags::ExecType, b"F")
            .push(Tags::OrdStatus, b"2")
            .push(Tags::Symbol, msg.get(Tags::Symbol).unwrap_or(b"?"))
            .push(Tags::LeavesQty, b"0")
            .push(Tags::CumQty, &qty);
        Ok(vec![fill])
    }
}

async fn run_acceptor(opts: Opts) -> Result<()> {
    let config = EngineConfig::builder()
        .with_comp_id(&opts.comp_id)
        .with_default_heartbeat_secs(opts.heartbeat.as_secs() as u32)
        .build()?;
    let outbound_depth = config.outbound_queue_depth as usize;

    let store: Arc<dyn MessageStore> = match &opts.store {
        Some(path) => Arc::new(fixgate::fix::sqlite_store::SqliteStore::open(path).await?),
        None => Arc::new(VecStore::new()),
    };

    let router = ApplicationRouter::new().register('D', Arc::new(FillEverything::default()));
    let sink = Arc::new(TcpSink::default());
    let handle = Engine::new(config, store, sink.clone())
        .with_router(router)
        .start();

    let listener = TcpListener::bind(opts.addr).await?;
    info!(addr = %opts.addr, "listening");

    let acceptor = {
        let handle = handle.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let mut next_conn: ConnId = 0;
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                stream.set_nodelay(true).ok();
                next_conn += 1;
                let conn = next_conn;
                info!(conn, %peer, "accepted");

                let (mut read_half, mut write_half) = stream.into_split();
                let (wtx, mut wrx) = mpsc::channel::<Vec<u8>>(outbound_depth);
                sink.register(conn, wtx);

                tokio::spawn(async move {
                    while let Some(bytes) = wrx.recv().await {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    let _ = write_half.shutdown().await;
                });

                if let Err(e) = handle.deliver_connect(conn, Some(peer.to_string())).await {
                    error!(conn, error = %e, "engine refused connection");
                    continue;
                }
                let handle = handle.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match read_half.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if handle.deliver_bytes(conn, &buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    handle.deliver_disconnect(conn).await;
                });
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    acceptor.abort();
    handle.stop(Duration::from_secs(5)).await;
    Ok(())
}

/// Scripted counterparty: logon, two orders, a resend request for the whole
/// outbound stream, then logout.
async fn run_script(opts: Opts) -> Result<()> {
    let mut stream = TcpStream::connect(opts.addr).await?;
    stream.set_nodelay(true)?;
    let mut seq = 0u32;
    let mut next = |b: MessageBuilder| {
        seq += 1;
        let mut buf = Vec::new();
        b.build(&mut buf, seq, &opts.comp_id, &opts.target_comp_id, Utc::now())
            .map(|_| buf)
    };

    let heartbeat = opts.heartbeat.as_secs().to_string();
    let logon = next(
        MessageBuilder::new("FIX.4.4", 'A')
            .push(Tags::EncryptMethod, b"0")
            .push(Tags::HeartBtInt, heartbeat.as_bytes()),
    )?;
    stream.write_all(&logon).await?;
    read_and_print(&mut stream, "logon reply").await?;

    for (cl_ord_id, qty) in [("ord-1", "100"), ("ord-2", "250")] {
        let order = next(
            MessageBuilder::new("FIX.4.4", 'D')
                .push(Tags::ClOrdID, cl_ord_id.as_bytes())
                .push(Tags::Symbol, b"MSFT")
                .push(Tags::Side, b"1")
                .push(Tags::OrderQty, qty.as_bytes())
                .push(Tags::OrdType, b"1"),
        )?;
        stream.write_all(&order).await?;
        read_and_print(&mut stream, "fill").await?;
    }

    let resend = next(
        MessageBuilder::new("FIX.4.4", '2')
            .push(Tags::BeginSeqNo, b"1")
            .push(Tags::EndSeqNo, b"0"),
    )?;
    stream.write_all(&resend).await?;
    read_and_print(&mut stream, "replay").await?;

    let logout = next(MessageBuilder::new("FIX.4.4", '5'))?;
    stream.write_all(&logout).await?;
    read_and_print(&mut stream, "logout reply").await?;
    Ok(())
}

async fn read_and_print(stream: &mut TcpStream, label: &str) -> Result<()> {
    let mut buf = [0u8; 8192];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;
    let mut at = 0;
    // frames can coalesce into one read; split after each checksum trailer
    while at < n {
        let end = match buf[at..n].windows(4).position(|w| w == b"\x0110=") {
            Some(p) => (at + p + 8).min(n),
            None => n,
        };
        match parse_message(&buf[at..end]) {
            Ok(msg) => info!(
                label,
                msg_type = ?msg.msg_type(),
                seq = ?msg.msg_seq_num(),
                frame = ?MsgBuf(buf[at..end].to_vec()),
            ),
            Err(e) => warn!(label, error = %e, "unparseable frame"),
        }
        at = end;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    if opts.listen {
        run_acceptor(opts).await
    } else {
        run_script(opts).await
    }
}
