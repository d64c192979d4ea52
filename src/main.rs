//! Study server: newline-delimited JSON RPC over TCP.
//!
//! Each connection may send any number of requests, one JSON object per
//! line. Store work runs on the blocking pool so a slow SQLite commit never
//! stalls the accept loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use choice_study::config::Config;
use choice_study::logging::{log, log_session_summary, obj, tick_aggregator, v_num, v_str, Domain, Level};
use choice_study::rpc::handle_line;
use choice_study::service::StudyService;
use choice_study::store::SqliteStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, Duration};

type Service = StudyService<SqliteStore>;

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
}

async fn serve_connection(stream: TcpStream, svc: Arc<Service>, counters: Arc<Counters>) -> Result<()> {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let svc = Arc::clone(&svc);
        let reply = tokio::task::spawn_blocking(move || handle_line(&*svc, &line)).await?;

        counters.requests.fetch_add(1, Ordering::Relaxed);
        if reply.starts_with(r#"{"ok":false"#) {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }

    log(Level::Debug, Domain::Rpc, "connection_closed", obj(&[("peer", v_str(&peer))]));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = SqliteStore::open(&cfg.sqlite_path)?;
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    log(
        Level::Info,
        Domain::System,
        "server_started",
        obj(&[
            ("listen_addr", v_str(&cfg.listen_addr)),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("reward_cents", v_num(cfg.reward_cents as f64)),
            ("max_earnings_cents", v_num(cfg.max_earnings_cents as f64)),
        ]),
    );

    let svc = Arc::new(StudyService::new(cfg, store));
    let counters = Arc::new(Counters::default());
    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log(Level::Warn, Domain::Rpc, "accept_failed", obj(&[("msg", v_str(&err.to_string()))]));
                        continue;
                    }
                };
                log(Level::Debug, Domain::Rpc, "connection_opened", obj(&[("peer", v_str(&addr.to_string()))]));
                let svc = Arc::clone(&svc);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, svc, counters).await {
                        log(Level::Warn, Domain::Rpc, "connection_error", obj(&[("msg", v_str(&err.to_string()))]));
                    }
                });
            }
            _ = ticker.tick() => tick_aggregator(),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    log_session_summary(
        started.elapsed().as_secs(),
        counters.requests.load(Ordering::Relaxed),
        counters.failures.load(Ordering::Relaxed),
    );
    Ok(())
}
