//! Dump per-participant metrics from a study database as JSON.
//!
//! Usage:
//!   cargo run --bin metrics_dump -- [study.sqlite] [PARTICIPANT_ID]
//!
//! Without a participant id every participant is dumped, keyed by id.

use anyhow::{Context, Result};
use choice_study::config::Config;
use choice_study::service::StudyService;
use choice_study::store::SqliteStore;
use serde_json::{Map, Value};

fn main() -> Result<()> {
    let mut cfg = Config::from_env();
    let mut args = std::env::args().skip(1);
    if let Some(path) = args.next() {
        cfg.sqlite_path = path;
    }
    let only = args.next();

    let store = SqliteStore::open(&cfg.sqlite_path)
        .with_context(|| format!("opening {}", cfg.sqlite_path))?;
    let svc = StudyService::new(cfg, store);

    let ids = match only {
        Some(id) => vec![id],
        None => svc.list_participants()?,
    };

    let mut out = Map::new();
    for id in ids {
        let metrics = svc.get_metrics(&id).with_context(|| format!("metrics for {}", id))?;
        let earnings = svc.get_earnings(&id)?;
        out.insert(
            id,
            serde_json::json!({
                "earnings": earnings,
                "metrics": metrics,
            }),
        );
    }

    println!("{}", serde_json::to_string_pretty(&Value::Object(out))?);
    Ok(())
}
