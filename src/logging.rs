//! Structured logging for the study core.
//!
//! Every record is one JSON line carrying a run id, a monotonic sequence
//! number, level, domain and a `data` payload. Records are mirrored to
//! per-run files under `LOG_DIR/RUN_ID/` (`events.jsonl`, `trace.jsonl`,
//! `metrics.jsonl`) and to stdout unless `LOG_STDOUT=0`. Callers that need
//! a different sink (integration tests, tools) call [`configure`] first.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ledger,   // Rewards, caps, clawbacks
    Schedule, // Schedule generation and extension
    Events,   // Event ingestion
    Metrics,  // Aggregation runs
    Storage,  // Persistence, version conflicts
    Rpc,      // Request dispatch
    System,   // Startup, shutdown
    Profile,  // Timing scopes
    Audit,    // Committed state hashes
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ledger => "ledger",
            Domain::Schedule => "schedule",
            Domain::Events => "events",
            Domain::Metrics => "metrics",
            Domain::Storage => "storage",
            Domain::Rpc => "rpc",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

type Sink = Option<Mutex<BufWriter<File>>>;

#[derive(Debug)]
struct RunContext {
    run_id: String,
    stdout: bool,
    events: Sink,
    trace: Sink,
    metrics: Sink,
}

fn open_sink(path: PathBuf) -> Sink {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

/// Unit test builds keep run files out of the package and stay off stdout.
fn default_log_base() -> PathBuf {
    if cfg!(test) {
        std::env::temp_dir().join("choice-study-runs")
    } else {
        PathBuf::from("out/runs")
    }
}

fn stdout_enabled(raw: Option<&str>) -> bool {
    match raw {
        Some("0") | Some("false") => false,
        Some("1") | Some("true") => true,
        _ => !cfg!(test),
    }
}

fn build_run_context(base: PathBuf, stdout: bool) -> RunContext {
    let run_id = std::env::var("RUN_ID")
        .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
    let run_dir = base.join(&run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
    }

    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
            "log_dir": run_dir.to_string_lossy(),
        })
        .to_string(),
    );

    RunContext {
        events: open_sink(run_dir.join("events.jsonl")),
        trace: open_sink(run_dir.join("trace.jsonl")),
        metrics: open_sink(run_dir.join("metrics.jsonl")),
        run_id,
        stdout,
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let base = std::env::var("LOG_DIR").map(PathBuf::from).unwrap_or_else(|_| default_log_base());
        let stdout = stdout_enabled(std::env::var("LOG_STDOUT").ok().as_deref());
        build_run_context(base, stdout)
    })
}

/// Pins the log directory and stdout mirroring before the first record is
/// written. Returns false when logging was already initialized.
pub fn configure(log_dir: PathBuf, stdout: bool) -> bool {
    let mut installed = false;
    RUN_CONTEXT.get_or_init(|| {
        installed = true;
        build_run_context(log_dir, stdout)
    });
    installed
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["password", "admin_password", "token", "authorization"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["participant_id", "task_key", "op", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Sink, line: &str) {
    if let Some(w) = writer {
        if let Ok(mut w) = w.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if component == "metrics" || event.starts_with("metrics.") {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

// =============================================================================
// Ledger logs
// =============================================================================

pub fn log_task_start(participant_id: &str, task_key: &str, trials_completed: u32, schedule_len: usize) {
    log(
        Level::Info,
        Domain::Ledger,
        "task_start",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("task_key", v_str(task_key)),
            ("trials_completed", json!(trials_completed)),
            ("schedule_len", json!(schedule_len)),
        ]),
    );
}

pub fn log_trial(participant_id: &str, task_key: &str, correct: bool, trials_completed: u32, threshold: u32) {
    log(
        Level::Debug,
        Domain::Ledger,
        "trial",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("task_key", v_str(task_key)),
            ("correct", json!(correct)),
            ("trials_completed", json!(trials_completed)),
            ("threshold", json!(threshold)),
        ]),
    );
    agg_increment("trial");
}

pub fn log_reward(participant_id: &str, task_key: &str, amount: Decimal, total: Decimal) {
    log(
        Level::Info,
        Domain::Ledger,
        "reward",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("task_key", v_str(task_key)),
            ("amount", v_dec(amount)),
            ("total_earnings", v_dec(total)),
        ]),
    );
    agg_increment("reward");
}

/// The cap swallows a reward: not an error, only recorded.
pub fn log_cap_reached(participant_id: &str, task_key: &str, total: Decimal, cap: Decimal) {
    log(
        Level::Warn,
        Domain::Ledger,
        "capacity_exceeded",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("task_key", v_str(task_key)),
            ("total_earnings", v_dec(total)),
            ("cap", v_dec(cap)),
        ]),
    );
}

pub fn log_clawback(participant_id: &str, task_key: &str, day: u32, forfeited: Decimal, total: Decimal) {
    log(
        Level::Warn,
        Domain::Ledger,
        "clawback",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("task_key", v_str(task_key)),
            ("day", json!(day)),
            ("forfeited", v_dec(forfeited)),
            ("total_earnings", v_dec(total)),
        ]),
    );
    agg_increment("clawback");
}

pub fn log_session_complete(participant_id: &str, new_day: u32) {
    log(
        Level::Info,
        Domain::Ledger,
        "session_complete",
        obj(&[("participant_id", v_str(participant_id)), ("day", json!(new_day))]),
    );
}

pub fn log_schedule_extended(participant_id: &str, task_key: &str, new_len: usize) {
    log(
        Level::Debug,
        Domain::Schedule,
        "schedule_extended",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("task_key", v_str(task_key)),
            ("schedule_len", json!(new_len)),
        ]),
    );
}

// =============================================================================
// Ingestion / storage / metrics logs
// =============================================================================

pub fn log_event_recorded(participant_id: &str, event_type: &str, phase: &str, day: u32) {
    log(
        Level::Debug,
        Domain::Events,
        "event_recorded",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("event_type", v_str(event_type)),
            ("phase", v_str(phase)),
            ("day", json!(day)),
        ]),
    );
    agg_increment("event");
}

pub fn log_unclassified_phase(participant_id: &str, event_type: &str, phase: &str) {
    log(
        Level::Warn,
        Domain::Events,
        "unclassified_phase",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("event_type", v_str(event_type)),
            ("phase", v_str(phase)),
        ]),
    );
}

pub fn log_conflict(participant_id: &str, expected: u64, found: u64) {
    log(
        Level::Warn,
        Domain::Storage,
        "version_conflict",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("expected", json!(expected)),
            ("found", json!(found)),
        ]),
    );
}

pub fn log_metrics_computed(participant_id: &str, groups: usize, events: usize) {
    log(
        Level::Info,
        Domain::Metrics,
        "metrics.computed",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("groups", json!(groups)),
            ("events", json!(events)),
        ]),
    );
}

/// Audit entry for a committed record
pub fn log_audit(op: &str, participant_id: &str, version: u64, state_hash: &str) {
    log(
        Level::Info,
        Domain::Audit,
        "commit",
        obj(&[
            ("op", v_str(op)),
            ("participant_id", v_str(participant_id)),
            ("version", json!(version)),
            ("state_hash", v_str(state_hash)),
        ]),
    );
}

/// Session summary on shutdown
pub fn log_session_summary(duration_secs: u64, requests: u64, failures: u64) {
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("duration_secs", json!(duration_secs)),
            ("requests", json!(requests)),
            ("failures", json!(failures)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

/// Money is logged as its exact decimal string.
pub fn v_dec(d: Decimal) -> Value {
    Value::String(d.round_dp(2).to_string())
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits elapsed time at trace level when dropped.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self { label, context: None, started: Instant::now() }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, context: Some(obj(fields)), started: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Log Aggregator for Periodic Summaries
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    trials: u64,
    rewards: u64,
    clawbacks: u64,
    events: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            trials: 0,
            rewards: 0,
            clawbacks: 0,
            events: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "trial" => self.trials += 1,
            "reward" => self.rewards += 1,
            "clawback" => self.clawbacks += 1,
            "event" => self.events += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<(u64, u64, u64, u64)> {
        if self.last_flush.elapsed().as_secs() >= self.flush_interval_secs {
            let result = (self.trials, self.rewards, self.clawbacks, self.events);
            self.trials = 0;
            self.rewards = 0;
            self.clawbacks = 0;
            self.events = 0;
            self.last_flush = Instant::now();
            Some(result)
        } else {
            None
        }
    }
}

/// Call periodically to emit aggregated stats
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some((trials, rewards, clawbacks, events)) = agg.maybe_flush() {
            log(
                Level::Info,
                Domain::System,
                "aggregated_stats",
                obj(&[
                    ("trials", json!(trials)),
                    ("rewards", json!(rewards)),
                    ("clawbacks", json!(clawbacks)),
                    ("events", json!(events)),
                ]),
            );
        }
    }
}

fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_test_builds_log_outside_package_and_quietly() {
        assert!(default_log_base().starts_with(std::env::temp_dir()));
        assert!(!stdout_enabled(None));
        assert!(!stdout_enabled(Some("0")));
        assert!(stdout_enabled(Some("true")));
    }

    #[test]
    fn test_configure_after_init_is_rejected() {
        ensure_run_context();
        assert!(!configure(PathBuf::from("out/runs"), true));
        assert!(!ensure_run_context().stdout || std::env::var("LOG_STDOUT").is_ok());
    }

    #[test]
    fn test_sanitize_redacts_password() {
        let fields = sanitize_fields(obj(&[("admin_password", v_str("hunter2")), ("day", json!(1))]));
        assert_eq!(fields.get("admin_password").unwrap(), "[REDACTED]");
        assert_eq!(fields.get("day").unwrap(), 1);
    }

    #[test]
    fn test_split_lifts_participant_id() {
        let (top, data) = split_fields(obj(&[
            ("participant_id", v_str("p-1")),
            ("amount", v_str("0.05")),
        ]));
        assert_eq!(top.get("participant_id").unwrap(), "p-1");
        assert!(data.contains_key("amount"));
        assert!(!data.contains_key("participant_id"));
    }

    #[test]
    fn test_v_dec_two_places() {
        assert_eq!(v_dec(Decimal::new(5, 2)), "0.05");
        assert_eq!(v_dec(Decimal::new(5, 0)), "5");
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_aggregator_counts() {
        let mut agg = LogAggregator::new();
        agg.flush_interval_secs = 0;
        agg.increment("trial");
        agg.increment("trial");
        agg.increment("reward");
        assert_eq!(agg.maybe_flush(), Some((2, 1, 0, 0)));
        assert_eq!(agg.maybe_flush(), Some((0, 0, 0, 0)));
    }
}
