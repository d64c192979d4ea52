//! Persistence for participant records and the append-only event log.
//!
//! Records are saved with a compare-and-swap on `version`; a stale writer gets
//! `ConcurrencyConflict` instead of silently overwriting a newer record.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{StudyError, StudyResult};
use crate::logging::log_conflict;
use crate::model::{EventType, ParticipantRecord, TaskType, TrialEvent};

pub trait Store: Send + Sync {
    fn insert_participant(&self, record: &ParticipantRecord) -> StudyResult<()>;

    fn load_participant(&self, participant_id: &str) -> StudyResult<ParticipantRecord>;

    fn list_participants(&self) -> StudyResult<Vec<String>>;

    /// Atomically replaces the record if its stored version still equals
    /// `record.version`, appending `event` in the same step. Returns the new
    /// version.
    fn commit(&self, record: &ParticipantRecord, event: Option<&TrialEvent>) -> StudyResult<u64>;

    /// All events of a participant ordered by timestamp, then insertion order.
    fn events_for(&self, participant_id: &str) -> StudyResult<Vec<TrialEvent>>;

    /// Number of `Trial` events logged for `(participant, phase, task)`.
    fn count_trials(&self, participant_id: &str, phase: &str, task: TaskType) -> StudyResult<u32>;
}

fn poisoned<T>(_: T) -> StudyError {
    StudyError::Internal("store lock poisoned".to_string())
}

fn conflict(participant_id: &str, expected: u64, found: u64) -> StudyError {
    log_conflict(participant_id, expected, found);
    StudyError::ConcurrencyConflict { participant_id: participant_id.to_string(), expected, found }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    participants: HashMap<String, ParticipantRecord>,
    events: Vec<TrialEvent>,
}

/// Process-local store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StudyResult<MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(poisoned)
    }
}

impl Store for MemoryStore {
    fn insert_participant(&self, record: &ParticipantRecord) -> StudyResult<()> {
        let mut inner = self.lock()?;
        if inner.participants.contains_key(&record.participant_id) {
            return Err(StudyError::Internal(format!("duplicate participant id {}", record.participant_id)));
        }
        inner.participants.insert(record.participant_id.clone(), record.clone());
        Ok(())
    }

    fn load_participant(&self, participant_id: &str) -> StudyResult<ParticipantRecord> {
        self.lock()?
            .participants
            .get(participant_id)
            .cloned()
            .ok_or_else(|| StudyError::not_found(participant_id))
    }

    fn list_participants(&self) -> StudyResult<Vec<String>> {
        let mut ids: Vec<String> = self.lock()?.participants.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn commit(&self, record: &ParticipantRecord, event: Option<&TrialEvent>) -> StudyResult<u64> {
        let mut inner = self.lock()?;
        let stored = inner
            .participants
            .get_mut(&record.participant_id)
            .ok_or_else(|| StudyError::not_found(&record.participant_id))?;
        if stored.version != record.version {
            return Err(conflict(&record.participant_id, record.version, stored.version));
        }
        let mut next = record.clone();
        next.version = record.version + 1;
        *stored = next;
        if let Some(ev) = event {
            inner.events.push(ev.clone());
        }
        Ok(record.version + 1)
    }

    fn events_for(&self, participant_id: &str) -> StudyResult<Vec<TrialEvent>> {
        let mut out: Vec<TrialEvent> = self
            .lock()?
            .events
            .iter()
            .filter(|e| e.participant_id == participant_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        out.sort_by_key(|e| e.timestamp_ms);
        Ok(out)
    }

    fn count_trials(&self, participant_id: &str, phase: &str, task: TaskType) -> StudyResult<u32> {
        let n = self
            .lock()?
            .events
            .iter()
            .filter(|e| {
                e.participant_id == participant_id
                    && e.phase == phase
                    && e.task_type == task
                    && e.event_type == EventType::Trial
            })
            .count();
        Ok(n as u32)
    }
}

// =============================================================================
// SQLite store
// =============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> StudyResult<Self> {
        let store = Self { conn: Mutex::new(Connection::open(path)?) };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StudyResult<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> StudyResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(poisoned)
    }

    fn init(&self) -> StudyResult<()> {
        self.lock()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trial_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                participant_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                phase TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                day INTEGER NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_participant_ts
                ON trial_events (participant_id, timestamp_ms);
            COMMIT;",
        )?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn insert_participant(&self, record: &ParticipantRecord) -> StudyResult<()> {
        let doc = serde_json::to_string(record)?;
        let inserted = self.lock()?.execute(
            "INSERT OR IGNORE INTO participants (id, version, created_at, doc) VALUES (?1, ?2, ?3, ?4)",
            params![record.participant_id, record.version as i64, record.created_at_ms, doc],
        )?;
        if inserted == 0 {
            return Err(StudyError::Internal(format!("duplicate participant id {}", record.participant_id)));
        }
        Ok(())
    }

    fn load_participant(&self, participant_id: &str) -> StudyResult<ParticipantRecord> {
        let row: Option<(i64, String)> = self
            .lock()?
            .query_row(
                "SELECT version, doc FROM participants WHERE id = ?1",
                params![participant_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (version, doc) = row.ok_or_else(|| StudyError::not_found(participant_id))?;
        let mut record: ParticipantRecord = serde_json::from_str(&doc)?;
        record.version = version as u64;
        Ok(record)
    }

    fn list_participants(&self) -> StudyResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM participants ORDER BY id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn commit(&self, record: &ParticipantRecord, event: Option<&TrialEvent>) -> StudyResult<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT version FROM participants WHERE id = ?1",
                params![record.participant_id],
                |r| r.get(0),
            )
            .optional()?;
        let found = found.ok_or_else(|| StudyError::not_found(&record.participant_id))? as u64;
        if found != record.version {
            return Err(conflict(&record.participant_id, record.version, found));
        }

        let next_version = record.version + 1;
        let mut next = record.clone();
        next.version = next_version;
        let doc = serde_json::to_string(&next)?;
        tx.execute(
            "UPDATE participants SET version = ?1, doc = ?2 WHERE id = ?3 AND version = ?4",
            params![next_version as i64, doc, record.participant_id, record.version as i64],
        )?;

        if let Some(ev) = event {
            tx.execute(
                "INSERT INTO trial_events (participant_id, task_type, phase, event_type, timestamp_ms, day, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ev.participant_id,
                    ev.task_type.as_str(),
                    ev.phase,
                    ev.event_type.as_str(),
                    ev.timestamp_ms,
                    ev.day as i64,
                    serde_json::to_string(ev)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(next_version)
    }

    fn events_for(&self, participant_id: &str) -> StudyResult<Vec<TrialEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc FROM trial_events WHERE participant_id = ?1 ORDER BY timestamp_ms ASC, seq ASC",
        )?;
        let docs = stmt
            .query_map(params![participant_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(serde_json::from_str(&doc)?);
        }
        Ok(out)
    }

    fn count_trials(&self, participant_id: &str, phase: &str, task: TaskType) -> StudyResult<u32> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM trial_events
             WHERE participant_id = ?1 AND phase = ?2 AND task_type = ?3 AND event_type = ?4",
            params![participant_id, phase, task.as_str(), EventType::Trial.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Condition;

    fn record(id: &str) -> ParticipantRecord {
        ParticipantRecord::new(id.to_string(), [Condition::Apparent, Condition::Genuine, Condition::Coercion], 10)
    }

    fn event(id: &str, event_type: EventType, phase: &str, ts: i64) -> TrialEvent {
        TrialEvent {
            participant_id: id.to_string(),
            task_type: TaskType::Matching,
            phase: phase.to_string(),
            task_variant: String::new(),
            event_type,
            trial_number: 0,
            response_time_ms: 100.0,
            correct: true,
            selected_option: None,
            reinforcement_delivered: false,
            schedule_requirement: 0,
            timestamp_ms: ts,
            day: 1,
        }
    }

    fn exercise_cas(store: &dyn Store) {
        store.insert_participant(&record("p-1")).unwrap();
        assert!(store.insert_participant(&record("p-1")).is_err());

        let loaded = store.load_participant("p-1").unwrap();
        assert_eq!(loaded.version, 0);
        let stale = loaded.clone();

        let v = store.commit(&loaded, Some(&event("p-1", EventType::Trial, "apparent", 5))).unwrap();
        assert_eq!(v, 1);

        let err = store.commit(&stale, None).unwrap_err();
        assert!(err.is_retryable(), "expected conflict, got {:?}", err);
        // The losing write appended nothing.
        assert_eq!(store.events_for("p-1").unwrap().len(), 1);

        assert_eq!(store.load_participant("p-1").unwrap().version, 1);
        assert_eq!(store.load_participant("nobody").unwrap_err().kind(), "not_found");
    }

    fn exercise_events(store: &dyn Store) {
        store.insert_participant(&record("p-2")).unwrap();
        let mut rec = store.load_participant("p-2").unwrap();
        for (i, (et, phase, ts)) in [
            (EventType::Trial, "apparent", 30),
            (EventType::Trial, "apparent", 10),
            (EventType::OptOut, "apparent", 40),
            (EventType::Trial, "coercion", 20),
        ]
        .into_iter()
        .enumerate()
        {
            let mut ev = event("p-2", et, phase, ts);
            ev.trial_number = i as u32;
            rec.version = store.commit(&rec, Some(&ev)).unwrap();
        }
        let ts: Vec<i64> = store.events_for("p-2").unwrap().iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(ts, vec![10, 20, 30, 40]);
        assert_eq!(store.count_trials("p-2", "apparent", TaskType::Matching).unwrap(), 2);
        assert_eq!(store.count_trials("p-2", "apparent", TaskType::Sorting).unwrap(), 0);
        assert_eq!(store.list_participants().unwrap(), vec!["p-2".to_string()]);
    }

    #[test]
    fn test_memory_store_cas() {
        exercise_cas(&MemoryStore::new());
    }

    #[test]
    fn test_memory_store_events() {
        exercise_events(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_cas() {
        exercise_cas(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_events() {
        exercise_events(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_equal_timestamps_keep_insert_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_participant(&record("p-3")).unwrap();
        let mut rec = store.load_participant("p-3").unwrap();
        for n in 0..3 {
            let mut ev = event("p-3", EventType::Trial, "genuine", 7);
            ev.trial_number = n;
            rec.version = store.commit(&rec, Some(&ev)).unwrap();
        }
        let order: Vec<u32> = store.events_for("p-3").unwrap().iter().map(|e| e.trial_number).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
