//! Service facade invoked by transport collaborators.
//!
//! Mutations on one participant run under a per-participant mutex and are
//! committed with the store's version check, so a duplicated or retried
//! request can never interleave with another read-modify-write of the same
//! ledger. Different participants proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{StudyError, StudyResult};
use crate::ingest::{apply_event, needs_trial_count, IngestOutcome};
use crate::ledger::{EarningsSummary, ReinforcementLedger, TaskStart, TrialOutcome};
use crate::logging::{log_audit, log_event_recorded, log_metrics_computed, log_session_complete, v_str, ProfileScope};
use crate::metrics::{MetricsAggregator, ParticipantMetrics};
use crate::model::{Condition, ParticipantRecord, PayoutStatus, SurveyRecord, TaskType, TrialEvent};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedParticipant {
    pub participant_id: String,
    pub condition_order: [Condition; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDay {
    pub day: u32,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct StudyService<S: Store> {
    cfg: Config,
    store: S,
    ledger: ReinforcementLedger,
    metrics: MetricsAggregator,
    rng: Mutex<StdRng>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: Store> StudyService<S> {
    pub fn new(cfg: Config, store: S) -> Self {
        let rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            ledger: ReinforcementLedger::new(&cfg),
            metrics: MetricsAggregator::new(),
            rng: Mutex::new(rng),
            locks: Mutex::new(HashMap::new()),
            store,
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn participant_lock(&self, participant_id: &str) -> StudyResult<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| StudyError::Internal("lock registry poisoned".to_string()))?;
        Ok(locks.entry(participant_id.to_string()).or_default().clone())
    }

    /// Drops the caller's handle and removes the registry entry once no other
    /// request holds or waits on it. Handles are only cloned under the
    /// registry mutex, so the strong count cannot grow while it is held.
    fn release_lock(&self, participant_id: &str, lock: Arc<Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else { return };
        drop(lock);
        if locks.get(participant_id).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(participant_id);
        }
    }

    /// Serialized load → mutate → validate → compare-and-swap commit.
    fn mutate<T, F>(&self, op: &str, participant_id: &str, f: F) -> StudyResult<T>
    where
        F: FnOnce(&mut ParticipantRecord, &mut StdRng) -> StudyResult<(T, Option<TrialEvent>)>,
    {
        let _scope = ProfileScope::with_context("service.mutate", &[("op", v_str(op))]);
        let lock = self.participant_lock(participant_id)?;
        let result = self.mutate_locked(op, participant_id, &lock, f);
        self.release_lock(participant_id, lock);
        result
    }

    fn mutate_locked<T, F>(&self, op: &str, participant_id: &str, lock: &Mutex<()>, f: F) -> StudyResult<T>
    where
        F: FnOnce(&mut ParticipantRecord, &mut StdRng) -> StudyResult<(T, Option<TrialEvent>)>,
    {
        let _guard = lock
            .lock()
            .map_err(|_| StudyError::Internal(format!("participant lock poisoned: {}", participant_id)))?;

        let mut record = self.store.load_participant(participant_id)?;
        let (out, event) = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| StudyError::Internal("rng poisoned".to_string()))?;
            f(&mut record, &mut *rng)?
        };
        record.check_invariants(self.ledger.max_earnings())?;
        let version = self.store.commit(&record, event.as_ref())?;
        log_audit(op, participant_id, version, &record.state_hash());
        Ok(out)
    }

    pub fn create_participant(&self) -> StudyResult<CreatedParticipant> {
        let (participant_id, condition_order) = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| StudyError::Internal("rng poisoned".to_string()))?;
            let id_bytes: [u8; 16] = rng.gen();
            let mut order = Condition::ARMS;
            order.shuffle(&mut *rng);
            (format!("P-{}", hex::encode(id_bytes)), order)
        };
        let record = ParticipantRecord::new(participant_id.clone(), condition_order, now_ms());
        self.store.insert_participant(&record)?;
        log_audit("create_participant", &participant_id, record.version, &record.state_hash());
        Ok(CreatedParticipant { participant_id, condition_order })
    }

    pub fn start_task(&self, participant_id: &str, task: &str, condition: &str, variant: &str) -> StudyResult<TaskStart> {
        let task = TaskType::parse(task)?;
        let condition = Condition::parse(condition)?;
        self.mutate("start_task", participant_id, |record, rng| {
            let out = self.ledger.start_task(record, task, condition, variant, rng)?;
            Ok((out, None))
        })
    }

    pub fn submit_trial(
        &self,
        participant_id: &str,
        task: &str,
        condition: &str,
        variant: &str,
        correct: bool,
    ) -> StudyResult<TrialOutcome> {
        let task = TaskType::parse(task)?;
        let condition = Condition::parse(condition)?;
        self.mutate("submit_trial", participant_id, |record, rng| {
            let out = self.ledger.process_trial(record, task, correct, condition, variant, rng)?;
            Ok((out, None))
        })
    }

    pub fn record_event(&self, mut event: TrialEvent) -> StudyResult<IngestOutcome> {
        event.validate()?;
        if event.timestamp_ms <= 0 {
            event.timestamp_ms = now_ms();
        }
        let participant_id = event.participant_id.clone();
        self.mutate("record_event", &participant_id, |record, _rng| {
            let trial_count = if needs_trial_count(&event) {
                self.store.count_trials(&participant_id, &event.phase, event.task_type)?
            } else {
                0
            };
            event.day = record.current_day;
            let out = apply_event(&self.ledger, record, &event, trial_count)?;
            log_event_recorded(&participant_id, event.event_type.as_str(), &event.phase, event.day);
            Ok((out, Some(event)))
        })
    }

    pub fn get_earnings(&self, participant_id: &str) -> StudyResult<EarningsSummary> {
        let record = self.store.load_participant(participant_id)?;
        Ok(self.ledger.earnings(&record))
    }

    pub fn get_metrics(&self, participant_id: &str) -> StudyResult<ParticipantMetrics> {
        let record = self.store.load_participant(participant_id)?;
        let events = self.store.events_for(participant_id)?;
        let metrics = self.metrics.calculate(&events, record.survey.as_ref());
        log_metrics_computed(participant_id, metrics.groups.len(), events.len());
        Ok(metrics)
    }

    /// Closes the current session; later events and rewards belong to the next day.
    pub fn complete_session(&self, participant_id: &str) -> StudyResult<SessionDay> {
        self.mutate("complete_session", participant_id, |record, _rng| {
            record.current_day += 1;
            log_session_complete(&record.participant_id, record.current_day);
            Ok((SessionDay { day: record.current_day }, None))
        })
    }

    pub fn submit_survey(&self, participant_id: &str, responses: BTreeMap<String, Value>) -> StudyResult<()> {
        self.mutate("submit_survey", participant_id, |record, _rng| {
            record.survey = Some(SurveyRecord { responses, submitted_at_ms: now_ms() });
            Ok(((), None))
        })
    }

    pub fn record_demographics(&self, participant_id: &str, demographics: Value) -> StudyResult<()> {
        if !demographics.is_object() {
            return Err(StudyError::invalid("demographics must be a JSON object"));
        }
        self.mutate("record_demographics", participant_id, |record, _rng| {
            record.demographics = Some(demographics);
            Ok(((), None))
        })
    }

    pub fn set_payout_status(&self, participant_id: &str, status: PayoutStatus) -> StudyResult<()> {
        self.mutate("set_payout_status", participant_id, |record, _rng| {
            record.payout_status = status;
            Ok(((), None))
        })
    }

    pub fn get_participant(&self, participant_id: &str) -> StudyResult<ParticipantRecord> {
        self.store.load_participant(participant_id)
    }

    pub fn list_participants(&self) -> StudyResult<Vec<String>> {
        self.store.list_participants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, ScheduleState, TaskKey};
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    fn service() -> StudyService<MemoryStore> {
        let cfg = Config { rng_seed: Some(17), ..Config::default() };
        StudyService::new(cfg, MemoryStore::new())
    }

    #[test]
    fn test_create_participant_permutes_arms() {
        let svc = service();
        let a = svc.create_participant().unwrap();
        let b = svc.create_participant().unwrap();
        assert_ne!(a.participant_id, b.participant_id);
        let mut order = a.condition_order.to_vec();
        order.sort();
        assert_eq!(order, Condition::ARMS.to_vec());
        assert_eq!(svc.list_participants().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_participant_is_not_found() {
        let svc = service();
        let err = svc.submit_trial("P-missing", "matching", "apparent", "", true).unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(svc.get_earnings("P-missing").unwrap_err().status_code(), 404);
        assert!(svc.get_metrics("P-missing").is_err());
    }

    #[test]
    fn test_bad_labels_are_invalid_argument() {
        let svc = service();
        let p = svc.create_participant().unwrap().participant_id;
        assert_eq!(svc.start_task(&p, "typing", "apparent", "").unwrap_err().kind(), "invalid_argument");
        assert_eq!(svc.submit_trial(&p, "matching", "control", "", true).unwrap_err().kind(), "invalid_argument");
        // Nothing was committed for the failed calls.
        assert_eq!(svc.get_participant(&p).unwrap().version, 0);
    }

    #[test]
    fn test_each_mutation_bumps_version() {
        let svc = service();
        let p = svc.create_participant().unwrap().participant_id;
        svc.start_task(&p, "sorting", "coercion", "").unwrap();
        svc.submit_trial(&p, "sorting", "coercion", "", true).unwrap();
        assert_eq!(svc.get_participant(&p).unwrap().version, 2);
    }

    #[test]
    fn test_complete_session_advances_day_and_stamps_events() {
        let svc = service();
        let p = svc.create_participant().unwrap().participant_id;
        assert_eq!(svc.complete_session(&p).unwrap().day, 2);
        let ev = TrialEvent {
            participant_id: p.clone(),
            task_type: TaskType::Matching,
            phase: "genuine".to_string(),
            task_variant: String::new(),
            event_type: EventType::Choice,
            trial_number: 1,
            response_time_ms: 10.0,
            correct: false,
            selected_option: None,
            reinforcement_delivered: false,
            schedule_requirement: 0,
            timestamp_ms: 0,
            day: 0,
        };
        svc.record_event(ev).unwrap();
        let stored = svc.store().events_for(&p).unwrap();
        assert_eq!(stored[0].day, 2);
        assert!(stored[0].timestamp_ms > 0);
    }

    #[test]
    fn test_clawback_sums_current_day_on_every_opt_out() {
        let svc = service();
        let p = svc.create_participant().unwrap().participant_id;
        svc.start_task(&p, "matching", "coercion", "").unwrap();
        // Force a threshold of one so every correct trial pays.
        {
            let mut rec = svc.get_participant(&p).unwrap();
            let key = TaskKey::new(TaskType::Matching, Condition::Coercion).unwrap();
            rec.reinforcement_state.insert(key, ScheduleState::with_schedule(vec![1; 20]));
            let v = svc.store().commit(&rec, None).unwrap();
            assert_eq!(v, rec.version + 1);
        }
        svc.submit_trial(&p, "matching", "coercion", "", true).unwrap();
        svc.complete_session(&p).unwrap();
        svc.submit_trial(&p, "matching", "coercion", "", true).unwrap();
        svc.submit_trial(&p, "matching", "coercion", "", true).unwrap();

        let mut opt_out = TrialEvent {
            participant_id: p.clone(),
            task_type: TaskType::Matching,
            phase: "Coercion".to_string(),
            task_variant: String::new(),
            event_type: EventType::OptOut,
            trial_number: 3,
            response_time_ms: 4_000.0,
            correct: false,
            selected_option: None,
            reinforcement_delivered: false,
            schedule_requirement: 0,
            timestamp_ms: 1_000,
            day: 0,
        };
        let out = svc.record_event(opt_out.clone()).unwrap();
        assert_eq!(out.earnings, Decimal::new(5, 2));
        // The day-2 sum (0.10) is deducted again and the total floors at zero.
        opt_out.timestamp_ms = 2_000;
        let again = svc.record_event(opt_out).unwrap();
        assert_eq!(again.clawback.unwrap().forfeited, Decimal::new(10, 2));
        assert_eq!(again.earnings, Decimal::ZERO);
    }

    #[test]
    fn test_survey_demographics_payout_pass_through() {
        let svc = service();
        let p = svc.create_participant().unwrap().participant_id;
        let mut responses = BTreeMap::new();
        responses.insert("fairness".to_string(), Value::from(2));
        svc.submit_survey(&p, responses).unwrap();
        svc.record_demographics(&p, serde_json::json!({"age": 31})).unwrap();
        assert!(svc.record_demographics(&p, Value::from("31")).is_err());
        svc.set_payout_status(&p, PayoutStatus::Paid).unwrap();

        let rec = svc.get_participant(&p).unwrap();
        assert_eq!(rec.payout_status, PayoutStatus::Paid);
        assert_eq!(rec.demographics.unwrap()["age"], 31);
        assert_eq!(svc.get_metrics(&p).unwrap().post_survey.unwrap().response_count, 1);
    }

    #[test]
    fn test_concurrent_submissions_serialize() {
        let svc = Arc::new(service());
        let p = svc.create_participant().unwrap().participant_id;
        svc.start_task(&p, "dragging", "apparent", "").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svc = Arc::clone(&svc);
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        svc.submit_trial(&p, "dragging", "apparent", "", true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let rec = svc.get_participant(&p).unwrap();
        let key = TaskKey::new(TaskType::Dragging, Condition::Apparent).unwrap();
        assert_eq!(rec.reinforcement_state[&key].trials_completed, 200);
        assert_eq!(rec.version, 201);
        let rewards = rec.reward_journal.len() as i64;
        assert_eq!(rec.earnings, Decimal::new(5 * rewards, 2));
        assert!(svc.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_lock_registry_is_pruned_after_each_call() {
        let svc = service();
        let ids: Vec<String> = (0..5).map(|_| svc.create_participant().unwrap().participant_id).collect();
        for id in &ids {
            svc.start_task(id, "sorting", "apparent", "").unwrap();
            svc.complete_session(id).unwrap();
        }
        // Failed mutations release their entry too.
        assert!(svc.submit_trial("P-missing", "sorting", "apparent", "", true).is_err());
        assert!(svc.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_genuine_trials_use_completion_counter() {
        let svc = service();
        let p = svc.create_participant().unwrap().participant_id;
        assert_eq!(svc.start_task(&p, "matching", "genuine", "").unwrap().trials_completed, 0);
        let out = svc.submit_trial(&p, "matching", "genuine", "", true).unwrap();
        assert_eq!(out.trials_completed, 1);
        assert!(!out.reward_earned);

        let rec = svc.get_participant(&p).unwrap();
        assert!(rec.reinforcement_state.is_empty());
        assert_eq!(rec.pre_training_completion["matching"], 1);
        assert_eq!(rec.earnings, Decimal::ZERO);
    }
}
