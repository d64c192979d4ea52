//! Core data model: tasks, conditions, trial events and the participant record.
//!
//! Free-form labels coming from the UI (`"Coercion Phase"`, `"dragging"`) are
//! decoded once here; everything past this module works with enums.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{StudyError, StudyResult};

// =============================================================================
// Task / condition vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Matching,
    Sorting,
    Dragging,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Matching, TaskType::Sorting, TaskType::Dragging];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Matching => "matching",
            TaskType::Sorting => "sorting",
            TaskType::Dragging => "dragging",
        }
    }

    pub fn parse(label: &str) -> StudyResult<Self> {
        match label.trim().to_lowercase().as_str() {
            "matching" => Ok(TaskType::Matching),
            "sorting" => Ok(TaskType::Sorting),
            "dragging" => Ok(TaskType::Dragging),
            other => Err(StudyError::invalid(format!("unknown task type '{}'", other))),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Genuine,
    Apparent,
    Coercion,
    PreTraining,
}

impl Condition {
    /// The three experimental arms, in canonical order.
    pub const ARMS: [Condition; 3] = [Condition::Genuine, Condition::Apparent, Condition::Coercion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Genuine => "genuine",
            Condition::Apparent => "apparent",
            Condition::Coercion => "coercion",
            Condition::PreTraining => "pre_training",
        }
    }

    /// Decode a free-form phase/condition label. Pre-training wins over the arm
    /// name so that labels such as "genuine pre-training" stay money-free.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        if ["pre-training", "pre_training", "pretraining", "pre training"]
            .iter()
            .any(|m| lower.contains(m))
        {
            Some(Condition::PreTraining)
        } else if lower.contains("coercion") {
            Some(Condition::Coercion)
        } else if lower.contains("apparent") {
            Some(Condition::Apparent)
        } else if lower.contains("genuine") {
            Some(Condition::Genuine)
        } else {
            None
        }
    }

    pub fn parse(label: &str) -> StudyResult<Self> {
        Self::from_label(label)
            .ok_or_else(|| StudyError::invalid(format!("unknown condition '{}'", label)))
    }

    /// The experimental arm a label mentions, ignoring any pre-training marker.
    pub fn arm_from_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        if lower.contains("coercion") {
            Some(Condition::Coercion)
        } else if lower.contains("apparent") {
            Some(Condition::Apparent)
        } else if lower.contains("genuine") {
            Some(Condition::Genuine)
        } else {
            None
        }
    }

    pub fn is_pre_training(&self) -> bool {
        matches!(self, Condition::PreTraining)
    }

    /// Genuine trials are tracked like pre-training: a per-variant completion
    /// counter and no monetary schedule. Exit stats still key them as Genuine.
    pub fn uses_pre_training_counter(&self) -> bool {
        matches!(self, Condition::Genuine | Condition::PreTraining)
    }

    pub fn earns_money(&self) -> bool {
        matches!(self, Condition::Apparent | Condition::Coercion)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(task, arm)` product key for every per-task ledger map.
///
/// Serialized as `"<task>_<arm>"` so it can key JSON objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TaskKey {
    pub task: TaskType,
    pub condition: Condition,
}

impl TaskKey {
    pub fn new(task: TaskType, condition: Condition) -> StudyResult<Self> {
        if condition.is_pre_training() {
            return Err(StudyError::invalid(format!(
                "pre-training has no ledger key (task {})",
                task
            )));
        }
        Ok(Self { task, condition })
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.task, self.condition)
    }
}

impl From<TaskKey> for String {
    fn from(key: TaskKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for TaskKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (task, cond) = raw
            .split_once('_')
            .ok_or_else(|| format!("malformed task key '{}'", raw))?;
        let task = TaskType::parse(task).map_err(|e| e.to_string())?;
        let condition = match cond {
            "genuine" => Condition::Genuine,
            "apparent" => Condition::Apparent,
            "coercion" => Condition::Coercion,
            _ => return Err(format!("malformed task key '{}'", raw)),
        };
        Ok(TaskKey { task, condition })
    }
}

/// Counter key for pre-training progress: task plus a sanitized variant suffix.
pub fn pre_training_key(task: TaskType, variant: &str) -> String {
    let mut suffix = String::with_capacity(variant.len());
    for ch in variant.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            suffix.push(ch);
        } else if !suffix.ends_with('_') {
            suffix.push('_');
        }
    }
    let suffix = suffix.trim_matches('_');
    if suffix.is_empty() {
        task.as_str().to_string()
    } else {
        format!("{}_{}", task, suffix)
    }
}

// =============================================================================
// Trial events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Trial,
    OptOut,
    SwitchTask,
    Survey,
    Choice,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Trial => "trial",
            EventType::OptOut => "opt_out",
            EventType::SwitchTask => "switch_task",
            EventType::Survey => "survey",
            EventType::Choice => "choice",
        }
    }

    /// Accepts `opt_out`, `opt-out`, `OptOut` and friends.
    pub fn parse(label: &str) -> StudyResult<Self> {
        let norm: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match norm.as_str() {
            "trial" => Ok(EventType::Trial),
            "optout" => Ok(EventType::OptOut),
            "switchtask" => Ok(EventType::SwitchTask),
            "survey" => Ok(EventType::Survey),
            "choice" => Ok(EventType::Choice),
            _ => Err(StudyError::invalid(format!("unknown event type '{}'", label))),
        }
    }
}

/// One logged participant action. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialEvent {
    pub participant_id: String,
    pub task_type: TaskType,
    /// Condition/stage label as sent by the client.
    pub phase: String,
    #[serde(default)]
    pub task_variant: String,
    pub event_type: EventType,
    #[serde(default)]
    pub trial_number: u32,
    #[serde(default)]
    pub response_time_ms: f64,
    #[serde(default)]
    pub correct: bool,
    #[serde(default)]
    pub selected_option: Option<String>,
    #[serde(default)]
    pub reinforcement_delivered: bool,
    #[serde(default)]
    pub schedule_requirement: u32,
    pub timestamp_ms: i64,
    /// Study day the event was ingested on; stamped by the service.
    #[serde(default)]
    pub day: u32,
}

impl TrialEvent {
    pub fn validate(&self) -> StudyResult<()> {
        if self.participant_id.trim().is_empty() {
            return Err(StudyError::invalid("event without participant id"));
        }
        if !self.response_time_ms.is_finite() || self.response_time_ms < 0.0 {
            return Err(StudyError::invalid(format!(
                "response time must be a non-negative number, got {}",
                self.response_time_ms
            )));
        }
        Ok(())
    }

    pub fn condition(&self) -> Option<Condition> {
        Condition::from_label(&self.phase)
    }
}

// =============================================================================
// Ledger state
// =============================================================================

/// Variable-ratio progress for one `(task, arm)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub schedule: Vec<u32>,
    pub schedule_index: usize,
    pub correct_count: u32,
    pub trials_completed: u32,
}

impl ScheduleState {
    pub fn with_schedule(schedule: Vec<u32>) -> Self {
        Self { schedule, schedule_index: 0, correct_count: 0, trials_completed: 0 }
    }

    pub fn current_threshold(&self) -> u32 {
        self.schedule.get(self.schedule_index).copied().unwrap_or(0)
    }

    pub fn index_valid(&self) -> bool {
        self.schedule_index < self.schedule.len()
    }
}

/// Last-write-wins latency/count pair for opt-out and switch-task stats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitStat {
    pub latency_ms: f64,
    pub count: u32,
}

/// A delivered reward, kept so same-day coercion earnings can be summed on opt-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub day: u32,
    pub key: TaskKey,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    #[default]
    Pending,
    Paid,
    Withheld,
}

impl PayoutStatus {
    pub fn parse(label: &str) -> StudyResult<Self> {
        match label.trim().to_lowercase().as_str() {
            "pending" => Ok(PayoutStatus::Pending),
            "paid" => Ok(PayoutStatus::Paid),
            "withheld" => Ok(PayoutStatus::Withheld),
            other => Err(StudyError::invalid(format!("unknown payout status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub responses: BTreeMap<String, Value>,
    pub submitted_at_ms: i64,
}

// =============================================================================
// Participant record (aggregate root)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub participant_id: String,
    pub condition_order: [Condition; 3],
    pub created_at_ms: i64,
    /// Bumped on every committed mutation; compared on save.
    #[serde(default)]
    pub version: u64,
    pub current_day: u32,
    #[serde(default)]
    pub reinforcement_state: BTreeMap<TaskKey, ScheduleState>,
    pub earnings: Decimal,
    #[serde(default)]
    pub earnings_by_task: BTreeMap<TaskKey, Decimal>,
    #[serde(default)]
    pub opt_out_stats: BTreeMap<TaskKey, ExitStat>,
    #[serde(default)]
    pub switch_task_stats: BTreeMap<TaskKey, ExitStat>,
    #[serde(default)]
    pub pre_training_completion: BTreeMap<String, u32>,
    #[serde(default)]
    pub reward_journal: Vec<RewardEntry>,
    #[serde(default)]
    pub survey: Option<SurveyRecord>,
    #[serde(default)]
    pub demographics: Option<Value>,
    #[serde(default)]
    pub payout_status: PayoutStatus,
}

impl ParticipantRecord {
    pub fn new(participant_id: String, condition_order: [Condition; 3], created_at_ms: i64) -> Self {
        Self {
            participant_id,
            condition_order,
            created_at_ms,
            version: 0,
            current_day: 1,
            reinforcement_state: BTreeMap::new(),
            earnings: Decimal::ZERO,
            earnings_by_task: BTreeMap::new(),
            opt_out_stats: BTreeMap::new(),
            switch_task_stats: BTreeMap::new(),
            pre_training_completion: BTreeMap::new(),
            reward_journal: Vec::new(),
            survey: None,
            demographics: None,
            payout_status: PayoutStatus::Pending,
        }
    }

    pub fn earnings_rounded(&self) -> Decimal {
        self.earnings.round_dp(2)
    }

    /// Checks the record-level invariants the ledger promises to keep.
    pub fn check_invariants(&self, max_earnings: Decimal) -> StudyResult<()> {
        if self.earnings < Decimal::ZERO || self.earnings > max_earnings {
            return Err(StudyError::Internal(format!(
                "earnings {} outside [0, {}] for {}",
                self.earnings, max_earnings, self.participant_id
            )));
        }
        for (key, state) in &self.reinforcement_state {
            if !state.index_valid() {
                return Err(StudyError::Internal(format!(
                    "schedule index {} out of bounds ({} entries) for {}",
                    state.schedule_index,
                    state.schedule.len(),
                    key
                )));
            }
        }
        let mut seen = self.condition_order.to_vec();
        seen.sort();
        seen.dedup();
        if seen.len() != 3 || seen.iter().any(|c| c.is_pre_training()) {
            return Err(StudyError::Internal(format!(
                "condition order {:?} is not a permutation of the arms",
                self.condition_order
            )));
        }
        Ok(())
    }

    /// SHA-256 of the serialized record, for audit logs.
    pub fn state_hash(&self) -> String {
        let doc = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_from_label() {
        assert_eq!(Condition::from_label("Coercion Phase"), Some(Condition::Coercion));
        assert_eq!(Condition::from_label("apparent"), Some(Condition::Apparent));
        assert_eq!(Condition::from_label("GENUINE"), Some(Condition::Genuine));
        assert_eq!(Condition::from_label("genuine pre-training"), Some(Condition::PreTraining));
        assert_eq!(Condition::from_label("practice"), None);
        assert!(Condition::parse("practice").is_err());
    }

    #[test]
    fn test_only_money_arms_use_schedules() {
        assert!(Condition::Genuine.uses_pre_training_counter());
        assert!(Condition::PreTraining.uses_pre_training_counter());
        assert!(!Condition::Apparent.uses_pre_training_counter());
        assert!(!Condition::Coercion.uses_pre_training_counter());
        assert!(!Condition::Genuine.is_pre_training());
    }

    #[test]
    fn test_task_parse_rejects_unknown() {
        assert_eq!(TaskType::parse(" Dragging ").unwrap(), TaskType::Dragging);
        let err = TaskType::parse("typing").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_task_key_string_roundtrip() {
        let key = TaskKey::new(TaskType::Dragging, Condition::Coercion).unwrap();
        assert_eq!(key.to_string(), "dragging_coercion");
        assert_eq!(TaskKey::try_from("dragging_coercion".to_string()).unwrap(), key);
        assert!(TaskKey::try_from("dragging_pr".to_string()).is_err());
        assert!(TaskKey::new(TaskType::Matching, Condition::PreTraining).is_err());
    }

    #[test]
    fn test_task_key_as_json_map_key() {
        let mut m = BTreeMap::new();
        m.insert(TaskKey::new(TaskType::Sorting, Condition::Apparent).unwrap(), 3u32);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"sorting_apparent":3}"#);
        let back: BTreeMap<TaskKey, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_pre_training_key_sanitizes_variant() {
        assert_eq!(pre_training_key(TaskType::Dragging, "PR"), "dragging_pr");
        assert_eq!(pre_training_key(TaskType::Dragging, " fixed-ratio #2 "), "dragging_fixed_ratio_2");
        assert_eq!(pre_training_key(TaskType::Sorting, ""), "sorting");
    }

    #[test]
    fn test_event_type_parse_variants() {
        assert_eq!(EventType::parse("opt-out").unwrap(), EventType::OptOut);
        assert_eq!(EventType::parse("OptOut").unwrap(), EventType::OptOut);
        assert_eq!(EventType::parse("switch_task").unwrap(), EventType::SwitchTask);
        assert!(EventType::parse("click").is_err());
    }

    #[test]
    fn test_new_record_holds_invariants() {
        let rec = ParticipantRecord::new(
            "p-1".to_string(),
            [Condition::Coercion, Condition::Genuine, Condition::Apparent],
            0,
        );
        assert!(rec.check_invariants(Decimal::new(500, 2)).is_ok());
        assert_eq!(rec.current_day, 1);
    }

    #[test]
    fn test_invariants_catch_bad_order_and_index() {
        let mut rec = ParticipantRecord::new(
            "p-2".to_string(),
            [Condition::Genuine, Condition::Genuine, Condition::Apparent],
            0,
        );
        assert!(rec.check_invariants(Decimal::new(500, 2)).is_err());
        rec.condition_order = [Condition::Genuine, Condition::Coercion, Condition::Apparent];
        let key = TaskKey::new(TaskType::Matching, Condition::Apparent).unwrap();
        let mut state = ScheduleState::with_schedule(vec![1, 2]);
        state.schedule_index = 2;
        rec.reinforcement_state.insert(key, state);
        assert!(rec.check_invariants(Decimal::new(500, 2)).is_err());
    }

    #[test]
    fn test_state_hash_changes_with_earnings() {
        let mut rec = ParticipantRecord::new(
            "p-3".to_string(),
            [Condition::Genuine, Condition::Apparent, Condition::Coercion],
            0,
        );
        let h1 = rec.state_hash();
        assert_eq!(h1, rec.state_hash());
        rec.earnings = Decimal::new(5, 2);
        assert_ne!(h1, rec.state_hash());
    }
}
