//! Side effects of recording an event on the participant record.
//!
//! The event itself is appended by the store; this module only updates the
//! exit statistics and runs the coercion opt-out clawback.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StudyResult;
use crate::ledger::{Clawback, ReinforcementLedger};
use crate::logging::log_unclassified_phase;
use crate::model::{Condition, EventType, ExitStat, ParticipantRecord, TaskKey, TrialEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub earnings: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clawback: Option<Clawback>,
}

/// Whether applying `event` needs the count of trials already logged for its
/// `(participant, phase, task)`.
pub fn needs_trial_count(event: &TrialEvent) -> bool {
    match event.event_type {
        EventType::OptOut => true,
        EventType::SwitchTask => event.phase.to_lowercase().contains("genuine"),
        _ => false,
    }
}

pub fn apply_event(
    ledger: &ReinforcementLedger,
    record: &mut ParticipantRecord,
    event: &TrialEvent,
    trial_count: u32,
) -> StudyResult<IngestOutcome> {
    let mut clawback = None;

    match event.event_type {
        EventType::OptOut => match Condition::arm_from_label(&event.phase) {
            Some(arm) => {
                let key = TaskKey::new(event.task_type, arm)?;
                record
                    .opt_out_stats
                    .insert(key, ExitStat { latency_ms: event.response_time_ms, count: trial_count });
                let pre_training = event.condition().map_or(false, |c| c.is_pre_training());
                if arm == Condition::Coercion && !pre_training {
                    clawback = Some(ledger.clawback(record, event.task_type)?);
                }
            }
            None => log_unclassified_phase(&record.participant_id, event.event_type.as_str(), &event.phase),
        },
        EventType::SwitchTask if needs_trial_count(event) => {
            let key = TaskKey::new(event.task_type, Condition::Genuine)?;
            record
                .switch_task_stats
                .insert(key, ExitStat { latency_ms: event.response_time_ms, count: trial_count });
        }
        _ => {}
    }

    Ok(IngestOutcome { earnings: record.earnings_rounded(), clawback })
}
