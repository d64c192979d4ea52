//! Reinforcement ledger: decides rewards per trial and keeps the earning
//! counters of a `ParticipantRecord` consistent.
//!
//! All operations work on a record the caller already holds exclusively;
//! serialization per participant is the service's job.

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::StudyResult;
use crate::logging::{log_cap_reached, log_clawback, log_reward, log_schedule_extended, log_task_start, log_trial};
use crate::model::{pre_training_key, Condition, ParticipantRecord, RewardEntry, ScheduleState, TaskKey, TaskType};
use crate::schedule::ScheduleGenerator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStart {
    pub total_earnings: Decimal,
    pub trials_completed: u32,
}

/// What happened to the money side of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardDecision {
    /// Not an earning arm, or an incorrect response.
    NotEligible,
    /// Correct, but the current threshold is not yet met.
    BelowThreshold,
    Granted(Decimal),
    /// Threshold met with the cap already reached.
    Capped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub reward_earned: bool,
    pub reward_amount: Decimal,
    pub total_earnings: Decimal,
    pub trials_completed: u32,
    pub current_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsSummary {
    pub total_earnings: Decimal,
    pub remaining_possible: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clawback {
    pub day: u32,
    pub forfeited: Decimal,
    pub total_earnings: Decimal,
}

#[derive(Debug, Clone)]
pub struct ReinforcementLedger {
    generator: ScheduleGenerator,
    reward_amount: Decimal,
    max_earnings: Decimal,
    trial_hint: u32,
}

impl ReinforcementLedger {
    pub fn new(cfg: &Config) -> Self {
        Self {
            generator: ScheduleGenerator::from_config(cfg),
            reward_amount: cfg.reward_amount(),
            max_earnings: cfg.max_earnings(),
            trial_hint: cfg.schedule_trial_hint,
        }
    }

    pub fn max_earnings(&self) -> Decimal {
        self.max_earnings
    }

    fn fresh_state<R: Rng + ?Sized>(&self, rng: &mut R) -> ScheduleState {
        ScheduleState::with_schedule(self.generator.generate(self.trial_hint, rng))
    }

    /// Ensures ledger state exists for the task. Pre-training and Genuine report
    /// their per-variant completion counter and never touch the money ledger.
    pub fn start_task<R: Rng + ?Sized>(
        &self,
        record: &mut ParticipantRecord,
        task: TaskType,
        condition: Condition,
        variant: &str,
        rng: &mut R,
    ) -> StudyResult<TaskStart> {
        if condition.uses_pre_training_counter() {
            let key = pre_training_key(task, variant);
            let done = record.pre_training_completion.get(&key).copied().unwrap_or(0);
            log_task_start(&record.participant_id, &key, done, 0);
            return Ok(TaskStart { total_earnings: record.earnings_rounded(), trials_completed: done });
        }

        let key = TaskKey::new(task, condition)?;
        let state = record
            .reinforcement_state
            .entry(key)
            .or_insert_with(|| self.fresh_state(rng));
        let trials_completed = state.trials_completed;
        log_task_start(&record.participant_id, &key.to_string(), trials_completed, state.schedule.len());
        Ok(TaskStart { total_earnings: record.earnings_rounded(), trials_completed })
    }

    /// Applies one trial. The variant only matters for the completion counters;
    /// main-task progress is shared by all variants of a `(task, condition)` pair.
    pub fn process_trial<R: Rng + ?Sized>(
        &self,
        record: &mut ParticipantRecord,
        task: TaskType,
        is_correct: bool,
        condition: Condition,
        variant: &str,
        rng: &mut R,
    ) -> StudyResult<TrialOutcome> {
        if condition.uses_pre_training_counter() {
            let key = pre_training_key(task, variant);
            let done = record.pre_training_completion.entry(key.clone()).or_insert(0);
            *done += 1;
            let trials_completed = *done;
            log_trial(&record.participant_id, &key, is_correct, trials_completed, 0);
            return Ok(TrialOutcome {
                reward_earned: false,
                reward_amount: Decimal::ZERO,
                total_earnings: record.earnings_rounded(),
                trials_completed,
                current_threshold: 0,
            });
        }

        let key = TaskKey::new(task, condition)?;
        let key_str = key.to_string();
        let remaining = (self.max_earnings - record.earnings).max(Decimal::ZERO);

        let state = record
            .reinforcement_state
            .entry(key)
            .or_insert_with(|| self.fresh_state(rng));
        state.trials_completed += 1;
        let threshold = state.current_threshold();

        let decision = if !(condition.earns_money() && is_correct) {
            RewardDecision::NotEligible
        } else {
            state.correct_count += 1;
            if state.correct_count >= threshold {
                state.correct_count = 0;
                state.schedule_index += 1;
                if state.schedule_index >= state.schedule.len() {
                    self.generator.extend(&mut state.schedule, self.trial_hint, rng);
                    log_schedule_extended(&record.participant_id, &key_str, state.schedule.len());
                }
                let amount = self.reward_amount.min(remaining);
                if amount > Decimal::ZERO {
                    RewardDecision::Granted(amount)
                } else {
                    RewardDecision::Capped
                }
            } else {
                RewardDecision::BelowThreshold
            }
        };
        let trials_completed = state.trials_completed;
        log_trial(&record.participant_id, &key_str, is_correct, trials_completed, threshold);

        let reward_amount = match decision {
            RewardDecision::Granted(amount) => {
                record.earnings += amount;
                *record.earnings_by_task.entry(key).or_insert(Decimal::ZERO) += amount;
                record.reward_journal.push(RewardEntry {
                    day: record.current_day,
                    key,
                    amount,
                });
                log_reward(&record.participant_id, &key_str, amount, record.earnings);
                amount
            }
            RewardDecision::Capped => {
                log_cap_reached(&record.participant_id, &key_str, record.earnings, self.max_earnings);
                Decimal::ZERO
            }
            RewardDecision::NotEligible | RewardDecision::BelowThreshold => Decimal::ZERO,
        };

        Ok(TrialOutcome {
            reward_earned: reward_amount > Decimal::ZERO,
            reward_amount,
            total_earnings: record.earnings_rounded(),
            trials_completed,
            current_threshold: threshold,
        })
    }

    pub fn earnings(&self, record: &ParticipantRecord) -> EarningsSummary {
        let total = record.earnings_rounded();
        EarningsSummary {
            total_earnings: total,
            remaining_possible: (self.max_earnings - total).max(Decimal::ZERO),
        }
    }

    /// Deducts the sum of every coercion reward for `task` delivered on the
    /// participant's current day. Each opt-out deducts the full sum again; both
    /// the total and the per-task breakdown are floored at zero.
    pub fn clawback(&self, record: &mut ParticipantRecord, task: TaskType) -> StudyResult<Clawback> {
        let key = TaskKey::new(task, Condition::Coercion)?;
        let day = record.current_day;
        let forfeited: Decimal = record
            .reward_journal
            .iter()
            .filter(|e| e.key == key && e.day == day)
            .map(|e| e.amount)
            .sum();

        if forfeited > Decimal::ZERO {
            record.earnings = (record.earnings - forfeited).max(Decimal::ZERO);
            if let Some(by_task) = record.earnings_by_task.get_mut(&key) {
                *by_task = (*by_task - forfeited).max(Decimal::ZERO);
            }
        }
        log_clawback(&record.participant_id, &key.to_string(), day, forfeited, record.earnings);

        Ok(Clawback { day, forfeited, total_earnings: record.earnings_rounded() })
    }
}
