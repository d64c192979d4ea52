//! Read-side aggregation of a participant's event log into per-task/phase
//! statistics. Nothing here is persisted; output depends only on the events
//! and the stored survey, so it can be recomputed at will.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logging::ProfileScope;
use crate::model::{EventType, SurveyRecord, TaskType, TrialEvent};

const MS_PER_MINUTE: f64 = 60_000.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub task_type: String,
    pub phase: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub total_trials: u32,
    pub correct_count: u32,
    pub accuracy: f64,
    pub active_time_ms: f64,
    pub active_time_minutes: f64,
    pub idle_time_minutes: f64,
    pub duration_minutes: f64,
    pub trials_per_minute: f64,
    pub avg_response_time_ms: f64,
    pub reinforcer_count: u32,
    pub reinforcement_rate_per_min: f64,
    pub position_1_count: u32,
    pub position_2_count: u32,
    pub position_3_count: u32,
    pub percent_pos1: f64,
    pub percent_pos2: f64,
    pub percent_pos3: f64,
    pub percent_left: f64,
    pub percent_right: f64,
    pub total_pr_responses: u32,
    /// Highest PR requirement that was reinforced; 0 if none was.
    pub breakpoint: u32,
    pub opt_out_count: u32,
    pub switch_task_count: u32,
    pub choice_count: u32,
    pub survey_event_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostSurveySummary {
    pub response_count: usize,
    pub answered_count: usize,
    pub submitted_at_ms: i64,
    pub responses: BTreeMap<String, Value>,
}

/// Metric groups keyed `"<task>_<phase>"` (lowercase), plus the synthetic
/// `post_survey` entry when the participant submitted one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParticipantMetrics {
    #[serde(flatten)]
    pub groups: BTreeMap<String, MetricGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_survey: Option<PostSurveySummary>,
}

/// Position bucket named by a selected option, if any.
pub fn classify_position(option: &str) -> Option<u8> {
    let o = option.to_lowercase();
    if o.contains("position 1") || o.contains("bin 1") || o.contains("left") {
        Some(1)
    } else if o.contains("position 2") || o.contains("bin 2") {
        Some(2)
    } else if o.contains("position 3") || o.contains("bin 3") || o.contains("right") {
        Some(3)
    } else {
        None
    }
}

fn is_pr_trial(ev: &TrialEvent) -> bool {
    ev.task_type == TaskType::Dragging
        && (ev.task_variant.trim().eq_ignore_ascii_case("pr") || ev.schedule_requirement > 0)
}

fn pct(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn per_minute(count: u32, minutes: f64) -> f64 {
    if minutes > 0.0 {
        count as f64 / minutes
    } else {
        0.0
    }
}

impl MetricGroup {
    fn open(ev: &TrialEvent) -> Self {
        Self {
            task_type: ev.task_type.as_str().to_string(),
            phase: ev.phase.clone(),
            start_time_ms: ev.timestamp_ms,
            end_time_ms: ev.timestamp_ms,
            ..Default::default()
        }
    }

    fn absorb(&mut self, ev: &TrialEvent) {
        self.start_time_ms = self.start_time_ms.min(ev.timestamp_ms);
        self.end_time_ms = self.end_time_ms.max(ev.timestamp_ms);

        match ev.event_type {
            EventType::Trial => {}
            EventType::OptOut => {
                self.opt_out_count += 1;
                return;
            }
            EventType::SwitchTask => {
                self.switch_task_count += 1;
                return;
            }
            EventType::Choice => {
                self.choice_count += 1;
                return;
            }
            EventType::Survey => {
                self.survey_event_count += 1;
                return;
            }
        }

        self.total_trials += 1;
        if ev.correct {
            self.correct_count += 1;
        }
        self.active_time_ms += ev.response_time_ms;
        if ev.reinforcement_delivered {
            self.reinforcer_count += 1;
        }
        match ev.selected_option.as_deref().and_then(classify_position) {
            Some(1) => self.position_1_count += 1,
            Some(2) => self.position_2_count += 1,
            Some(3) => self.position_3_count += 1,
            _ => {}
        }
        if is_pr_trial(ev) {
            self.total_pr_responses += 1;
            if ev.reinforcement_delivered {
                self.breakpoint = self.breakpoint.max(ev.schedule_requirement);
            }
        }
    }

    fn finish(&mut self) {
        let total_ms = (self.end_time_ms - self.start_time_ms).max(0) as f64;
        self.accuracy = pct(self.correct_count, self.total_trials);
        self.active_time_minutes = self.active_time_ms / MS_PER_MINUTE;
        self.idle_time_minutes = (total_ms - self.active_time_ms).max(0.0) / MS_PER_MINUTE;
        // A single trial has no meaningful span.
        self.duration_minutes = if self.total_trials > 1 { total_ms / MS_PER_MINUTE } else { 0.0 };
        self.trials_per_minute = per_minute(self.total_trials, self.duration_minutes);
        self.reinforcement_rate_per_min = per_minute(self.reinforcer_count, self.duration_minutes);
        self.avg_response_time_ms = if self.total_trials > 0 {
            self.active_time_ms / self.total_trials as f64
        } else {
            0.0
        };
        self.percent_pos1 = pct(self.position_1_count, self.total_trials);
        self.percent_pos2 = pct(self.position_2_count, self.total_trials);
        self.percent_pos3 = pct(self.position_3_count, self.total_trials);
        self.percent_left = self.percent_pos1;
        self.percent_right = self.percent_pos2 + self.percent_pos3;
    }
}

fn summarize_survey(survey: &SurveyRecord) -> PostSurveySummary {
    let answered_count = survey
        .responses
        .values()
        .filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
        .count();
    PostSurveySummary {
        response_count: survey.responses.len(),
        answered_count,
        submitted_at_ms: survey.submitted_at_ms,
        responses: survey.responses.clone(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsAggregator;

impl MetricsAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn group_key(task: TaskType, phase: &str) -> String {
        format!("{}_{}", task.as_str(), phase).to_lowercase()
    }

    /// Never fails: missing fields have already defaulted to zero/empty at
    /// decode time, and empty groups yield zeroed rates.
    pub fn calculate(&self, events: &[TrialEvent], survey: Option<&SurveyRecord>) -> ParticipantMetrics {
        let _scope = ProfileScope::new("metrics.calculate");

        let mut ordered: Vec<&TrialEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp_ms);

        let mut groups: BTreeMap<String, MetricGroup> = BTreeMap::new();
        for ev in ordered {
            groups
                .entry(Self::group_key(ev.task_type, &ev.phase))
                .or_insert_with(|| MetricGroup::open(ev))
                .absorb(ev);
        }
        for group in groups.values_mut() {
            group.finish();
        }

        ParticipantMetrics { groups, post_survey: survey.map(summarize_survey) }
    }
}
