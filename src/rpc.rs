//! Line-oriented JSON RPC surface over `StudyService`.
//!
//! One request object per line, tagged by `op`; one response object per
//! line. Labels arrive as free-form strings and are decoded here, so a bad
//! task or event type comes back as `invalid_argument`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StudyError, StudyResult};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{EventType, PayoutStatus, TaskType, TrialEvent};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::service::StudyService;
use crate::store::Store;

/// Event as sent by the client, before label decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    pub participant_id: String,
    pub task_type: String,
    pub phase: String,
    #[serde(default)]
    pub task_variant: String,
    pub event_type: String,
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
    #[serde(default)]
    pub timestamp_ms: i64,
}

impl EventInput {
    pub fn into_event(self) -> StudyResult<TrialEvent> {
        Ok(TrialEvent {
            task_type: TaskType::parse(&self.task_type)?,
            event_type: EventType::parse(&self.event_type)?,
            participant_id: self.participant_id,
            phase: self.phase,
            task_variant: self.task_variant,
            trial_number: self.trial_number,
            response_time_ms: self.response_time_ms,
            correct: self.correct,
            selected_option: self.selected_option,
            reinforcement_delivered: self.reinforcement_delivered,
            schedule_requirement: self.schedule_requirement,
            timestamp_ms: self.timestamp_ms,
            day: 0,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateParticipant,
    StartTask {
        participant_id: String,
        task_type: String,
        condition: String,
        #[serde(default)]
        variant: String,
    },
    SubmitTrial {
        participant_id: String,
        task_type: String,
        condition: String,
        #[serde(default)]
        variant: String,
        correct: bool,
    },
    RecordEvent {
        event: EventInput,
    },
    GetEarnings {
        participant_id: String,
    },
    GetMetrics {
        participant_id: String,
    },
    CompleteSession {
        participant_id: String,
    },
    SubmitSurvey {
        participant_id: String,
        responses: BTreeMap<String, Value>,
    },
    RecordDemographics {
        participant_id: String,
        demographics: Value,
    },
    SetPayoutStatus {
        participant_id: String,
        status: String,
    },
    GetParticipant {
        participant_id: String,
    },
    ListParticipants,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateParticipant => "create_participant",
            Request::StartTask { .. } => "start_task",
            Request::SubmitTrial { .. } => "submit_trial",
            Request::RecordEvent { .. } => "record_event",
            Request::GetEarnings { .. } => "get_earnings",
            Request::GetMetrics { .. } => "get_metrics",
            Request::CompleteSession { .. } => "complete_session",
            Request::SubmitSurvey { .. } => "submit_survey",
            Request::RecordDemographics { .. } => "record_demographics",
            Request::SetPayoutStatus { .. } => "set_payout_status",
            Request::GetParticipant { .. } => "get_participant",
            Request::ListParticipants => "list_participants",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub status: u16,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(result: Value) -> Self {
        Self { ok: true, result: Some(result), error: None }
    }

    fn failure(err: &StudyError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                status: err.status_code(),
                msg: err.to_string(),
            }),
        }
    }
}

fn to_value<T: Serialize>(out: StudyResult<T>) -> StudyResult<Value> {
    Ok(serde_json::to_value(out?)?)
}

fn execute<S: Store>(svc: &StudyService<S>, req: Request) -> StudyResult<Value> {
    match req {
        Request::CreateParticipant => to_value(svc.create_participant()),
        Request::StartTask { participant_id, task_type, condition, variant } => {
            to_value(svc.start_task(&participant_id, &task_type, &condition, &variant))
        }
        Request::SubmitTrial { participant_id, task_type, condition, variant, correct } => {
            to_value(svc.submit_trial(&participant_id, &task_type, &condition, &variant, correct))
        }
        Request::RecordEvent { event } => to_value(svc.record_event(event.into_event()?)),
        Request::GetEarnings { participant_id } => to_value(svc.get_earnings(&participant_id)),
        Request::GetMetrics { participant_id } => to_value(svc.get_metrics(&participant_id)),
        Request::CompleteSession { participant_id } => to_value(svc.complete_session(&participant_id)),
        Request::SubmitSurvey { participant_id, responses } => {
            to_value(svc.submit_survey(&participant_id, responses))
        }
        Request::RecordDemographics { participant_id, demographics } => {
            to_value(svc.record_demographics(&participant_id, demographics))
        }
        Request::SetPayoutStatus { participant_id, status } => {
            to_value(svc.set_payout_status(&participant_id, PayoutStatus::parse(&status)?))
        }
        Request::GetParticipant { participant_id } => to_value(svc.get_participant(&participant_id)),
        Request::ListParticipants => to_value(svc.list_participants()),
    }
}

/// Runs one request, retrying version conflicts before reporting them.
pub fn dispatch<S: Store>(svc: &StudyService<S>, req: Request) -> Response {
    let op = req.op();
    let retry = RetryConfig::from_config(svc.config());
    match retry_on_conflict(&retry, op, || execute(svc, req.clone())) {
        Ok(value) => Response::success(value),
        Err(err) => {
            let level = if err.status_code() >= 500 { Level::Error } else { Level::Warn };
            log(
                level,
                Domain::Rpc,
                "request_failed",
                obj(&[("op", v_str(op)), ("kind", v_str(err.kind())), ("msg", v_str(&err.to_string()))]),
            );
            Response::failure(&err)
        }
    }
}

/// Decode one line, dispatch it, and encode the response.
pub fn handle_line<S: Store>(svc: &StudyService<S>, line: &str) -> String {
    let response = match serde_json::from_str::<Request>(line) {
        Ok(req) => dispatch(svc, req),
        Err(e) => Response::failure(&StudyError::invalid(format!("malformed request: {}", e))),
    };
    serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"ok":false,"error":{"kind":"internal","status":500,"msg":"encode failed"}}"#.to_string())
}
