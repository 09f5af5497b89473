//! Wire records exchanged with the workflow engine.
//!
//! An observation is one task lifecycle event (a pipeline, process or task
//! starting, running or finishing). An action is the acknowledgment the
//! server sends back, correlated to the observation by `event_id`.
//!
//! Both are protobuf messages so any client that speaks the frame
//! protocol can produce and consume them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the only RPC method the server exposes.
pub const SEND_TASK_OBSERVATION: &str = "SendTaskObservation";

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One task lifecycle event, as emitted by the workflow engine.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct TaskObservation {
    /// Client-generated id. Echoed back unchanged in [`Action::observation_event_id`].
    #[prost(string, tag = "1")]
    pub event_id: String,
    /// Free-text classification, e.g. "task_start" or "task_complete".
    #[prost(string, tag = "2")]
    pub event_type: String,
    /// Advisory occurrence time; never validated.
    #[prost(string, tag = "3")]
    pub timestamp_iso: String,
    #[prost(string, tag = "4")]
    pub pipeline_name: String,
    #[prost(string, tag = "5")]
    pub process_name: String,
    #[prost(int64, tag = "6")]
    pub task_id_num: i64,
    #[prost(string, tag = "7")]
    pub task_hash: String,
    #[prost(string, tag = "8")]
    pub task_name: String,
    #[prost(string, tag = "9")]
    pub native_id: String,
    #[prost(string, tag = "10")]
    pub status: String,
    #[prost(int32, optional, tag = "11")]
    pub exit_code: Option<i32>,
    #[prost(int64, optional, tag = "12")]
    pub duration_ms: Option<i64>,
    #[prost(int64, optional, tag = "13")]
    pub peak_rss_bytes: Option<i64>,
    #[prost(double, optional, tag = "14")]
    pub cpu_time_seconds: Option<f64>,
    #[prost(string, tag = "15")]
    pub error_message: String,
    #[prost(string, tag = "16")]
    pub work_dir: String,
    #[prost(string, tag = "17")]
    pub container_id: String,
    #[prost(string, tag = "18")]
    pub container_engine: String,
    #[prost(string, tag = "19")]
    pub script_id: String,
    #[prost(string, tag = "20")]
    pub script_hash: String,
}

impl TaskObservation {
    /// Start an observation with the two fields every event needs.
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = name.into();
        self
    }

    pub fn process(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    pub fn task(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The server's reply to exactly one observation.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Action {
    /// Equals the triggering observation's `event_id`. Empty means the
    /// observation could not be correlated.
    #[prost(string, tag = "1")]
    pub observation_event_id: String,
    /// Fresh on every call, unrelated to the event id.
    #[prost(string, tag = "2")]
    pub action_id: String,
    #[prost(string, tag = "3")]
    pub action_details: String,
    #[prost(bool, tag = "4")]
    pub success: bool,
    #[prost(string, tag = "5")]
    pub message: String,
}

/// Generate a new action id.
pub fn new_action_id() -> String {
    format!("act_{}", Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// RPC envelope
// ---------------------------------------------------------------------------

/// Request envelope: the method name plus its argument.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(message, optional, tag = "2")]
    pub observation: Option<TaskObservation>,
}

impl RpcRequest {
    pub fn send_task_observation(observation: TaskObservation) -> Self {
        Self {
            method: SEND_TASK_OBSERVATION.to_string(),
            observation: Some(observation),
        }
    }
}

/// Error payload for requests the server could not dispatch.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcError {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Error codes carried in [`RpcError::code`].
pub mod codes {
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const UNIMPLEMENTED: i32 = 12;
}
