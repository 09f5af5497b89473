//! Maps one observation to one action.
//!
//! The handler holds no per-request state. Its only side effect is appending
//! lines to a [`LogSink`], and a failing sink never changes the reply.

use std::future::Future;
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::fields::{self, FieldDefaults};
use crate::model::{Action, TaskObservation, new_action_id};
use crate::sink::LogSink;
use crate::telemetry::metrics;

/// The seam the server dispatches every call to.
///
/// Implementations must be safe to call concurrently.
pub trait ObservationHandler: Send + Sync + 'static {
    fn handle(&self, observation: TaskObservation) -> impl Future<Output = Action> + Send;
}

/// Which side effect an event type triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Exactly "task_start".
    Start,
    /// Contains "complete", "succeeded" or "failed", ignoring case.
    Done,
    /// Anything else: no side effect.
    Other,
}

const DONE_KEYWORDS: [&str; 3] = ["complete", "succeeded", "failed"];

impl Route {
    pub fn classify(event_type: &str) -> Self {
        if event_type == "task_start" {
            return Self::Start;
        }
        let lowered = event_type.to_lowercase();
        if DONE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            Self::Done
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Done => "done",
            Self::Other => "other",
        }
    }
}

/// Reference handler: acknowledges every observation and logs it to a sink.
#[derive(Clone)]
pub struct ActionHandler {
    sink: Arc<dyn LogSink>,
}

impl ActionHandler {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Build the action for one observation.
    pub fn respond(&self, observation: &TaskObservation) -> Action {
        let route = Route::classify(&observation.event_type);

        self.log(&format!(
            "Received event: id={}, type={}",
            observation.event_id, observation.event_type
        ));
        self.log(&format!(
            "  Pipeline: {}, Process: {}, Task: {}",
            observation.pipeline_name, observation.process_name, observation.task_name
        ));
        match route {
            Route::Start => self.log("start"),
            Route::Done => self.log("done"),
            Route::Other => {}
        }

        if observation.event_id.is_empty() {
            warn!(event_type = %observation.event_type, "observation has no event_id");
            metrics::uncorrelated_observations().add(1, &[]);
        }
        metrics::observations_handled().add(1, &[KeyValue::new("route", route.as_str())]);

        let action = Action {
            observation_event_id: observation.event_id.clone(),
            action_id: new_action_id(),
            action_details: format!(
                "Processed event type '{}': {}",
                observation.event_type,
                route.as_str()
            ),
            success: true,
            message: "Successfully processed TaskObservation".to_string(),
        };
        self.log(&format!("Sending Action: action_id={}", action.action_id));
        action
    }

    /// Coerce loosely-typed fields, then respond. Never fails.
    pub fn handle_fields(&self, fields: &Map<String, Value>) -> Action {
        let coerced = fields::coerce(fields, FieldDefaults::Passthrough);
        for warning in &coerced.warnings {
            self.log(&format!("Warning: {warning}, using default"));
        }
        self.respond(&coerced.observation)
    }

    fn log(&self, line: &str) {
        if let Err(e) = self.sink.append(line) {
            debug!(error = %e, "log sink append failed");
            metrics::sink_failures().add(1, &[]);
        }
    }
}

impl ObservationHandler for ActionHandler {
    async fn handle(&self, observation: TaskObservation) -> Action {
        self.respond(&observation)
    }
}

impl std::fmt::Debug for ActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandler").finish_non_exhaustive()
    }
}
