//! Per-connection call loop.
//!
//! A connection carries any number of sequential calls. Between calls it
//! closes as soon as shutdown begins; a call already being handled runs on
//! until it replies or the force token fires. Malformed input gets one
//! rejection frame and then the connection is closed.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::frame::{Frame, framed};
use crate::handler::ObservationHandler;
use crate::model::{RpcError, SEND_TASK_OBSERVATION, codes};
use crate::telemetry::metrics;
use crate::telemetry::rpc::{record_action, start_call_span};

pub(super) async fn serve<H: ObservationHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    shutdown: CancellationToken,
    force: CancellationToken,
) {
    let mut frames = framed(stream);

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => {
                debug!("closing idle connection");
                return;
            }
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            None => {
                debug!("peer closed connection");
                return;
            }
            Some(Err(e)) if e.is_malformed() => {
                warn!(error = %e, "malformed frame, closing connection");
                let rejection = rejection(codes::INVALID_ARGUMENT, "malformed", e.to_string());
                let _ = frames.send(rejection).await;
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to read frame");
                reject("read");
                return;
            }
        };

        let reply = tokio::select! {
            () = force.cancelled() => {
                warn!("call abandoned after grace window");
                return;
            }
            reply = dispatch(handler.as_ref(), frame) => reply,
        };

        let sent = tokio::select! {
            () = force.cancelled() => return,
            sent = frames.send(reply) => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "failed to send reply");
            return;
        }
    }
}

async fn dispatch<H: ObservationHandler>(handler: &H, frame: Frame) -> Frame {
    let request = match frame {
        Frame::Call(request) => request,
        other => {
            return rejection(
                codes::INVALID_ARGUMENT,
                "unexpected_kind",
                format!("expected a call frame, got {:?}", other.kind()),
            );
        }
    };

    if request.method != SEND_TASK_OBSERVATION {
        return rejection(
            codes::UNIMPLEMENTED,
            "unknown_method",
            format!("unknown method '{}'", request.method),
        );
    }

    // A call without an observation still gets an (uncorrelated) action.
    let observation = request.observation.unwrap_or_default();
    let span = start_call_span(&observation.event_id, &observation.event_type);

    let started = Instant::now();
    let _in_flight = InFlight::enter();
    let action = handler.handle(observation).instrument(span.clone()).await;
    record_action(&span, &action.action_id);
    metrics::call_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

    Frame::Action(action)
}

fn rejection(code: i32, reason: &'static str, message: String) -> Frame {
    reject(reason);
    Frame::Rejection(RpcError { code, message })
}

fn reject(reason: &'static str) {
    metrics::rpc_errors().add(1, &[opentelemetry::KeyValue::new("reason", reason)]);
}

/// Keeps the in-flight gauge balanced even when a call is abandoned.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::calls_in_flight().add(1, &[]);
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::calls_in_flight().add(-1, &[]);
    }
}
