//! Span helpers for calls and server lifecycle transitions.

use std::net::SocketAddr;

use tracing::Span;

/// Start a span for one connection.
pub fn start_connection_span(peer: &SocketAddr) -> Span {
    tracing::info_span!("rpc.connection", "net.peer" = %peer)
}

/// Start a span for one `SendTaskObservation` call.
///
/// The `rpc.action_id` field is declared empty and can be filled via
/// [`record_action`].
pub fn start_call_span(event_id: &str, event_type: &str) -> Span {
    tracing::info_span!(
        "rpc.send_task_observation",
        "rpc.event_id" = event_id,
        "rpc.event_type" = event_type,
        "rpc.action_id" = tracing::field::Empty,
    )
}

/// Record the generated action id on a call span.
pub fn record_action(span: &Span, action_id: &str) {
    span.record("rpc.action_id", action_id);
}

/// Start a span for the server lifecycle.
pub fn start_lifecycle_span(addr: &SocketAddr) -> Span {
    tracing::info_span!("server.lifecycle", "server.addr" = %addr)
}

/// Record a lifecycle transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
