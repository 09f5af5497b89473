//! # ai-action-streamer
//!
//! Receives task lifecycle observations from a workflow engine and replies
//! to each with exactly one correlated action.
//!
//! Provides the observation handler, a supervised server lifecycle
//! (start / stop with grace / await termination), in-process and actor
//! hosting, a client, and OpenTelemetry observability.

pub mod client;
pub mod config;
pub mod error;
pub mod fields;
pub mod frame;
pub mod handler;
pub mod model;
pub mod server;
pub mod sink;
pub mod telemetry;

pub use error::{Error, Result};
