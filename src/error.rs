//! Error types for ai-action-streamer.

use std::net::SocketAddr;

use thiserror::Error;

use crate::frame::FrameError;
use crate::server::ServerState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid lifecycle transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ServerState, to: ServerState },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("server returned error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("lifecycle actor is gone")]
    ActorGone,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
