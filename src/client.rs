//! Client for the `SendTaskObservation` call.
//!
//! Builds observations from loose key/value input with the client-side
//! defaults (fresh event id, current timestamp) and sends them over one
//! reusable connection. Retry policy is the caller's business.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fields::{self, FieldDefaults};
use crate::frame::{Frame, FrameCodec, FrameError, framed};
use crate::model::{Action, RpcRequest, TaskObservation};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to an action server.
#[derive(Debug)]
pub struct ActionClient {
    addr: String,
    frames: Framed<TcpStream, FrameCodec>,
}

impl ActionClient {
    /// Connect to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        debug!(addr, "connected to action server");
        Ok(Self {
            addr: addr.to_string(),
            frames: framed(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one observation and wait for its action.
    ///
    /// # Errors
    ///
    /// Connection-level failures (`Error::Io`, `Error::Frame`) and
    /// server-side rejections (`Error::Remote`).
    pub async fn send_task_observation(&mut self, observation: TaskObservation) -> Result<Action> {
        info!(
            event_id = %observation.event_id,
            event_type = %observation.event_type,
            addr = %self.addr,
            "sending task observation"
        );
        let call = Frame::Call(RpcRequest::send_task_observation(observation));
        self.frames.send(call).await?;

        match self.frames.next().await {
            Some(Ok(Frame::Action(action))) => Ok(action),
            Some(Ok(Frame::Rejection(err))) => Err(Error::Remote {
                code: err.code,
                message: err.message,
            }),
            Some(Ok(other)) => Err(FrameError::UnexpectedKind(other.kind()).into()),
            Some(Err(e)) => Err(e.into()),
            None => Err(FrameError::ConnectionClosed.into()),
        }
    }

    /// Coerce loose fields with client defaults, then send.
    ///
    /// Malformed numeric values are logged and defaulted, never fatal.
    pub async fn send_fields(&mut self, fields: &Map<String, Value>) -> Result<Action> {
        let coerced = fields::coerce(fields, FieldDefaults::Client);
        self.send_task_observation(coerced.observation).await
    }
}

/// One-shot convenience: connect, send, disconnect.
pub async fn send_task_observation(addr: &str, fields: &Map<String, Value>) -> Result<Action> {
    let mut client = ActionClient::connect(addr).await?;
    client.send_fields(fields).await
}
