use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqError, ZmqMessage};

use crate::{
    connection::ConnectionInfo,
    wire::{Header, Message, ProtocolError, Signer},
};

/// Wait used for each non-blocking receive while draining the iopub backlog.
const DRAIN_POLL: Duration = Duration::from_millis(2);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Socket(#[from] ZmqError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("session is closed")]
    Closed,
}

/// The two kernel channels a session talks over, as raw multipart frames.
#[async_trait]
pub trait Channels: Send {
    async fn send_shell(&mut self, frames: Vec<Bytes>) -> Result<(), SessionError>;
    async fn recv_shell(&mut self) -> Result<Vec<Bytes>, SessionError>;
    /// Returns `None` when nothing arrives on the shell channel within `wait`.
    async fn poll_shell(&mut self, wait: Duration) -> Result<Option<Vec<Bytes>>, SessionError>;
    /// Returns `None` when nothing arrives on the iopub channel within `wait`.
    async fn poll_iopub(&mut self, wait: Duration) -> Result<Option<Vec<Bytes>>, SessionError>;
    /// Closes both channels. Closing twice is a no-op.
    async fn close(&mut self);
}

/// ZeroMQ DEALER (shell) and SUB (iopub) sockets connected to a kernel.
pub struct ZmqChannels {
    shell: Option<DealerSocket>,
    iopub: Option<SubSocket>,
}

impl ZmqChannels {
    pub async fn connect(
        connection: &ConnectionInfo,
        connect_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let shell_endpoint = connection.shell_endpoint();
        let iopub_endpoint = connection.iopub_endpoint();
        info!(shell = %shell_endpoint, iopub = %iopub_endpoint, "connecting to kernel");

        let mut shell = DealerSocket::new();
        timeout(connect_timeout, shell.connect(&shell_endpoint))
            .await
            .map_err(|_| SessionError::ConnectTimeout(shell_endpoint))??;

        let mut iopub = SubSocket::new();
        timeout(connect_timeout, iopub.connect(&iopub_endpoint))
            .await
            .map_err(|_| SessionError::ConnectTimeout(iopub_endpoint))??;
        iopub.subscribe("").await?;

        Ok(Self {
            shell: Some(shell),
            iopub: Some(iopub),
        })
    }
}

#[async_trait]
impl Channels for ZmqChannels {
    async fn send_shell(&mut self, frames: Vec<Bytes>) -> Result<(), SessionError> {
        let shell = self.shell.as_mut().ok_or(SessionError::Closed)?;
        let message = ZmqMessage::try_from(frames).map_err(|_| ProtocolError::Empty)?;
        shell.send(message).await?;
        Ok(())
    }

    async fn recv_shell(&mut self) -> Result<Vec<Bytes>, SessionError> {
        let shell = self.shell.as_mut().ok_or(SessionError::Closed)?;
        Ok(shell.recv().await?.into_vec())
    }

    async fn poll_shell(&mut self, wait: Duration) -> Result<Option<Vec<Bytes>>, SessionError> {
        let shell = self.shell.as_mut().ok_or(SessionError::Closed)?;
        recv_within(shell, wait).await
    }

    async fn poll_iopub(&mut self, wait: Duration) -> Result<Option<Vec<Bytes>>, SessionError> {
        let iopub = self.iopub.as_mut().ok_or(SessionError::Closed)?;
        recv_within(iopub, wait).await
    }

    async fn close(&mut self) {
        if let Some(shell) = self.shell.take() {
            for e in shell.close().await {
                warn!(error = %e, "error closing shell socket");
            }
            debug!("shell socket closed");
        }
        if let Some(iopub) = self.iopub.take() {
            for e in iopub.close().await {
                warn!(error = %e, "error closing iopub socket");
            }
            debug!("iopub socket closed");
        }
    }
}

async fn recv_within<S>(socket: &mut S, wait: Duration) -> Result<Option<Vec<Bytes>>, SessionError>
where
    S: SocketRecv + Send,
{
    match timeout(wait, socket.recv()).await {
        Ok(message) => Ok(Some(message?.into_vec())),
        Err(_) => Ok(None),
    }
}

/// A signed conversation with one kernel over a pair of channels.
pub struct Session<C> {
    channels: C,
    signer: Signer,
    session_id: String,
    username: String,
}

impl<C: Channels> Session<C> {
    pub fn new(channels: C, signer: Signer, username: impl Into<String>) -> Self {
        Self {
            channels,
            signer,
            session_id: Uuid::new_v4().to_string(),
            username: username.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channels(&self) -> &C {
        &self.channels
    }

    /// Signs and sends a fresh request on the shell channel, returning its msg id.
    pub async fn send_request(
        &mut self,
        msg_type: &str,
        content: Value,
    ) -> Result<String, SessionError> {
        let header = Header::new(msg_type, &self.session_id, &self.username);
        let msg_id = header.msg_id.clone();
        let frames = Message::request(header, content).to_frames(&self.signer)?;

        self.channels.send_shell(frames).await?;
        debug!(%msg_id, msg_type, "request sent");

        Ok(msg_id)
    }

    /// Reads the next shell reply without interpreting it.
    pub async fn discard_shell_reply(&mut self) -> Result<(), SessionError> {
        let frames = self.channels.recv_shell().await?;
        debug!(frames = frames.len(), "shell reply consumed");
        Ok(())
    }

    pub async fn poll_shell(&mut self, wait: Duration) -> Result<Option<Message>, SessionError> {
        let frames = self.channels.poll_shell(wait).await?;
        Ok(frames.and_then(|frames| decode_or_skip(frames, "shell")))
    }

    /// Undecodable iopub messages are logged and reported as no message.
    pub async fn poll_iopub(&mut self, wait: Duration) -> Result<Option<Message>, SessionError> {
        let frames = self.channels.poll_iopub(wait).await?;
        Ok(frames.and_then(|frames| decode_or_skip(frames, "iopub")))
    }

    /// Discards up to `limit` queued iopub messages and returns how many were dropped.
    pub async fn drain_iopub(&mut self, limit: usize) -> usize {
        let mut drained = 0;
        while drained < limit {
            match self.channels.poll_iopub(DRAIN_POLL).await {
                Ok(Some(_)) => drained += 1,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "stopped draining iopub backlog");
                    break;
                }
            }
        }

        if drained > 0 {
            debug!(drained, "discarded stale iopub messages");
        }
        drained
    }

    pub async fn close(&mut self) {
        self.channels.close().await;
    }
}

fn decode_or_skip(frames: Vec<Bytes>, channel: &str) -> Option<Message> {
    match Message::from_frames(frames) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(channel, error = %e, "skipping undecodable message");
            None
        }
    }
}
