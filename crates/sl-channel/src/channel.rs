//! Channel handles shared by every channel kind.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sl_types::{ChannelError, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection status of a boundary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Waiting for the first connection.
    Connecting,
    Connected,
    /// The link failed and the channel is waiting for a new one.
    Reconnecting,
    /// The channel task has ended.
    Closed,
}

/// Summary returned when a channel task ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub name: String,
    /// Items confirmed delivered to the receiving side.
    pub sent: u64,
    /// Items placed into the local destination buffer.
    pub received: u64,
    pub reconnects: u64,
    /// Items abandoned by a non-clean stop.
    pub dropped: u64,
    /// True when the channel ended by delivering everything it held.
    pub clean: bool,
}

/// State shared between a channel task and its handle.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) name: String,
    pub(crate) token: Token,
    status: RwLock<ConnectionStatus>,
    remote: RwLock<Option<SocketAddr>>,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl ChannelState {
    pub(crate) fn new(name: String, token: Token) -> Self {
        Self {
            name,
            token,
            status: RwLock::new(ConnectionStatus::Connecting),
            remote: RwLock::new(None),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn set_remote(&self, remote: Option<SocketAddr>) {
        *self.remote.write() = remote;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once a non-clean stop is requested.
    pub(crate) async fn aborted(&self) {
        self.abort.cancelled().await
    }
}

/// A running channel direction.
#[async_trait]
pub trait BoundaryChannel: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// The edge this channel carries.
    fn token(&self) -> Token;

    fn connection_status(&self) -> ConnectionStatus;

    /// Address of the peer on the current link, if any.
    fn remote_endpoint(&self) -> Option<SocketAddr>;

    /// Requests termination. A clean stop delivers every item queued before
    /// the request and then closes; a non-clean stop ends at the next
    /// bounded wait, discarding what is left. A non-clean stop may follow a
    /// clean one to abandon it.
    fn stop(&self, clean: bool);

    /// Waits for the task to end. Repeated calls return the same report.
    async fn close(&self) -> Result<ChannelReport, ChannelError>;
}

/// Handle to a spawned channel task.
pub struct ChannelHandle {
    state: Arc<ChannelState>,
    task: Mutex<Option<JoinHandle<ChannelReport>>>,
    report: tokio::sync::Mutex<Option<ChannelReport>>,
}

impl ChannelHandle {
    pub(crate) fn spawn<F>(state: Arc<ChannelState>, task: F) -> Self
    where
        F: std::future::Future<Output = ChannelReport> + Send + 'static,
    {
        Self {
            state,
            task: Mutex::new(Some(tokio::spawn(task))),
            report: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stop_requested()
    }
}

#[async_trait]
impl BoundaryChannel for ChannelHandle {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn token(&self) -> Token {
        self.state.token
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.state.status.read()
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        *self.state.remote.read()
    }

    fn stop(&self, clean: bool) {
        debug!(channel = %self.state.name, clean, "stop requested");
        if !clean {
            self.state.abort.cancel();
        }
        self.state.stop.cancel();
    }

    async fn close(&self) -> Result<ChannelReport, ChannelError> {
        let mut report = self.report.lock().await;
        if let Some(done) = report.as_ref() {
            return Ok(done.clone());
        }
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Err(ChannelError::Stopped {
                name: self.state.name.clone(),
            });
        };
        let done = task
            .await
            .map_err(|e| ChannelError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        *report = Some(done.clone());
        Ok(done)
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.state.abort.cancel();
        self.state.stop.cancel();
    }
}
