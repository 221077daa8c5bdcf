//! Network boundary channels.
//!
//! The output (sending) side owns a listener for its whole life and the
//! input side connects to it. Every (re)connection starts with the input
//! side sending the number of items it has delivered so far; the output
//! side forgets those and resends the rest of its unacknowledged log. After
//! each delivered item the input side writes the new cumulative count. An
//! item is only forgotten by the sender once the receiver has it, so a
//! broken link loses nothing.

use sl_types::{Buffer, ChannelError, SharedBuffer, Token};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, ChannelReport, ChannelState, ConnectionStatus};
use crate::codec::{encode_item, read_frame, write_body, write_end, CountReader, Frame};
use crate::config::ChannelConfig;
use crate::directory::ChannelDirectory;

/// How a link ended without an I/O failure.
enum LinkEnd {
    /// Everything was delivered and the stream closed cleanly.
    Finished,
    /// A non-clean stop was requested.
    Aborted,
}

fn timed_out(what: &str) -> ChannelError {
    ChannelError::Io(io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out")))
}

/// Encoded items written to the link but not yet acknowledged.
#[derive(Debug, Default)]
struct UnackedLog {
    /// Cumulative count of acknowledged items.
    acked: u64,
    frames: VecDeque<Vec<u8>>,
    /// Index of the next frame to write on the current link.
    cursor: usize,
}

impl UnackedLog {
    fn push(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames written on the current link and not yet acknowledged.
    fn in_flight(&self) -> usize {
        self.cursor
    }

    fn next_unsent(&self) -> Option<&[u8]> {
        self.frames.get(self.cursor).map(Vec::as_slice)
    }

    fn mark_sent(&mut self) {
        self.cursor += 1;
    }

    /// Restarts writing from the oldest unacknowledged frame.
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Applies a cumulative delivered count, returning how many frames it
    /// newly confirmed.
    fn acknowledge(&mut self, delivered: u64) -> Result<u64, ChannelError> {
        if delivered < self.acked {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer regressed to {delivered} after acknowledging {}", self.acked),
            )));
        }
        let confirmed = delivered - self.acked;
        if confirmed > self.frames.len() as u64 {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer acknowledged {delivered} items but only {} were sent", self.acked + self.frames.len() as u64),
            )));
        }
        let n = confirmed as usize;
        self.frames.drain(..n);
        self.cursor = self.cursor.saturating_sub(n);
        self.acked = delivered;
        Ok(confirmed)
    }
}

// ---------------------------------------------------------------------------
// Output side
// ---------------------------------------------------------------------------

/// Sends the items of a local buffer to a remote [`TcpInputChannel`].
///
/// A clean stop finishes only after a receiver has acknowledged every item
/// and seen the end-of-stream marker, so it waits for a receiver to connect.
pub struct TcpOutputChannel {
    state: Arc<ChannelState>,
    listener: TcpListener,
    buffer: SharedBuffer,
    config: ChannelConfig,
}

impl TcpOutputChannel {
    /// Binds an ephemeral port on `host` and publishes it under `token`.
    pub async fn bind(
        token: Token,
        buffer: SharedBuffer,
        host: IpAddr,
        config: &ChannelConfig,
        directory: &ChannelDirectory,
    ) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(SocketAddr::new(host, 0)).await?;
        let addr = listener.local_addr()?;
        let name = format!("tcp-out {token}");
        info!(channel = %name, %addr, "output channel listening");
        directory.publish(token, addr);
        Ok(Self {
            state: Arc::new(ChannelState::new(name, token)),
            listener,
            buffer,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> ChannelHandle {
        let state = self.state.clone();
        ChannelHandle::spawn(state, self.run())
    }

    async fn run(self) -> ChannelReport {
        let mut report = ChannelReport {
            name: self.state.name.clone(),
            ..Default::default()
        };
        let mut log = UnackedLog::default();
        loop {
            if self.state.abort_requested() {
                break;
            }
            let Some((stream, peer)) = self.accept_once().await else {
                continue;
            };
            match self.serve(stream, peer, &mut log, &mut report).await {
                Ok(LinkEnd::Finished) => {
                    report.clean = true;
                    break;
                }
                Ok(LinkEnd::Aborted) => break,
                Err(e) => {
                    report.reconnects += 1;
                    self.state.set_remote(None);
                    self.state.set_status(ConnectionStatus::Reconnecting);
                    warn!(
                        channel = %self.state.name,
                        error = %e,
                        unacked = log.len(),
                        "link failed, waiting for reconnection"
                    );
                }
            }
        }
        if !report.clean {
            report.dropped += (log.len() + self.buffer.size()) as u64;
        }
        self.state.set_remote(None);
        self.state.set_status(ConnectionStatus::Closed);
        info!(
            channel = %report.name,
            sent = report.sent,
            reconnects = report.reconnects,
            dropped = report.dropped,
            clean = report.clean,
            "output channel closed"
        );
        report
    }

    /// One accept attempt, bounded by the reconnect wait.
    async fn accept_once(&self) -> Option<(TcpStream, SocketAddr)> {
        tokio::select! {
            _ = self.state.aborted() => None,
            accepted = timeout(self.config.reconnect_wait(), self.listener.accept()) => match accepted {
                Ok(Ok(pair)) => Some(pair),
                Ok(Err(e)) => {
                    warn!(channel = %self.state.name, error = %e, "accept failed");
                    sleep(self.config.poll_interval()).await;
                    None
                }
                Err(_) => None,
            },
        }
    }

    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        log: &mut UnackedLog,
        report: &mut ChannelReport,
    ) -> Result<LinkEnd, ChannelError> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let delivered = timeout(self.config.reconnect_wait(), reader.read_u64())
            .await
            .map_err(|_| timed_out("handshake"))??;
        report.sent += log.acknowledge(delivered)?;
        log.rewind();
        self.state.set_remote(Some(peer));
        self.state.set_status(ConnectionStatus::Connected);
        info!(
            channel = %self.state.name,
            %peer,
            delivered,
            resend = log.len(),
            "output channel connected"
        );

        let mut acks = CountReader::default();
        let window = self.config.send_window();
        loop {
            if self.state.abort_requested() {
                return Ok(LinkEnd::Aborted);
            }
            for count in poll_counts(&reader, &mut acks)? {
                report.sent += log.acknowledge(count)?;
            }
            // A full window means the receiver is behind, not gone; wait
            // for acknowledgements rather than block on the socket.
            if log.in_flight() < window {
                if let Some(frame) = log.next_unsent() {
                    self.write_frame(&mut writer, frame).await?;
                    log.mark_sent();
                    continue;
                }
            }
            if log.len() < window {
                if let Some(item) = self.buffer.read() {
                    match encode_item(&item, self.config.max_frame_bytes) {
                        Ok(frame) => log.push(frame),
                        Err(e) => {
                            warn!(channel = %self.state.name, error = %e, "dropping unencodable item");
                            report.dropped += 1;
                        }
                    }
                    continue;
                }
            }
            if self.state.stop_requested() && log.is_empty() {
                timeout(self.config.write_timeout(), write_end(&mut writer))
                    .await
                    .map_err(|_| timed_out("end of stream"))??;
                // Wait for the receiver to hang up.
                let _ = timeout(self.config.reconnect_wait(), reader.read_u8()).await;
                return Ok(LinkEnd::Finished);
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    async fn write_frame(&self, writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), ChannelError> {
        timeout(self.config.write_timeout(), write_body(writer, frame))
            .await
            .map_err(|_| timed_out("write"))?
    }
}

/// Drains whatever count bytes are ready without blocking. A closed stream
/// is an error.
fn poll_counts(reader: &OwnedReadHalf, counts: &mut CountReader) -> Result<Vec<u64>, ChannelError> {
    let mut ready = Vec::new();
    let mut scratch = [0u8; 64];
    loop {
        match reader.try_read(&mut scratch) {
            Ok(0) => {
                return Err(ChannelError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the link",
                )))
            }
            Ok(n) => ready.extend(counts.feed(&scratch[..n])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ready),
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Input side
// ---------------------------------------------------------------------------

/// Receives items from a remote [`TcpOutputChannel`] into a local buffer.
///
/// The sender's address is looked up in a [`ChannelDirectory`]. A clean stop
/// keeps receiving until the sender signals end of stream; use a non-clean
/// stop to abandon a sender that is gone.
pub struct TcpInputChannel {
    state: Arc<ChannelState>,
    buffer: SharedBuffer,
    directory: Arc<ChannelDirectory>,
    config: ChannelConfig,
}

impl TcpInputChannel {
    pub fn new(
        token: Token,
        buffer: SharedBuffer,
        directory: Arc<ChannelDirectory>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            state: Arc::new(ChannelState::new(format!("tcp-in {token}"), token)),
            buffer,
            directory,
            config: config.clone(),
        }
    }

    pub fn spawn(self) -> ChannelHandle {
        let state = self.state.clone();
        ChannelHandle::spawn(state, self.run())
    }

    async fn run(self) -> ChannelReport {
        let mut report = ChannelReport {
            name: self.state.name.clone(),
            ..Default::default()
        };
        loop {
            if self.state.abort_requested() {
                break;
            }
            let Some((stream, peer)) = self.connect_once().await else {
                continue;
            };
            match self.serve(stream, peer, &mut report).await {
                Ok(LinkEnd::Finished) => {
                    report.clean = true;
                    break;
                }
                Ok(LinkEnd::Aborted) => break,
                Err(e) => {
                    report.reconnects += 1;
                    self.state.set_remote(None);
                    self.state.set_status(ConnectionStatus::Reconnecting);
                    warn!(
                        channel = %self.state.name,
                        error = %e,
                        delivered = report.received,
                        "link failed, reconnecting"
                    );
                }
            }
        }
        self.state.set_remote(None);
        self.state.set_status(ConnectionStatus::Closed);
        info!(
            channel = %report.name,
            received = report.received,
            reconnects = report.reconnects,
            clean = report.clean,
            "input channel closed"
        );
        report
    }

    /// One connection attempt, bounded by the reconnect wait.
    async fn connect_once(&self) -> Option<(TcpStream, SocketAddr)> {
        let Some(addr) = self.directory.resolve(&self.state.token) else {
            debug!(channel = %self.state.name, "sender not published yet");
            self.pause().await;
            return None;
        };
        match timeout(self.config.reconnect_wait(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Some((stream, addr)),
            Ok(Err(e)) => {
                debug!(channel = %self.state.name, %addr, error = %e, "connect failed");
                self.pause().await;
                None
            }
            Err(_) => None,
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.state.aborted() => {}
            _ = sleep(self.config.reconnect_wait()) => {}
        }
    }

    async fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        report: &mut ChannelReport,
    ) -> Result<LinkEnd, ChannelError> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        self.write_count(&mut writer, report.received).await?;
        self.state.set_remote(Some(peer));
        self.state.set_status(ConnectionStatus::Connected);
        info!(
            channel = %self.state.name,
            %peer,
            delivered = report.received,
            "input channel connected"
        );

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.state.aborted() => return Ok(LinkEnd::Aborted),
                frame = read_frame(&mut reader, self.config.max_frame_bytes) => frame?,
            };
            match frame {
                Frame::End => return Ok(LinkEnd::Finished),
                Frame::Item(mut item) => {
                    loop {
                        match self.buffer.write(item) {
                            Ok(()) => break,
                            Err(back) => {
                                if self.state.abort_requested() {
                                    report.dropped += 1;
                                    return Ok(LinkEnd::Aborted);
                                }
                                item = back;
                                sleep(self.config.poll_interval()).await;
                            }
                        }
                    }
                    report.received += 1;
                    self.write_count(&mut writer, report.received).await?;
                }
            }
        }
    }

    async fn write_count(&self, writer: &mut OwnedWriteHalf, count: u64) -> Result<(), ChannelError> {
        timeout(self.config.write_timeout(), writer.write_u64(count))
            .await
            .map_err(|_| timed_out("acknowledgement"))??;
        Ok(())
    }
}
