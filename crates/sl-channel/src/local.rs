//! Pass-through channel between two buffers on the same node.
//!
//! A non-clean stop leaves unmoved items in the source buffer.

use sl_types::{Buffer, SharedBuffer, Token};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::channel::{ChannelHandle, ChannelReport, ChannelState, ConnectionStatus};
use crate::config::ChannelConfig;

/// Moves items from one local buffer to another, in order.
pub struct LocalChannel {
    state: Arc<ChannelState>,
    source: SharedBuffer,
    sink: SharedBuffer,
    poll_interval: Duration,
}

impl LocalChannel {
    pub fn new(token: Token, source: SharedBuffer, sink: SharedBuffer, config: &ChannelConfig) -> Self {
        Self {
            state: Arc::new(ChannelState::new(format!("local {token}"), token)),
            source,
            sink,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn spawn(self) -> ChannelHandle {
        let state = self.state.clone();
        ChannelHandle::spawn(state, self.run())
    }

    async fn run(self) -> ChannelReport {
        self.state.set_status(ConnectionStatus::Connected);
        let mut report = ChannelReport {
            name: self.state.name.clone(),
            ..Default::default()
        };
        loop {
            if self.state.abort_requested() {
                break;
            }
            if self.source.is_empty() {
                if self.state.stop_requested() {
                    report.clean = true;
                    break;
                }
            } else if !self.sink.is_full() {
                // Only this channel writes the sink, so the room seen here
                // is still there for the write.
                if let Some(item) = self.source.read() {
                    if self.sink.write(item).is_err() {
                        report.dropped += 1;
                    } else {
                        report.sent += 1;
                        report.received += 1;
                    }
                }
                continue;
            }
            sleep(self.poll_interval).await;
        }
        self.state.set_status(ConnectionStatus::Closed);
        info!(
            channel = %report.name,
            moved = report.sent,
            left = self.source.size(),
            clean = report.clean,
            "local channel closed"
        );
        report
    }
}
