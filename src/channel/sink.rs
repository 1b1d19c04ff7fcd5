use super::ChannelAction;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// The peer side of the channel is gone; nothing more can be sent.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel closed")]
pub struct SinkClosed;

/// Destination for the actions produced by a `ChannelEmulator`.
pub trait ChannelSink: Send {
    fn apply(
        &mut self,
        action: ChannelAction,
    ) -> impl Future<Output = Result<(), SinkClosed>> + Send;
}

/// Production sink: writes through the connection's russh `Handle`.
pub struct HandleSink {
    handle: Handle,
    id: ChannelId,
}

impl HandleSink {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

impl ChannelSink for HandleSink {
    async fn apply(&mut self, action: ChannelAction) -> Result<(), SinkClosed> {
        let id = self.id;
        let result: Result<(), ()> = match action {
            ChannelAction::Success => self.handle.channel_success(id).await.map_err(|_| ()),
            ChannelAction::Failure => self.handle.channel_failure(id).await.map_err(|_| ()),
            ChannelAction::Data(bytes) => self
                .handle
                .data(id, CryptoVec::from_slice(&bytes))
                .await
                .map_err(|_| ()),
            // Extended data type 1 is SSH_EXTENDED_DATA_STDERR
            ChannelAction::ExtendedData(bytes) => self
                .handle
                .extended_data(id, 1, CryptoVec::from_slice(&bytes))
                .await
                .map_err(|_| ()),
            ChannelAction::ExitStatus(code) => self
                .handle
                .exit_status_request(id, code)
                .await
                .map_err(|_| ()),
            ChannelAction::Eof => self.handle.eof(id).await.map_err(|_| ()),
            ChannelAction::Close => self.handle.close(id).await.map_err(|_| ()),
        };
        result.map_err(|_| SinkClosed)
    }
}

/// Records actions in memory. Used to drive the emulator without a transport.
/// Clones share the same record.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    actions: Arc<Mutex<Vec<ChannelAction>>>,
    /// Fail every apply once this many actions have been recorded.
    fail_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    pub fn actions(&self) -> Vec<ChannelAction> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChannelAction>> {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChannelSink for RecordingSink {
    async fn apply(&mut self, action: ChannelAction) -> Result<(), SinkClosed> {
        let mut actions = self.lock();
        if self.fail_after.is_some_and(|n| actions.len() >= n) {
            return Err(SinkClosed);
        }
        actions.push(action);
        Ok(())
    }
}
