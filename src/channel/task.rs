use super::sink::{ChannelSink, SinkClosed};
use super::{ChannelAction, ChannelEmulator, ChannelEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Events queued per channel before the channel is considered overrun.
pub const CHANNEL_QUEUE_CAPACITY: usize = 256;

/// Drive one channel until it closes, its queue is dropped, the sink fails,
/// or the owning connection cancels it. Events are handled strictly in order.
pub async fn run_channel<S: ChannelSink>(
    mut emulator: ChannelEmulator,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut sink: S,
    cancel: CancellationToken,
) {
    let initial = emulator.start();
    if apply_all(&mut sink, initial).await.is_err() {
        emulator.abort();
        return;
    }

    while !emulator.is_closed() {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let actions = emulator.handle(event);
        if let Err(e) = apply_all(&mut sink, actions).await {
            debug!(error = %e, "channel sink gone");
            break;
        }
    }
    emulator.abort();
}

async fn apply_all<S: ChannelSink>(
    sink: &mut S,
    actions: Vec<ChannelAction>,
) -> Result<(), SinkClosed> {
    for action in actions {
        sink.apply(action).await?;
    }
    Ok(())
}
