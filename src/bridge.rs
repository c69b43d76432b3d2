//! The push-style adapter [`ChangeStream::into_emitter`](crate::ChangeStream::into_emitter)
//! attaches: a background task drains the stream and forwards events over a channel, standing in
//! for the spec's `on('change', ...)`/`on('error', ...)` event emitter (spec.md §4.4's emitter
//! branch, §5).

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::Stream;
use serde::de::DeserializeOwned;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{controller::ChangeStream, error::Result};

/// A push handle attached to a [`ChangeStream`] via
/// [`ChangeStream::into_emitter`](crate::ChangeStream::into_emitter).
///
/// Every event the underlying stream produces, including an eventual terminal error, is forwarded
/// over an internal channel by a background task. Dropping the emitter aborts that task, which is
/// the cancellation behavior spec.md §5 calls for ("dropping a subscription stops the feed").
pub struct ChangeStreamEmitter<T> {
    receiver: mpsc::UnboundedReceiver<Result<T>>,
    handle: JoinHandle<()>,
}

impl<T> ChangeStreamEmitter<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn spawn(mut stream: ChangeStream<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(Some(event)) => {
                        if tx.send(Ok(event)).is_err() {
                            debug!(target: "change_stream::bridge", "emitter dropped, stopping drain task");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(target: "change_stream::bridge", "stream closed without error, ending drain task");
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });
        Self { receiver: rx, handle }
    }

    /// Receives the next event, or `None` once the stream has closed without error. A terminal
    /// error is delivered as one final `Some(Err(_))` before the channel closes.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.receiver.recv().await
    }
}

impl<T> Stream for ChangeStreamEmitter<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for ChangeStreamEmitter<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
