// Copyright 2015-2020 SWIM.AI inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Owns the current transport instance, the single ingress task that reads
//! and dispatches frames, and the serialized write path. Reconnect itself
//! lives one layer up (in [`crate::client::Client`]); the connector only
//! knows how to dial once and how to let interested parties know that the
//! dial it was serving has ended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::codec;
use crate::error::ClientError;
use crate::transport::{MessageKind, Transport, TransportReader, TransportWriter};

/// A callback registered to receive every frame read off the transport, in
/// registration order. Implementations must not block indefinitely — any
/// long-running work belongs on a task the handler spawns itself.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, frame: &codec::Frame);
}

/// Reported for transport- and codec-level failures that do not by
/// themselves change connection state.
pub type ErrorSink = Arc<dyn Fn(ClientError) + Send + Sync>;

struct ActiveConnection {
    out_tx: mpsc::Sender<MessageKind>,
    stopped: Arc<AtomicBool>,
    send_handle: JoinHandle<()>,
    receive_handle: JoinHandle<()>,
}

/// Owns a (possibly absent) transport instance, the registered frame
/// handlers, and the canonical connection URL (mutable; redirect updates
/// it).
pub struct Connector<T: Transport> {
    transport: T,
    url: Mutex<Url>,
    active: Mutex<Option<ActiveConnection>>,
    handlers: Mutex<Vec<Arc<dyn FrameHandler>>>,
    connection_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    dropped_tx: watch::Sender<u64>,
    dropped_rx: watch::Receiver<u64>,
    error_sink: ErrorSink,
}

impl<T> Connector<T>
where
    T: Transport + 'static,
    T::Writer: 'static,
    T::Reader: 'static,
{
    pub fn new(
        transport: T,
        url: Url,
        connection_timeout: Duration,
        write_timeout: Duration,
        read_timeout: Duration,
        error_sink: ErrorSink,
    ) -> Arc<Connector<T>> {
        let (dropped_tx, dropped_rx) = watch::channel(0);
        Arc::new(Connector {
            transport,
            url: Mutex::new(url),
            active: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            connection_timeout,
            write_timeout,
            read_timeout,
            dropped_tx,
            dropped_rx,
            error_sink,
        })
    }

    /// Register a frame handler. Guarded by the handler list's own mutex,
    /// independent of the connection and write paths.
    pub async fn add_handler(&self, handler: Arc<dyn FrameHandler>) {
        self.handlers.lock().await.push(handler);
    }

    pub async fn current_url(&self) -> Url {
        self.url.lock().await.clone()
    }

    pub async fn set_url(&self, url: Url) {
        *self.url.lock().await = url;
    }

    /// A watch channel that increments every time the connection this
    /// connector was serving ends, for whatever reason. The reconnect
    /// driver in [`crate::client::Client`] subscribes to this to learn
    /// when to redial.
    pub fn subscribe_dropped(self: &Arc<Self>) -> watch::Receiver<u64> {
        self.dropped_rx.clone()
    }

    /// Dial the connector's current URL and start the ingress task.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        use tracing::Instrument;

        let url = self.current_url().await;
        let (writer, reader) = self.transport.dial(&url, self.connection_timeout).await?;

        let (out_tx, out_rx) = mpsc::channel::<MessageKind>(64);
        let stopped = Arc::new(AtomicBool::new(false));

        let send_handle = tokio::spawn(
            SendTask {
                writer,
                rx: out_rx,
                write_timeout: self.write_timeout,
                stopped: stopped.clone(),
                connector: self.clone(),
            }
            .run()
            .instrument(tracing::info_span!("connector.send", %url)),
        );

        let receive_handle = tokio::spawn(
            ReceiveTask {
                reader,
                connector: self.clone(),
                read_timeout: self.read_timeout,
                stopped: stopped.clone(),
            }
            .run()
            .instrument(tracing::info_span!("connector.receive", %url)),
        );

        *self.active.lock().await = Some(ActiveConnection {
            out_tx,
            stopped,
            send_handle,
            receive_handle,
        });

        Ok(())
    }

    async fn dispatch(&self, text: &str) {
        let frames = match codec::parse(text) {
            Ok(frames) => frames,
            Err(ClientError::EmptyMessage) => return,
            Err(err) => {
                (self.error_sink)(err);
                return;
            }
        };

        let handlers = self.handlers.lock().await.clone();
        for frame in &frames {
            tracing::trace!(topic = frame.topic(), action = frame.action(), "dispatching frame");
            for handler in &handlers {
                handler.on_frame(frame).await;
            }
        }
    }

    /// Notify the reconnect driver that the connection has ended, but only
    /// the first of the send/receive tasks to observe `stopped` flipping
    /// does so — `stopped` is the single point of truth both tasks race on.
    fn mark_dropped_once(&self, stopped: &AtomicBool) {
        if !stopped.swap(true, Ordering::AcqRel) {
            self.dropped_tx.send_modify(|generation| *generation += 1);
        }
    }

    /// Serialize a frame write behind the connector's outbound channel.
    /// Returns [`ClientError::Closed`] if there is no active connection.
    pub async fn write(&self, topic: &str, action: &str, parts: &[String]) -> Result<(), ClientError> {
        let bytes = codec::encode(topic, action, parts);
        let guard = self.active.lock().await;
        match guard.as_ref() {
            Some(active) if !active.stopped.load(Ordering::Acquire) => active
                .out_tx
                .send(MessageKind::Text(bytes))
                .await
                .map_err(|_| ClientError::TransportWrite),
            _ => Err(ClientError::Closed),
        }
    }

    /// Close the current connection. Idempotent. Does not itself bump the
    /// dropped-generation counter — an explicit close is not a surprise
    /// disconnect and the reconnect driver distinguishes the two by
    /// checking connection state before reacting.
    pub async fn close(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.stopped.store(true, Ordering::Release);
            active.send_handle.abort();
            active.receive_handle.abort();
        }
    }

    /// Close the current connection the same way [`Connector::close`] does,
    /// but also wake whatever is watching [`Connector::subscribe_dropped`].
    /// Used for server redirects (the reconnect driver must redial right
    /// away, without waiting out a backoff interval) and for a
    /// heartbeat-missed teardown (the driver must notice `Error` and stop
    /// retrying instead of staying parked on a generation bump that will
    /// never come).
    pub async fn close_and_notify(&self) {
        self.close().await;
        self.dropped_tx.send_modify(|generation| *generation += 1);
    }
}

struct SendTask<T: Transport> {
    writer: T::Writer,
    rx: mpsc::Receiver<MessageKind>,
    write_timeout: Duration,
    stopped: Arc<AtomicBool>,
    connector: Arc<Connector<T>>,
}

impl<T: Transport + 'static> SendTask<T> {
    async fn run(mut self) {
        while !self.stopped.load(Ordering::Acquire) {
            let message = match self.rx.recv().await {
                Some(message) => message,
                None => break,
            };
            if self
                .writer
                .write_message(message, self.write_timeout)
                .await
                .is_err()
            {
                (self.connector.error_sink)(ClientError::TransportWrite);
                break;
            }
        }
        self.writer.close().await;
        self.connector.mark_dropped_once(&self.stopped);
    }
}

struct ReceiveTask<T: Transport> {
    reader: T::Reader,
    connector: Arc<Connector<T>>,
    read_timeout: Duration,
    stopped: Arc<AtomicBool>,
}

impl<T> ReceiveTask<T>
where
    T: Transport + 'static,
{
    async fn run(mut self) {
        while !self.stopped.load(Ordering::Acquire) {
            match self.reader.read_message(self.read_timeout).await {
                Ok(MessageKind::Text(text)) => {
                    self.connector.dispatch(&text).await;
                }
                Ok(MessageKind::Binary(_)) => {
                    tracing::trace!("dropping binary transport message");
                }
                Ok(MessageKind::Close) => {
                    break;
                }
                Err(err) => {
                    (self.connector.error_sink)(err);
                    break;
                }
            }
        }
        self.connector.mark_dropped_once(&self.stopped);
    }
}
