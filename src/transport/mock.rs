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

//! An in-memory fake transport for driving the connection state machine,
//! dispatcher and event subsystem in tests without a live socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::error::ClientError;

use super::{MessageKind, Transport, TransportReader, TransportWriter};

/// The peer-facing half of a [`MockTransport`] dial: lets a test stand in
/// as the deepstream server, sending frames to the client and observing
/// what the client writes.
pub struct MockPeer {
    pub to_client: mpsc::Sender<MessageKind>,
    pub from_client: mpsc::Receiver<MessageKind>,
}

impl MockPeer {
    pub async fn send_text(&self, text: impl Into<String>) {
        self.to_client
            .send(MessageKind::Text(text.into()))
            .await
            .expect("client side dropped");
    }

    pub async fn recv_text(&mut self) -> String {
        match self.from_client.recv().await.expect("client side closed") {
            MessageKind::Text(text) => text,
            other => panic!("expected a text message, got {:?}", other),
        }
    }

    pub async fn close(&self) {
        let _ = self.to_client.send(MessageKind::Close).await;
    }
}

/// A [`Transport`] whose `dial` hands back an in-memory channel pair
/// instead of opening a socket. Each call to `dial` records a new
/// [`MockPeer`] for the test to drive.
#[derive(Clone, Default)]
pub struct MockTransport {
    pending: Arc<Mutex<Vec<MockPeer>>>,
    dial_count: Arc<Mutex<usize>>,
    fail_next_dials: Arc<Mutex<usize>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Pop the next dial's peer handle. Panics if no dial has happened yet.
    pub fn next_peer(&self) -> MockPeer {
        self.pending
            .lock()
            .pop()
            .expect("no pending dial to take a peer from")
    }

    pub fn dial_count(&self) -> usize {
        *self.dial_count.lock()
    }

    /// Make the next `count` calls to `dial` fail with
    /// [`ClientError::TransportDial`] instead of succeeding, for exercising
    /// the reconnect driver's dial-failure retry path.
    pub fn fail_next_dials(&self, count: usize) {
        *self.fail_next_dials.lock() = count;
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Writer = MockWriter;
    type Reader = MockReader;

    async fn dial(
        &self,
        _url: &Url,
        _handshake_timeout: Duration,
    ) -> Result<(Self::Writer, Self::Reader), ClientError> {
        {
            let mut remaining = self.fail_next_dials.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::TransportDial(Some("mock dial failure".to_string())));
            }
        }

        let (to_client, rx_client) = mpsc::channel(32);
        let (to_peer, from_client) = mpsc::channel(32);

        *self.dial_count.lock() += 1;
        self.pending.lock().push(MockPeer {
            to_client,
            from_client,
        });

        Ok((MockWriter { tx: to_peer }, MockReader { rx: rx_client }))
    }
}

pub struct MockWriter {
    tx: mpsc::Sender<MessageKind>,
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn write_message(&mut self, kind: MessageKind, _deadline: Duration) -> Result<(), ClientError> {
        self.tx
            .send(kind)
            .await
            .map_err(|_| ClientError::TransportWrite)
    }

    async fn close(&mut self) {
        let _ = self.tx.send(MessageKind::Close).await;
    }
}

pub struct MockReader {
    rx: mpsc::Receiver<MessageKind>,
}

#[async_trait]
impl TransportReader for MockReader {
    async fn read_message(&mut self, deadline: Duration) -> Result<MessageKind, ClientError> {
        let received = if deadline.is_zero() {
            self.rx.recv().await
        } else {
            tokio::time::timeout(deadline, self.rx.recv())
                .await
                .map_err(|_| ClientError::TransportRead)?
        };
        match received {
            Some(message) => Ok(message),
            None => Ok(MessageKind::Close),
        }
    }
}
