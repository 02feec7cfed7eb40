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

//! The narrow message-oriented duplex the [`crate::connector::Connector`]
//! drives. Kept behind a trait so the rest of the engine can be tested
//! against an in-memory fake instead of a live socket. A dial produces a
//! split writer/reader pair so that a background send task and a
//! background receive task can each own one half without contending for
//! a single `&mut`.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::ClientError;

pub mod tungstenite;

/// An in-memory fake [`Transport`], public so that both this crate's own
/// tests and a downstream user's integration tests can drive a [`Client`]
/// without a live socket (the `swim` client's own test harness takes the
/// same approach with an in-process fake connection).
///
/// [`Client`]: crate::client::Client
pub mod mock;

/// The kind of a message read from, or to be written to, the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Dials new connections to a remote host. Reconnect is modeled as `dial`
/// being repeatable after the previous pair has been dropped.
#[async_trait]
pub trait Transport: Send + Sync {
    type Writer: TransportWriter;
    type Reader: TransportReader;

    /// Dial the given URL, failing if the handshake does not complete
    /// within `handshake_timeout`.
    async fn dial(
        &self,
        url: &Url,
        handshake_timeout: Duration,
    ) -> Result<(Self::Writer, Self::Reader), ClientError>;
}

/// The write half of a dialed connection.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one message, aborting if `deadline` elapses first.
    async fn write_message(&mut self, kind: MessageKind, deadline: Duration) -> Result<(), ClientError>;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}

/// The read half of a dialed connection.
#[async_trait]
pub trait TransportReader: Send {
    /// Read one message, blocking until one arrives, the peer closes, or
    /// the transport errors. `deadline` bounds the wait; the zero duration
    /// means unbounded (§6: "read_timeout_ms (0 = unbounded)").
    async fn read_message(&mut self, deadline: Duration) -> Result<MessageKind, ClientError>;
}
