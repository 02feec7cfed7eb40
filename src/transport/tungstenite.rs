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

//! The production [`Transport`] backed by `tokio-tungstenite`, split into
//! a sink half and a stream half exactly as the socket library hands them
//! back.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::ClientError;

use super::{MessageKind, Transport, TransportReader, TransportWriter};

/// Dials real WebSocket connections via `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteTransport;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[async_trait]
impl Transport for TungsteniteTransport {
    type Writer = TungsteniteWriter;
    type Reader = TungsteniteReader;

    async fn dial(
        &self,
        url: &Url,
        handshake_timeout: Duration,
    ) -> Result<(Self::Writer, Self::Reader), ClientError> {
        tracing::info!(%url, "dialing remote host");

        let dial = tokio_tungstenite::connect_async(url.as_str());
        let (stream, _response) = tokio::time::timeout(handshake_timeout, dial)
            .await
            .map_err(|_| ClientError::TransportDial(Some("handshake timed out".to_string())))?
            .map_err(|e| ClientError::TransportDial(Some(tungstenite_dial_message(&e))))?;

        let (sink, stream) = stream.split();
        Ok((TungsteniteWriter { sink }, TungsteniteReader { stream }))
    }
}

fn tungstenite_dial_message(e: &tungstenite::Error) -> String {
    match e {
        tungstenite::Error::Url(m) => format!("invalid url: {}", m),
        tungstenite::Error::Http(resp) => format!("http error: {}", resp.status()),
        tungstenite::Error::Tls(m) => format!("tls error: {}", m),
        other => other.to_string(),
    }
}

pub struct TungsteniteWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportWriter for TungsteniteWriter {
    async fn write_message(&mut self, kind: MessageKind, deadline: Duration) -> Result<(), ClientError> {
        let message = match kind {
            MessageKind::Text(text) => Message::Text(text),
            MessageKind::Binary(bytes) => Message::Binary(bytes),
            MessageKind::Close => Message::Close(None),
        };

        tokio::time::timeout(deadline, self.sink.send(message))
            .await
            .map_err(|_| ClientError::TransportWrite)?
            .map_err(|_| ClientError::TransportWrite)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

pub struct TungsteniteReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReader for TungsteniteReader {
    async fn read_message(&mut self, deadline: Duration) -> Result<MessageKind, ClientError> {
        let read = async {
            loop {
                return match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => Ok(MessageKind::Text(text)),
                    Some(Ok(Message::Binary(bytes))) => Ok(MessageKind::Binary(bytes)),
                    Some(Ok(Message::Close(_))) => Ok(MessageKind::Close),
                    // Ping/Pong/Frame are handled transparently by tungstenite; keep reading.
                    Some(Ok(_)) => continue,
                    Some(Err(tungstenite::Error::ConnectionClosed))
                    | Some(Err(tungstenite::Error::AlreadyClosed)) => Ok(MessageKind::Close),
                    Some(Err(_)) => Err(ClientError::TransportRead),
                    None => Ok(MessageKind::Close),
                };
            }
        };

        if deadline.is_zero() {
            read.await
        } else {
            tokio::time::timeout(deadline, read)
                .await
                .map_err(|_| ClientError::TransportRead)?
        }
    }
}
