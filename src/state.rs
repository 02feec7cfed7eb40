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

//! The connection lifecycle state machine: handshake, challenge, auth,
//! heartbeat acks, redirect and rejection. Owns nothing but the current
//! [`ConnectionState`] and the pending-login flag; the driving frames come
//! in through [`StateMachine::on_frame`] and outbound frames are written
//! through the supplied [`crate::connector::Connector`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use url::Url;

use crate::codec::Frame;
use crate::config::ClientConfig;
use crate::connector::{Connector, FrameHandler};
use crate::error::ClientError;
use crate::heartbeat::{self, LastHeartbeat};
use crate::transport::Transport;

use async_trait::async_trait;

/// The connection's lifecycle state, advanced only through the transitions
/// below and observable read-only by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    AwaitingConnection,
    Challenging,
    AwaitingAuthentication,
    Authenticating,
    Open,
    Reconnecting,
    Error,
}

/// Drives [`ConnectionState`] off inbound `C`/`A` frames and the client's
/// own `Login`/`Close` calls. A single instance is registered as a
/// [`FrameHandler`] on the connector it is built with.
pub struct StateMachine<T: Transport> {
    connector: Arc<Connector<T>>,
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    login_pending: AtomicBool,
    last_heartbeat: LastHeartbeat,
}

impl<T> StateMachine<T>
where
    T: Transport + 'static,
    T::Writer: 'static,
    T::Reader: 'static,
{
    pub fn new(connector: Arc<Connector<T>>, config: ClientConfig) -> Arc<StateMachine<T>> {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Closed);
        Arc::new(StateMachine {
            connector,
            config,
            state: Mutex::new(ConnectionState::Closed),
            state_tx,
            login_pending: AtomicBool::new(false),
            last_heartbeat: heartbeat::last_heartbeat(),
        })
    }

    pub async fn current(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Called once a fresh transport dial has succeeded: `Closed` (or
    /// `Reconnecting`) → `AwaitingConnection`, the root of the handshake
    /// sequence in every row of §4.E.
    pub async fn on_dialed(&self) {
        self.set_state(ConnectionState::AwaitingConnection).await;
    }

    /// Request a login. If the challenge handshake has not yet produced
    /// `AwaitingAuthentication`, the request is only recorded as pending
    /// (`PendingLogin`, §3) and `A|REQ` is sent automatically the moment
    /// the handshake reaches that state instead.
    pub async fn login(&self) -> Result<(), ClientError> {
        let state = self.current().await;
        if state == ConnectionState::AwaitingAuthentication {
            self.send_auth_request().await
        } else {
            self.login_pending.store(true, Ordering::Release);
            Ok(())
        }
    }

    async fn send_auth_request(&self) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Authenticating).await;
        let body = self.config.auth.to_json().to_string();
        self.connector.write("A", "REQ", &[body]).await
    }

    async fn set_state(&self, new_state: ConnectionState) {
        *self.state.lock().await = new_state;
        let _ = self.state_tx.send(new_state);
    }

    /// Shared with the heartbeat supervisor, which only reads it. Set only
    /// on `C|PI` and on entering `Open`, never at client construction — an
    /// eagerly-started supervisor must not see a stale timestamp and fire
    /// a spurious timeout before the first ping has had a chance to arrive.
    pub fn last_heartbeat(&self) -> LastHeartbeat {
        self.last_heartbeat.clone()
    }

    fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Some(tokio::time::Instant::now());
    }

    /// Force the state to `Error`, bypassing the frame-driven transitions.
    /// Used by the heartbeat supervisor on a missed ping (§4.E).
    pub async fn force_error(&self) {
        self.set_state(ConnectionState::Error).await;
    }

    /// Force the state to `Closed`. Used by [`crate::client::Client::close`]
    /// and by the reconnect driver when `auto_reconnect` is disabled.
    pub async fn force_closed(&self) {
        self.set_state(ConnectionState::Closed).await;
    }

    /// Force the state to `Reconnecting`. Used by the reconnect driver
    /// while it waits out the backoff interval between redial attempts.
    pub async fn force_reconnecting(&self) {
        self.set_state(ConnectionState::Reconnecting).await;
    }
}

#[async_trait]
impl<T> FrameHandler for StateMachine<T>
where
    T: Transport + 'static,
    T::Writer: 'static,
    T::Reader: 'static,
{
    async fn on_frame(&self, frame: &Frame) {
        match (frame.topic(), frame.action()) {
            ("C", "CH") => {
                self.set_state(ConnectionState::Challenging).await;
                let url = self.connector.current_url().await;
                let _ = self
                    .connector
                    .write("C", "CHR", &[url.to_string()])
                    .await;
            }
            ("C", "A") => {
                self.set_state(ConnectionState::AwaitingAuthentication).await;
                if self.config.auto_login || self.login_pending.swap(false, Ordering::AcqRel) {
                    let _ = self.send_auth_request().await;
                }
            }
            ("C", "REJ") => {
                let reason = frame.part(0).unwrap_or("connection rejected").to_string();
                self.report(ClientError::ServerReject(reason)).await;
                self.connector.close().await;
                self.set_state(ConnectionState::Closed).await;
            }
            ("C", "RED") => {
                if let Some(new_url) = frame.part(0) {
                    tracing::warn!(%new_url, "redirected by server");
                    self.connector.close_and_notify().await;
                    if let Ok(url) = Url::parse(new_url) {
                        self.connector.set_url(url).await;
                    }
                    self.set_state(ConnectionState::AwaitingConnection).await;
                }
            }
            ("A", "A") => {
                self.mark_heartbeat();
                self.set_state(ConnectionState::Open).await;
                tracing::info!("authenticated, connection open");
            }
            ("A", "E") => {
                let code = frame.part(0).unwrap_or("UNKNOWN");
                let message = frame.part(1);
                let err = ClientError::from_auth_code(code, message);
                tracing::error!(?err, "authentication rejected");
                self.report(err).await;
                self.set_state(ConnectionState::Error).await;
            }
            ("C", "PI") => {
                self.mark_heartbeat();
                let _ = self.connector.write("C", "PO", &[]).await;
            }
            _ => {}
        }
    }
}

impl<T> StateMachine<T>
where
    T: Transport + 'static,
{
    async fn report(&self, err: ClientError) {
        if let Some(handler) = &self.config.error_handler {
            handler(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    async fn make() -> (Arc<Connector<MockTransport>>, Arc<StateMachine<MockTransport>>, MockTransport) {
        let transport = MockTransport::new();
        let connector = Connector::new(
            transport.clone(),
            Url::parse("ws://localhost:6020").unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(0),
            Arc::new(|_| {}),
        );
        let machine = StateMachine::new(connector.clone(), ClientConfig::default());
        connector.add_handler(machine.clone() as Arc<dyn FrameHandler>).await;
        (connector, machine, transport)
    }

    #[tokio::test]
    async fn challenge_then_ack_then_login_reaches_open() {
        let (connector, machine, transport) = make().await;
        connector.connect().await.unwrap();
        machine.on_dialed().await;
        let mut peer = transport.next_peer();

        peer.send_text("C\u{1f}CH\u{1e}").await;
        let chr = peer.recv_text().await;
        assert_eq!(chr, "C\u{1f}CHR\u{1f}ws://localhost:6020/\u{1e}");
        assert_eq!(machine.current().await, ConnectionState::Challenging);

        peer.send_text("C\u{1f}A\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(machine.current().await, ConnectionState::AwaitingAuthentication);

        machine.login().await.unwrap();
        let req = peer.recv_text().await;
        assert!(req.starts_with("A\u{1f}REQ\u{1f}"));
        assert_eq!(machine.current().await, ConnectionState::Authenticating);

        peer.send_text("A\u{1f}A\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(machine.current().await, ConnectionState::Open);
    }

    #[tokio::test]
    async fn login_before_challenge_ack_is_queued_and_sent_once_awaiting_authentication() {
        let (connector, machine, transport) = make().await;
        connector.connect().await.unwrap();
        machine.on_dialed().await;
        let mut peer = transport.next_peer();

        machine.login().await.unwrap();
        peer.send_text("C\u{1f}CH\u{1e}").await;
        let _ = peer.recv_text().await; // CHR

        peer.send_text("C\u{1f}A\u{1e}").await;
        let req = peer.recv_text().await;
        assert!(req.starts_with("A\u{1f}REQ\u{1f}"));
        assert_eq!(machine.current().await, ConnectionState::Authenticating);
    }

    #[tokio::test]
    async fn reject_closes_and_reports() {
        let (connector, machine, transport) = make().await;
        connector.connect().await.unwrap();
        machine.on_dialed().await;
        let mut peer = transport.next_peer();

        peer.send_text("C\u{1f}REJ\u{1f}no room\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(machine.current().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (connector, machine, transport) = make().await;
        connector.connect().await.unwrap();
        machine.on_dialed().await;
        let mut peer = transport.next_peer();

        peer.send_text("C\u{1f}PI\u{1e}").await;
        let pong = peer.recv_text().await;
        assert_eq!(pong, "C\u{1f}PO\u{1e}");
    }
}
