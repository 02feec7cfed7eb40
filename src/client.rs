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

//! The public client facade: construction, `Login`/`Close`, connection
//! state, event access, and the reconnect driver task that ties the
//! connector, state machine, heartbeat supervisor and event subsystem
//! together.
//!
//! Ownership follows §9's resolution of the connector/event cycle: the
//! client owns the connector, the state machine and the event subsystem;
//! both the state machine and the event subsystem are registered as frame
//! handlers on the connector and hold only a non-owning `Arc` back to it
//! for outbound writes. Nothing references the client itself, so closing
//! it is a matter of stopping the supervisors and the connector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::connector::{Connector, FrameHandler};
use crate::error::ClientError;
use crate::event::{EventHandler, EventSubsystem};
use crate::heartbeat::{self, HeartbeatSupervisor};
use crate::payload::TypedValue;
use crate::state::{ConnectionState, StateMachine};
use crate::transport::Transport;

/// A realtime client for the deepstream.io server, generic over the
/// [`Transport`] it dials with (production code uses
/// [`crate::transport::tungstenite::TungsteniteTransport`]; tests use
/// [`crate::transport::mock::MockTransport`]).
pub struct Client<T: Transport> {
    connector: Arc<Connector<T>>,
    state: Arc<StateMachine<T>>,
    events: Arc<EventSubsystem<T>>,
    config: ClientConfig,
    backoff: Arc<parking_lot::Mutex<Backoff>>,
    heartbeat: Mutex<Option<HeartbeatSupervisor>>,
    reconnect_handle: Mutex<Option<JoinHandle<()>>>,
    replay_handle: Mutex<Option<JoinHandle<()>>>,
    backoff_reset_handle: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl<T> Client<T>
where
    T: Transport + 'static,
    T::Writer: 'static,
    T::Reader: 'static,
{
    /// Build a client and start connecting asynchronously; returns as soon
    /// as the first dial has been kicked off, not once it completes.
    pub async fn new(transport: T, url: Url, config: ClientConfig) -> Arc<Client<T>> {
        let error_sink: Arc<dyn Fn(ClientError) + Send + Sync> = match config.error_handler.clone() {
            Some(handler) => handler,
            None => Arc::new(|_| {}),
        };

        let connector = Connector::new(
            transport,
            url,
            config.connection_timeout,
            config.write_timeout,
            config.read_timeout,
            error_sink,
        );
        let state = StateMachine::new(connector.clone(), config.clone());
        let events = EventSubsystem::new(connector.clone(), config.error_handler.clone());

        connector
            .add_handler(state.clone() as Arc<dyn FrameHandler>)
            .await;
        connector
            .add_handler(events.clone() as Arc<dyn FrameHandler>)
            .await;

        let backoff = Arc::new(parking_lot::Mutex::new(Backoff::new(&config)));

        let client = Arc::new(Client {
            connector,
            state,
            events,
            config,
            backoff,
            heartbeat: Mutex::new(None),
            reconnect_handle: Mutex::new(None),
            replay_handle: Mutex::new(None),
            backoff_reset_handle: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        });

        client.start_heartbeat().await;
        client.clone().spawn_replay_driver().await;
        client.clone().spawn_backoff_reset_driver().await;
        client.clone().spawn_reconnect_driver().await;
        client
    }

    /// Watch the state machine for arrivals at `Open` and re-issue every
    /// subscription the second and later time (§4.F "on reaching `Open`
    /// after a reconnection"); the very first arrival is an initial login,
    /// not a reconnection, and must not double up the `E|S` that
    /// [`EventSubsystem::subscribe`] already sent.
    async fn spawn_replay_driver(self: Arc<Self>) {
        let mut states = self.state.subscribe();
        let client = self.clone();
        let handle = tokio::spawn(async move {
            let mut reached_open_before = false;
            loop {
                if states.changed().await.is_err() {
                    return;
                }
                if *states.borrow() == ConnectionState::Open {
                    if reached_open_before {
                        client.events.replay_subscriptions().await;
                    } else {
                        reached_open_before = true;
                    }
                }
            }
        });
        *self.replay_handle.lock().await = Some(handle);
    }

    /// Watch the state machine for every arrival at `Open` and reset the
    /// shared [`Backoff`] there, not merely on a successful dial (§4.E:
    /// "Reset on any successful reach of `Open`"). A dial that succeeds
    /// but drops again before the handshake finishes — repeated failures
    /// while `Challenging`/`Authenticating` — must not reset the backoff,
    /// or the exponential growth it exists to provide never accumulates.
    async fn spawn_backoff_reset_driver(self: Arc<Self>) {
        let mut states = self.state.subscribe();
        let backoff = self.backoff.clone();
        let handle = tokio::spawn(async move {
            loop {
                if states.changed().await.is_err() {
                    return;
                }
                if *states.borrow() == ConnectionState::Open {
                    backoff.lock().reset();
                }
            }
        });
        *self.backoff_reset_handle.lock().await = Some(handle);
    }

    async fn start_heartbeat(&self) {
        let config = self.config.clone();
        let state = self.state.clone();
        let connector = self.connector.clone();
        let closed = self.closed.clone();
        let supervisor = heartbeat::spawn(self.state.last_heartbeat(), config.heartbeat_interval, move |err| {
            if closed.load(Ordering::Acquire) {
                return;
            }
            tracing::error!(?err, "heartbeat supervisor closing the connection");
            if let Some(handler) = &config.error_handler {
                handler(err);
            }
            // §7: a missed heartbeat is terminal and, unlike an auth
            // rejection, also tears down the (presumably stale) transport;
            // the reconnect driver sees `Error` and stops on its own.
            let state = state.clone();
            let connector = connector.clone();
            tokio::spawn(async move {
                state.force_error().await;
                connector.close_and_notify().await;
            });
        });
        *self.heartbeat.lock().await = Some(supervisor);
    }

    /// Spawn the task that dials once, then watches the connector's
    /// dropped-generation channel and redials with backoff for as long as
    /// `auto_reconnect` is configured and the state machine has not entered
    /// a terminal condition (`Closed` or `Error`).
    async fn spawn_reconnect_driver(self: Arc<Self>) {
        use tracing::Instrument;
        let handle = tokio::spawn(self.clone().reconnect_loop().instrument(tracing::info_span!("reconnect")));
        *self.reconnect_handle.lock().await = Some(handle);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut dropped = self.connector.subscribe_dropped();

        loop {
            let dialed = match self.connector.connect().await {
                Ok(()) => {
                    self.state.on_dialed().await;
                    if dropped.changed().await.is_err() || self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    true
                }
                Err(err) => {
                    tracing::warn!(?err, "dial failed");
                    self.report(err);
                    false
                }
            };

            if self.closed.load(Ordering::Acquire) {
                return;
            }

            // A dial failure never touches connection state (there was no
            // connection to drive a transition), so the terminal/redirect
            // checks below only make sense once a dial actually succeeded
            // and then later ended — otherwise a bare dial failure on the
            // very first attempt would read the machine's untouched initial
            // `Closed` value and wrongly stop retrying forever.
            if dialed {
                let current = self.state.current().await;
                if current == ConnectionState::Error || current == ConnectionState::Closed {
                    return;
                }
                // A redirect already reset state to `AwaitingConnection` and
                // swapped the URL; redial right away and don't let it eat into
                // the backoff budget (§4.E "the redirect must not count
                // against reconnect backoff").
                if current == ConnectionState::AwaitingConnection {
                    continue;
                }
            }
            if !self.config.auto_reconnect {
                // §7: a dial failure with no auto-reconnect is surfaced as a
                // terminal `Error` (the connection was never established);
                // a drop *after* a live connection with no auto-reconnect
                // just settles into `Closed`, per §6's `auto_reconnect`
                // config-option description.
                if dialed {
                    self.state.force_closed().await;
                } else {
                    self.state.force_error().await;
                }
                return;
            }

            self.state.force_reconnecting().await;
            let wait = self
                .backoff
                .lock()
                .next_interval(rand::thread_rng().gen_range(0.0..1.0));
            tracing::warn!(?wait, "reconnecting");
            tokio::time::sleep(wait).await;

            if self.closed.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn report(&self, err: ClientError) {
        if let Some(handler) = &self.config.error_handler {
            handler(err);
        }
    }

    /// Request a login. Queued (per §3's `PendingLogin` flag) if the
    /// challenge handshake has not yet reached `AwaitingAuthentication`.
    pub async fn login(&self) -> Result<(), ClientError> {
        self.state.login().await
    }

    /// The current connection lifecycle state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.current().await
    }

    /// Access to the event subsystem (subscribe/unsubscribe/publish).
    pub fn events(&self) -> &Arc<EventSubsystem<T>> {
        &self.events
    }

    pub async fn subscribe(&self, event: impl Into<String>, handler: EventHandler) -> Result<(), ClientError> {
        self.events.subscribe(event, handler).await
    }

    pub async fn unsubscribe(&self, event: &str) -> Result<(), ClientError> {
        self.events.unsubscribe(event).await
    }

    pub async fn publish(&self, event: &str, values: &[TypedValue]) -> Result<(), ClientError> {
        self.events.publish(event, values).await
    }

    /// Idempotent. Stops the heartbeat supervisor and the reconnect driver,
    /// and closes the transport.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(supervisor) = self.heartbeat.lock().await.take() {
            supervisor.stop();
        }
        if let Some(handle) = self.reconnect_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.replay_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.backoff_reset_handle.lock().await.take() {
            handle.abort();
        }
        self.connector.close().await;
        self.state.force_closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;

    fn no_reconnect_config() -> ClientConfig {
        ClientConfig {
            auto_reconnect: false,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn a_failed_first_dial_is_retried_when_auto_reconnect_is_on() {
        let transport = MockTransport::new();
        transport.fail_next_dials(2);
        let config = ClientConfig {
            auto_reconnect: true,
            rec_interval_min: Duration::from_millis(5),
            rec_interval_max: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let client = Client::new(transport.clone(), Url::parse("ws://localhost:6020").unwrap(), config).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.dial_count(), 1, "two failures then a successful dial");
        assert_eq!(client.connection_state().await, ConnectionState::AwaitingConnection);

        client.close().await;
    }

    #[tokio::test]
    async fn handshake_and_login_reaches_open_end_to_end() {
        let transport = MockTransport::new();
        let client = Client::new(
            transport.clone(),
            Url::parse("ws://localhost:6020").unwrap(),
            no_reconnect_config(),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut peer = transport.next_peer();

        peer.send_text("C\u{1f}CH\u{1e}").await;
        let chr = peer.recv_text().await;
        assert_eq!(chr, "C\u{1f}CHR\u{1f}ws://localhost:6020/\u{1e}");

        peer.send_text("C\u{1f}A\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.connection_state().await, ConnectionState::AwaitingAuthentication);

        client.login().await.unwrap();
        let req = peer.recv_text().await;
        assert!(req.starts_with("A\u{1f}REQ\u{1f}"));

        peer.send_text("A\u{1f}A\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.connection_state().await, ConnectionState::Open);

        client.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = MockTransport::new();
        let client = Client::new(
            transport,
            Url::parse("ws://localhost:6020").unwrap(),
            no_reconnect_config(),
        )
        .await;
        client.close().await;
        client.close().await;
        assert_eq!(client.connection_state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn subscribe_and_publish_round_trip_through_the_client_facade() {
        let transport = MockTransport::new();
        let client = Client::new(
            transport.clone(),
            Url::parse("ws://localhost:6020").unwrap(),
            no_reconnect_config(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut peer = transport.next_peer();

        client.subscribe("t", Arc::new(|_, _| {})).await.unwrap();
        assert_eq!(peer.recv_text().await, "E\u{1f}S\u{1f}t\u{1e}");

        client
            .publish("t", &[TypedValue::from("hello")])
            .await
            .unwrap();
        assert_eq!(peer.recv_text().await, "E\u{1f}EVT\u{1f}t\u{1f}Shello\u{1e}");

        client.close().await;
    }
}
