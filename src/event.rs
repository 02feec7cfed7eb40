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

//! The event subscription table: subscribe/unsubscribe/publish, inbound
//! `E|EVT` fan-out, and resubscription replay on reconnect.
//!
//! Keyed by event name alone — the wire protocol acks a subscribe by name,
//! with no correlation id — so the invariant "at most one outstanding
//! server subscription per event name" is what keeps a second local
//! `Subscribe` from re-issuing `E|S`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::codec::Frame;
use crate::config::ErrorHandler;
use crate::connector::{Connector, FrameHandler};
use crate::error::ClientError;
use crate::payload::{self, TypedValue};
use crate::transport::Transport;

/// Invoked once per inbound event for every handler registered on it, in
/// registration order. Must not block indefinitely; long work belongs on a
/// task the handler spawns itself.
pub type EventHandler = Arc<dyn Fn(&str, &[TypedValue]) + Send + Sync>;

struct Subscription {
    handlers: Vec<EventHandler>,
    acked: bool,
    /// Set by `unsubscribe` and cleared by a fresh `subscribe`; the table
    /// entry itself is kept until the matching `E|A|US|<event>` ack
    /// arrives, per §3's "subscription table entries are never removed
    /// until an unsubscribe ack arrives" invariant. `handlers` is cleared
    /// immediately so inbound events stop reaching callers right away,
    /// reconciling that with §4.F's "subsequent inbound `E|EVT` ... are
    /// silently dropped (no handlers)".
    pending_unsubscribe: bool,
}

/// Owns the subscription table and a non-owning reference to the
/// [`Connector`] it writes `E|S`/`E|US`/`E|EVT` frames through. The
/// connector never references this type back; it is registered as one of
/// the connector's [`FrameHandler`]s instead (§9 "Cyclic ownership").
pub struct EventSubsystem<T: Transport> {
    connector: Arc<Connector<T>>,
    table: Mutex<HashMap<String, Subscription>>,
    error_handler: Option<ErrorHandler>,
}

impl<T> EventSubsystem<T>
where
    T: Transport + 'static,
    T::Writer: 'static,
    T::Reader: 'static,
{
    pub fn new(connector: Arc<Connector<T>>, error_handler: Option<ErrorHandler>) -> Arc<EventSubsystem<T>> {
        Arc::new(EventSubsystem {
            connector,
            table: Mutex::new(HashMap::new()),
            error_handler,
        })
    }

    /// Append `handler` to `event`'s local handler list. Only the first
    /// `Subscribe` for a given event name issues `E|S`; subsequent ones for
    /// the same name do no network I/O at all — the idempotence property
    /// in §8 invariant 1.
    pub async fn subscribe(&self, event: impl Into<String>, handler: EventHandler) -> Result<(), ClientError> {
        let event = event.into();
        let mut table = self.table.lock().await;
        match table.get_mut(&event) {
            Some(sub) => {
                sub.handlers.push(handler);
                // A resubscribe cancels a pending unsubscribe that has not
                // yet been acked — the table entry was never actually
                // removed, so there is nothing to re-insert.
                sub.pending_unsubscribe = false;
                Ok(())
            }
            None => {
                table.insert(
                    event.clone(),
                    Subscription {
                        handlers: vec![handler],
                        acked: false,
                        pending_unsubscribe: false,
                    },
                );
                drop(table);
                self.connector.write("E", "S", &[event]).await
            }
        }
    }

    /// Clear `event`'s local handlers (so inbound `E|EVT` for it is
    /// silently dropped from this point on) and issue `E|US`, but keep the
    /// table entry itself until the matching `E|A|US|<event>` ack arrives
    /// — removed only then, by [`EventSubsystem::handle_unsubscribe_ack`],
    /// per §3's invariant.
    pub async fn unsubscribe(&self, event: &str) -> Result<(), ClientError> {
        {
            let mut table = self.table.lock().await;
            if let Some(sub) = table.get_mut(event) {
                sub.handlers.clear();
                sub.pending_unsubscribe = true;
            }
        }
        self.connector.write("E", "US", &[event.to_string()]).await
    }

    /// Encode `values` with the typed payload format and issue `E|EVT`. No
    /// ack is expected for a publish.
    pub async fn publish(&self, event: &str, values: &[TypedValue]) -> Result<(), ClientError> {
        let parts = payload::encode_all(values);
        self.connector
            .write("E", "EVT", &[vec![event.to_string()], parts].concat())
            .await
    }

    /// Re-issue `E|S` for every table entry not already waiting on an
    /// unsubscribe ack, resetting `acked` to `false`. Handler lists are
    /// preserved. Called by the client's state-watching replay task on
    /// every arrival at `Open` after the first.
    pub async fn replay_subscriptions(&self) {
        let events: Vec<String> = {
            let mut table = self.table.lock().await;
            for sub in table.values_mut() {
                if !sub.pending_unsubscribe {
                    sub.acked = false;
                }
            }
            table
                .iter()
                .filter(|(_, sub)| !sub.pending_unsubscribe)
                .map(|(event, _)| event.clone())
                .collect()
        };

        for event in events {
            if let Err(err) = self.connector.write("E", "S", &[event]).await {
                self.report(err);
            }
        }
    }

    fn report(&self, err: ClientError) {
        if let Some(handler) = &self.error_handler {
            handler(err);
        }
    }

    async fn handle_subscribe_ack(&self, event: &str) {
        let mut table = self.table.lock().await;
        match table.get_mut(event) {
            Some(sub) => sub.acked = true,
            None => {
                drop(table);
                self.report(ClientError::SubscriptionAckUnknown(event.to_string()));
            }
        }
    }

    /// Removes `event`'s table entry once its unsubscribe has actually
    /// been acked by the server — the only point at which §3 permits a
    /// subscription table entry to disappear (besides the client closing).
    async fn handle_unsubscribe_ack(&self, event: &str) {
        let mut table = self.table.lock().await;
        match table.get(event) {
            Some(sub) if sub.pending_unsubscribe => {
                table.remove(event);
            }
            Some(_) => {
                // A resubscribe raced the ack and cancelled the pending
                // removal; the entry is live again, nothing to do.
            }
            None => {
                drop(table);
                self.report(ClientError::SubscriptionAckUnknown(event.to_string()));
            }
        }
    }

    async fn handle_event(&self, event: &str, parts: &[String]) {
        let values = match payload::decode_all(parts) {
            Ok(values) => values,
            Err(err) => {
                self.report(err);
                return;
            }
        };

        let handlers = {
            let table = self.table.lock().await;
            match table.get(event) {
                Some(sub) => sub.handlers.clone(),
                None => return, // no local subscription; silently dropped
            }
        };

        for handler in &handlers {
            handler(event, &values);
        }
    }
}

#[async_trait]
impl<T> FrameHandler for EventSubsystem<T>
where
    T: Transport + 'static,
    T::Writer: 'static,
    T::Reader: 'static,
{
    async fn on_frame(&self, frame: &Frame) {
        if frame.topic() != "E" {
            return;
        }

        match frame.action() {
            "EVT" => {
                if let Some(event) = frame.part(0) {
                    self.handle_event(event, &frame.data()[1..]).await;
                }
            }
            "A" => match frame.part(0) {
                // E|A|S|<event> acks a subscribe.
                Some("S") => {
                    if let Some(event) = frame.part(1) {
                        self.handle_subscribe_ack(event).await;
                    }
                }
                // E|A|US|<event> acks an unsubscribe.
                Some("US") => {
                    if let Some(event) = frame.part(1) {
                        self.handle_unsubscribe_ack(event).await;
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    fn connector() -> (Arc<Connector<MockTransport>>, MockTransport) {
        let transport = MockTransport::new();
        let connector = Connector::new(
            transport.clone(),
            Url::parse("ws://localhost:6020").unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(0),
            Arc::new(|_| {}),
        );
        (connector, transport)
    }

    #[tokio::test]
    async fn second_subscribe_to_the_same_event_sends_nothing() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let mut peer = transport.next_peer();

        let events = EventSubsystem::new(connector, ClientConfig::default().error_handler);
        events.subscribe("t", Arc::new(|_, _| {})).await.unwrap();
        assert_eq!(peer.recv_text().await, "E\u{1f}S\u{1f}t\u{1e}");

        events.subscribe("t", Arc::new(|_, _| {})).await.unwrap();
        let second_frame = tokio::time::timeout(Duration::from_millis(50), peer.recv_text()).await;
        assert!(second_frame.is_err(), "second Subscribe must not write to the wire");
    }

    #[tokio::test]
    async fn publish_emits_the_documented_typed_frame() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let mut peer = transport.next_peer();

        let events = EventSubsystem::new(connector, None);
        let values = vec![
            TypedValue::from("yetAnotherValue"),
            TypedValue::from(10.0),
            TypedValue::from(true),
            TypedValue::from(false),
            TypedValue::from(serde_json::json!({"qwe": 123})),
        ];
        events.publish("t", &values).await.unwrap();

        let frame = peer.recv_text().await;
        assert_eq!(
            frame,
            "E\u{1f}EVT\u{1f}t\u{1f}SyetAnotherValue\u{1f}N10\u{1f}T\u{1f}F\u{1f}O{\"qwe\":123}\u{1e}"
        );
    }

    #[tokio::test]
    async fn inbound_event_invokes_every_handler_in_registration_order() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let peer = transport.next_peer();

        let events = EventSubsystem::new(connector.clone(), None);
        connector.add_handler(events.clone() as Arc<dyn FrameHandler>).await;

        let order = Arc::new(Mutex::new(Vec::<u8>::new()));
        let order1 = order.clone();
        let order2 = order.clone();
        events
            .subscribe("t", Arc::new(move |_, _| {
                order1.try_lock().unwrap().push(1);
            }))
            .await
            .unwrap();
        events
            .subscribe("t", Arc::new(move |_, _| {
                order2.try_lock().unwrap().push(2);
            }))
            .await
            .unwrap();

        peer.send_text("E\u{1f}EVT\u{1f}t\u{1f}Shello\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_ack_is_reported_without_state_change() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let peer = transport.next_peer();

        let reports = Arc::new(AtomicUsize::new(0));
        let reports_clone = reports.clone();
        let events = EventSubsystem::new(
            connector.clone(),
            Some(Arc::new(move |_| {
                reports_clone.fetch_add(1, Ordering::Relaxed);
            })),
        );
        connector.add_handler(events.clone() as Arc<dyn FrameHandler>).await;

        peer.send_text("E\u{1f}A\u{1f}S\u{1f}never-subscribed\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(reports.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unsubscribe_drops_handlers_immediately_but_keeps_the_entry_until_acked() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let mut peer = transport.next_peer();

        let events = EventSubsystem::new(connector.clone(), None);
        connector.add_handler(events.clone() as Arc<dyn FrameHandler>).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        events
            .subscribe("t", Arc::new(move |_, _| {
                seen_clone.fetch_add(1, Ordering::Relaxed);
            }))
            .await
            .unwrap();
        assert_eq!(peer.recv_text().await, "E\u{1f}S\u{1f}t\u{1e}");

        events.unsubscribe("t").await.unwrap();
        assert_eq!(peer.recv_text().await, "E\u{1f}US\u{1f}t\u{1e}");

        // Inbound events stop reaching the (now-cleared) handler list right
        // away, even though the table entry has not been removed yet.
        peer.send_text("E\u{1f}EVT\u{1f}t\u{1f}Shello\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::Relaxed), 0);

        // Until the ack arrives, the entry survives a replay pass (and is
        // excluded from it, so no spurious re-subscribe is sent for an
        // event the caller is walking away from).
        events.replay_subscriptions().await;
        let premature = tokio::time::timeout(Duration::from_millis(50), peer.recv_text()).await;
        assert!(premature.is_err(), "a pending-unsubscribe event must not be replayed");

        peer.send_text("E\u{1f}A\u{1f}US\u{1f}t\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            !events.table.lock().await.contains_key("t"),
            "the table entry is removed once the unsubscribe ack arrives"
        );
    }

    #[tokio::test]
    async fn unsubscribe_ack_for_an_event_with_no_local_entry_is_reported() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let peer = transport.next_peer();

        let reports = Arc::new(AtomicUsize::new(0));
        let reports_clone = reports.clone();
        let events = EventSubsystem::new(
            connector.clone(),
            Some(Arc::new(move |_| {
                reports_clone.fetch_add(1, Ordering::Relaxed);
            })),
        );
        connector.add_handler(events.clone() as Arc<dyn FrameHandler>).await;

        peer.send_text("E\u{1f}A\u{1f}US\u{1f}never-subscribed\u{1e}").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(reports.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn replay_reissues_subscribe_for_every_table_entry() {
        let (connector, transport) = connector();
        connector.connect().await.unwrap();
        let mut peer = transport.next_peer();

        let events = EventSubsystem::new(connector, None);
        events.subscribe("a", Arc::new(|_, _| {})).await.unwrap();
        events.subscribe("b", Arc::new(|_, _| {})).await.unwrap();
        let _ = peer.recv_text().await;
        let _ = peer.recv_text().await;

        events.replay_subscriptions().await;
        let mut replayed = vec![peer.recv_text().await, peer.recv_text().await];
        replayed.sort();
        assert_eq!(replayed, vec!["E\u{1f}S\u{1f}a\u{1e}", "E\u{1f}S\u{1f}b\u{1e}"]);
    }
}
