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

//! Liveness supervisor: wakes every `heartbeat_interval` and closes the
//! client with [`ClientError::HeartbeatMissed`] if no `C|PI` (and no
//! arrival at `Open`, which seeds the timestamp) has been seen within
//! `2 * heartbeat_interval`.
//!
//! The timestamp is seeded only at the moment the connection reaches
//! `Open`, never at task construction — seeding it earlier would let the
//! supervisor fire a spurious timeout before the first ping has had a
//! chance to arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ClientError;

/// Shared between the state machine (which seeds and refreshes it) and the
/// supervisor task (which only reads it). A plain `std::sync::Mutex` is
/// enough: every critical section is a single load or store, never held
/// across an `.await`.
pub type LastHeartbeat = Arc<Mutex<Option<Instant>>>;

pub fn last_heartbeat() -> LastHeartbeat {
    Arc::new(Mutex::new(None))
}

/// Spawns the heartbeat supervisor task. `on_missed` is invoked at most
/// once, the first time a miss is detected; the task then exits.
pub fn spawn<F>(last_heartbeat: LastHeartbeat, interval: std::time::Duration, on_missed: F) -> HeartbeatSupervisor
where
    F: Fn(ClientError) + Send + Sync + 'static,
{
    let stopped = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(run(last_heartbeat, interval, stopped.clone(), on_missed));
    HeartbeatSupervisor { handle, stopped }
}

async fn run<F>(
    last_heartbeat: LastHeartbeat,
    interval: std::time::Duration,
    stopped: Arc<AtomicBool>,
    on_missed: F,
) where
    F: Fn(ClientError) + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        ticker.tick().await;
        if stopped.load(Ordering::Acquire) {
            return;
        }

        let last = *last_heartbeat.lock().unwrap();
        let last = match last {
            Some(last) => last,
            // `Open` has not been reached yet; nothing to supervise.
            None => continue,
        };

        if Instant::now().duration_since(last) > interval * 2 {
            tracing::error!("heartbeat missed");
            on_missed(ClientError::HeartbeatMissed);
            return;
        }
    }
}

/// A handle to the spawned supervisor task; the owning client calls
/// [`HeartbeatSupervisor::stop`] on close.
pub struct HeartbeatSupervisor {
    handle: JoinHandle<()>,
    stopped: Arc<AtomicBool>,
}

impl HeartbeatSupervisor {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as FiredFlag;

    #[tokio::test(start_paused = true)]
    async fn fires_after_twice_the_interval_with_no_ping() {
        let last_heartbeat = last_heartbeat();
        *last_heartbeat.lock().unwrap() = Some(Instant::now());

        let fired = Arc::new(FiredFlag::new(false));
        let fired_clone = fired.clone();
        let supervisor = spawn(
            last_heartbeat,
            std::time::Duration::from_millis(100),
            move |_err| fired_clone.store(true, Ordering::Release),
        );

        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        assert!(fired.load(Ordering::Acquire));
        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn a_refreshed_timestamp_prevents_the_timeout() {
        let last_heartbeat = last_heartbeat();
        *last_heartbeat.lock().unwrap() = Some(Instant::now());

        let fired = Arc::new(FiredFlag::new(false));
        let fired_clone = fired.clone();
        let heartbeats = last_heartbeat.clone();
        let supervisor = spawn(
            last_heartbeat,
            std::time::Duration::from_millis(100),
            move |_err| fired_clone.store(true, Ordering::Release),
        );

        tokio::time::advance(std::time::Duration::from_millis(90)).await;
        *heartbeats.lock().unwrap() = Some(Instant::now());
        tokio::time::advance(std::time::Duration::from_millis(90)).await;
        tokio::task::yield_now().await;

        assert!(!fired.load(Ordering::Acquire));
        supervisor.stop();
    }
}
