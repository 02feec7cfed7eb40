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

//! Exponential reconnect backoff with jitter, as driven by the reconnect
//! task (§5) on every failed redial. Resets on reaching `Open`; capped at
//! `rec_interval_max`.

use std::time::Duration;

use crate::config::ClientConfig;

/// Tracks the current backoff interval across a reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ClientConfig) -> Backoff {
        Backoff {
            min: config.rec_interval_min,
            max: config.rec_interval_max,
            factor: config.rec_interval_factor,
            current: config.rec_interval_min,
        }
    }

    /// The interval to wait before the next redial attempt, with jitter in
    /// `[0.8, 1.2]` of the computed interval applied (to avoid a thundering
    /// herd of clients reconnecting to the same host in lockstep).
    pub fn next_interval(&mut self, jitter_unit: f64) -> Duration {
        let base = self.current;
        self.current = std::cmp::min(
            self.max,
            Duration::from_secs_f64(self.current.as_secs_f64() * self.factor),
        );

        let jitter_scale = 0.8 + 0.4 * jitter_unit.clamp(0.0, 1.0);
        Duration::from_secs_f64(base.as_secs_f64() * jitter_scale)
    }

    /// Reset the backoff to its minimum, called on every successful reach
    /// of `Open`.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            rec_interval_min: Duration::from_millis(100),
            rec_interval_max: Duration::from_millis(1_000),
            rec_interval_factor: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn interval_grows_multiplicatively_and_caps_at_max() {
        let mut backoff = Backoff::new(&config());

        let first = backoff.next_interval(0.5);
        assert_eq!(first, Duration::from_millis(100));

        let second = backoff.next_interval(0.5);
        assert_eq!(second, Duration::from_millis(200));

        for _ in 0..10 {
            backoff.next_interval(0.5);
        }
        assert_eq!(backoff.next_interval(0.5), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_the_documented_band() {
        let mut backoff = Backoff::new(&config());
        let low = backoff.clone().next_interval(0.0);
        let high = backoff.clone().next_interval(1.0);
        assert_eq!(low, Duration::from_millis(80));
        assert_eq!(high, Duration::from_millis(120));
    }

    #[test]
    fn reset_returns_to_the_minimum() {
        let mut backoff = Backoff::new(&config());
        backoff.next_interval(0.5);
        backoff.next_interval(0.5);
        backoff.reset();
        assert_eq!(backoff.next_interval(0.5), Duration::from_millis(100));
    }
}
