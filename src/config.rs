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

//! Client configuration. Created once at construction and read-only
//! thereafter, except that auth credentials may be rotated before an
//! explicit [`crate::client::Client::login`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// The credentials sent on `A|REQ`. The original deepstream client accepts
/// either a username/password pair or a bare token.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AuthParams {
    Credentials { username: String, password: String },
    Token { token: String },
    None,
}

impl Default for AuthParams {
    fn default() -> Self {
        AuthParams::None
    }
}

/// An asynchronous error sink. Invoked for errors that do not arise from a
/// direct synchronous call: ingress decode errors, heartbeat misses,
/// unexpected topics, authentication failures.
pub type ErrorHandler = Arc<dyn Fn(crate::error::ClientError) + Send + Sync>;

/// Configuration for a [`crate::client::Client`].
#[derive(Clone)]
pub struct ClientConfig {
    pub auto_reconnect: bool,
    pub auto_login: bool,
    pub connection_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rec_interval_min: Duration,
    pub rec_interval_max: Duration,
    pub rec_interval_factor: f64,
    pub auth: AuthParams,
    pub error_handler: Option<ErrorHandler>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            auto_reconnect: true,
            auto_login: false,
            connection_timeout: Duration::from_millis(10_000),
            write_timeout: Duration::from_millis(5_000),
            read_timeout: Duration::from_millis(0),
            heartbeat_interval: Duration::from_millis(30_000),
            rec_interval_min: Duration::from_millis(200),
            rec_interval_max: Duration::from_millis(30_000),
            rec_interval_factor: 1.5,
            auth: AuthParams::None,
            error_handler: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_login", &self.auto_login)
            .field("connection_timeout", &self.connection_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("rec_interval_min", &self.rec_interval_min)
            .field("rec_interval_max", &self.rec_interval_max)
            .field("rec_interval_factor", &self.rec_interval_factor)
            .field("auth", &self.auth)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Incremental builder for [`ClientConfig`], mirroring the teacher's
/// `ConfigHierarchy` incremental-builder style.
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn auto_reconnect(mut self, value: bool) -> Self {
        self.config.auto_reconnect = value;
        self
    }

    pub fn auto_login(mut self, value: bool) -> Self {
        self.config.auto_login = value;
        self
    }

    pub fn connection_timeout(mut self, value: Duration) -> Self {
        self.config.connection_timeout = value;
        self
    }

    pub fn write_timeout(mut self, value: Duration) -> Self {
        self.config.write_timeout = value;
        self
    }

    pub fn read_timeout(mut self, value: Duration) -> Self {
        self.config.read_timeout = value;
        self
    }

    pub fn heartbeat_interval(mut self, value: Duration) -> Self {
        self.config.heartbeat_interval = value;
        self
    }

    pub fn reconnect_backoff(mut self, min: Duration, max: Duration, factor: f64) -> Self {
        self.config.rec_interval_min = min;
        self.config.rec_interval_max = max;
        self.config.rec_interval_factor = factor;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.auth = AuthParams::Credentials {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.auth = AuthParams::Token {
            token: token.into(),
        };
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(crate::error::ClientError) + Send + Sync + 'static,
    {
        self.config.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl AuthParams {
    /// Render the auth parameters as the JSON body of an `A|REQ` frame.
    /// `AuthParams::None` serializes to `null` under `#[serde(untagged)]`;
    /// the server expects an (empty) object, so that case is mapped to `{}`.
    pub fn to_json(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Null) | Err(_) => serde_json::json!({}),
            Ok(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ClientConfig::default();
        assert!(config.auto_reconnect);
        assert!(!config.auto_login);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(config.rec_interval_factor, 1.5);
    }

    #[test]
    fn builder_overrides_are_applied() {
        let config = ClientConfigBuilder::new()
            .auto_login(true)
            .credentials("userA", "password")
            .build();

        assert!(config.auto_login);
        assert_eq!(
            config.auth,
            AuthParams::Credentials {
                username: "userA".to_string(),
                password: "password".to_string()
            }
        );
    }

    #[test]
    fn credentials_render_as_the_expected_json() {
        let auth = AuthParams::Credentials {
            username: "userA".to_string(),
            password: "password".to_string(),
        };
        assert_eq!(
            auth.to_json().to_string(),
            "{\"password\":\"password\",\"username\":\"userA\"}"
        );
    }
}
