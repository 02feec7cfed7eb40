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

//! The error surface for the client. Transport and codec errors are
//! recoverable (the ingress loop or dispatcher reports and continues);
//! authentication and rejection errors are terminal.

use thiserror::Error;

/// The error kinds a `deepstream` client can produce, synchronously from a
/// public call or asynchronously through the configured error handler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("failed to dial the remote host: {0:?}")]
    TransportDial(Option<String>),

    #[error("transport read failed")]
    TransportRead,

    #[error("transport write failed")]
    TransportWrite,

    #[error("received an empty transport message")]
    EmptyMessage,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("malformed payload part: {0}")]
    MalformedPayload(String),

    #[error("unexpected frame for topic {topic:?} action {action:?}")]
    UnexpectedFrame { topic: String, action: String },

    #[error("authentication rejected: invalid authentication data")]
    AuthInvalid,

    #[error("authentication rejected: too many authentication attempts")]
    AuthTooManyAttempts,

    #[error("authentication failed: {0}")]
    AuthGeneric(String),

    #[error("connection rejected by server: {0}")]
    ServerReject(String),

    #[error("heartbeat missed, last ping was too long ago")]
    HeartbeatMissed,

    #[error("received a subscription ack for an event with no local subscription: {0}")]
    SubscriptionAckUnknown(String),

    #[error("the client has already been closed")]
    Closed,
}

impl ClientError {
    /// Maps a deepstream auth error code (the second part of `A|E`) onto
    /// the typed error variants known to this crate; anything else maps
    /// to a generic auth failure carrying the original code.
    pub fn from_auth_code(code: &str, message: Option<&str>) -> ClientError {
        match code {
            "INVALID_AUTH_DATA" => ClientError::AuthInvalid,
            "TOO_MANY_AUTH_ATTEMPTS" => ClientError::AuthTooManyAttempts,
            other => {
                ClientError::AuthGeneric(message.unwrap_or(other).to_string())
            }
        }
    }

    /// Whether this error should prevent the reconnect loop from retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::AuthInvalid
                | ClientError::AuthTooManyAttempts
                | ClientError::AuthGeneric(_)
                | ClientError::ServerReject(_)
                | ClientError::HeartbeatMissed
        )
    }
}
