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

//! A realtime client for the deepstream.io server: a long-lived bidirectional
//! connection carrying a framed text protocol over WebSocket, multiplexing
//! connection, authentication and event traffic over a single transport.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod payload;
pub mod state;
pub mod transport;

pub use client::Client;
pub use config::{AuthParams, ClientConfig, ClientConfigBuilder};
pub use error::ClientError;
pub use state::ConnectionState;
