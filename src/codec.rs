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

//! Parsing and serialization of the deepstream wire format.
//!
//! A frame is a sequence of UTF-8 parts joined by the part separator
//! (`0x1F`) and terminated by the message separator (`0x1E`). A transport
//! message may batch several frames; [`parse`] splits on the message
//! separator and ignores the empty trailing split the terminator leaves
//! behind.

use crate::error::ClientError;

/// Byte separating the parts within a single frame.
pub const PART_SEPARATOR: char = '\u{1f}';
/// Byte separating frames within a batched transport message.
pub const MESSAGE_SEPARATOR: char = '\u{1e}';

/// One parsed protocol message: a topic, an action and an ordered list of
/// opaque string parts. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    topic: String,
    action: String,
    data: Vec<String>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, action: impl Into<String>, data: Vec<String>) -> Frame {
        Frame {
            topic: topic.into(),
            action: action.into(),
            data,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn data(&self) -> &[String] {
        &self.data
    }

    /// Convenience accessor for the data part at `index`, if present.
    pub fn part(&self, index: usize) -> Option<&str> {
        self.data.get(index).map(String::as_str)
    }
}

/// Split a transport message into its constituent frames.
///
/// Fails with [`ClientError::EmptyMessage`] for empty input and with
/// [`ClientError::MalformedFrame`] for a segment with fewer than two
/// parts (a frame always has at least a topic and an action).
pub fn parse(message: &str) -> Result<Vec<Frame>, ClientError> {
    if message.is_empty() {
        return Err(ClientError::EmptyMessage);
    }

    message
        .split(MESSAGE_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(parse_segment)
        .collect()
}

fn parse_segment(segment: &str) -> Result<Frame, ClientError> {
    let mut parts = segment.split(PART_SEPARATOR);

    let topic = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ClientError::MalformedFrame(segment.to_string()))?;
    let action = parts
        .next()
        .ok_or_else(|| ClientError::MalformedFrame(segment.to_string()))?;

    Ok(Frame::new(
        topic,
        action,
        parts.map(str::to_string).collect(),
    ))
}

/// Encode a frame's topic, action and parts into wire bytes, terminated by
/// the message separator. Never emits a trailing empty part.
pub fn encode(topic: &str, action: &str, parts: &[String]) -> String {
    let mut out = String::with_capacity(topic.len() + action.len() + 8);
    out.push_str(topic);
    out.push(PART_SEPARATOR);
    out.push_str(action);
    for part in parts {
        out.push(PART_SEPARATOR);
        out.push_str(part);
    }
    out.push(MESSAGE_SEPARATOR);
    out
}
