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

//! Typed scalar values embedded in event and record payload parts.
//!
//! Each typed part is a one-character tag followed by the encoded value:
//! `L` null, `T`/`F` bool, `N<digits>` number, `S<utf8>` string,
//! `O<json>` object. This typing is only used for event payloads and
//! record partial updates; control frames use raw string parts and never
//! go through this module.

use serde_json::Value as Json;

use crate::error::ClientError;

/// A single typed payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(Json),
}

impl TypedValue {
    /// Encode this value as a tagged wire part.
    pub fn encode(&self) -> String {
        match self {
            TypedValue::Null => "L".to_string(),
            TypedValue::Bool(true) => "T".to_string(),
            TypedValue::Bool(false) => "F".to_string(),
            TypedValue::Number(n) => format!("N{}", n),
            TypedValue::String(s) => format!("S{}", s),
            TypedValue::Object(json) => format!("O{}", json),
        }
    }

    /// Decode a tagged wire part back into a typed value.
    pub fn decode(part: &str) -> Result<TypedValue, ClientError> {
        let mut chars = part.chars();
        let tag = chars
            .next()
            .ok_or_else(|| ClientError::MalformedPayload(part.to_string()))?;
        let rest = chars.as_str();

        match tag {
            'L' => Ok(TypedValue::Null),
            'T' => Ok(TypedValue::Bool(true)),
            'F' => Ok(TypedValue::Bool(false)),
            'N' => rest
                .parse::<f64>()
                .map(TypedValue::Number)
                .map_err(|_| ClientError::MalformedPayload(part.to_string())),
            'S' => Ok(TypedValue::String(rest.to_string())),
            'O' => serde_json::from_str(rest)
                .map(TypedValue::Object)
                .map_err(|_| ClientError::MalformedPayload(part.to_string())),
            _ => Err(ClientError::MalformedPayload(part.to_string())),
        }
    }
}

impl From<bool> for TypedValue {
    fn from(b: bool) -> Self {
        TypedValue::Bool(b)
    }
}

impl From<f64> for TypedValue {
    fn from(n: f64) -> Self {
        TypedValue::Number(n)
    }
}

impl From<i64> for TypedValue {
    fn from(n: i64) -> Self {
        TypedValue::Number(n as f64)
    }
}

impl From<String> for TypedValue {
    fn from(s: String) -> Self {
        TypedValue::String(s)
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        TypedValue::String(s.to_string())
    }
}

impl From<Json> for TypedValue {
    fn from(j: Json) -> Self {
        TypedValue::Object(j)
    }
}

/// Encode a sequence of values as wire parts.
pub fn encode_all(values: &[TypedValue]) -> Vec<String> {
    values.iter().map(TypedValue::encode).collect()
}

/// Decode a sequence of wire parts back into values, failing on the first
/// unrecognized tag.
pub fn decode_all(parts: &[String]) -> Result<Vec<TypedValue>, ClientError> {
    parts.iter().map(|part| TypedValue::decode(part)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_round_trip() {
        let values = vec![
            TypedValue::from("yetAnotherValue"),
            TypedValue::from(10.0),
            TypedValue::from(true),
            TypedValue::from(false),
            TypedValue::from(json!({"qwe": 123})),
        ];
        let encoded = encode_all(&values);
        assert_eq!(
            encoded,
            vec!["SyetAnotherValue", "N10", "T", "F", "O{\"qwe\":123}"]
        );

        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn null_round_trips() {
        assert_eq!(TypedValue::Null.encode(), "L");
        assert_eq!(TypedValue::decode("L").unwrap(), TypedValue::Null);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        assert!(matches!(
            TypedValue::decode("Zfoo"),
            Err(ClientError::MalformedPayload(_))
        ));
    }

    #[test]
    fn non_numeric_number_is_malformed() {
        assert!(matches!(
            TypedValue::decode("Nabc"),
            Err(ClientError::MalformedPayload(_))
        ));
    }

    #[test]
    fn invalid_json_object_is_malformed() {
        assert!(matches!(
            TypedValue::decode("O{not json"),
            Err(ClientError::MalformedPayload(_))
        ));
    }
}
