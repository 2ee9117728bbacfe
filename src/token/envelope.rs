//! Token fields carried at the top level of every upstream response.

use core::fmt;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Error object embedded in a response body. Sub-fields that are missing or
/// not strings are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamError {
    pub kind: String,
    pub message: String,
    pub details: String,
}

impl UpstreamError {
    fn from_map(map: &Map<String, Value>) -> Self {
        let field = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            kind: field("type"),
            message: field("message"),
            details: field("details"),
        }
    }
}

/// Decoded token envelope. Every field is optional: an absent, null or
/// non-numeric field means "no information" and never overwrites state.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenEnvelope {
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub timestamp: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub tokens_left: Option<i64>,
    /// Milliseconds until the next refill tick.
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub refill_in: Option<i64>,
    /// Tokens granted per minute.
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub refill_rate: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub token_flow_reduction: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub tokens_consumed: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub processing_time_in_ms: Option<i64>,
    /// Only an object is read; any other shape counts as absent.
    #[serde(default, deserialize_with = "de_opt_upstream_error")]
    pub error: Option<UpstreamError>,
}

impl TokenEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self> {
        // Structs also deserialize from JSON arrays; only an object is an envelope.
        if body.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{') {
            return Err(Error::ResponseParse(de::Error::custom(
                "expected a JSON object at the top level",
            )));
        }
        serde_json::from_slice(body).map_err(Error::ResponseParse)
    }

    pub fn has_token_fields(&self) -> bool {
        self.tokens_left.is_some() || self.refill_in.is_some() || self.refill_rate.is_some()
    }
}

fn de_opt_i64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientI64)
}

fn de_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientF64)
}

fn de_opt_upstream_error<'de, D>(deserializer: D) -> std::result::Result<Option<UpstreamError>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => Some(UpstreamError::from_map(&map)),
        _ => None,
    })
}

struct LenientI64;

impl<'de> Visitor<'de> for LenientI64 {
    type Value = Option<i64>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer, a float or null")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
        Ok(Some(i64::try_from(v).unwrap_or(i64::MAX)))
    }

    // Truncates toward zero; `as` saturates at the i64 bounds.
    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(v.is_finite().then(|| v as i64))
    }

    fn visit_str<E: de::Error>(self, _v: &str) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_bool<E: de::Error>(self, _v: bool) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Self::Value, D::Error> {
        d.deserialize_any(self)
    }
}

struct LenientF64;

impl<'de> Visitor<'de> for LenientF64 {
    type Value = Option<f64>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a number or null")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(v.is_finite().then_some(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_str<E: de::Error>(self, _v: &str) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_bool<E: de::Error>(self, _v: bool) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Self::Value, D::Error> {
        d.deserialize_any(self)
    }
}
