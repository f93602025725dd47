//! Envelope codec — the request/response record and its wire encoding:
//! recursive key aliasing, timestamp normalization, MessagePack, Zstandard.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueMap};

pub const DEFAULT_PRIORITY: i64 = 10;
pub const CRITICAL_PRIORITY: i64 = 0;

/// Known envelope types. The type is an open-ended string on the wire;
/// these are the ones the transport and gateway treat specially.
pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_ACK: &str = "ack";

/// Data-subtree alias table (§4.1 step 2). Applied recursively to every map
/// encountered under `data`; unknown keys pass through unchanged.
pub const DATA_ALIAS_MAP: &[(&str, &str)] = &[
    ("entity_id", "e"),
    ("task_id", "ti"),
    ("object_id", "oi"),
    ("alias", "als"),
    ("type", "t"),
    ("subtype", "st"),
    ("status", "s"),
    ("components", "c"),
    ("telemetry", "tl"),
    ("health", "h"),
    ("battery_percent", "bp"),
    ("latitude", "lat"),
    ("longitude", "lon"),
    ("altitude_m", "alt"),
    ("metadata", "m"),
    ("created_at", "ca"),
    ("updated_at", "ua"),
    ("note", "n"),
    ("reason", "r"),
    ("status_filter", "sf"),
    ("since", "sn"),
    ("fields", "f"),
    ("limit", "l"),
    ("offset", "o"),
    ("cursor", "cur"),
    ("result", "res"),
];

/// Top-level envelope key alias table (§4.1 step 4). Applied non-recursively.
pub const ENVELOPE_ALIAS_MAP: &[(&str, &str)] = &[
    ("command", "cmd"),
    ("data", "d"),
    ("id", "i"),
    ("type", "t"),
    ("correlation_id", "cid"),
];

const TIMESTAMP_KEYS: &[&str] = &["created_at", "updated_at", "ca", "ua"];

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+T\d{2}:\d{2}:\d{2})(\.\d+)?(Z|[+-]\d{2}:\d{2})?$").unwrap()
    })
}

/// Strips fractional seconds from an ISO-8601-ish timestamp string,
/// preserving any timezone offset. Values that don't match the pattern are
/// returned unchanged.
fn normalize_timestamp_value(s: &str) -> String {
    let re = timestamp_re();
    match re.captures(s) {
        Some(caps) => {
            let base = caps.get(1).map_or("", |m| m.as_str());
            let offset = caps.get(3).map_or("", |m| m.as_str());
            format!("{base}{offset}")
        }
        None => s.to_string(),
    }
}

fn alias_map_lookup<'a>(table: &'a [(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    table.iter().find(|(from, _)| *from == key).map(|(_, to)| *to)
}

fn reverse_alias_map_lookup<'a>(table: &'a [(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    table.iter().find(|(_, to)| *to == key).map(|(from, _)| *from)
}

/// Recursively substitutes keys in every map encountered, descending into
/// lists and nested maps. `lookup` controls alias direction.
fn alias_recursive(value: &Value, lookup: impl Fn(&str) -> Option<&'static str> + Copy) -> Value {
    match value {
        Value::Map(map) => {
            let mut out = ValueMap::with_capacity(map.len());
            for (k, v) in map {
                let new_key = lookup(k).map(str::to_string).unwrap_or_else(|| k.clone());
                out.insert(new_key, alias_recursive(v, lookup));
            }
            Value::Map(out)
        }
        Value::List(items) => Value::List(items.iter().map(|v| alias_recursive(v, lookup)).collect()),
        other => other.clone(),
    }
}

/// Applies the data alias map recursively (long keys -> short keys).
pub fn shorten_payload(value: &Value) -> Value {
    alias_recursive(value, |k| alias_map_lookup(DATA_ALIAS_MAP, k))
}

/// Reverses the data alias map recursively (short keys -> long keys).
pub fn expand_payload(value: &Value) -> Value {
    alias_recursive(value, |k| reverse_alias_map_lookup(DATA_ALIAS_MAP, k))
}

/// Walks a value tree, rewriting any string found under a
/// created_at/updated_at/ca/ua key with `normalize_timestamp_value`.
fn normalize_timestamps(value: &Value) -> Value {
    match value {
        Value::Map(map) => {
            let mut out = ValueMap::with_capacity(map.len());
            for (k, v) in map {
                let new_v = if TIMESTAMP_KEYS.contains(&k.as_str()) {
                    match v {
                        Value::String(s) => Value::String(normalize_timestamp_value(s)),
                        other => normalize_timestamps(other),
                    }
                } else {
                    normalize_timestamps(v)
                };
                out.insert(k.clone(), new_v);
            }
            Value::Map(out)
        }
        Value::List(items) => Value::List(items.iter().map(normalize_timestamps).collect()),
        other => other.clone(),
    }
}

/// In-memory form used both by the wire codec and the JSON spool file. The
/// wire codec drives its own alias/normalize pipeline (see
/// `encode_envelope`/`decode_envelope`); this derive just gives the spool a
/// plain JSON shape to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub meta: ValueMap,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl Envelope {
    pub fn request(id: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            kind: TYPE_REQUEST.to_string(),
            command: command.into(),
            priority: DEFAULT_PRIORITY,
            correlation_id: None,
            data,
            meta: ValueMap::new(),
        }
    }

    pub fn response_to(request: &Envelope, data: Value) -> Self {
        Self {
            id: request.id.clone(),
            kind: TYPE_RESPONSE.to_string(),
            command: request.command.clone(),
            priority: request.priority,
            correlation_id: request.correlation_id.clone(),
            data,
            meta: ValueMap::new(),
        }
    }

    pub fn error_to(request: &Envelope, message: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            kind: TYPE_ERROR.to_string(),
            command: request.command.clone(),
            priority: request.priority,
            correlation_id: request.correlation_id.clone(),
            data: Value::map([("error".to_string(), Value::String(message.into()))]),
            meta: ValueMap::new(),
        }
    }

    pub fn lease_seconds(&self) -> Option<f64> {
        self.meta.get("lease_seconds").and_then(value_as_f64)
    }

    pub fn operation_timeout_seconds(&self) -> Option<f64> {
        self.meta.get("operation_timeout_seconds").and_then(value_as_f64)
    }

    fn to_wire_map(&self) -> Value {
        let mut top = ValueMap::new();
        top.insert("id".to_string(), Value::String(self.id.clone()));
        top.insert("type".to_string(), Value::String(self.kind.clone()));
        top.insert("command".to_string(), Value::String(self.command.clone()));
        top.insert("priority".to_string(), Value::Int(self.priority));
        top.insert("data".to_string(), self.data.clone());
        if !self.meta.is_empty() {
            top.insert("meta".to_string(), Value::Map(self.meta.clone()));
        }
        if let Some(cid) = &self.correlation_id {
            top.insert("correlation_id".to_string(), Value::String(cid.clone()));
        }
        Value::Map(top)
    }

    fn from_wire_map(value: Value) -> Result<Self, CodecError> {
        let map = match value {
            Value::Map(m) => m,
            _ => return Err(CodecError::NotAMap),
        };
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingField("id"))?
            .to_string();
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingField("type"))?
            .to_string();
        let command = map
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let priority = match map.get("priority") {
            Some(Value::Int(i)) => *i,
            _ => DEFAULT_PRIORITY,
        };
        let correlation_id = map
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let data = map.get("data").cloned().unwrap_or(Value::Null);
        let meta = match map.get("meta") {
            Some(Value::Map(m)) => m.clone(),
            _ => ValueMap::new(),
        };
        Ok(Envelope {
            id,
            kind,
            command,
            priority,
            correlation_id,
            data,
            meta,
        })
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Recursively drops map entries whose value is null, descending into
/// lists. Used by the gateway to compact handler results before replying.
pub fn compact(value: &Value) -> Value {
    match value {
        Value::Map(map) => {
            let mut out = ValueMap::new();
            for (k, v) in map {
                if v.is_null() {
                    continue;
                }
                out.insert(k.clone(), compact(v));
            }
            Value::Map(out)
        }
        Value::List(items) => Value::List(items.iter().map(compact).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("zstd failed: {0}")]
    Zstd(#[from] std::io::Error),
    #[error("decoded payload was not a map")]
    NotAMap,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

pub const ZSTD_LEVEL: i32 = 4;

/// Encodes an envelope per §4.1: alias `data` recursively, normalize
/// timestamps, alias the top-level keys, MessagePack, then Zstandard.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, CodecError> {
    let aliased_data = shorten_payload(&env.data);
    let normalized_data = normalize_timestamps(&aliased_data);

    let mut wire = env.clone();
    wire.data = normalized_data;
    let top = wire.to_wire_map();
    let aliased_top = alias_top_level(&top, true);

    let packed = rmp_serde::to_vec_named(&aliased_top)?;
    let compressed = zstd::stream::encode_all(packed.as_slice(), ZSTD_LEVEL)?;
    Ok(compressed)
}

/// Reverses `encode_envelope`.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let packed = zstd::stream::decode_all(bytes)?;
    let top: Value = rmp_serde::from_slice(&packed)?;
    let unaliased_top = alias_top_level(&top, false);
    let mut env = Envelope::from_wire_map(unaliased_top)?;
    env.data = expand_payload(&env.data);
    Ok(env)
}

/// Renames only the top-level keys of an envelope map (non-recursive), in
/// either direction.
fn alias_top_level(value: &Value, shorten: bool) -> Value {
    let map = match value {
        Value::Map(m) => m,
        other => return other.clone(),
    };
    let mut out = ValueMap::with_capacity(map.len());
    for (k, v) in map {
        let new_key = if shorten {
            alias_map_lookup(ENVELOPE_ALIAS_MAP, k).map(str::to_string)
        } else {
            reverse_alias_map_lookup(ENVELOPE_ALIAS_MAP, k).map(str::to_string)
        }
        .unwrap_or_else(|| k.clone());
        out.insert(new_key, v.clone());
    }
    Value::Map(out)
}
