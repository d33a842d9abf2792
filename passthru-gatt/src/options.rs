//! Parsing of the `a{sv}` options dictionary passed to attribute methods
//!
//! BlueZ sends `offset` and `mtu` as `q`, but other peers box them in an
//! extra variant or use wider integer types. Both shapes are accepted.

use std::collections::HashMap;

use tracing::debug;
use zbus::zvariant::{OwnedValue, Value};

use crate::error::GattError;

/// MTU assumed when the peer does not supply one
pub const DEFAULT_MTU: u16 = 517;

/// How a write expects to be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    /// Write without response, no reply is sent
    Command,
    /// Write with response
    #[default]
    Request,
}

/// Parsed ReadValue/WriteValue/AcquireNotify options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeOptions {
    pub offset: usize,
    pub mtu: u16,
    pub write_type: WriteType,
}

impl Default for AttributeOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            mtu: DEFAULT_MTU,
            write_type: WriteType::Request,
        }
    }
}

impl AttributeOptions {
    /// Parse from any sequence of key/value pairs
    pub fn parse<'r, 'v: 'r, K, I>(entries: I) -> Result<Self, GattError>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, &'r Value<'v>)>,
    {
        let mut opts = Self::default();

        for (key, value) in entries {
            let key = key.as_ref();
            if key.eq_ignore_ascii_case("offset") {
                let offset = integer(value).ok_or_else(|| invalid(key, value))?;
                opts.offset = usize::try_from(offset).map_err(|_| invalid(key, value))?;
            } else if key.eq_ignore_ascii_case("mtu") {
                let mtu = integer(value).ok_or_else(|| invalid(key, value))?;
                opts.mtu = u16::try_from(mtu).map_err(|_| invalid(key, value))?;
            } else if key.eq_ignore_ascii_case("type") {
                opts.write_type = match string(value) {
                    Some("command") => WriteType::Command,
                    Some("request") | Some("reliable") => WriteType::Request,
                    _ => return Err(invalid(key, value)),
                };
            } else if key.eq_ignore_ascii_case("link") || key.eq_ignore_ascii_case("device") {
                // Accepted, not used
            } else {
                debug!("Ignoring unknown attribute option {key:?} = {value:?}");
            }
        }

        Ok(opts)
    }

    /// Parse the dictionary as delivered by zbus
    pub fn from_dict(dict: &HashMap<String, OwnedValue>) -> Result<Self, GattError> {
        Self::parse(dict.iter().map(|(k, v)| (k.as_str(), &**v)))
    }

    /// Whether the caller waits for a method reply
    pub fn expects_reply(&self) -> bool {
        self.write_type == WriteType::Request
    }
}

/// Unwrap any number of variant boxes, then widen to u64
fn integer(value: &Value<'_>) -> Option<u64> {
    match value {
        Value::Value(inner) => integer(inner),
        Value::U8(v) => Some(u64::from(*v)),
        Value::U16(v) => Some(u64::from(*v)),
        Value::U32(v) => Some(u64::from(*v)),
        Value::U64(v) => Some(*v),
        Value::I16(v) => u64::try_from(*v).ok(),
        Value::I32(v) => u64::try_from(*v).ok(),
        Value::I64(v) => u64::try_from(*v).ok(),
        _ => None,
    }
}

fn string<'a>(value: &'a Value<'_>) -> Option<&'a str> {
    match value {
        Value::Value(inner) => string(inner),
        Value::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

fn invalid(key: &str, value: &Value<'_>) -> GattError {
    GattError::InvalidArguments(format!("bad value for option {key:?}: {value:?}"))
}
