//! Event records delivered by a trace backend, and the structured records the
//! pipeline emits for them
//!
//! An `EventRecord` is only borrowed for the duration of one callback. Anything
//! that must outlive the callback is copied into a `StructuredRecord`.

use crate::decoder::{self, InType, PropertyValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01
pub(crate) const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// One raw, type-tagged field of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    /// Wire-type tag (TDH in-type numbering)
    pub in_type: u16,
    /// Raw little-endian payload
    #[serde(with = "hex_payload")]
    pub data: Vec<u8>,
}

impl Property {
    pub fn raw(name: &str, in_type: u16, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            in_type,
            data,
        }
    }

    fn typed(name: &str, in_type: InType, data: Vec<u8>) -> Self {
        Self::raw(name, in_type as u16, data)
    }

    pub fn i8(name: &str, value: i8) -> Self {
        Self::typed(name, InType::Int8, value.to_le_bytes().to_vec())
    }

    pub fn u8(name: &str, value: u8) -> Self {
        Self::typed(name, InType::UInt8, vec![value])
    }

    pub fn i16(name: &str, value: i16) -> Self {
        Self::typed(name, InType::Int16, value.to_le_bytes().to_vec())
    }

    pub fn u16(name: &str, value: u16) -> Self {
        Self::typed(name, InType::UInt16, value.to_le_bytes().to_vec())
    }

    pub fn i32(name: &str, value: i32) -> Self {
        Self::typed(name, InType::Int32, value.to_le_bytes().to_vec())
    }

    pub fn u32(name: &str, value: u32) -> Self {
        Self::typed(name, InType::UInt32, value.to_le_bytes().to_vec())
    }

    pub fn i64(name: &str, value: i64) -> Self {
        Self::typed(name, InType::Int64, value.to_le_bytes().to_vec())
    }

    pub fn u64(name: &str, value: u64) -> Self {
        Self::typed(name, InType::UInt64, value.to_le_bytes().to_vec())
    }

    /// NUL-terminated UTF-16LE string
    pub fn unicode(name: &str, value: &str) -> Self {
        let mut data: Vec<u8> = value.encode_utf16().flat_map(u16::to_le_bytes).collect();
        data.extend_from_slice(&[0, 0]);
        Self::typed(name, InType::UnicodeString, data)
    }

    /// NUL-terminated 8-bit string
    pub fn ansi(name: &str, value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self::typed(name, InType::AnsiString, data)
    }

    /// UTF-16LE string prefixed with its byte length as a u16
    pub fn counted(name: &str, value: &str) -> Self {
        let body: Vec<u8> = value.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let len = u16::try_from(body.len()).unwrap_or(u16::MAX);
        let mut data = len.to_le_bytes().to_vec();
        data.extend_from_slice(&body[..usize::from(len)]);
        Self::typed(name, InType::CountedString, data)
    }

    pub fn binary(name: &str, value: &[u8]) -> Self {
        Self::typed(name, InType::Binary, value.to_vec())
    }

    /// 100ns intervals since 1601-01-01 UTC
    pub fn filetime(name: &str, value: DateTime<Utc>) -> Self {
        let secs = value.timestamp() + FILETIME_UNIX_OFFSET_SECS;
        let ticks = secs as u64 * 10_000_000 + u64::from(value.timestamp_subsec_nanos() / 100);
        Self::typed(name, InType::FileTime, ticks.to_le_bytes().to_vec())
    }

    /// IPv4 address stored the way kernel network events carry it: a
    /// UINT32 field whose bytes are in network order
    pub fn ipv4(name: &str, value: Ipv4Addr) -> Self {
        Self::typed(name, InType::UInt32, value.octets().to_vec())
    }

    /// IP address of either family, v6 carried as a 16-byte binary field
    pub fn ip(name: &str, value: IpAddr) -> Self {
        match value {
            IpAddr::V4(v4) => Self::ipv4(name, v4),
            IpAddr::V6(v6) => Self::binary(name, &v6.octets()),
        }
    }
}

/// A raw event as produced by the trace backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u16,
    #[serde(default)]
    pub version: u8,
    #[serde(default)]
    pub level: u8,
    #[serde(default)]
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub process_id: u32,
    pub thread_id: u32,
    pub provider_id: Uuid,
    pub provider_name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl EventRecord {
    pub fn builder(provider_name: &str, provider_id: Uuid, id: u16) -> EventRecordBuilder {
        EventRecordBuilder {
            record: EventRecord {
                id,
                version: 0,
                level: 0,
                name: String::new(),
                timestamp: Utc::now(),
                process_id: 0,
                thread_id: 0,
                provider_id,
                provider_name: provider_name.to_string(),
                properties: Vec::new(),
            },
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Decode a named property, returning the sentinel when it is absent
    pub fn value(&self, name: &str) -> PropertyValue {
        match self.property(name) {
            Some(prop) => decoder::decode(prop),
            None => PropertyValue::Unavailable,
        }
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.value(name) {
            PropertyValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.value(name) {
            PropertyValue::I32(v) => Some(v),
            // Some providers declare client pids as UINT32
            PropertyValue::U32(v) => i32::try_from(v).ok(),
            _ => None,
        }
    }

    /// Any string-typed property (unicode, ANSI or counted)
    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.value(name) {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Reinterpret a raw address field: 4 bytes as IPv4 in network order,
    /// 16 bytes as IPv6
    pub fn get_ip_addr(&self, name: &str) -> Option<IpAddr> {
        let data = &self.property(name)?.data;
        match data.len() {
            4 => {
                let octets: [u8; 4] = data.as_slice().try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = data.as_slice().try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            _ => None,
        }
    }
}

/// Fluent construction of records, used by replay captures and tests
#[derive(Debug, Clone)]
pub struct EventRecordBuilder {
    record: EventRecord,
}

impl EventRecordBuilder {
    pub fn process(mut self, pid: u32) -> Self {
        self.record.process_id = pid;
        self
    }

    pub fn thread(mut self, tid: u32) -> Self {
        self.record.thread_id = tid;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.record.name = name.to_string();
        self
    }

    pub fn version(mut self, version: u8) -> Self {
        self.record.version = version;
        self
    }

    pub fn level(mut self, level: u8) -> Self {
        self.record.level = level;
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.record.properties.push(property);
        self
    }

    pub fn build(self) -> EventRecord {
        self.record
    }
}

/// Ordered sequence of named, typed fields emitted for one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredRecord {
    fields: Vec<(String, PropertyValue)>,
}

impl StructuredRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.fields.push((key.into(), value));
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for StructuredRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
