//! Typed property decoding
//!
//! Turns one raw, type-tagged field into a `PropertyValue`. Decoding never
//! fails past this boundary: truncated payloads, bad encodings, unknown tags
//! and the categories deliberately left uninterpreted (floating point,
//! boolean, GUID, pointer, SID, hex-dump and the legacy counted/reversed
//! string encodings) all resolve to `PropertyValue::Unavailable`.

use crate::record::{Property, FILETIME_UNIX_OFFSET_SECS};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Rendering of the sentinel in structured output
pub const UNAVAILABLE: &str = "<Unknown type>";

/// Wire-type tags (TDH in-type numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum InType {
    Null = 0,
    UnicodeString = 1,
    AnsiString = 2,
    Int8 = 3,
    UInt8 = 4,
    Int16 = 5,
    UInt16 = 6,
    Int32 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Float = 11,
    Double = 12,
    Boolean = 13,
    Binary = 14,
    Guid = 15,
    Pointer = 16,
    FileTime = 17,
    SystemTime = 18,
    Sid = 19,
    HexInt32 = 20,
    HexInt64 = 21,
    CountedString = 300,
    CountedAnsiString = 301,
    ReversedCountedString = 302,
    ReversedCountedAnsiString = 303,
    NonNullTerminatedString = 304,
    NonNullTerminatedAnsiString = 305,
    UnicodeChar = 306,
    AnsiChar = 307,
    SizeT = 308,
    HexDump = 309,
    WbemSid = 310,
}

impl InType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        use InType as T;

        let t = match raw {
            0 => T::Null,
            1 => T::UnicodeString,
            2 => T::AnsiString,
            3 => T::Int8,
            4 => T::UInt8,
            5 => T::Int16,
            6 => T::UInt16,
            7 => T::Int32,
            8 => T::UInt32,
            9 => T::Int64,
            10 => T::UInt64,
            11 => T::Float,
            12 => T::Double,
            13 => T::Boolean,
            14 => T::Binary,
            15 => T::Guid,
            16 => T::Pointer,
            17 => T::FileTime,
            18 => T::SystemTime,
            19 => T::Sid,
            20 => T::HexInt32,
            21 => T::HexInt64,
            300 => T::CountedString,
            301 => T::CountedAnsiString,
            302 => T::ReversedCountedString,
            303 => T::ReversedCountedAnsiString,
            304 => T::NonNullTerminatedString,
            305 => T::NonNullTerminatedAnsiString,
            306 => T::UnicodeChar,
            307 => T::AnsiChar,
            308 => T::SizeT,
            309 => T::HexDump,
            310 => T::WbemSid,
            _ => return None,
        };
        Some(t)
    }

    /// Whether the decoder interprets this category instead of returning
    /// the sentinel
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            InType::UnicodeString
                | InType::AnsiString
                | InType::Int8
                | InType::UInt8
                | InType::Int16
                | InType::UInt16
                | InType::Int32
                | InType::UInt32
                | InType::Int64
                | InType::UInt64
                | InType::Binary
                | InType::FileTime
                | InType::CountedString
        )
    }
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    String(String),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
    Address(IpAddr),
    Guid(Uuid),
    /// The field could not or would not be interpreted
    Unavailable,
}

impl PropertyValue {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PropertyValue::Unavailable)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::I8(v) => write!(f, "{}", v),
            PropertyValue::U8(v) => write!(f, "{}", v),
            PropertyValue::I16(v) => write!(f, "{}", v),
            PropertyValue::U16(v) => write!(f, "{}", v),
            PropertyValue::I32(v) => write!(f, "{}", v),
            PropertyValue::U32(v) => write!(f, "{}", v),
            PropertyValue::I64(v) => write!(f, "{}", v),
            PropertyValue::U64(v) => write!(f, "{}", v),
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Binary(b) => f.write_str(&hex::encode(b)),
            PropertyValue::DateTime(t) => f.write_str(&t.to_rfc3339()),
            PropertyValue::Address(a) => write!(f, "{}", a),
            PropertyValue::Guid(g) => write!(f, "{}", g),
            PropertyValue::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyValue::I8(v) => serializer.serialize_i8(*v),
            PropertyValue::U8(v) => serializer.serialize_u8(*v),
            PropertyValue::I16(v) => serializer.serialize_i16(*v),
            PropertyValue::U16(v) => serializer.serialize_u16(*v),
            PropertyValue::I32(v) => serializer.serialize_i32(*v),
            PropertyValue::U32(v) => serializer.serialize_u32(*v),
            PropertyValue::I64(v) => serializer.serialize_i64(*v),
            PropertyValue::U64(v) => serializer.serialize_u64(*v),
            other => serializer.collect_str(other),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
enum DecodeError {
    #[error("payload truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("invalid UTF-16 payload")]
    InvalidUtf16,

    #[error("FILETIME out of range: {0}")]
    TimeOutOfRange(u64),
}

/// Decode one property. Never fails; see module docs for sentinel cases.
pub fn decode(property: &Property) -> PropertyValue {
    decode_raw(property.in_type, &property.name, &property.data)
}

/// Decode a payload given its wire-type tag
pub fn decode_raw(in_type: u16, name: &str, data: &[u8]) -> PropertyValue {
    let Some(kind) = InType::from_raw(in_type) else {
        debug!(field = name, in_type, "unknown property type tag");
        return PropertyValue::Unavailable;
    };

    if !kind.is_supported() {
        trace!(field = name, ?kind, "property type left uninterpreted");
        return PropertyValue::Unavailable;
    }

    match try_decode(kind, data) {
        Ok(value) => value,
        Err(e) => {
            debug!(field = name, ?kind, error = %e, "property decode failed");
            PropertyValue::Unavailable
        }
    }
}

fn try_decode(kind: InType, data: &[u8]) -> Result<PropertyValue, DecodeError> {
    let value = match kind {
        InType::Int8 => PropertyValue::I8(i8::from_le_bytes(fixed(data)?)),
        InType::UInt8 => PropertyValue::U8(u8::from_le_bytes(fixed(data)?)),
        InType::Int16 => PropertyValue::I16(i16::from_le_bytes(fixed(data)?)),
        InType::UInt16 => PropertyValue::U16(u16::from_le_bytes(fixed(data)?)),
        InType::Int32 => PropertyValue::I32(i32::from_le_bytes(fixed(data)?)),
        InType::UInt32 => PropertyValue::U32(u32::from_le_bytes(fixed(data)?)),
        InType::Int64 => PropertyValue::I64(i64::from_le_bytes(fixed(data)?)),
        InType::UInt64 => PropertyValue::U64(u64::from_le_bytes(fixed(data)?)),
        InType::UnicodeString => PropertyValue::String(utf16_until_nul(data)?),
        InType::AnsiString => {
            let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            PropertyValue::String(String::from_utf8_lossy(&data[..end]).into_owned())
        }
        InType::CountedString => {
            let len = usize::from(u16::from_le_bytes(fixed(data)?));
            let body = data
                .get(2..2 + len)
                .ok_or(DecodeError::Truncated {
                    needed: 2 + len,
                    actual: data.len(),
                })?;
            PropertyValue::String(utf16_until_nul(body)?)
        }
        InType::Binary => PropertyValue::Binary(data.to_vec()),
        InType::FileTime => PropertyValue::DateTime(filetime(u64::from_le_bytes(fixed(data)?))?),
        _ => PropertyValue::Unavailable,
    };
    Ok(value)
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], DecodeError> {
    data.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::Truncated {
            needed: N,
            actual: data.len(),
        })
}

fn utf16_until_nul(data: &[u8]) -> Result<String, DecodeError> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|_| DecodeError::InvalidUtf16)
}

fn filetime(ticks: u64) -> Result<DateTime<Utc>, DecodeError> {
    let secs = (ticks / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ticks % 10_000_000) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).ok_or(DecodeError::TimeOutOfRange(ticks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_integers_decode_little_endian() {
        assert_eq!(decode(&Property::i8("a", -3)), PropertyValue::I8(-3));
        assert_eq!(decode(&Property::u8("a", 200)), PropertyValue::U8(200));
        assert_eq!(decode(&Property::i16("a", -300)), PropertyValue::I16(-300));
        assert_eq!(decode(&Property::u16("a", 60000)), PropertyValue::U16(60000));
        assert_eq!(decode(&Property::i32("a", -70000)), PropertyValue::I32(-70000));
        assert_eq!(decode(&Property::u32("a", 4_000_000_000)), PropertyValue::U32(4_000_000_000));
        assert_eq!(decode(&Property::i64("a", i64::MIN)), PropertyValue::I64(i64::MIN));
        assert_eq!(decode(&Property::u64("a", u64::MAX)), PropertyValue::U64(u64::MAX));
    }

    #[test]
    fn test_strings_decode() {
        assert_eq!(
            decode(&Property::unicode("s", "héllo")),
            PropertyValue::String("héllo".to_string())
        );
        assert_eq!(
            decode(&Property::ansi("s", "plain")),
            PropertyValue::String("plain".to_string())
        );
        assert_eq!(
            decode(&Property::counted("s", "counted")),
            PropertyValue::String("counted".to_string())
        );
    }

    #[test]
    fn test_unicode_without_terminator_reads_to_end() {
        let data: Vec<u8> = "abc".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let p = Property::raw("s", InType::UnicodeString as u16, data);
        assert_eq!(decode(&p), PropertyValue::String("abc".to_string()));
    }

    #[test]
    fn test_binary_and_filetime() {
        assert_eq!(
            decode(&Property::binary("b", &[0xde, 0xad])),
            PropertyValue::Binary(vec![0xde, 0xad])
        );

        let when = Utc.with_ymd_and_hms(2020, 5, 17, 12, 30, 0).unwrap();
        assert_eq!(
            decode(&Property::filetime("t", when)),
            PropertyValue::DateTime(when)
        );
    }

    #[test]
    fn test_filetime_epoch() {
        let p = Property::raw("t", InType::FileTime as u16, 0u64.to_le_bytes().to_vec());
        let PropertyValue::DateTime(t) = decode(&p) else {
            panic!("expected datetime");
        };
        assert_eq!(t.to_rfc3339(), "1601-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_unsupported_categories_return_sentinel() {
        for tag in [
            InType::Float,
            InType::Double,
            InType::Boolean,
            InType::Guid,
            InType::Pointer,
            InType::Sid,
            InType::HexDump,
            InType::CountedAnsiString,
            InType::ReversedCountedString,
            InType::NonNullTerminatedString,
        ] {
            let p = Property::raw("x", tag as u16, vec![1; 16]);
            assert_eq!(decode(&p), PropertyValue::Unavailable, "{:?}", tag);
        }
    }

    #[test]
    fn test_unknown_tag_returns_sentinel() {
        let p = Property::raw("x", 9999, vec![1, 2, 3, 4]);
        assert!(decode(&p).is_unavailable());
    }

    #[test]
    fn test_truncated_payload_returns_sentinel() {
        let p = Property::raw("x", InType::UInt64 as u16, vec![1, 2, 3]);
        assert!(decode(&p).is_unavailable());

        let counted = Property::raw("x", InType::CountedString as u16, vec![10, 0, b'a', 0]);
        assert!(decode(&counted).is_unavailable());
    }

    #[test]
    fn test_invalid_utf16_returns_sentinel() {
        // Lone high surrogate
        let p = Property::raw("x", InType::UnicodeString as u16, vec![0x00, 0xd8, 0x00, 0x00]);
        assert!(decode(&p).is_unavailable());
    }

    #[test]
    fn test_value_serialization() {
        assert_eq!(serde_json::to_string(&PropertyValue::U32(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&PropertyValue::Binary(vec![0xab, 0x01])).unwrap(),
            "\"ab01\""
        );
        assert_eq!(
            serde_json::to_string(&PropertyValue::Unavailable).unwrap(),
            "\"<Unknown type>\""
        );
        assert_eq!(
            serde_json::to_string(&PropertyValue::Address("10.1.2.3".parse().unwrap())).unwrap(),
            "\"10.1.2.3\""
        );
    }

    #[test]
    fn test_from_raw_covers_every_variant() {
        for raw in (0u16..=21).chain(300..=310) {
            let t = InType::from_raw(raw).unwrap();
            assert_eq!(t as u16, raw);
        }
        assert_eq!(InType::from_raw(22), None);
        assert_eq!(InType::from_raw(311), None);
    }
}
