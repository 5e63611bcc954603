use crate::field_types::ValueKind;
use num_bigint::{BigInt, BigUint};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A decoded field value.
///
/// Unsigned integers of up to four bytes are widened into the next larger
/// signed type. Eight-byte unsigned integers, and integers whose declared
/// length does not match their kind, are kept as arbitrary-precision values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    UInt8(i16),
    UInt16(i32),
    UInt24(i32),
    UInt32(i64),
    Int8(i8),
    Int16(i16),
    Int24(i32),
    Int32(i32),
    Int64(i64),
    Big(BigUint),
    BigSigned(BigInt),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac(String),
    String(String),
}

impl FieldValue {
    /// Decode `bytes` according to `kind`. Returns `None` for skipped fields.
    pub fn decode(kind: ValueKind, bytes: &[u8]) -> Option<Self> {
        if kind == ValueKind::Skip {
            return None;
        }

        if let Some(native) = kind.native_length()
            && native != bytes.len()
        {
            return Some(match kind {
                ValueKind::Int8 | ValueKind::Int16 | ValueKind::Int24 | ValueKind::Int32
                | ValueKind::Int64 => Self::BigSigned(BigInt::from_signed_bytes_be(bytes)),
                _ => Self::Big(BigUint::from_bytes_be(bytes)),
            });
        }

        let value = match kind {
            ValueKind::UInt8 => Self::UInt8(i16::from(bytes[0])),
            ValueKind::UInt16 => Self::UInt16(i32::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
            ValueKind::UInt24 => Self::UInt24(i32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])),
            ValueKind::UInt32 => Self::UInt32(i64::from(u32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            ValueKind::UInt64 => Self::Big(BigUint::from_bytes_be(bytes)),
            ValueKind::Int8 => Self::Int8(i8::from_be_bytes([bytes[0]])),
            ValueKind::Int16 => Self::Int16(i16::from_be_bytes([bytes[0], bytes[1]])),
            ValueKind::Int24 => {
                // Sign-extend from the top bit of the first byte.
                let fill = if bytes[0] & 0x80 != 0 { 0xff } else { 0x00 };
                Self::Int24(i32::from_be_bytes([fill, bytes[0], bytes[1], bytes[2]]))
            }
            ValueKind::Int32 => {
                Self::Int32(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            ValueKind::Int64 => Self::Int64(i64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])),
            ValueKind::VarInt => decode_unsigned(bytes),
            ValueKind::Ipv4 => Self::Ipv4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            ValueKind::Ipv6 => {
                let mut octets = [0_u8; 16];
                octets.copy_from_slice(bytes);
                Self::Ipv6(Ipv6Addr::from(octets))
            }
            ValueKind::Mac => Self::Mac(mac_to_string(bytes)),
            ValueKind::String => Self::String(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            ValueKind::Skip => return None,
        };
        Some(value)
    }

    /// The value as a signed 64-bit integer, if it is an integer that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::UInt8(v) => Some(i64::from(*v)),
            Self::UInt16(v) | Self::UInt24(v) | Self::Int24(v) | Self::Int32(v) => {
                Some(i64::from(*v))
            }
            Self::UInt32(v) | Self::Int64(v) => Some(*v),
            Self::Int8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Big(v) => i64::try_from(v).ok(),
            Self::BigSigned(v) => i64::try_from(v).ok(),
            Self::Ipv4(_) | Self::Ipv6(_) | Self::Mac(_) | Self::String(_) => None,
        }
    }

    /// The value as an unsigned 64-bit integer, if it is a non-negative integer that fits.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Big(v) => u64::try_from(v).ok(),
            Self::BigSigned(v) => u64::try_from(v).ok(),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt8(v) | Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) | Self::UInt24(v) | Self::Int24(v) | Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) | Self::Int64(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Big(v) => write!(f, "{v}"),
            Self::BigSigned(v) => write!(f, "{v}"),
            Self::Ipv4(v) => write!(f, "{v}"),
            Self::Ipv6(v) => write!(f, "{v}"),
            Self::Mac(v) | Self::String(v) => f.write_str(v),
        }
    }
}

fn decode_unsigned(bytes: &[u8]) -> FieldValue {
    match bytes.len() {
        1 => FieldValue::UInt8(i16::from(bytes[0])),
        2 => FieldValue::UInt16(i32::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
        3 => FieldValue::UInt24(i32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])),
        4 => FieldValue::UInt32(i64::from(u32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        _ => FieldValue::Big(BigUint::from_bytes_be(bytes)),
    }
}

fn mac_to_string(bytes: &[u8]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}
