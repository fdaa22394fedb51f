//! Windows registry hives: in-memory keys, the hive file codec, comparison
//! and the diff container
//!
//! - [`hive`]: [`RegistryKey`] trees and [`Hive`] files
//! - [`codec`]: parse and write hive files through the `regf` crate
//! - [`compare`]: two-sided comparison into per-value records
//! - [`diff`]: [`RegDiff`], the serializable set of changed values
//!
//! Values are kept as raw bytes plus their type tag; two values are equal when
//! both the tag and the bytes are.

pub mod codec;
pub mod compare;
pub mod diff;
pub mod hive;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use compare::{HiveComparator, HiveComparison, RegistryEntry};
pub use diff::{ApplyOutcome, RegDiff};
pub use hive::{Hive, RegistryKey};

/// Registry value type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// REG_NONE
    None,
    /// REG_SZ
    Sz,
    /// REG_EXPAND_SZ
    ExpandSz,
    /// REG_BINARY
    Binary,
    /// REG_DWORD
    Dword,
    /// REG_DWORD_BIG_ENDIAN
    DwordBigEndian,
    /// REG_LINK
    Link,
    /// REG_MULTI_SZ
    MultiSz,
    /// REG_RESOURCE_LIST
    ResourceList,
    /// REG_FULL_RESOURCE_DESCRIPTOR
    FullResourceDescriptor,
    /// REG_RESOURCE_REQUIREMENTS_LIST
    ResourceRequirementsList,
    /// REG_QWORD
    Qword,
    /// Any other tag, kept as stored
    Unknown(u32),
}

impl ValueType {
    /// Decode a stored tag
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ValueType::None,
            1 => ValueType::Sz,
            2 => ValueType::ExpandSz,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiSz,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            other => ValueType::Unknown(other),
        }
    }

    /// Tag as stored on disk
    pub fn to_raw(self) -> u32 {
        match self {
            ValueType::None => 0,
            ValueType::Sz => 1,
            ValueType::ExpandSz => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiSz => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(raw) => raw,
        }
    }

    /// Win32 constant name
    pub fn name(self) -> String {
        match self {
            ValueType::None => "REG_NONE".into(),
            ValueType::Sz => "REG_SZ".into(),
            ValueType::ExpandSz => "REG_EXPAND_SZ".into(),
            ValueType::Binary => "REG_BINARY".into(),
            ValueType::Dword => "REG_DWORD".into(),
            ValueType::DwordBigEndian => "REG_DWORD_BIG_ENDIAN".into(),
            ValueType::Link => "REG_LINK".into(),
            ValueType::MultiSz => "REG_MULTI_SZ".into(),
            ValueType::ResourceList => "REG_RESOURCE_LIST".into(),
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR".into(),
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST".into(),
            ValueType::Qword => "REG_QWORD".into(),
            ValueType::Unknown(raw) => format!("REG_0x{:x}", raw),
        }
    }

    /// Parse a tag name as accepted on the command line
    pub fn parse_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        let bare = upper.strip_prefix("REG_").unwrap_or(&upper);
        Some(match bare {
            "NONE" => ValueType::None,
            "SZ" => ValueType::Sz,
            "EXPAND_SZ" => ValueType::ExpandSz,
            "BINARY" => ValueType::Binary,
            "DWORD" => ValueType::Dword,
            "DWORD_BIG_ENDIAN" => ValueType::DwordBigEndian,
            "LINK" => ValueType::Link,
            "MULTI_SZ" => ValueType::MultiSz,
            "QWORD" => ValueType::Qword,
            _ => return None,
        })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A typed registry value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegValue {
    /// Type tag
    pub value_type: ValueType,
    /// Stored bytes
    pub data: Vec<u8>,
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn from_utf16le(data: &[u8]) -> String {
    let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

impl RegValue {
    /// Value from raw parts
    pub fn new(value_type: ValueType, data: Vec<u8>) -> Self {
        Self { value_type, data }
    }

    /// REG_SZ, NUL-terminated UTF-16LE
    pub fn sz(s: &str) -> Self {
        let mut data = utf16le(s);
        data.extend_from_slice(&[0, 0]);
        Self::new(ValueType::Sz, data)
    }

    /// REG_EXPAND_SZ
    pub fn expand_sz(s: &str) -> Self {
        Self { value_type: ValueType::ExpandSz, ..Self::sz(s) }
    }

    /// REG_MULTI_SZ, each string NUL-terminated plus a final NUL
    pub fn multi_sz<S: AsRef<str>>(items: &[S]) -> Self {
        let mut data = Vec::new();
        for item in items {
            data.extend(utf16le(item.as_ref()));
            data.extend_from_slice(&[0, 0]);
        }
        data.extend_from_slice(&[0, 0]);
        Self::new(ValueType::MultiSz, data)
    }

    /// REG_DWORD, little-endian
    pub fn dword(v: u32) -> Self {
        Self::new(ValueType::Dword, v.to_le_bytes().to_vec())
    }

    /// REG_QWORD, little-endian
    pub fn qword(v: u64) -> Self {
        Self::new(ValueType::Qword, v.to_le_bytes().to_vec())
    }

    /// REG_BINARY
    pub fn binary(data: Vec<u8>) -> Self {
        Self::new(ValueType::Binary, data)
    }

    /// String contents of SZ, EXPAND_SZ and LINK values
    pub fn as_string(&self) -> Option<String> {
        match self.value_type {
            ValueType::Sz | ValueType::ExpandSz | ValueType::Link => {
                Some(from_utf16le(&self.data).trim_end_matches('\0').to_string())
            }
            _ => None,
        }
    }

    /// Strings of a MULTI_SZ value
    pub fn as_multi_sz(&self) -> Option<Vec<String>> {
        if self.value_type != ValueType::MultiSz {
            return None;
        }
        Some(
            from_utf16le(&self.data)
                .split('\0')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Numeric contents of DWORD and DWORD_BIG_ENDIAN values
    pub fn as_dword(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        match self.value_type {
            ValueType::Dword => Some(u32::from_le_bytes(bytes)),
            ValueType::DwordBigEndian => Some(u32::from_be_bytes(bytes)),
            _ => None,
        }
    }

    /// Numeric contents of QWORD values
    pub fn as_qword(&self) -> Option<u64> {
        if self.value_type != ValueType::Qword {
            return None;
        }
        let bytes: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Parse `text` as a value of type `value_type`
    ///
    /// Numbers accept decimal or `0x` hex, binary data is hex, MULTI_SZ items
    /// are separated by `|`.
    pub fn parse(value_type: ValueType, text: &str) -> Option<Self> {
        let number = |t: &str| -> Option<u64> {
            match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => t.parse().ok(),
            }
        };
        match value_type {
            ValueType::Sz => Some(Self::sz(text)),
            ValueType::ExpandSz => Some(Self::expand_sz(text)),
            ValueType::MultiSz => Some(Self::multi_sz(&text.split('|').collect::<Vec<_>>())),
            ValueType::Dword => number(text).and_then(|n| u32::try_from(n).ok()).map(Self::dword),
            ValueType::Qword => number(text).map(Self::qword),
            ValueType::DwordBigEndian => number(text)
                .and_then(|n| u32::try_from(n).ok())
                .map(|n| Self::new(ValueType::DwordBigEndian, n.to_be_bytes().to_vec())),
            other => hex::decode(text.replace([' ', ','], "")).ok().map(|d| Self::new(other, d)),
        }
    }
}

impl fmt::Display for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_string() {
            return write!(f, "{}", s);
        }
        if let Some(items) = self.as_multi_sz() {
            return write!(f, "{}", items.join("|"));
        }
        if let Some(n) = self.as_dword() {
            return write!(f, "0x{:08x} ({})", n, n);
        }
        if let Some(n) = self.as_qword() {
            return write!(f, "0x{:016x} ({})", n, n);
        }
        write!(f, "{}", hex::encode(&self.data))
    }
}
