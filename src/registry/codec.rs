//! Conversion between [`Hive`] trees and regf hive files
//!
//! Parsing and writing go through the `regf` crate. Parsing walks the crate's
//! key view into an owned [`RegistryKey`] tree; a key whose values or subkeys
//! cannot be read keeps whatever did read and is flagged incomplete. Writing
//! builds a `KeyTreeNode` tree and emits a version 1.3 hive.

use regf::hive::RegistryKey as StoredKey;
use regf::{DataType, HiveBuilder, KeyTreeNode, KeyTreeValue, RegistryHive};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, trace, warn};

use super::hive::{Hive, RegistryKey};
use super::{RegValue, ValueType};
use crate::error::{Result, VhdiffError};

/// Hive format version written for every output hive
pub const HIVE_VERSION: (u32, u32) = (1, 3);

/// Nesting depth past which subkeys are dropped
const MAX_KEY_DEPTH: usize = 512;

/// Parse a hive file image
///
/// Hive files come from untrusted images, so a panic inside the parser is
/// reported as an invalid hive.
pub(crate) fn parse(bytes: &[u8]) -> Result<Hive> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| read_hive(bytes)));
    match outcome {
        Ok(result) => result,
        Err(_) => Err(VhdiffError::InvalidHive("hive parser rejected the file".into())),
    }
}

fn read_hive(bytes: &[u8]) -> Result<Hive> {
    let hive = RegistryHive::from_bytes(bytes.to_vec())
        .map_err(|e| VhdiffError::InvalidHive(format!("parse hive: {}", e)))?;
    let root = hive
        .root_key()
        .map_err(|e| VhdiffError::InvalidHive(format!("read root key: {}", e)))?;
    let root = read_key(&root, "", 0);
    debug!("Parsed hive rooted at {}", root.name());
    Ok(Hive::from_root(root))
}

fn read_key(stored: &StoredKey<'_>, path: &str, depth: usize) -> RegistryKey {
    let mut key = RegistryKey::new(stored.name());

    match stored.values() {
        Ok(values) => {
            for value in values {
                let name = value.name();
                match value.raw_data() {
                    Ok(data) => {
                        let value_type = ValueType::from_raw(value.raw_data_type());
                        key.values.push((name, RegValue::new(value_type, data)));
                    }
                    Err(e) => {
                        debug!("Value {}::{} unreadable: {}", path, name, e);
                        key.incomplete = true;
                    }
                }
            }
        }
        Err(e) => {
            debug!("Values of {} unreadable: {}", path, e);
            key.incomplete = true;
        }
    }

    if depth >= MAX_KEY_DEPTH {
        warn!("Key {} exceeds maximum nesting depth", path);
        key.incomplete = true;
        return key;
    }
    match stored.subkeys() {
        Ok(subkeys) => {
            for sub in subkeys {
                let child_path = super::hive::join_key_path(path, &sub.name());
                let child = read_key(&sub, &child_path, depth + 1);
                if key.subkey(child.name()).is_some() {
                    trace!("Duplicate subkey {} ignored", child_path);
                    key.incomplete = true;
                    continue;
                }
                key.insert_subkey(child);
            }
        }
        Err(e) => {
            debug!("Subkeys of {} unreadable: {}", path, e);
            key.incomplete = true;
        }
    }
    key
}

/// Serialize a hive to a version 1.3 file image
pub(crate) fn write(hive: &Hive) -> Result<Vec<u8>> {
    let tree = to_tree(hive.root());
    let (major, minor) = HIVE_VERSION;
    let mut builder = HiveBuilder::from_tree_with_version(tree, major, minor);
    let bytes = builder
        .to_bytes()
        .map_err(|e| VhdiffError::InvalidHive(format!("serialize hive: {}", e)))?;
    trace!("Serialized hive to {} bytes", bytes.len());
    Ok(bytes)
}

fn to_tree(key: &RegistryKey) -> KeyTreeNode {
    let mut node = KeyTreeNode::new(key.name());
    for (name, value) in key.values() {
        node.values.push(KeyTreeValue {
            name: name.to_string(),
            data_type: data_type(value.value_type),
            data: value.data.clone(),
        });
    }
    // Subkeys iterate in uppercased-name order, as subkey lists require.
    for sub in key.subkeys() {
        node.children.push(to_tree(sub));
    }
    node
}

fn data_type(value_type: ValueType) -> DataType {
    match value_type {
        ValueType::None => DataType::None,
        ValueType::Sz => DataType::String,
        ValueType::ExpandSz => DataType::ExpandString,
        ValueType::Binary => DataType::Binary,
        ValueType::Dword => DataType::Dword,
        ValueType::DwordBigEndian => DataType::DwordBigEndian,
        ValueType::Link => DataType::Link,
        ValueType::MultiSz => DataType::MultiString,
        ValueType::ResourceList => DataType::ResourceList,
        ValueType::FullResourceDescriptor => DataType::FullResourceDescriptor,
        ValueType::ResourceRequirementsList => DataType::ResourceRequirementsList,
        ValueType::Qword => DataType::Qword,
        ValueType::Unknown(raw) => DataType::Unknown(raw),
    }
}
