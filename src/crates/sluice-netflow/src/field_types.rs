//! Field-type definitions: how each NetFlow field id is named and decoded.
//!
//! The registry is built once and shared through an `Arc`. Ids that are not
//! defined still decode, using a kind inferred from the declared length.

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const BUILTIN_DEFINITIONS: &str = include_str!("../definitions/netflow9.yml");

/// Primitive decode rule of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    UInt8,
    UInt16,
    UInt24,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int24,
    Int32,
    Int64,
    /// Unsigned integer whose width is taken from the template
    VarInt,
    Ipv4,
    Ipv6,
    Mac,
    String,
    /// Bytes are consumed but not decoded
    Skip,
}

impl ValueKind {
    /// Kind used for a field id with no definition.
    pub fn from_length(length: u16) -> Self {
        match length {
            1 => Self::UInt8,
            2 => Self::UInt16,
            3 => Self::UInt24,
            4 => Self::UInt32,
            6 => Self::Mac,
            8 => Self::UInt64,
            16 => Self::Ipv6,
            _ => Self::String,
        }
    }

    /// Width the kind expects on the wire, if it has a fixed one.
    pub fn native_length(self) -> Option<usize> {
        match self {
            Self::UInt8 | Self::Int8 => Some(1),
            Self::UInt16 | Self::Int16 => Some(2),
            Self::UInt24 | Self::Int24 => Some(3),
            Self::UInt32 | Self::Int32 | Self::Ipv4 => Some(4),
            Self::Mac => Some(6),
            Self::UInt64 | Self::Int64 => Some(8),
            Self::Ipv6 => Some(16),
            Self::VarInt | Self::String | Self::Skip => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldType {
    pub id: u16,
    pub kind: ValueKind,
    pub name: String,
}

impl FieldType {
    pub fn new(id: u16, kind: ValueKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
        }
    }

    /// Type synthesised for an unknown id from its declared length.
    pub fn fallback(id: u16, length: u16) -> Self {
        Self::new(id, ValueKind::from_length(length), format!("field_{id}"))
    }
}

/// Immutable mapping from field-type id to its decode rule.
#[derive(Debug, Clone, Default)]
pub struct FieldTypeRegistry {
    types: HashMap<u16, FieldType>,
}

impl FieldTypeRegistry {
    /// Registry with the NetFlow v9 definitions compiled into the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_DEFINITIONS)
    }

    /// Parse definitions of the form `id: [name, kind]`.
    pub fn from_yaml_str(definitions: &str) -> Result<Self> {
        let entries: BTreeMap<u16, (String, ValueKind)> = serde_yaml::from_str(definitions)?;
        let types = entries
            .into_iter()
            .map(|(id, (name, kind))| (id, FieldType::new(id, kind, name)))
            .collect();
        Ok(Self { types })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let definitions =
            std::fs::read_to_string(path).map_err(|source| FlowError::DefinitionsIo {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&definitions)
    }

    /// Definitions of `other` replace ours for the ids they share.
    pub fn merged_with(mut self, other: FieldTypeRegistry) -> Self {
        self.types.extend(other.types);
        self
    }

    pub fn get(&self, id: u16) -> Option<&FieldType> {
        self.types.get(&id)
    }

    /// Definition for `id`, or the length-based fallback when there is none.
    pub fn resolve(&self, id: u16, length: u16) -> FieldType {
        match self.types.get(&id) {
            Some(field_type) => field_type.clone(),
            None => {
                tracing::debug!(
                    "no definition for field type {}, decoding {} bytes by length",
                    id,
                    length
                );
                FieldType::fallback(id, length)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_definitions_load() {
        let registry = FieldTypeRegistry::builtin().unwrap();
        assert!(registry.len() > 100);

        let src_addr = registry.get(8).unwrap();
        assert_eq!(src_addr.name, "ipv4_src_addr");
        assert_eq!(src_addr.kind, ValueKind::Ipv4);
        assert_eq!(registry.get(1).unwrap().kind, ValueKind::VarInt);
        assert_eq!(registry.get(56).unwrap().kind, ValueKind::Mac);
    }

    #[test]
    fn unknown_ids_fall_back_by_length() {
        let registry = FieldTypeRegistry::default();
        let cases = [
            (1, ValueKind::UInt8),
            (2, ValueKind::UInt16),
            (3, ValueKind::UInt24),
            (4, ValueKind::UInt32),
            (6, ValueKind::Mac),
            (8, ValueKind::UInt64),
            (16, ValueKind::Ipv6),
            (5, ValueKind::String),
            (32, ValueKind::String),
        ];
        for (length, kind) in cases {
            let field_type = registry.resolve(4000, length);
            assert_eq!(field_type.kind, kind, "length {length}");
            assert_eq!(field_type.name, "field_4000");
        }
    }

    #[test]
    fn known_ids_resolve_to_their_definition_regardless_of_length() {
        let registry = FieldTypeRegistry::builtin().unwrap();
        let field_type = registry.resolve(7, 4);
        assert_eq!(field_type.name, "l4_src_port");
        assert_eq!(field_type.kind, ValueKind::UInt16);
    }

    #[test]
    fn custom_definitions_override_builtin() {
        let custom = FieldTypeRegistry::from_yaml_str("7: [source_port, int32]\n9000: [tenant, string]\n")
            .unwrap();
        let registry = FieldTypeRegistry::builtin().unwrap().merged_with(custom);

        assert_eq!(registry.get(7).unwrap().name, "source_port");
        assert_eq!(registry.get(7).unwrap().kind, ValueKind::Int32);
        assert_eq!(registry.get(9000).unwrap().kind, ValueKind::String);
        assert_eq!(registry.get(8).unwrap().name, "ipv4_src_addr");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = FieldTypeRegistry::from_yaml_str("1: [in_bytes, float]\n").unwrap_err();
        assert!(matches!(err, FlowError::Definitions(_)));
    }

    #[test]
    fn definitions_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "300: [observation_point, uint32]").unwrap();

        let registry = FieldTypeRegistry::from_path(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(300).unwrap().name, "observation_point");
    }

    #[test]
    fn missing_file_reports_its_path() {
        let err = FieldTypeRegistry::from_path("/nonexistent/netflow.yml").unwrap_err();
        match err {
            FlowError::DefinitionsIo { path, .. } => {
                assert_eq!(path, Path::new("/nonexistent/netflow.yml"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
