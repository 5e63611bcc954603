//! NetFlow v9 packet decoding.
//!
//! A packet is a 20-byte header followed by flow-sets. Template flow-sets
//! (id 0) and option template flow-sets (id 1) update the session's
//! [`FlowTemplateCache`]; data flow-sets (id >= 256) are decoded with the
//! template cached under their id. A data flow-set without a template stops
//! decoding of the rest of the packet, keeping everything decoded before it.

use crate::error::{FlowError, Result};
use crate::field_types::{FieldTypeRegistry, ValueKind};
use crate::template::{
    FlowTemplateCache, OptionTemplate, ScopeField, ScopeType, Template, TemplateField,
};
use crate::value::FieldValue;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NETFLOW_V9_VERSION: u16 = 9;
pub const HEADER_LEN: usize = 20;

const FLOWSET_HEADER_LEN: usize = 4;
const TEMPLATE_FLOWSET_ID: u16 = 0;
const OPTION_TEMPLATE_FLOWSET_ID: u16 = 1;
const MIN_DATA_FLOWSET_ID: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHeader {
    pub version: u16,
    /// Number of records (templates and data) the exporter put in the packet
    pub count: u16,
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub sequence: u32,
    pub source_id: u32,
}

impl FlowHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(FlowError::HeaderTooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = read_u16(data, 0);
        if version != NETFLOW_V9_VERSION {
            return Err(FlowError::InvalidVersion {
                expected: NETFLOW_V9_VERSION,
                actual: version,
            });
        }

        Ok(Self {
            version,
            count: read_u16(data, 2),
            sys_uptime: read_u32(data, 4),
            unix_secs: read_u32(data, 8),
            sequence: read_u32(data, 12),
            source_id: read_u32(data, 16),
        })
    }
}

/// One decoded record. Field maps are keyed by field-type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowRecord {
    Data {
        template_id: u16,
        fields: BTreeMap<String, FieldValue>,
    },
    Options {
        template_id: u16,
        scopes: BTreeMap<String, FieldValue>,
        options: BTreeMap<String, FieldValue>,
    },
}

impl FlowRecord {
    pub fn template_id(&self) -> u16 {
        match self {
            Self::Data { template_id, .. } | Self::Options { template_id, .. } => *template_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPacket {
    pub header: FlowHeader,
    /// Data templates announced in this packet
    pub templates: Vec<Arc<Template>>,
    /// The session's active option template after this packet
    pub option_template: Option<Arc<OptionTemplate>>,
    pub records: Vec<FlowRecord>,
    /// Flow-set id of the data flow-set that had no template, if any
    pub missing_template: Option<u16>,
    /// Size of the packet in bytes
    pub length: usize,
}

/// Decodes NetFlow v9 packets using a shared field-type registry.
#[derive(Debug, Clone)]
pub struct FlowRecordParser {
    registry: Arc<FieldTypeRegistry>,
}

impl FlowRecordParser {
    pub fn new(registry: Arc<FieldTypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FieldTypeRegistry {
        &self.registry
    }

    /// Decode one packet, reading and updating the session's template cache.
    pub fn parse(&self, data: &[u8], cache: &mut FlowTemplateCache) -> Result<FlowPacket> {
        let header = FlowHeader::from_bytes(data)?;
        let mut packet = FlowPacket {
            header,
            templates: Vec::new(),
            option_template: None,
            records: Vec::new(),
            missing_template: None,
            length: data.len(),
        };

        let mut offset = HEADER_LEN;
        while offset.saturating_add(FLOWSET_HEADER_LEN) <= data.len() {
            let flowset_id = read_u16(data, offset);
            let flowset_len = read_u16(data, offset + 2);
            if usize::from(flowset_len) < FLOWSET_HEADER_LEN {
                return Err(FlowError::InvalidFlowSetLength {
                    flowset_id,
                    length: flowset_len,
                });
            }
            let end = offset + usize::from(flowset_len);
            if end > data.len() {
                return Err(FlowError::TruncatedFlowSet {
                    flowset_id,
                    declared: usize::from(flowset_len),
                    available: data.len() - offset,
                });
            }
            let body = &data[offset + FLOWSET_HEADER_LEN..end];

            match flowset_id {
                TEMPLATE_FLOWSET_ID => {
                    self.parse_templates(body, cache, &mut packet.templates)?;
                }
                OPTION_TEMPLATE_FLOWSET_ID => {
                    self.parse_option_templates(body, cache)?;
                }
                id if id >= MIN_DATA_FLOWSET_ID => {
                    if !decode_data_flowset(id, body, cache, &mut packet.records) {
                        tracing::warn!(
                            "no template {} for source id {}, dropping the rest of the packet",
                            id,
                            header.source_id
                        );
                        packet.missing_template = Some(id);
                        break;
                    }
                }
                id => {
                    tracing::debug!("skipping flow-set with reserved id {}", id);
                }
            }

            offset = end;
        }

        packet.option_template = cache.option_template();
        Ok(packet)
    }

    fn parse_templates(
        &self,
        body: &[u8],
        cache: &mut FlowTemplateCache,
        announced: &mut Vec<Arc<Template>>,
    ) -> Result<()> {
        let mut cursor = body;
        while cursor.len() >= 4 {
            let template_id = read_u16(cursor, 0);
            let field_count = usize::from(read_u16(cursor, 2));
            if template_id < MIN_DATA_FLOWSET_ID {
                // Zero padding up to the flow-set boundary.
                break;
            }

            let record_len = 4 + field_count * 4;
            if record_len > cursor.len() {
                return Err(FlowError::TruncatedTemplate { template_id });
            }

            let fields = self.field_definitions(&cursor[4..record_len]);
            let template = Arc::new(Template {
                id: template_id,
                fields,
            });
            tracing::debug!(
                "template {} with {} fields ({} bytes per record)",
                template_id,
                field_count,
                template.record_length()
            );
            cache.put(Arc::clone(&template));
            announced.push(template);

            cursor = &cursor[record_len..];
        }
        Ok(())
    }

    fn parse_option_templates(&self, body: &[u8], cache: &mut FlowTemplateCache) -> Result<()> {
        let mut cursor = body;
        while cursor.len() >= 6 {
            let template_id = read_u16(cursor, 0);
            let scope_len = usize::from(read_u16(cursor, 2));
            let option_len = usize::from(read_u16(cursor, 4));
            if template_id < MIN_DATA_FLOWSET_ID {
                break;
            }

            // Section lengths are in bytes, not field counts.
            let scope_end = 6 + scope_len;
            let defs_end = scope_end + option_len;
            if defs_end > cursor.len() {
                return Err(FlowError::TruncatedTemplate { template_id });
            }

            let scope_fields = cursor[6..scope_end]
                .chunks_exact(4)
                .map(|def| ScopeField {
                    scope_type: ScopeType::from_id(read_u16(def, 0)),
                    length: read_u16(def, 2),
                })
                .collect();
            let option_fields = self.field_definitions(&cursor[scope_end..defs_end]);

            tracing::debug!("option template {}", template_id);
            cache.put_option(Arc::new(OptionTemplate {
                id: template_id,
                scope_fields,
                option_fields,
            }));

            cursor = &cursor[defs_end..];
        }
        Ok(())
    }

    fn field_definitions(&self, defs: &[u8]) -> Vec<TemplateField> {
        defs.chunks_exact(4)
            .map(|def| {
                let type_id = read_u16(def, 0);
                let length = read_u16(def, 2);
                TemplateField {
                    field_type: self.registry.resolve(type_id, length),
                    length,
                }
            })
            .collect()
    }
}

/// Decode the records of a data flow-set. Returns false when no template is
/// cached for `flowset_id`.
fn decode_data_flowset(
    flowset_id: u16,
    body: &[u8],
    cache: &FlowTemplateCache,
    records: &mut Vec<FlowRecord>,
) -> bool {
    if let Some(template) = cache.get(flowset_id) {
        let width = template.record_length();
        if width == 0 {
            tracing::warn!("template {} has zero-length records, skipping", flowset_id);
            return true;
        }
        // chunks_exact leaves trailing padding shorter than a record behind.
        for record in body.chunks_exact(width) {
            records.push(FlowRecord::Data {
                template_id: flowset_id,
                fields: decode_fields(&template.fields, record),
            });
        }
        return true;
    }

    if let Some(template) = cache.option_template_for(flowset_id) {
        let width = template.record_length();
        if width == 0 {
            tracing::warn!(
                "option template {} has zero-length records, skipping",
                flowset_id
            );
            return true;
        }
        for record in body.chunks_exact(width) {
            let mut offset = 0;
            let mut scopes = BTreeMap::new();
            for scope in &template.scope_fields {
                let end = offset + usize::from(scope.length);
                if let Some(value) = FieldValue::decode(ValueKind::VarInt, &record[offset..end]) {
                    scopes.insert(scope.scope_type.name(), value);
                }
                offset = end;
            }
            records.push(FlowRecord::Options {
                template_id: flowset_id,
                scopes,
                options: decode_fields(&template.option_fields, &record[offset..]),
            });
        }
        return true;
    }

    false
}

fn decode_fields(fields: &[TemplateField], record: &[u8]) -> BTreeMap<String, FieldValue> {
    let mut values = BTreeMap::new();
    let mut offset = 0;
    for field in fields {
        let end = offset + usize::from(field.length);
        if let Some(value) = FieldValue::decode(field.field_type.kind, &record[offset..end]) {
            values.insert(field.field_type.name.clone(), value);
        }
        offset = end;
    }
    values
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
