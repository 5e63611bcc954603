//! NetFlow v9 decoding.
//!
//! [`FlowRecordParser`] walks a packet's flow-sets, caching templates in a
//! per-session [`FlowTemplateCache`] and decoding data records with the
//! field kinds held by a shared [`FieldTypeRegistry`].

mod error;
mod field_types;
mod parser;
mod template;
mod value;

pub use error::{FlowError, Result};
pub use field_types::{FieldType, FieldTypeRegistry, ValueKind};
pub use parser::{
    FlowHeader, FlowPacket, FlowRecord, FlowRecordParser, HEADER_LEN, NETFLOW_V9_VERSION,
};
pub use template::{
    FlowTemplateCache, OptionTemplate, ScopeField, ScopeType, Template, TemplateField,
};
pub use value::FieldValue;
