use crate::field_types::FieldType;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateField {
    pub field_type: FieldType,
    pub length: u16,
}

/// Layout of the data records of one flow-set id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: u16,
    pub fields: Vec<TemplateField>,
}

impl Template {
    /// Byte width of one data record.
    pub fn record_length(&self) -> usize {
        self.fields.iter().map(|f| usize::from(f.length)).sum()
    }
}

/// What an option record's scope field describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeType {
    System,
    Interface,
    LineCard,
    Cache,
    Template,
    Other(u16),
}

impl ScopeType {
    pub fn from_id(id: u16) -> Self {
        match id {
            1 => Self::System,
            2 => Self::Interface,
            3 => Self::LineCard,
            4 => Self::Cache,
            5 => Self::Template,
            other => Self::Other(other),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::Interface => "interface".to_string(),
            Self::LineCard => "line_card".to_string(),
            Self::Cache => "cache".to_string(),
            Self::Template => "template".to_string(),
            Self::Other(id) => format!("scope_{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeField {
    pub scope_type: ScopeType,
    pub length: u16,
}

/// Layout of option records: scope fields followed by option fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTemplate {
    pub id: u16,
    pub scope_fields: Vec<ScopeField>,
    pub option_fields: Vec<TemplateField>,
}

impl OptionTemplate {
    pub fn record_length(&self) -> usize {
        let scope: usize = self.scope_fields.iter().map(|f| usize::from(f.length)).sum();
        let options: usize = self.option_fields.iter().map(|f| usize::from(f.length)).sum();
        scope + options
    }
}

/// Templates announced so far by one exporter session.
///
/// Caches must not be shared between unrelated exporters: template ids are
/// only unique within a session.
#[derive(Debug, Default)]
pub struct FlowTemplateCache {
    templates: HashMap<u16, Arc<Template>>,
    option_template: Option<Arc<OptionTemplate>>,
}

impl FlowTemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `template`, replacing any previous template with the same id.
    pub fn put(&mut self, template: Arc<Template>) -> Option<Arc<Template>> {
        self.templates.insert(template.id, template)
    }

    pub fn get(&self, id: u16) -> Option<Arc<Template>> {
        self.templates.get(&id).cloned()
    }

    /// Make `template` the active option template of the session.
    pub fn put_option(&mut self, template: Arc<OptionTemplate>) -> Option<Arc<OptionTemplate>> {
        self.option_template.replace(template)
    }

    pub fn option_template(&self) -> Option<Arc<OptionTemplate>> {
        self.option_template.clone()
    }

    /// The active option template, if it has the given id.
    pub fn option_template_for(&self, id: u16) -> Option<Arc<OptionTemplate>> {
        self.option_template
            .as_ref()
            .filter(|template| template.id == id)
            .cloned()
    }

    /// Number of cached data templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty() && self.option_template.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_types::ValueKind;

    fn template(id: u16, lengths: &[u16]) -> Arc<Template> {
        Arc::new(Template {
            id,
            fields: lengths
                .iter()
                .enumerate()
                .map(|(i, &length)| TemplateField {
                    field_type: FieldType::new(i as u16 + 1, ValueKind::VarInt, format!("f{i}")),
                    length,
                })
                .collect(),
        })
    }

    #[test]
    fn record_length_sums_field_lengths() {
        assert_eq!(template(256, &[4, 2, 1]).record_length(), 7);

        let options = OptionTemplate {
            id: 300,
            scope_fields: vec![ScopeField {
                scope_type: ScopeType::System,
                length: 4,
            }],
            option_fields: vec![TemplateField {
                field_type: FieldType::new(34, ValueKind::UInt32, "sampling_interval"),
                length: 4,
            }],
        };
        assert_eq!(options.record_length(), 8);
    }

    #[test]
    fn same_id_replaces_previous_template() {
        let mut cache = FlowTemplateCache::new();
        assert!(cache.put(template(256, &[4])).is_none());
        let previous = cache.put(template(256, &[2, 2])).unwrap();

        assert_eq!(previous.fields.len(), 1);
        assert_eq!(cache.get(256).unwrap().fields.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn only_one_option_template_is_active() {
        let mut cache = FlowTemplateCache::new();
        let first = Arc::new(OptionTemplate {
            id: 300,
            scope_fields: Vec::new(),
            option_fields: Vec::new(),
        });
        let second = Arc::new(OptionTemplate {
            id: 301,
            ..(*first).clone()
        });

        cache.put_option(first);
        cache.put_option(second);

        assert!(cache.option_template_for(300).is_none());
        assert_eq!(cache.option_template_for(301).unwrap().id, 301);
        assert!(!cache.is_empty());
    }

    #[test]
    fn scope_types_have_stable_names() {
        assert_eq!(ScopeType::from_id(1).name(), "system");
        assert_eq!(ScopeType::from_id(3).name(), "line_card");
        assert_eq!(ScopeType::from_id(42).name(), "scope_42");
    }
}
