//! Typed record tree
//!
//! The producer returns each dataset record as a nested JSON document whose keys
//! are built from UUIDs: field lists live under `fields_{template_uuid}` (or
//! `fields_{record_uuid}`) and linked child records under
//! `records_{template_uuid}`. Individual fields are either bare objects or
//! single-key wrappers around the field object.
//!
//! [`RecordNode::from_value`] normalises all of that into a tree of
//! [`RecordNode`]s and [`FieldNode`]s so the pipeline never touches raw keys.

mod search;

pub use search::{depth_first, find_field, find_fields, find_record_by_template, find_value, DepthFirst, RecordLike};

use crate::error::{OdrError, Result};
use serde_json::{Map, Value};

/// One dataset record and its linked child records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordNode {
    pub record_uuid: String,
    pub template_uuid: String,
    pub unique_id: Option<String>,
    pub fields: Vec<FieldNode>,
    pub children: Vec<RecordNode>,
}

/// A single field value attached to a record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldNode {
    pub template_field_uuid: Option<String>,
    pub field_uuid: Option<String>,
    pub value: FieldValue,
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldValue {
    Scalar(String),
    /// Selected radio/checkbox options, by display name
    Options(Vec<String>),
    Tags(Vec<TagNode>),
    #[default]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagNode {
    pub id: String,
    pub name: String,
    pub children: Vec<TagNode>,
}

/// A file (or image) uploaded to a field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileRef {
    pub file_uuid: String,
    pub original_name: String,
    pub href: String,
    /// -1 ignore, 0 unrated, 1 poor, 2 fair, 3 excellent
    pub quality: Option<i32>,
    /// Upload timestamp as sent by the producer
    pub created: Option<String>,
    /// Set on resized/derived images
    pub parent_image_id: Option<String>,
}

/// Borrowed view of one entry in a record: either a field or a collection of
/// child records
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Field(&'a FieldNode),
    Records(&'a [RecordNode]),
}

impl<'a> Node<'a> {
    pub fn as_field(self) -> Option<&'a FieldNode> {
        match self {
            Node::Field(field) => Some(field),
            Node::Records(_) => None,
        }
    }

    pub fn as_records(self) -> Option<&'a [RecordNode]> {
        match self {
            Node::Records(records) => Some(records),
            Node::Field(_) => None,
        }
    }
}

impl RecordNode {
    /// Build the tree from a producer JSON document
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| OdrError::parse("record must be a JSON object"))?;
        Ok(Self::from_object(object))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(&value)
    }

    fn from_object(object: &Map<String, Value>) -> Self {
        let mut record = RecordNode {
            record_uuid: string_at(object, "record_uuid").unwrap_or_default(),
            template_uuid: string_at(object, "template_uuid").unwrap_or_default(),
            unique_id: string_at(object, "unique_id"),
            ..Default::default()
        };

        for (key, entry) in object {
            let Some(items) = entry.as_array() else {
                continue;
            };

            if key == "fields" || key.starts_with("fields_") {
                record
                    .fields
                    .extend(items.iter().filter_map(FieldNode::from_item));
            } else if key.starts_with("records_") || key == "related_databases" {
                record.children.extend(
                    items
                        .iter()
                        .filter_map(Value::as_object)
                        .map(RecordNode::from_object),
                );
            }
        }

        record
    }

    /// Fields first, then one entry per non-empty child collection
    pub fn nodes(&self) -> impl Iterator<Item = Node<'_>> {
        let children = (!self.children.is_empty()).then_some(Node::Records(&self.children[..]));
        self.fields.iter().map(Node::Field).chain(children)
    }
}

impl FieldNode {
    fn from_item(item: &Value) -> Option<Self> {
        let object = item.as_object()?;
        let field = if is_field_object(object) {
            object
        } else {
            object.values().find_map(Value::as_object)?
        };
        Some(Self::from_object(field))
    }

    fn from_object(object: &Map<String, Value>) -> Self {
        let files = object
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_object)
                    .map(FileRef::from_object)
                    .collect()
            })
            .unwrap_or_default();

        FieldNode {
            template_field_uuid: string_at(object, "template_field_uuid"),
            field_uuid: string_at(object, "field_uuid"),
            value: FieldValue::from_object(object),
            files,
        }
    }

    /// Whether this field is the one identified by `field_id`
    pub fn matches(&self, field_id: &str) -> bool {
        self.template_field_uuid.as_deref() == Some(field_id)
            || self.field_uuid.as_deref() == Some(field_id)
    }

    /// Display text: a file link wins over a scalar value, which wins over
    /// selected options. `None` when the field carries nothing printable.
    pub fn text(&self) -> Option<String> {
        if let Some(file) = self.files.iter().find(|f| !f.href.is_empty()) {
            return Some(file.href.clone());
        }
        match &self.value {
            FieldValue::Scalar(s) if !s.is_empty() => Some(s.clone()),
            FieldValue::Options(names) if !names.is_empty() => Some(names.join(", ")),
            _ => None,
        }
    }
}

impl FieldValue {
    fn from_object(object: &Map<String, Value>) -> Self {
        if let Some(scalar) = object.get("value").and_then(scalar_to_string) {
            return FieldValue::Scalar(scalar);
        }
        if let Some(values) = object.get("values").and_then(Value::as_array) {
            let names: Vec<String> = values
                .iter()
                .filter_map(|v| v.as_object().and_then(|o| string_at(o, "name")))
                .collect();
            if !names.is_empty() {
                return FieldValue::Options(names);
            }
        }
        if let Some(tags) = object.get("tags").and_then(Value::as_array) {
            let tags = TagNode::from_items(tags);
            if !tags.is_empty() {
                return FieldValue::Tags(tags);
            }
        }
        FieldValue::Empty
    }
}

impl TagNode {
    fn from_items(items: &[Value]) -> Vec<Self> {
        items
            .iter()
            .filter_map(Value::as_object)
            .map(|o| TagNode {
                id: string_at(o, "id").unwrap_or_default(),
                name: string_at(o, "name").unwrap_or_default(),
                children: o
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|t| TagNode::from_items(t))
                    .unwrap_or_default(),
            })
            .collect()
    }
}

impl FileRef {
    fn from_object(object: &Map<String, Value>) -> Self {
        let metadata = object.get("_file_metadata").and_then(Value::as_object);

        FileRef {
            file_uuid: string_at(object, "file_uuid").unwrap_or_default(),
            original_name: string_at(object, "original_name").unwrap_or_default(),
            href: string_at(object, "href").unwrap_or_default(),
            quality: metadata
                .and_then(|m| string_at(m, "_quality"))
                .and_then(|q| q.trim().parse().ok()),
            created: metadata.and_then(|m| match m.get("_create_date") {
                // PHP DateTime objects serialise as {"date": "...", "timezone": ...}
                Some(Value::Object(date)) => string_at(date, "date"),
                Some(other) => scalar_to_string(other),
                None => None,
            }),
            parent_image_id: string_at(object, "parent_image_id"),
        }
    }

    /// File name prefix shared by every revision of this file, i.e. the part of
    /// `original_name` before the file UUID. `None` when the name does not embed
    /// the UUID.
    pub fn stub(&self) -> Option<&str> {
        if self.file_uuid.is_empty() {
            return None;
        }
        self.original_name
            .find(&self.file_uuid)
            .map(|idx| &self.original_name[..idx])
    }
}

fn is_field_object(object: &Map<String, Value>) -> bool {
    object.contains_key("template_field_uuid") || object.contains_key("field_uuid")
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_at(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(scalar_to_string)
}
