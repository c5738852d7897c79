//! Depth-first search over record trees

use super::{FieldNode, Node, RecordNode};

/// Uniform access to a record's own fields and its linked children
pub trait RecordLike {
    /// First field of this record (not its children) identified by `field_id`
    fn lookup(&self, field_id: &str) -> Option<&FieldNode>;

    fn children(&self) -> &[RecordNode];
}

impl RecordLike for RecordNode {
    fn lookup(&self, field_id: &str) -> Option<&FieldNode> {
        own_fields(self).find(|f| f.matches(field_id))
    }

    fn children(&self) -> &[RecordNode] {
        &self.children
    }
}

/// Pre-order iterator: a record is yielded before any of its children, and
/// children are visited in document order.
pub struct DepthFirst<'a> {
    stack: Vec<&'a RecordNode>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = &'a RecordNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let collections: Vec<&'a [RecordNode]> = node.nodes().filter_map(Node::as_records).collect();
        for records in collections.into_iter().rev() {
            self.stack.extend(records.iter().rev());
        }
        Some(node)
    }
}

/// A record's own fields, children excluded
fn own_fields(record: &RecordNode) -> impl Iterator<Item = &FieldNode> {
    record.nodes().filter_map(Node::as_field)
}

impl RecordNode {
    pub fn depth_first(&self) -> DepthFirst<'_> {
        DepthFirst { stack: vec![self] }
    }
}

/// First record (root included) satisfying `predicate`
pub fn depth_first<'a, P>(root: &'a RecordNode, mut predicate: P) -> Option<&'a RecordNode>
where
    P: FnMut(&RecordNode) -> bool,
{
    root.depth_first().find(|record| predicate(record))
}

/// First record whose template is `template_uuid`
pub fn find_record_by_template<'a>(root: &'a RecordNode, template_uuid: &str) -> Option<&'a RecordNode> {
    depth_first(root, |record| record.template_uuid == template_uuid)
}

/// First field anywhere in the tree identified by `field_id`
pub fn find_field<'a>(root: &'a RecordNode, field_id: &str) -> Option<&'a FieldNode> {
    root.depth_first().find_map(|record| record.lookup(field_id))
}

/// Every field in the tree identified by `field_id`, in depth-first order
pub fn find_fields<'a>(root: &'a RecordNode, field_id: &'a str) -> impl Iterator<Item = &'a FieldNode> + 'a {
    root.depth_first()
        .flat_map(own_fields)
        .filter(move |field| field.matches(field_id))
}

/// Display text of the first non-empty field identified by `field_id`.
///
/// A record's own fields are checked before its children. Matches that carry
/// no printable value are skipped so the search continues into children.
pub fn find_value(field_id: &str, root: &RecordNode) -> Option<String> {
    root.depth_first().find_map(|record| {
        own_fields(record)
            .filter(|field| field.matches(field_id))
            .find_map(FieldNode::text)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use serde_json::json;

    fn sample() -> RecordNode {
        RecordNode::from_value(&json!({
            "record_uuid": "root",
            "template_uuid": "mineral",
            "fields_mineral": [
                {"k": {"template_field_uuid": "name", "value": "Quartz"}},
                {"k": {"template_field_uuid": "note", "value": ""}}
            ],
            "records_mineral": [
                {
                    "record_uuid": "ref-1",
                    "template_uuid": "reference",
                    "fields_reference": [
                        {"k": {"template_field_uuid": "note", "value": "from child"}},
                        {"k": {"template_field_uuid": "journal", "value": "Am. Mineral."}}
                    ],
                    "records_reference": [{
                        "record_uuid": "auth-1",
                        "template_uuid": "author",
                        "fields_author": [{"k": {"template_field_uuid": "surname", "value": "Downs"}}]
                    }]
                },
                {
                    "record_uuid": "ref-2",
                    "template_uuid": "reference",
                    "fields_reference": [{"k": {"template_field_uuid": "journal", "value": "Can. Mineral."}}]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_find_value_in_root() {
        assert_eq!(find_value("name", &sample()).as_deref(), Some("Quartz"));
    }

    #[test]
    fn test_find_value_in_nested_child() {
        // Nested three levels down, not present at the root
        assert_eq!(find_value("surname", &sample()).as_deref(), Some("Downs"));
    }

    #[test]
    fn test_find_value_skips_empty_match() {
        assert_eq!(find_value("note", &sample()).as_deref(), Some("from child"));
    }

    #[test]
    fn test_find_value_missing() {
        assert_eq!(find_value("nope", &sample()), None);
    }

    #[test]
    fn test_depth_first_order() {
        let tree = sample();
        let order: Vec<&str> = tree.depth_first().map(|r| r.record_uuid.as_str()).collect();
        assert_eq!(order, vec!["root", "ref-1", "auth-1", "ref-2"]);
        assert_eq!(find_value("journal", &tree).as_deref(), Some("Am. Mineral."));
    }

    #[test]
    fn test_find_helpers() {
        let tree = sample();
        assert_eq!(find_record_by_template(&tree, "author").unwrap().record_uuid, "auth-1");
        assert_eq!(find_fields(&tree, "journal").count(), 2);
        assert_eq!(
            find_field(&tree, "surname").unwrap().value,
            FieldValue::Scalar("Downs".into())
        );
        assert!(tree.lookup("surname").is_none());
        assert!(depth_first(&tree, |r| r.record_uuid == "ref-2").is_some());
    }

    #[test]
    fn test_node_view_matches_record_like() {
        let tree = sample();
        let fields: Vec<&FieldNode> = tree.nodes().filter_map(Node::as_field).collect();
        let collections: Vec<&[RecordNode]> = tree.nodes().filter_map(Node::as_records).collect();

        assert_eq!(fields.len(), 2);
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].len(), tree.children().len());
        assert!(std::ptr::eq(collections[0], tree.children()));
        assert_eq!(tree.lookup("name").unwrap().text().as_deref(), Some("Quartz"));
    }
}
