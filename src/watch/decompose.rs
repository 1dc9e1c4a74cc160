// src/watch/decompose.rs

use serde_json::json;

use crate::types::{
    ChangeEvent, ChangeEventType, ChangeFragment, EntityData, FragmentOperation, RelationshipData,
};

pub fn module_entity_id(namespace: &str, module: &str) -> String {
    format!("module:{namespace}/{module}")
}

pub fn file_entity_id(file_path: &str) -> String {
    format!("file:{file_path}")
}

/// File-level decomposition of a [`ChangeEvent`]:
///
/// - the module entity (always upserted)
/// - the file entity
/// - a `contains` relationship module -> file
///
/// A deletion removes the file entity and its relationship; the module
/// stays.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDecomposer {
    /// Request an embedding for every file entity.
    pub embed_files: bool,
}

impl FileDecomposer {
    pub fn new(embed_files: bool) -> Self {
        Self { embed_files }
    }

    pub fn decompose(&self, event: &ChangeEvent) -> Vec<ChangeFragment> {
        let module_id = module_entity_id(&event.namespace, &event.module);
        let file_id = file_entity_id(&event.file_path);
        let file_name = event
            .file_path
            .rsplit('/')
            .next()
            .unwrap_or(&event.file_path)
            .to_string();

        let operation = match event.event_type {
            ChangeEventType::Created => FragmentOperation::Add,
            ChangeEventType::Modified => FragmentOperation::Update,
            ChangeEventType::Deleted => FragmentOperation::Remove,
        };

        let module = ChangeFragment::entity(
            FragmentOperation::Update,
            EntityData {
                id: module_id.clone(),
                kind: "module".into(),
                name: event.module.clone(),
                properties: json!({ "namespace": event.namespace }),
                embed: false,
            },
        );

        let file = ChangeFragment::entity(
            operation,
            EntityData {
                id: file_id.clone(),
                kind: "file".into(),
                name: file_name,
                properties: json!({
                    "path": event.file_path,
                    "size": event.size,
                    "diffHash": event.diff_hash,
                }),
                embed: self.embed_files && !operation.is_removal(),
            },
        );

        let contains = ChangeFragment::relationship(
            operation,
            RelationshipData {
                id: format!("contains:{module_id}->{file_id}"),
                source: module_id,
                target: file_id,
                kind: "contains".into(),
                properties: serde_json::Value::Null,
            },
        );

        vec![module, file, contains]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FragmentData;
    use chrono::Utc;

    fn event(event_type: ChangeEventType) -> ChangeEvent {
        ChangeEvent {
            id: "e".into(),
            namespace: "acme".into(),
            module: "billing".into(),
            file_path: "acme/billing/lib.rs".into(),
            event_type,
            timestamp: Utc::now(),
            size: 3,
            diff_hash: "abc".into(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn modification_yields_module_file_and_contains() {
        let fragments = FileDecomposer::new(true).decompose(&event(ChangeEventType::Modified));
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(ChangeFragment::is_consistent));
        assert_eq!(fragments[0].id(), "module:acme/billing");
        assert_eq!(fragments[1].id(), "file:acme/billing/lib.rs");
        match &fragments[2].data {
            FragmentData::Relationship(rel) => {
                assert_eq!(rel.source, "module:acme/billing");
                assert_eq!(rel.target, "file:acme/billing/lib.rs");
            }
            other => panic!("expected relationship, got {other:?}"),
        }
        match &fragments[1].data {
            FragmentData::Entity(e) => assert!(e.embed),
            other => panic!("expected entity, got {other:?}"),
        }
    }

    #[test]
    fn deletion_removes_file_but_keeps_module() {
        let fragments = FileDecomposer::new(true).decompose(&event(ChangeEventType::Deleted));
        assert_eq!(fragments[0].operation, FragmentOperation::Update);
        assert_eq!(fragments[1].operation, FragmentOperation::Remove);
        assert_eq!(fragments[2].operation, FragmentOperation::Remove);
    }
}
