//! Field-level diff of an update audit record.

use super::recorder::AuditRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One changed field. A missing side means the key was absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Compare before/after images key by key, keeping only differing keys.
///
/// Records without both images (inserts, deletes) yield an empty diff.
pub fn diff(record: &AuditRecord) -> BTreeMap<String, FieldChange> {
    let (before, after) = match (&record.before_state, &record.after_state) {
        (Some(before), Some(after)) => (before, after),
        _ => return BTreeMap::new(),
    };

    let mut changes = BTreeMap::new();
    for key in before.keys().chain(after.keys()) {
        if changes.contains_key(key) {
            continue;
        }
        let old = before.get(key);
        let new = after.get(key);
        if old != new {
            changes.insert(
                key.clone(),
                FieldChange {
                    old: old.cloned(),
                    new: new.cloned(),
                },
            );
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditAction, AuditId, Fields, Timestamp};
    use proptest::prelude::*;
    use serde_json::json;

    fn update_record(before: Value, after: Value) -> AuditRecord {
        AuditRecord {
            id: AuditId(1),
            created_at: Timestamp(0),
            actor_id: "u-1".into(),
            actor_label: "Pak Joko".into(),
            table_name: "grades".into(),
            record_id: "g-1".into(),
            action: AuditAction::Update,
            before_state: before.as_object().cloned(),
            after_state: after.as_object().cloned(),
        }
    }

    #[test]
    fn test_diff_changed_and_added_keys() {
        let record = update_record(json!({"score": 85}), json!({"score": 90, "notes": "ok"}));
        let changes = diff(&record);

        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes["score"],
            FieldChange {
                old: Some(json!(85)),
                new: Some(json!(90))
            }
        );
        assert_eq!(
            changes["notes"],
            FieldChange {
                old: None,
                new: Some(json!("ok"))
            }
        );
    }

    #[test]
    fn test_diff_removed_key_and_unchanged_key() {
        let record = update_record(
            json!({"name": "Ani", "class": "7A"}),
            json!({"name": "Ani"}),
        );
        let changes = diff(&record);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes["class"].new, None);
    }

    #[test]
    fn test_diff_of_insert_is_empty() {
        let mut record = update_record(json!({}), json!({"score": 1}));
        record.action = AuditAction::Insert;
        record.before_state = None;
        assert!(diff(&record).is_empty());
    }

    proptest! {
        #[test]
        fn prop_diff_only_reports_differences(
            before in prop::collection::btree_map("[a-e]", 0i64..5, 0..5),
            after in prop::collection::btree_map("[a-e]", 0i64..5, 0..5),
        ) {
            let to_fields = |m: &std::collections::BTreeMap<String, i64>| -> Fields {
                m.iter().map(|(k, v)| (k.clone(), json!(v))).collect()
            };
            let mut record = update_record(json!({}), json!({}));
            record.before_state = Some(to_fields(&before));
            record.after_state = Some(to_fields(&after));

            let changes = diff(&record);
            for (key, change) in &changes {
                prop_assert_ne!(&change.old, &change.new);
                prop_assert_eq!(change.old.clone(), before.get(key).map(|v| json!(v)));
                prop_assert_eq!(change.new.clone(), after.get(key).map(|v| json!(v)));
            }
            for key in before.keys().chain(after.keys()) {
                if before.get(key) != after.get(key) {
                    prop_assert!(changes.contains_key(key));
                }
            }
        }
    }
}
