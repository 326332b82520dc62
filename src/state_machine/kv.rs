//! Student record store
//!
//! Operations (arrive through the log as `Op`):
//! - `Put { key, record }` - replace the record under `key`
//! - `Get { key }` - read the record under `key`, never deduplicated
//!
//! Local reads use `get()` / `keys()` directly and bypass the log.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::{ApplyOutcome, SnapshotError, Snapshotable, StateMachine};
use crate::kv::command::{ClientId, Op, OpKind};

/// A student record as stored and served by the gateway
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StudentRecord {
    /// Year of study
    pub grand: i64,
    pub class: String,
    pub major: String,
    pub name: String,
    pub course_count: i64,
    pub total_credits: f64,
}

#[cfg(test)]
impl StudentRecord {
    pub(crate) fn sample(name: &str) -> Self {
        StudentRecord {
            grand: 2,
            class: "CS-1".to_string(),
            major: "Computer Science".to_string(),
            name: name.to_string(),
            course_count: 5,
            total_credits: 18.5,
        }
    }
}

/// In-memory record map plus the duplicate-detection table
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: BTreeMap<String, StudentRecord>,
    /// Highest applied write sequence per client
    last_seq: HashMap<ClientId, u64>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a record directly (for local reads, bypasses Raft)
    pub fn get(&self, key: &str) -> Option<StudentRecord> {
        self.data.get(key).cloned()
    }

    /// All keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last_seq(&self, client_id: ClientId) -> Option<u64> {
        self.last_seq.get(&client_id).copied()
    }

    fn is_duplicate(&self, op: &Op) -> bool {
        self.last_seq
            .get(&op.client_id)
            .is_some_and(|&last| op.seq <= last)
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, op: &Op) -> ApplyOutcome {
        match &op.kind {
            OpKind::Get { key } => ApplyOutcome::Applied(self.get(key)),
            OpKind::Put { key, record } => {
                // Checked before touching the map: a retransmitted write never re-applies
                if self.is_duplicate(op) {
                    return ApplyOutcome::Duplicate;
                }
                self.data.insert(key.clone(), record.clone());
                self.last_seq.insert(op.client_id, op.seq);
                ApplyOutcome::Applied(None)
            }
        }
    }
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(SnapshotError::Serialize)
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        *self = serde_json::from_slice(data).map_err(SnapshotError::Deserialize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut kv = KeyValueStore::new();

        let outcome = kv.apply(&Op::put("s1", StudentRecord::sample("Alice"), 1, 1));
        assert_eq!(outcome, ApplyOutcome::Applied(None));
        assert_eq!(kv.get("s1").unwrap().name, "Alice");
    }

    #[test]
    fn test_get_not_found() {
        let mut kv = KeyValueStore::new();
        assert_eq!(kv.get("nonexistent"), None);
        assert_eq!(kv.apply(&Op::get("nonexistent", 1, 1)), ApplyOutcome::Applied(None));
    }

    #[test]
    fn test_logged_get_returns_current_value() {
        let mut kv = KeyValueStore::new();
        kv.apply(&Op::put("s1", StudentRecord::sample("Alice"), 1, 1));

        let outcome = kv.apply(&Op::get("s1", 2, 1));
        assert_eq!(outcome, ApplyOutcome::Applied(Some(StudentRecord::sample("Alice"))));
    }

    #[test]
    fn test_overwrite() {
        let mut kv = KeyValueStore::new();

        kv.apply(&Op::put("s1", StudentRecord::sample("Alice"), 1, 1));
        kv.apply(&Op::put("s1", StudentRecord::sample("Bob"), 1, 2));

        assert_eq!(kv.get("s1").unwrap().name, "Bob");
        assert_eq!(kv.last_seq(1), Some(2));
    }

    #[test]
    fn test_duplicate_put_not_reapplied() {
        let mut kv = KeyValueStore::new();
        let first = Op::put("s1", StudentRecord::sample("Alice"), 1, 1);
        kv.apply(&first);
        // Another client writes in between; the retransmission must not undo it
        kv.apply(&Op::put("s1", StudentRecord::sample("Bob"), 2, 1));

        assert_eq!(kv.apply(&first), ApplyOutcome::Duplicate);
        assert_eq!(kv.get("s1").unwrap().name, "Bob");
    }

    #[test]
    fn test_older_sequence_is_duplicate() {
        let mut kv = KeyValueStore::new();
        kv.apply(&Op::put("s1", StudentRecord::sample("Alice"), 1, 5));

        let stale = Op::put("s2", StudentRecord::sample("Carol"), 1, 3);
        assert_eq!(kv.apply(&stale), ApplyOutcome::Duplicate);
        assert_eq!(kv.get("s2"), None);
        assert_eq!(kv.last_seq(1), Some(5));
    }

    #[test]
    fn test_gets_are_never_deduplicated() {
        let mut kv = KeyValueStore::new();
        kv.apply(&Op::put("s1", StudentRecord::sample("Alice"), 1, 5));

        let outcome = kv.apply(&Op::get("s1", 1, 2));
        assert!(matches!(outcome, ApplyOutcome::Applied(Some(_))));
        assert_eq!(kv.last_seq(1), Some(5));
    }

    #[test]
    fn test_keys_sorted() {
        let mut kv = KeyValueStore::new();
        kv.apply(&Op::put("s3", StudentRecord::sample("C"), 1, 1));
        kv.apply(&Op::put("s1", StudentRecord::sample("A"), 1, 2));
        kv.apply(&Op::put("s2", StudentRecord::sample("B"), 1, 3));

        assert_eq!(kv.keys(), vec!["s1", "s2", "s3"]);
        assert_eq!(kv.len(), 3);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut kv1 = KeyValueStore::new();
        kv1.apply(&Op::put("s1", StudentRecord::sample("Alice"), 7, 1));
        kv1.apply(&Op::put("s2", StudentRecord::sample("Bob"), 7, 2));

        let snapshot = kv1.snapshot().unwrap();

        let mut kv2 = KeyValueStore::new();
        kv2.restore(&snapshot).unwrap();

        assert_eq!(kv2.get("s1"), kv1.get("s1"));
        assert_eq!(kv2.get("s2"), kv1.get("s2"));
        assert_eq!(kv2.last_seq(7), Some(2));
    }

    #[test]
    fn test_restored_dedup_table_still_rejects() {
        let mut kv1 = KeyValueStore::new();
        let op = Op::put("s1", StudentRecord::sample("Alice"), 7, 1);
        kv1.apply(&op);

        let mut kv2 = KeyValueStore::new();
        kv2.restore(&kv1.snapshot().unwrap()).unwrap();

        assert_eq!(kv2.apply(&op), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_restore_overwrites_existing_data() {
        let mut kv1 = KeyValueStore::new();
        kv1.apply(&Op::put("original", StudentRecord::sample("A"), 1, 1));
        let snapshot = kv1.snapshot().unwrap();

        let mut kv2 = KeyValueStore::new();
        kv2.apply(&Op::put("existing", StudentRecord::sample("B"), 2, 1));

        kv2.restore(&snapshot).unwrap();

        assert!(kv2.get("original").is_some());
        assert_eq!(kv2.get("existing"), None);
        assert_eq!(kv2.last_seq(2), None);
    }

    #[test]
    fn test_restore_invalid_data() {
        let mut kv = KeyValueStore::new();
        let err = kv.restore(b"invalid json data").unwrap_err();
        assert!(err.to_string().contains("deserialization failed"));
    }

    #[test]
    fn test_record_json_field_names() {
        let json = serde_json::to_value(StudentRecord::sample("Alice")).unwrap();
        for field in ["grand", "class", "major", "name", "course_count", "total_credits"] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }
}
