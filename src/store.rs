//! Persistence of [`MembershipChangeRequest`] records, keyed by request id.

use crate::coordinator::MembershipChangeRequest;
use crate::model::RequestId;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Record store failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Underlying I/O error while reading or writing records.
    #[error("request store I/O error: {0}")]
    Io(String),
    /// A stored record could not be parsed.
    #[error("request record {id} is corrupt: {reason}")]
    Corrupt {
        /// Request id.
        id: String,
        /// Parse failure.
        reason: String,
    },
}

/// Durable storage of request records with their full history.
pub trait RequestStore: Send + Sync {
    /// Loads a record.
    fn load(&self, id: &RequestId) -> Result<Option<MembershipChangeRequest>, StoreError>;

    /// Inserts or replaces a record.
    fn save(&self, record: &MembershipChangeRequest) -> Result<(), StoreError>;

    /// Every stored request id, sorted.
    fn ids(&self) -> Result<Vec<RequestId>, StoreError>;
}

/// One `request_<id>.json` document per record.
#[derive(Debug, Clone)]
pub struct FileRequestStore {
    dir: PathBuf,
}

impl FileRequestStore {
    /// Store rooted at `dir`; created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &RequestId) -> PathBuf {
        self.dir.join(format!("request_{id}.json"))
    }
}

impl RequestStore for FileRequestStore {
    fn load(&self, id: &RequestId) -> Result<Option<MembershipChangeRequest>, StoreError> {
        let path = self.path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                id: id.to_string(),
                reason: err.to_string(),
            })
    }

    fn save(&self, record: &MembershipChangeRequest) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|err| StoreError::Io(err.to_string()))?;
        let path = self.path(&record.id);
        let tmp_path = self.dir.join(format!("request_{}.json.tmp", record.id));
        let contents = serde_json::to_string_pretty(record)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        fs::write(&tmp_path, contents).map_err(|err| StoreError::Io(err.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|err| StoreError::Io(err.to_string()))
    }

    fn ids(&self) -> Result<Vec<RequestId>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let mut ids: Vec<RequestId> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()
                    .and_then(|name| name.strip_prefix("request_"))
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .and_then(RequestId::parse)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Volatile store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    records: Mutex<BTreeMap<RequestId, MembershipChangeRequest>>,
}

impl MemoryRequestStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<RequestId, MembershipChangeRequest>>, StoreError>
    {
        self.records
            .lock()
            .map_err(|_| StoreError::Io("request store lock poisoned".into()))
    }
}

impl RequestStore for MemoryRequestStore {
    fn load(&self, id: &RequestId) -> Result<Option<MembershipChangeRequest>, StoreError> {
        Ok(self.records()?.get(id).cloned())
    }

    fn save(&self, record: &MembershipChangeRequest) -> Result<(), StoreError> {
        self.records()?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn ids(&self) -> Result<Vec<RequestId>, StoreError> {
        Ok(self.records()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{ChangeState, OnboardingRequest};
    use crate::provision::EnrollmentSpec;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn record(id: &str) -> MembershipChangeRequest {
        MembershipChangeRequest::new(
            RequestId::parse(id).unwrap(),
            OnboardingRequest::AddOrganization {
                organization: "org3".into(),
                msp_id: "Org3MSP".into(),
                channel: "mychannel".into(),
                admin: EnrollmentSpec::new("admin"),
                user: None,
                policies: None,
                anchor_peers: Vec::new(),
                initial_node: None,
            },
        )
    }

    #[test]
    fn file_store_round_trips_history() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("onboard_store_{nanos}"));
        let store = FileRequestStore::new(&dir);
        let id = RequestId::parse("req-7").unwrap();
        assert_eq!(store.load(&id).unwrap(), None);

        let mut rec = record("req-7");
        rec.advance(ChangeState::CredentialsProvisioned);
        store.save(&rec).unwrap();

        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(store.ids().unwrap(), vec![id]);
        assert!(!dir.join("request_req-7.json.tmp").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_record_is_reported() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("onboard_store_bad_{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("request_bad.json"), "{").unwrap();
        let store = FileRequestStore::new(&dir);
        let err = store.load(&RequestId::parse("bad").unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn memory_store_lists_sorted_ids() {
        let store = MemoryRequestStore::new();
        store.save(&record("b")).unwrap();
        store.save(&record("a")).unwrap();
        let ids: Vec<String> = store.ids().unwrap().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
