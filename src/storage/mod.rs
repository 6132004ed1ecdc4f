//! Durable key/value repository.
//!
//! The repository owns all persisted state. Everything cached in memory by
//! the fleet inventory, scheduler, and coordinator is a derived view that
//! must be rebuildable from here on cold start.
//!
//! Logical keyspaces:
//! - `mission/{id}` — mission records
//! - `uav/{id}` — UAV records
//! - `cluster/{id}` — cluster and cluster-mission records
//! - `raft/{node}/term`, `raft/{node}/vote`, `raft/{node}/log/{index}`,
//!   `raft/{node}/snapshot` — consensus persistent state
//!
//! Note: writes do not flush per-operation. Sled provides durability via
//! background flushing; on crash the replicated log is the source of truth
//! and replays any lost tail.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Contract the core depends on. Atomic single-key writes plus
/// compare-and-swap; multi-row atomicity is intentionally absent because
/// replication is the source of truth.
pub trait Repository: Send + Sync {
    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> CoreResult<()>;
    fn delete(&self, key: &str) -> CoreResult<()>;
    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>>;
    /// Atomic compare-and-swap. `expected = None` means "insert if absent".
    /// Returns `true` when the swap applied.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> CoreResult<bool>;
}

/// Typed convenience layer over the byte contract.
pub trait RepositoryExt: Repository {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| CoreError::Fatal(format!("corrupt record at {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> CoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> CoreResult<Vec<(String, T)>> {
        let mut out = Vec::new();
        for (key, bytes) in self.scan_prefix(prefix)? {
            match serde_json::from_slice(&bytes) {
                Ok(value) => out.push((key, value)),
                Err(e) => {
                    // A single corrupt row should not take the scan down;
                    // surface it loudly and keep going.
                    tracing::error!(key = %key, error = %e, "Skipping corrupt record");
                }
            }
        }
        Ok(out)
    }
}

impl<R: Repository + ?Sized> RepositoryExt for R {}

/// Sled-backed repository.
#[derive(Clone)]
pub struct SledRepository {
    db: Arc<sled::Db>,
}

impl SledRepository {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory store for tests.
    pub fn open_temporary() -> CoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl Repository for SledRepository {
    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> CoreResult<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> CoreResult<bool> {
        let result = self
            .db
            .compare_and_swap(key, expected, new.map(<[u8]>::to_vec))?;
        Ok(result.is_ok())
    }
}

/// Key builders for the logical keyspaces.
pub mod keys {
    pub fn mission(id: &str) -> String {
        format!("mission/{id}")
    }
    pub fn uav(id: &str) -> String {
        format!("uav/{id}")
    }
    pub fn cluster(id: &str) -> String {
        format!("cluster/{id}")
    }
    pub fn raft_term(node: &str) -> String {
        format!("raft/{node}/term")
    }
    pub fn raft_vote(node: &str) -> String {
        format!("raft/{node}/vote")
    }
    /// Zero-padded so log keys sort numerically under a prefix scan.
    pub fn raft_log(node: &str, index: u64) -> String {
        format!("raft/{node}/log/{index:020}")
    }
    pub fn raft_log_prefix(node: &str) -> String {
        format!("raft/{node}/log/")
    }
    pub fn raft_snapshot(node: &str) -> String {
        format!("raft/{node}/snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        value: u64,
    }

    fn repo() -> SledRepository {
        SledRepository::open_temporary().unwrap()
    }

    #[test]
    fn test_put_get_delete_roundtrip() {
        let r = repo();
        let rec = Record {
            id: "a".into(),
            value: 7,
        };
        r.put_json("mission/a", &rec).unwrap();
        let got: Option<Record> = r.get_json("mission/a").unwrap();
        assert_eq!(got, Some(rec));

        r.delete("mission/a").unwrap();
        let got: Option<Record> = r.get_json("mission/a").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_scoped() {
        let r = repo();
        for i in [3u64, 1, 2] {
            r.put_json(
                &keys::raft_log("n1", i),
                &Record {
                    id: format!("e{i}"),
                    value: i,
                },
            )
            .unwrap();
        }
        r.put_json(
            &keys::raft_log("n2", 1),
            &Record {
                id: "x".into(),
                value: 9,
            },
        )
        .unwrap();

        let rows: Vec<(String, Record)> = r.scan_json(&keys::raft_log_prefix("n1")).unwrap();
        assert_eq!(rows.len(), 3);
        let values: Vec<u64> = rows.iter().map(|(_, rec)| rec.value).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_compare_and_swap_insert_if_absent() {
        let r = repo();
        assert!(r.compare_and_swap("uav/u1", None, Some(b"one")).unwrap());
        // Second insert-if-absent must fail.
        assert!(!r.compare_and_swap("uav/u1", None, Some(b"two")).unwrap());
        assert_eq!(r.get("uav/u1").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn test_compare_and_swap_conditional_update() {
        let r = repo();
        r.put("uav/u1", b"one").unwrap();
        assert!(!r
            .compare_and_swap("uav/u1", Some(b"wrong"), Some(b"two"))
            .unwrap());
        assert!(r
            .compare_and_swap("uav/u1", Some(b"one"), Some(b"two"))
            .unwrap());
        assert_eq!(r.get("uav/u1").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repo");
        {
            let r = SledRepository::open(&path).unwrap();
            r.put_json(
                "mission/m1",
                &Record {
                    id: "m1".into(),
                    value: 1,
                },
            )
            .unwrap();
            r.flush().unwrap();
        }
        {
            let r = SledRepository::open(&path).unwrap();
            let got: Option<Record> = r.get_json("mission/m1").unwrap();
            assert_eq!(got.map(|r| r.value), Some(1));
        }
    }
}
