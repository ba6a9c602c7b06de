//! Object-store access and canonical object naming.
//!
//! Every client derives the same object key for the same block, so the name
//! format is part of the on-wire contract: `{fs}_{inode}_{chunk}_{block}`.

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{GetOptions, GetRange, ObjectStore, PutPayload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::fs::errors::FsError;
use crate::meta::types::{FsId, InodeId};

/// Canonical object key for one block of one chunk.
pub fn object_name(fs_id: FsId, inode_id: InodeId, chunk_id: u64, block_index: u64) -> String {
    format!("{fs_id}_{inode_id}_{chunk_id}_{block_index}")
}

const UPLOAD_BACKOFF_START: Duration = Duration::from_millis(100);
const UPLOAD_BACKOFF_MAX: Duration = Duration::from_secs(10);
/// After this many consecutive failures the adapter starts shouting; upload
/// keeps retrying regardless, losing data is not an option.
const UPLOAD_ALERT_THRESHOLD: u32 = 10;

#[derive(Clone)]
pub struct ObjectAdapter {
    store: Arc<dyn ObjectStore>,
}

impl ObjectAdapter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn put(&self, name: &str, data: Bytes) -> Result<(), FsError> {
        self.store
            .put(&ObjectPath::from(name), PutPayload::from_bytes(data))
            .await
            .map_err(|e| {
                warn!(name, "object put failed: {e}");
                FsError::IoError
            })?;
        Ok(())
    }

    /// Upload that never gives up: failures back off exponentially and are
    /// escalated to error logs past a threshold.
    pub async fn put_with_retry(&self, name: &str, data: Bytes) {
        let mut backoff = UPLOAD_BACKOFF_START;
        let mut failures = 0u32;
        loop {
            match self
                .store
                .put(&ObjectPath::from(name), PutPayload::from_bytes(data.clone()))
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    failures += 1;
                    if failures >= UPLOAD_ALERT_THRESHOLD {
                        error!(name, failures, "object upload persistently failing: {e}");
                    } else {
                        warn!(name, failures, "object upload failed, retrying: {e}");
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(UPLOAD_BACKOFF_MAX);
                }
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Bytes>, FsError> {
        match self.store.get(&ObjectPath::from(name)).await {
            Ok(result) => Ok(Some(result.bytes().await.map_err(|e| {
                warn!(name, "object body read failed: {e}");
                FsError::IoError
            })?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => {
                warn!(name, "object get failed: {e}");
                Err(FsError::IoError)
            }
        }
    }

    pub async fn get_range(
        &self,
        name: &str,
        offset: u64,
        len: u64,
    ) -> Result<Option<Bytes>, FsError> {
        let options = GetOptions {
            range: Some(GetRange::Bounded(offset..offset + len)),
            ..Default::default()
        };
        match self.store.get_opts(&ObjectPath::from(name), options).await {
            Ok(result) => Ok(Some(result.bytes().await.map_err(|e| {
                warn!(name, "object body read failed: {e}");
                FsError::IoError
            })?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => {
                warn!(name, "object range get failed: {e}");
                Err(FsError::IoError)
            }
        }
    }

    /// Best-effort delete; missing objects are fine.
    pub async fn delete(&self, name: &str) {
        match self.store.delete(&ObjectPath::from(name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => warn!(name, "object delete failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn adapter() -> ObjectAdapter {
        ObjectAdapter::new(Arc::new(InMemory::new()))
    }

    #[test]
    fn test_object_name_format() {
        assert_eq!(object_name(1, 2, 3, 4), "1_2_3_4");
        assert_eq!(object_name(100, 42, 7, 0), "100_42_7_0");
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let adapter = adapter();
        let name = object_name(1, 2, 3, 0);

        assert_eq!(adapter.get(&name).await.unwrap(), None);
        adapter
            .put(&name, Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        assert_eq!(
            adapter.get(&name).await.unwrap(),
            Some(Bytes::from_static(b"hello world"))
        );
        assert_eq!(
            adapter.get_range(&name, 6, 5).await.unwrap(),
            Some(Bytes::from_static(b"world"))
        );

        adapter.delete(&name).await;
        assert_eq!(adapter.get(&name).await.unwrap(), None);
    }
}
