//! Client dentry cache: a per-parent child map over a global LRU, falling
//! through to the partition store on miss. Rename commit updates entries
//! with `insert_or_replace`; cache-only removal never issues an RPC.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::meta::client::MetaClient;
use crate::meta::types::{Dentry, InodeId, MetaStatus};

pub struct DentryCache {
    meta: Arc<MetaClient>,
    children: DashMap<InodeId, Arc<Mutex<HashMap<String, Dentry>>>>,
    lru: Mutex<VecDeque<(InodeId, String)>>,
    capacity: usize,
    max_name_length: usize,
}

impl DentryCache {
    pub fn new(meta: Arc<MetaClient>, capacity: usize, max_name_length: usize) -> Arc<Self> {
        Arc::new(Self {
            meta,
            children: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            max_name_length,
        })
    }

    fn check_name(&self, name: &str) -> Result<(), MetaStatus> {
        if name.len() > self.max_name_length {
            return Err(MetaStatus::NameTooLong);
        }
        if name.is_empty() || name.contains(['\0', '/']) {
            return Err(MetaStatus::InvalidParam);
        }
        Ok(())
    }

    fn cache_lookup(&self, parent: InodeId, name: &str) -> Option<Dentry> {
        let children = self.children.get(&parent)?;
        let map = children.lock().unwrap();
        map.get(name).cloned()
    }

    fn cache_store(&self, dentry: Dentry) {
        let parent = dentry.parent_inode_id;
        let name = dentry.name.clone();
        let children = self
            .children
            .entry(parent)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone();
        children.lock().unwrap().insert(name.clone(), dentry);

        let mut lru = self.lru.lock().unwrap();
        if let Some(pos) = lru.iter().position(|(p, n)| *p == parent && n == &name) {
            lru.remove(pos);
        }
        lru.push_back((parent, name));
        while lru.len() > self.capacity {
            if let Some((evict_parent, evict_name)) = lru.pop_front() {
                if let Some(children) = self.children.get(&evict_parent) {
                    children.lock().unwrap().remove(&evict_name);
                }
            }
        }
    }

    /// Remove the cache entry only; no RPC.
    pub fn delete_cache(&self, parent: InodeId, name: &str) {
        if let Some(children) = self.children.get(&parent) {
            children.lock().unwrap().remove(name);
        }
        let mut lru = self.lru.lock().unwrap();
        if let Some(pos) = lru.iter().position(|(p, n)| *p == parent && n == name) {
            lru.remove(pos);
        }
    }

    /// Used by rename commit: the new binding replaces whatever was cached.
    pub fn insert_or_replace(&self, dentry: Dentry) {
        self.cache_store(dentry);
    }

    pub async fn get(&self, parent: InodeId, name: &str) -> Result<Dentry, MetaStatus> {
        self.check_name(name)?;
        if let Some(dentry) = self.cache_lookup(parent, name) {
            return Ok(dentry);
        }
        let dentry = self.meta.get_dentry(parent, name).await?;
        self.cache_store(dentry.clone());
        Ok(dentry)
    }

    pub async fn create(&self, dentry: Dentry) -> Result<(), MetaStatus> {
        self.check_name(&dentry.name)?;
        self.meta.create_dentry(dentry.clone()).await?;
        self.cache_store(dentry);
        Ok(())
    }

    pub async fn delete(&self, parent: InodeId, name: &str) -> Result<(), MetaStatus> {
        self.check_name(name)?;
        // Drop the cache entry first so a failed RPC cannot leave a stale hit.
        self.delete_cache(parent, name);
        self.meta.delete_dentry(parent, name).await
    }

    /// Paged listing straight from the partition store; listings are not
    /// cached, only point lookups are.
    pub async fn list(
        &self,
        parent: InodeId,
        last: Option<String>,
        limit: u32,
        only_dir: bool,
    ) -> Result<Vec<Dentry>, MetaStatus> {
        let dentries = self.meta.list_dentry(parent, last, limit, only_dir).await?;
        debug!(parent, count = dentries.len(), "listed dentries");
        Ok(dentries)
    }

    /// Full listing, paging until the store runs dry.
    pub async fn list_all(&self, parent: InodeId, page: u32) -> Result<Vec<Dentry>, MetaStatus> {
        let mut out = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let batch = self.list(parent, last.clone(), page, false).await?;
            let done = page == 0 || (batch.len() as u32) < page;
            last = batch.last().map(|d| d.name.clone());
            out.extend(batch);
            if done || last.is_none() {
                return Ok(out);
            }
        }
    }
}
