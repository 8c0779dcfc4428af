//! Cache-set registry and membership history.
//!
//! Cache sets are never deleted, only deactivated. Membership is a list of
//! validity intervals `[start_height, end_height)`; changes close an interval
//! and open a new one so "who belonged when" stays auditable.
//!
//! Admin commands edit the snapshot from their own process. Edits run under
//! the snapshot's file lock against the latest file contents, and a running
//! service picks them up through [`CacheSetRegistry::refresh`].

use crate::storage::lock::FileLock;
use crate::window::Window;
use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub type CacheSetId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSet {
    pub id: CacheSetId,
    pub owner: u64,
    pub name: String,
    pub is_public: bool,
    pub is_internal: bool,
    pub is_active: bool,
    /// Height at which the set was created.
    pub created_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSetMembership {
    pub cache_set: CacheSetId,
    pub address: String,
    pub start_height: u64,
    /// `None` while the membership is active.
    pub end_height: Option<u64>,
}

impl CacheSetMembership {
    fn is_active(&self) -> bool {
        self.end_height.is_none()
    }
}

/// Parameters for a new cache set.
#[derive(Debug, Clone)]
pub struct NewCacheSet {
    pub owner: u64,
    pub name: String,
    pub addresses: Vec<String>,
    pub is_public: bool,
    pub is_internal: bool,
}

/// Result of a membership update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    next_id: CacheSetId,
    sets: Vec<CacheSet>,
    memberships: Vec<CacheSetMembership>,
}

impl RegistrySnapshot {
    fn set(&self, id: CacheSetId) -> Result<&CacheSet> {
        self.sets
            .iter()
            .find(|set| set.id == id)
            .ok_or_else(|| eyre!("unknown cache set {id}"))
    }

    fn open_memberships(&mut self, id: CacheSetId, addresses: &[String], height: u64) -> Vec<String> {
        let active: HashSet<String> = self
            .memberships
            .iter()
            .filter(|member| member.cache_set == id && member.is_active())
            .map(|member| member.address.clone())
            .collect();
        let mut opened = Vec::new();
        let mut seen = HashSet::new();
        for address in addresses {
            if active.contains(address) || !seen.insert(address.clone()) {
                continue;
            }
            self.memberships.push(CacheSetMembership {
                cache_set: id,
                address: address.clone(),
                start_height: height,
                end_height: None,
            });
            opened.push(address.clone());
        }
        opened
    }
}

#[derive(Debug)]
struct RegistryFile {
    path: PathBuf,
    lock: FileLock<()>,
}

/// Registry of cache sets, persisted as a JSON snapshot.
#[derive(Debug)]
pub struct CacheSetRegistry {
    file: Option<RegistryFile>,
    state: Mutex<RegistrySnapshot>,
}

impl CacheSetRegistry {
    /// Open (or start) the registry stored at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = load_snapshot(&path)?;
        let lock = FileLock::open(&path, ())?;
        Ok(Self {
            file: Some(RegistryFile { path, lock }),
            state: Mutex::new(state),
        })
    }

    /// Registry that is never written to disk.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            file: None,
            state: Mutex::new(RegistrySnapshot::default()),
        }
    }

    /// Reload the snapshot so changes made by other processes become visible.
    pub fn refresh(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _file_guard = file.lock.acquire()?;
        let snapshot = load_snapshot(&file.path)?;
        let mut state = self.state.lock();
        if snapshot.sets.len() != state.sets.len()
            || snapshot.memberships.len() != state.memberships.len()
        {
            tracing::debug!(
                cache_sets = snapshot.sets.len(),
                memberships = snapshot.memberships.len(),
                "cache set registry reloaded"
            );
        }
        *state = snapshot;
        Ok(())
    }

    /// Apply `change` to the latest snapshot and commit it once persisted.
    fn mutate<T>(&self, change: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let _file_guard = self.file.as_ref().map(|file| file.lock.acquire()).transpose()?;
        let mut state = self.state.lock();
        let mut next = match &self.file {
            Some(file) => load_snapshot(&file.path)?,
            None => state.clone(),
        };
        let out = change(&mut next)?;
        if let Some(file) = &self.file {
            persist_snapshot(&file.path, &next)?;
        }
        *state = next;
        Ok(out)
    }

    /// Create a cache set whose initial members join at `height`.
    pub fn create(&self, new: NewCacheSet, height: u64) -> Result<CacheSet> {
        let cache_set = self.mutate(|state| {
            if state
                .sets
                .iter()
                .any(|set| set.owner == new.owner && set.name == new.name)
            {
                return Err(eyre!(
                    "cache set {:?} already exists for owner {}",
                    new.name,
                    new.owner
                ));
            }
            state.next_id += 1;
            let cache_set = CacheSet {
                id: state.next_id,
                owner: new.owner,
                name: new.name.clone(),
                is_public: new.is_public,
                is_internal: new.is_internal,
                is_active: true,
                created_height: height,
            };
            state.sets.push(cache_set.clone());
            state.open_memberships(cache_set.id, &new.addresses, height);
            Ok(cache_set)
        })?;
        info!(
            cache_set = cache_set.id,
            owner = cache_set.owner,
            name = %cache_set.name,
            members = new.addresses.len(),
            height,
            "cache set created"
        );
        Ok(cache_set)
    }

    /// Close `remove` and open `add` memberships at `height`.
    pub fn update_membership(
        &self,
        id: CacheSetId,
        add: &[String],
        remove: &[String],
        height: u64,
    ) -> Result<MembershipChange> {
        let change = self.mutate(|state| {
            state.set(id)?;
            let remove: HashSet<&String> = remove.iter().collect();
            let mut closed = Vec::new();
            for member in state
                .memberships
                .iter_mut()
                .filter(|member| member.cache_set == id && member.is_active())
            {
                if remove.contains(&member.address) {
                    if height < member.start_height {
                        return Err(eyre!(
                            "cannot close membership of {} at {height} before its start {}",
                            member.address,
                            member.start_height
                        ));
                    }
                    member.end_height = Some(height);
                    closed.push(member.address.clone());
                }
            }
            let opened = state.open_memberships(id, add, height);
            Ok(MembershipChange { opened, closed })
        })?;
        info!(
            cache_set = id,
            height,
            opened = change.opened.len(),
            closed = change.closed.len(),
            "cache set membership updated"
        );
        Ok(change)
    }

    pub fn deactivate(&self, id: CacheSetId) -> Result<()> {
        self.mutate(|state| {
            let set = state
                .sets
                .iter_mut()
                .find(|set| set.id == id)
                .ok_or_else(|| eyre!("unknown cache set {id}"))?;
            set.is_active = false;
            Ok(())
        })?;
        info!(cache_set = id, "cache set deactivated");
        Ok(())
    }

    pub fn get(&self, id: CacheSetId) -> Option<CacheSet> {
        self.state.lock().set(id).ok().cloned()
    }

    pub fn find(&self, owner: u64, name: &str) -> Option<CacheSet> {
        self.state
            .lock()
            .sets
            .iter()
            .find(|set| set.owner == owner && set.name == name)
            .cloned()
    }

    pub fn list(&self) -> Vec<CacheSet> {
        self.state.lock().sets.clone()
    }

    pub fn active(&self) -> Vec<CacheSet> {
        self.state
            .lock()
            .sets
            .iter()
            .filter(|set| set.is_active)
            .cloned()
            .collect()
    }

    /// Membership history of a set.
    pub fn memberships(&self, id: CacheSetId) -> Vec<CacheSetMembership> {
        self.state
            .lock()
            .memberships
            .iter()
            .filter(|member| member.cache_set == id)
            .cloned()
            .collect()
    }

    /// Identifiers that belonged to the set at some point of `window`.
    ///
    /// Members that joined when the set was created also count for windows
    /// before creation, which is what historical backfill aggregates over.
    pub fn members_for_window(&self, id: CacheSetId, window: Window) -> Result<Vec<String>> {
        let state = self.state.lock();
        let created_height = state.set(id)?.created_height;
        let members: BTreeSet<String> = state
            .memberships
            .iter()
            .filter(|member| member.cache_set == id)
            .filter(|member| {
                let start = if member.start_height == created_height {
                    0
                } else {
                    member.start_height
                };
                window.intersects(start, member.end_height)
            })
            .map(|member| member.address.clone())
            .collect();
        Ok(members.into_iter().collect())
    }
}

fn load_snapshot(path: &Path) -> Result<RegistrySnapshot> {
    if !path.exists() {
        return Ok(RegistrySnapshot::default());
    }
    let bytes = fs::read(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).wrap_err("failed to deserialize cache set registry")
}

fn persist_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).wrap_err("failed to create registry dir")?;
    }
    let bytes = serde_json::to_vec_pretty(snapshot).wrap_err("failed to serialize registry")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).wrap_err_with(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).wrap_err_with(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
