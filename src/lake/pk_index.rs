// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use roaring::RoaringBitmap;

use crate::common::error::{LakeError, Result};
use crate::lake::del_vector::DelVector;
use crate::lake::meta_file::{MetaFileBuilder, load_segment_delvec_bitmap};
use crate::lake::metadata::TabletMetadataPb;
use crate::lake::segment::{decode_delete_keys, read_segment_file};
use crate::lake::txn_log::OpWritePb;

/// Physical location of a visible row: segment (by rssid) and ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentRowRef {
    pub rssid: u32,
    pub row_id: u32,
}

/// In-memory primary-key index of one tablet. `data_version` is the
/// metadata version the map reflects; a mismatch means the cached state
/// is stale and must be rebuilt from a snapshot.
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    map: HashMap<Vec<u8>, SegmentRowRef>,
    data_version: i64,
}

impl PrimaryIndex {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn data_version(&self) -> i64 {
        self.data_version
    }

    pub fn get(&self, key: &[u8]) -> Option<SegmentRowRef> {
        self.map.get(key).copied()
    }
}

struct CacheEntry {
    index: Arc<Mutex<PrimaryIndex>>,
    // Includes the cache's own reference; baseline is 1.
    refs: usize,
}

/// Reference-counted cache of per-tablet primary-key indexes, shared by
/// all publish attempts on a tablet. Mutations made during an unfinished
/// publish are revoked wholesale through [`UpdateManager::invalidate`],
/// forcing the next attempt to rebuild from durable state.
#[derive(Default)]
pub struct UpdateManager {
    cache: Mutex<HashMap<i64, CacheEntry>>,
}

/// Scoped handle on a cached index entry. Releases its reference on drop,
/// so the ref count returns to baseline however the publish attempt ends.
pub struct IndexHandle<'a> {
    mgr: &'a UpdateManager,
    tablet_id: i64,
    index: Arc<Mutex<PrimaryIndex>>,
}

impl IndexHandle<'_> {
    pub fn lock(&self) -> MutexGuard<'_, PrimaryIndex> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for IndexHandle<'_> {
    fn drop(&mut self) {
        self.mgr.release(self.tablet_id);
    }
}

impl UpdateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, tablet_id: i64) -> IndexHandle<'_> {
        let mut cache = self.lock_cache();
        let entry = cache.entry(tablet_id).or_insert_with(|| CacheEntry {
            index: Arc::new(Mutex::new(PrimaryIndex::default())),
            refs: 1,
        });
        entry.refs += 1;
        IndexHandle {
            mgr: self,
            tablet_id,
            index: Arc::clone(&entry.index),
        }
    }

    fn release(&self, tablet_id: i64) {
        let mut cache = self.lock_cache();
        if let Some(entry) = cache.get_mut(&tablet_id) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Drop the cached index so the next publish rebuilds from durable
    /// state instead of a half-updated cache. Outstanding handles keep
    /// their (now detached) index and release without effect.
    pub fn invalidate(&self, tablet_id: i64) {
        self.lock_cache().remove(&tablet_id);
        tracing::info!(
            target: "lakemeta::lake",
            tablet_id,
            "PK_INDEX invalidated cached primary index"
        );
    }

    /// Stamp the cached index with the version just made durable.
    pub fn update_index_data_version(&self, tablet_id: i64, version: i64) {
        let index = match self.lock_cache().get(&tablet_id) {
            Some(entry) => Arc::clone(&entry.index),
            None => return,
        };
        index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .data_version = version;
    }

    /// Current reference count of the cached entry, 0 when absent.
    /// Baseline after any completed publish attempt is 1.
    pub fn index_ref_count(&self, tablet_id: i64) -> usize {
        self.lock_cache().get(&tablet_id).map_or(0, |e| e.refs)
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<i64, CacheEntry>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve one `op_write` against the tablet's primary-key index:
    /// upsert the incoming rowset's keys, apply delete keys, and stage
    /// the resulting delete-vector deltas on `builder`. The caller holds
    /// `handle` for the whole publish and appends the rowset afterwards
    /// via `apply_opwrite`, which consumes the same rssid range assumed
    /// here.
    pub fn publish_primary_key_write(
        &self,
        handle: &IndexHandle<'_>,
        root: &Path,
        op_write: &OpWritePb,
        builder: &mut MetaFileBuilder,
        apply_version: i64,
    ) -> Result<()> {
        if apply_version <= 0 {
            return Err(LakeError::InvalidArgument(format!(
                "invalid apply_version for primary key publish: {apply_version}"
            )));
        }
        let has_rows = op_write
            .rowset
            .as_ref()
            .is_some_and(|rs| rs.num_rows.unwrap_or(0) > 0);
        if !has_rows && op_write.dels.is_empty() {
            return Ok(());
        }

        let mut index = handle.lock();
        let expected_base = apply_version - 1;
        if index.data_version != expected_base {
            rebuild_visible_index(&mut index, root, builder, expected_base)?;
        }

        let mut changed_deletes: BTreeMap<u32, RoaringBitmap> = BTreeMap::new();

        if has_rows && let Some(rowset) = op_write.rowset.as_ref() {
            let first_rssid = builder.next_rowset_id();
            for (seg_idx, file_name) in rowset.segments.iter().enumerate() {
                let rssid = first_rssid + seg_idx as u32;
                let segment = read_segment_file(root, file_name)?;
                for (row_idx, key) in segment.keys.iter().enumerate() {
                    let row_id = u32::try_from(row_idx).map_err(|_| {
                        LakeError::InvalidArgument(format!(
                            "row id overflow in segment {file_name}: row_index={row_idx}"
                        ))
                    })?;
                    if let Some(old_ref) = index.map.insert(key.clone(), SegmentRowRef { rssid, row_id }) {
                        changed_deletes
                            .entry(old_ref.rssid)
                            .or_default()
                            .insert(old_ref.row_id);
                    }
                }
            }
        }

        for payload in &op_write.dels {
            for key in decode_delete_keys(payload)? {
                if let Some(old_ref) = index.map.remove(&key) {
                    changed_deletes
                        .entry(old_ref.rssid)
                        .or_default()
                        .insert(old_ref.row_id);
                }
            }
        }

        for (rssid, added) in changed_deletes {
            // A log applied earlier in the same publish may have already
            // staged deletions for this segment; merge on top of those.
            let mut delvec = match builder.find_delvec(rssid)? {
                Some(staged) => staged,
                None => {
                    let base = load_segment_delvec_bitmap(root, builder.metadata(), rssid)?;
                    let mut delvec = DelVector::new(apply_version);
                    delvec.merge(&base);
                    delvec
                }
            };
            delvec.merge(&added);
            builder.append_delvec(&DelVector::with_bitmap(apply_version, delvec.bitmap().clone()), rssid)?;
        }

        index.data_version = apply_version;
        builder.mark_index_updated();
        tracing::debug!(
            target: "lakemeta::lake",
            tablet_id = handle.tablet_id,
            apply_version,
            visible_keys = index.len(),
            "PK_INDEX applied op_write to primary index"
        );
        Ok(())
    }
}

/// Rebuild the visible index from the draft snapshot: replay rowsets in
/// commit order, skipping rows deleted per the (staged or durable)
/// delete vectors.
fn rebuild_visible_index(
    index: &mut PrimaryIndex,
    root: &Path,
    builder: &MetaFileBuilder,
    data_version: i64,
) -> Result<()> {
    index.map.clear();
    let metadata: &TabletMetadataPb = builder.metadata();
    for rowset in &metadata.rowsets {
        let first_rssid = rowset.id.ok_or_else(|| {
            LakeError::Corruption("primary key rebuild requires rowset.id".to_string())
        })?;
        for (seg_idx, file_name) in rowset.segments.iter().enumerate() {
            let rssid = first_rssid + seg_idx as u32;
            let deleted = match builder.find_delvec(rssid)? {
                Some(staged) => staged.bitmap().clone(),
                None => load_segment_delvec_bitmap(root, metadata, rssid)?,
            };
            let segment = read_segment_file(root, file_name)?;
            for (row_idx, key) in segment.keys.iter().enumerate() {
                let row_id = row_idx as u32;
                if deleted.contains(row_id) {
                    continue;
                }
                index.map.insert(key.clone(), SegmentRowRef { rssid, row_id });
            }
        }
    }
    index.data_version = data_version;
    tracing::info!(
        target: "lakemeta::lake",
        tablet_id = metadata.id.unwrap_or(0),
        data_version,
        visible_keys = index.len(),
        "PK_INDEX rebuilt visible primary index"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_restores_baseline_ref_count() {
        let mgr = UpdateManager::new();
        assert_eq!(mgr.index_ref_count(7), 0);
        {
            let _h1 = mgr.acquire(7);
            assert_eq!(mgr.index_ref_count(7), 2);
            let _h2 = mgr.acquire(7);
            assert_eq!(mgr.index_ref_count(7), 3);
        }
        assert_eq!(mgr.index_ref_count(7), 1);
    }

    #[test]
    fn invalidate_detaches_outstanding_handles() {
        let mgr = UpdateManager::new();
        let handle = mgr.acquire(7);
        mgr.invalidate(7);
        assert_eq!(mgr.index_ref_count(7), 0);
        // The detached handle still works and its drop is a no-op.
        handle.lock().data_version = 5;
        drop(handle);
        assert_eq!(mgr.index_ref_count(7), 0);
        // Re-acquire starts from a fresh entry.
        let fresh = mgr.acquire(7);
        assert_eq!(fresh.lock().data_version(), 0);
    }

    #[test]
    fn update_data_version_touches_only_cached_entries() {
        let mgr = UpdateManager::new();
        mgr.update_index_data_version(9, 4);
        assert_eq!(mgr.index_ref_count(9), 0);
        let handle = mgr.acquire(9);
        mgr.update_index_data_version(9, 4);
        assert_eq!(handle.lock().data_version(), 4);
    }
}
