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

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use prost::Message;

use crate::common::error::{LakeError, Result};
use crate::lake::delta_writer::cleanup_unpublished_segment;
use crate::lake::io::{delete_path_if_exists, write_bytes_if_absent};
use crate::lake::layout::{
    LOG_DIR, META_DIR, data_file_path, metadata_file_path, parse_metadata_version,
};
use crate::lake::meta_file::{
    MetaFileBuilder, load_segment_delvec_bitmap, read_metadata_file,
};
use crate::lake::metadata::{TabletMetadataPb, compaction_score, is_primary_key};
use crate::lake::pk_index::UpdateManager;
use crate::lake::segment::read_segment_file;
use crate::lake::txn_log::{
    TxnLogOp, TxnLogPb, delete_txn_log_file, dispatch_txn_log, read_txn_log_file,
    write_txn_log_file,
};

/// Entry point for tablet state under one storage root. Owns the shared
/// primary-key index cache and the per-tablet publish locks that serialize
/// same-process publishers; cross-process publishers are serialized by the
/// create-new metadata write instead.
pub struct TabletManager {
    root: PathBuf,
    update_mgr: Arc<UpdateManager>,
    publish_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl TabletManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            update_mgr: Arc::new(UpdateManager::new()),
            publish_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn update_manager(&self) -> &Arc<UpdateManager> {
        &self.update_mgr
    }

    /// Install the initial snapshot of a tablet. Fails with
    /// `AlreadyExists` if that (tablet, version) was already published.
    pub fn put_tablet_metadata(&self, metadata: &TabletMetadataPb) -> Result<()> {
        let tablet_id = metadata
            .id
            .filter(|v| *v > 0)
            .ok_or_else(|| LakeError::InvalidArgument("metadata missing tablet id".to_string()))?;
        let version = metadata
            .version
            .filter(|v| *v > 0)
            .ok_or_else(|| LakeError::InvalidArgument("metadata missing version".to_string()))?;
        write_bytes_if_absent(
            &metadata_file_path(&self.root, tablet_id, version),
            &metadata.encode_to_vec(),
        )
    }

    pub fn get_tablet_metadata(&self, tablet_id: i64, version: i64) -> Result<TabletMetadataPb> {
        read_metadata_file(&self.root, tablet_id, version)
    }

    /// Latest published version, discovered by scanning the meta dir.
    pub fn get_latest_version(&self, tablet_id: i64) -> Result<i64> {
        let meta_dir = self.root.join(META_DIR);
        let entries = match fs::read_dir(&meta_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LakeError::NotFound(format!("tablet {tablet_id}")));
            }
            Err(e) => {
                return Err(LakeError::Io(format!(
                    "list meta dir failed: {}: {e}",
                    meta_dir.display()
                )));
            }
        };
        let mut latest: Option<i64> = None;
        for entry in entries {
            let entry =
                entry.map_err(|e| LakeError::Io(format!("list meta dir entry failed: {e}")))?;
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| parse_metadata_version(name, tablet_id))
            {
                latest = Some(latest.map_or(version, |v| v.max(version)));
            }
        }
        latest.ok_or_else(|| LakeError::NotFound(format!("tablet {tablet_id}")))
    }

    pub fn put_txn_log(&self, txn_log: &TxnLogPb) -> Result<()> {
        write_txn_log_file(&self.root, txn_log)
    }

    pub fn get_txn_log(&self, tablet_id: i64, txn_id: i64) -> Result<TxnLogPb> {
        read_txn_log_file(&self.root, tablet_id, txn_id)
    }

    pub fn delete_txn_log(&self, tablet_id: i64, txn_id: i64) -> Result<()> {
        delete_txn_log_file(&self.root, tablet_id, txn_id)
    }

    /// Drop an unpublished transaction: its txn log and the segment files
    /// the log references. Published versions never point at these files,
    /// so this is safe whenever the txn is known not to have committed.
    pub fn abort_txn(&self, tablet_id: i64, txn_id: i64) -> Result<()> {
        self.with_publish_lock(tablet_id, || self.abort_txn_locked(tablet_id, txn_id))
    }

    fn abort_txn_locked(&self, tablet_id: i64, txn_id: i64) -> Result<()> {
        let txn_log = match self.get_txn_log(tablet_id, txn_id) {
            Ok(log) => log,
            Err(e) if e.is_not_found() => {
                // A writer that died between its segment write and its log
                // write leaves an orphan segment; the deterministic name
                // lets the abort still find it.
                return cleanup_unpublished_segment(&self.root, tablet_id, txn_id);
            }
            Err(e) => return Err(e),
        };
        if let Some(rowset) = txn_log.op_write.as_ref().and_then(|op| op.rowset.as_ref()) {
            for file_name in &rowset.segments {
                delete_path_if_exists(&data_file_path(&self.root, file_name))?;
            }
        }
        self.delete_txn_log(tablet_id, txn_id)?;
        tracing::info!(
            target: "lakemeta::lake",
            tablet_id,
            txn_id,
            "LAKE_PUBLISH aborted txn"
        );
        Ok(())
    }

    /// Apply `txn_ids` on top of `base_version` to publish `new_version`.
    /// Idempotent: re-publishing an already-visible version returns the
    /// existing snapshot. Exactly one concurrent caller performs the
    /// durable write; losers return the winner's snapshot.
    ///
    /// Returns the published snapshot and its compaction score.
    pub fn publish_version(
        &self,
        tablet_id: i64,
        base_version: i64,
        new_version: i64,
        txn_ids: &[i64],
    ) -> Result<(Arc<TabletMetadataPb>, f64)> {
        if tablet_id <= 0 || base_version <= 0 || new_version <= base_version {
            return Err(LakeError::InvalidArgument(format!(
                "invalid publish request: tablet_id={tablet_id}, \
                 base_version={base_version}, new_version={new_version}"
            )));
        }
        if txn_ids.is_empty() || new_version - base_version != txn_ids.len() as i64 {
            return Err(LakeError::InvalidArgument(format!(
                "txn count does not match version delta: \
                 base_version={base_version}, new_version={new_version}, txns={}",
                txn_ids.len()
            )));
        }

        self.with_publish_lock(tablet_id, || {
            self.publish_version_locked(tablet_id, base_version, new_version, txn_ids)
        })
    }

    fn publish_version_locked(
        &self,
        tablet_id: i64,
        base_version: i64,
        new_version: i64,
        txn_ids: &[i64],
    ) -> Result<(Arc<TabletMetadataPb>, f64)> {
        // Duplicate publish of a version that is already visible.
        match self.get_tablet_metadata(tablet_id, new_version) {
            Ok(existing) => {
                let score = compaction_score(&existing);
                tracing::info!(
                    target: "lakemeta::lake",
                    tablet_id,
                    new_version,
                    "LAKE_PUBLISH version already published, skipping"
                );
                return Ok((Arc::new(existing), score));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let base = self.get_tablet_metadata(tablet_id, base_version).map_err(|e| {
            if e.is_not_found() {
                LakeError::InvalidVersion(format!(
                    "base version not found: tablet_id={tablet_id}, base_version={base_version}"
                ))
            } else {
                e
            }
        })?;

        let mut draft = base;
        draft.version = Some(new_version);
        draft.commit_time = Some(chrono::Utc::now().timestamp());
        draft.compaction_inputs.clear();
        let primary_key = is_primary_key(&draft);

        let mut builder =
            MetaFileBuilder::new(tablet_id, &self.root, draft, Arc::clone(&self.update_mgr));
        let index_handle = primary_key.then(|| self.update_mgr.acquire(tablet_id));

        for (i, txn_id) in txn_ids.iter().copied().enumerate() {
            let apply_version = base_version + 1 + i as i64;
            if let Err(e) = self.apply_one_txn(&mut builder, index_handle.as_ref(), tablet_id, txn_id, apply_version)
            {
                builder.handle_failure();
                tracing::warn!(
                    target: "lakemeta::lake",
                    tablet_id,
                    txn_id,
                    apply_version,
                    error = %e,
                    "LAKE_PUBLISH failed to apply txn log"
                );
                return Err(e);
            }
        }

        let published = match builder.finalize(txn_ids[txn_ids.len() - 1]) {
            Ok(published) => published,
            Err(e) if e.is_already_exists() => {
                // Lost the durable race. Nothing of this draft became
                // visible; adopt the winner's snapshot.
                builder.handle_failure();
                let existing = self.get_tablet_metadata(tablet_id, new_version)?;
                let score = compaction_score(&existing);
                tracing::info!(
                    target: "lakemeta::lake",
                    tablet_id,
                    new_version,
                    "LAKE_PUBLISH lost publish race, returning winner snapshot"
                );
                return Ok((Arc::new(existing), score));
            }
            Err(e) => {
                builder.handle_failure();
                return Err(e);
            }
        };

        // Winner-only cleanup so a racing publisher never deletes logs a
        // slower retry may still need to read.
        for txn_id in txn_ids {
            if let Err(e) = self.delete_txn_log(tablet_id, *txn_id) {
                tracing::warn!(
                    target: "lakemeta::lake",
                    tablet_id,
                    txn_id,
                    error = %e,
                    "LAKE_PUBLISH failed to delete consumed txn log"
                );
            }
        }

        let score = compaction_score(&published);
        tracing::info!(
            target: "lakemeta::lake",
            tablet_id,
            base_version,
            new_version,
            txns = txn_ids.len(),
            rowsets = published.rowsets.len(),
            score,
            "LAKE_PUBLISH published new version"
        );
        Ok((published, score))
    }

    fn apply_one_txn(
        &self,
        builder: &mut MetaFileBuilder,
        index_handle: Option<&crate::lake::pk_index::IndexHandle<'_>>,
        tablet_id: i64,
        txn_id: i64,
        apply_version: i64,
    ) -> Result<()> {
        let txn_log = self.get_txn_log(tablet_id, txn_id)?;
        match dispatch_txn_log(&txn_log) {
            TxnLogOp::Write(op_write) => {
                if let Some(handle) = index_handle {
                    self.update_mgr.publish_primary_key_write(
                        handle,
                        &self.root,
                        op_write,
                        builder,
                        apply_version,
                    )?;
                }
                builder.apply_opwrite(op_write);
            }
            TxnLogOp::Compaction(op_compaction) => {
                builder.apply_opcompaction(op_compaction);
            }
            TxnLogOp::Empty => {}
        }
        Ok(())
    }

    /// Materialize the visible rows of one snapshot: every segment row not
    /// flagged by that segment's delete vector, in rowset commit order.
    pub fn read_rows(&self, tablet_id: i64, version: i64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let metadata = self.get_tablet_metadata(tablet_id, version)?;
        let mut rows = Vec::new();
        for rowset in &metadata.rowsets {
            let first_rssid = rowset.id.ok_or_else(|| {
                LakeError::Corruption(format!(
                    "published rowset missing id: tablet_id={tablet_id}, version={version}"
                ))
            })?;
            for (seg_idx, file_name) in rowset.segments.iter().enumerate() {
                let rssid = first_rssid + seg_idx as u32;
                let deleted = load_segment_delvec_bitmap(&self.root, &metadata, rssid)?;
                let segment = read_segment_file(&self.root, file_name)?;
                for (row_idx, (key, value)) in
                    segment.keys.iter().zip(segment.values.iter()).enumerate()
                {
                    if deleted.contains(row_idx as u32) {
                        continue;
                    }
                    rows.push((key.clone(), value.clone()));
                }
            }
        }
        Ok(rows)
    }

    /// Pending txn logs for one tablet, discovered by scanning the log dir.
    pub fn list_txn_log_ids(&self, tablet_id: i64) -> Result<Vec<i64>> {
        let log_dir = self.root.join(LOG_DIR);
        let entries = match fs::read_dir(&log_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LakeError::Io(format!(
                    "list log dir failed: {}: {e}",
                    log_dir.display()
                )));
            }
        };
        let prefix = format!("{:016x}_", tablet_id as u64);
        let mut txn_ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| LakeError::Io(format!("list log dir entry failed: {e}")))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(txn_part) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".log"))
            else {
                continue;
            };
            if let Ok(txn_id) = u64::from_str_radix(txn_part, 16)
                && let Ok(txn_id) = i64::try_from(txn_id)
            {
                txn_ids.push(txn_id);
            }
        }
        txn_ids.sort_unstable();
        Ok(txn_ids)
    }

    /// Serialize same-process publishers of one tablet. The lock entry is
    /// created on first use and kept for the manager's lifetime.
    fn with_publish_lock<T>(&self, tablet_id: i64, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self
                .publish_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(tablet_id).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f()
    }
}
