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
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use prost::Message;
use roaring::RoaringBitmap;
use sha2::{Digest, Sha256};

use crate::common::error::{LakeError, Result};
use crate::lake::del_vector::{DelVector, crc32c_mask, crc32c_unmask};
use crate::lake::io::{read_bytes, write_bytes, write_bytes_if_absent};
use crate::lake::layout::{data_file_path, metadata_file_path};
use crate::lake::metadata::{
    DelvecMetadataPb, DelvecPagePb, FileMetaPb, TabletMetadataPb, is_primary_key, next_rowset_id,
};
use crate::lake::pk_index::UpdateManager;
use crate::lake::txn_log::{OpCompactionPb, OpWritePb};

/// Builds the next tablet-metadata snapshot from a base copy by applying
/// txn-log operations and buffering delete-vector deltas. Single-use:
/// `building -> finalized` or `building -> failed`.
pub struct MetaFileBuilder {
    tablet_id: i64,
    root: PathBuf,
    metadata: TabletMetadataPb,
    update_mgr: Arc<UpdateManager>,
    // Concatenated delvec payloads staged for the new version's file.
    buf: Vec<u8>,
    delvecs: HashMap<u32, DelvecPagePb>,
    has_finalized: bool,
    has_update_index: bool,
    has_applied_compaction: bool,
}

impl MetaFileBuilder {
    pub fn new(
        tablet_id: i64,
        root: &Path,
        metadata: TabletMetadataPb,
        update_mgr: Arc<UpdateManager>,
    ) -> Self {
        Self {
            tablet_id,
            root: root.to_path_buf(),
            metadata,
            update_mgr,
            buf: Vec::new(),
            delvecs: HashMap::new(),
            has_finalized: false,
            has_update_index: false,
            has_applied_compaction: false,
        }
    }

    pub fn metadata(&self) -> &TabletMetadataPb {
        &self.metadata
    }

    pub fn next_rowset_id(&self) -> u32 {
        self.metadata
            .next_rowset_id
            .unwrap_or_else(|| next_rowset_id(&self.metadata.rowsets))
    }

    pub fn has_update_index(&self) -> bool {
        self.has_update_index
    }

    pub fn mark_index_updated(&mut self) {
        self.has_update_index = true;
    }

    /// Stage a delete-vector delta for one segment. Empty delvecs are
    /// dropped. A later append for the same segment supersedes the
    /// earlier staged page (batch publish merges through `find_delvec`
    /// before re-appending).
    pub fn append_delvec(&mut self, delvec: &DelVector, rssid: u32) -> Result<()> {
        if delvec.cardinality() == 0 {
            return Ok(());
        }
        let payload = delvec.save_to()?;
        let offset = self.buf.len() as u64;
        let crc = crc32c_mask(crc32c::crc32c(&payload));
        self.buf.extend_from_slice(&payload);
        self.delvecs.insert(
            rssid,
            DelvecPagePb {
                version: None, // stamped at finalize
                offset: Some(offset),
                size: Some(payload.len() as u64),
                crc32c: Some(crc),
                crc32c_gen_version: None,
            },
        );
        Ok(())
    }

    /// Look up a delvec staged in this builder's buffer, so a second txn
    /// log applied in the same publish sees the first log's deletions.
    pub fn find_delvec(&self, rssid: u32) -> Result<Option<DelVector>> {
        let Some(page) = self.delvecs.get(&rssid) else {
            return Ok(None);
        };
        let offset = page.offset.unwrap_or(0) as usize;
        let size = page.size.unwrap_or(0) as usize;
        let payload = self.buf.get(offset..offset + size).ok_or_else(|| {
            LakeError::Internal(format!(
                "staged delvec page out of buffer range: rssid={rssid}, offset={offset}, size={size}"
            ))
        })?;
        let version = self.metadata.version.unwrap_or(0);
        DelVector::load(version, payload).map(Some)
    }

    /// Append the op's rowset to the draft. The rowset consumes the rssid
    /// range `[next_rowset_id, next_rowset_id + max(1, segments))` even
    /// when it carries no segment files.
    pub fn apply_opwrite(&mut self, op_write: &OpWritePb) {
        let Some(rowset) = op_write.rowset.as_ref() else {
            return;
        };
        if rowset.num_rows.unwrap_or(0) <= 0 && op_write.dels.is_empty() {
            return;
        }
        let rowset_id = self.next_rowset_id();
        let mut new_rowset = rowset.clone();
        new_rowset.id = Some(rowset_id);
        self.metadata
            .next_rowset_id
            .replace(rowset_id.saturating_add(new_rowset.segments.len().max(1) as u32));
        self.metadata.rowsets.push(new_rowset);
        if is_primary_key(&self.metadata) {
            self.has_update_index = true;
        }
    }

    /// Replace the input rowsets with the compacted output rowset and
    /// drop the delvec pages of every removed segment.
    pub fn apply_opcompaction(&mut self, op_compaction: &OpCompactionPb) {
        let mut removed_rssid_ranges: Vec<(u32, u32)> = Vec::new();
        self.metadata.rowsets.retain(|rowset| {
            let id = rowset.id.unwrap_or(0);
            if op_compaction.input_rowsets.contains(&id) {
                let last = id + rowset.segments.len().max(1) as u32 - 1;
                removed_rssid_ranges.push((id, last));
                false
            } else {
                true
            }
        });

        let mut delvec_erase_cnt = 0;
        if let Some(delvec_meta) = self.metadata.delvec_meta.as_mut() {
            delvec_meta.delvecs.retain(|rssid, _| {
                let removed = removed_rssid_ranges
                    .iter()
                    .any(|(first, last)| *rssid >= *first && *rssid <= *last);
                if removed {
                    delvec_erase_cnt += 1;
                }
                !removed
            });
        }

        if let Some(output) = op_compaction
            .output_rowset
            .as_ref()
            .filter(|rs| !rs.segments.is_empty())
        {
            let rowset_id = self.next_rowset_id();
            let mut new_rowset = output.clone();
            new_rowset.id = Some(rowset_id);
            self.metadata
                .next_rowset_id
                .replace(rowset_id.saturating_add(new_rowset.segments.len() as u32));
            self.metadata.rowsets.push(new_rowset);
        }

        self.metadata.compaction_inputs = op_compaction.input_rowsets.clone();
        if is_primary_key(&self.metadata) {
            // Compaction moves surviving rows to new rssids; the cached
            // index cannot be trusted whether this draft publishes or not.
            self.has_update_index = true;
            self.has_applied_compaction = true;
        }

        tracing::info!(
            target: "lakemeta::lake",
            tablet_id = self.tablet_id,
            input_ranges = ?removed_rssid_ranges,
            delvec_erase_cnt,
            output_segments = op_compaction
                .output_rowset
                .as_ref()
                .map(|rs| rs.segments.len())
                .unwrap_or(0),
            "META_FILE applied op_compaction"
        );
    }

    fn finalize_delvec(&mut self, version: i64, txn_id: i64) -> Result<()> {
        if !is_primary_key(&self.metadata) || self.delvecs.is_empty() {
            return Ok(());
        }
        let file_name = build_delvec_file_name(self.tablet_id, txn_id, version)?;
        if !self.buf.is_empty() {
            write_bytes(&data_file_path(&self.root, &file_name), &self.buf)?;
        }
        let delvec_meta = self
            .metadata
            .delvec_meta
            .get_or_insert_with(DelvecMetadataPb::default);
        delvec_meta.version_to_file.insert(
            version,
            FileMetaPb {
                name: Some(file_name),
            },
        );
        for (rssid, mut page) in self.delvecs.drain() {
            page.version = Some(version);
            page.crc32c_gen_version = Some(version);
            delvec_meta.delvecs.insert(rssid, page);
        }
        Ok(())
    }

    /// Persist the staged delvec pages and the draft metadata as one
    /// logical unit for the new version. The metadata write uses
    /// create-new semantics; `AlreadyExists` means another publisher won
    /// the race and nothing of this draft became visible.
    pub fn finalize(&mut self, txn_id: i64) -> Result<Arc<TabletMetadataPb>> {
        let start = Instant::now();
        let version = self.metadata.version.ok_or_else(|| {
            LakeError::InvalidArgument("draft metadata missing version".to_string())
        })?;
        self.finalize_delvec(version, txn_id)?;
        let path = metadata_file_path(&self.root, self.tablet_id, version);
        write_bytes_if_absent(&path, &self.metadata.encode_to_vec())?;
        if self.has_applied_compaction && is_primary_key(&self.metadata) {
            // The cached index still maps keys into the compacted-away
            // segments. Drop it so the next publish rebuilds against
            // this snapshot instead of trusting dead rssids.
            self.update_mgr.invalidate(self.tablet_id);
        } else {
            self.update_mgr
                .update_index_data_version(self.tablet_id, version);
        }
        self.has_finalized = true;
        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 {
            tracing::info!(
                target: "lakemeta::lake",
                tablet_id = self.tablet_id,
                version,
                cost_ms = elapsed.as_millis() as u64,
                "META_FILE finalize was slow"
            );
        }
        Ok(Arc::new(self.metadata.clone()))
    }

    /// Failure path: if the shared primary-key index was touched and the
    /// snapshot never became durable, the cache must be dropped so a
    /// retry rebuilds from durable state.
    pub fn handle_failure(&self) {
        if is_primary_key(&self.metadata) && !self.has_finalized && self.has_update_index {
            self.update_mgr.invalidate(self.tablet_id);
        }
    }
}

/// Deterministic delvec file name, stable across publish retries of the
/// same (tablet, txn, version).
fn build_delvec_file_name(tablet_id: i64, txn_id: i64, version: i64) -> Result<String> {
    if tablet_id <= 0 || txn_id <= 0 || version <= 0 {
        return Err(LakeError::InvalidArgument(format!(
            "invalid delvec file name inputs: tablet_id={tablet_id}, txn_id={txn_id}, version={version}"
        )));
    }
    let seed = format!("delvec_file:tablet={tablet_id}:txn={txn_id}:version={version}");
    let digest = Sha256::digest(seed.as_bytes());
    Ok(format!(
        "{:016x}_{}.delvec",
        txn_id as u64,
        hex::encode(&digest[0..16])
    ))
}

/// Read one segment's durable delete bitmap per the snapshot's delvec
/// pages. Missing page means no deletions.
pub fn load_segment_delvec_bitmap(
    root: &Path,
    metadata: &TabletMetadataPb,
    rssid: u32,
) -> Result<RoaringBitmap> {
    let Some(delvec_meta) = metadata.delvec_meta.as_ref() else {
        return Ok(RoaringBitmap::new());
    };
    let Some(page) = delvec_meta.delvecs.get(&rssid) else {
        return Ok(RoaringBitmap::new());
    };
    let size = page.size.unwrap_or(0);
    if size == 0 {
        return Ok(RoaringBitmap::new());
    }
    let version = page.version.ok_or_else(|| {
        LakeError::Corruption(format!("delvec page missing version: rssid={rssid}"))
    })?;
    let file_name = delvec_meta
        .version_to_file
        .get(&version)
        .and_then(|f| f.name.as_deref())
        .ok_or_else(|| {
            LakeError::Corruption(format!(
                "delvec file mapping missing: rssid={rssid}, version={version}"
            ))
        })?;
    let bytes = read_bytes(&data_file_path(root, file_name))?;
    let offset = page.offset.unwrap_or(0) as usize;
    let end = offset + size as usize;
    let payload = bytes.get(offset..end).ok_or_else(|| {
        LakeError::Corruption(format!(
            "delvec page out of file range: rssid={rssid}, offset={offset}, size={size}, file_size={}",
            bytes.len()
        ))
    })?;
    if let Some(masked) = page.crc32c
        && page.crc32c_gen_version == Some(version)
    {
        let expected = crc32c_unmask(masked);
        let actual = crc32c::crc32c(payload);
        if expected != actual {
            return Err(LakeError::Corruption(format!(
                "delvec crc32c mismatch: rssid={rssid}, version={version}, expected={expected}, actual={actual}"
            )));
        }
    }
    let delvec = DelVector::load(version, payload)?;
    Ok(delvec.bitmap().clone())
}

pub fn read_metadata_file(root: &Path, tablet_id: i64, version: i64) -> Result<TabletMetadataPb> {
    let path = metadata_file_path(root, tablet_id, version);
    let bytes = read_bytes(&path).map_err(|e| match e {
        LakeError::NotFound(_) => LakeError::NotFound(format!(
            "tablet metadata tablet_id={tablet_id} version={version}"
        )),
        other => other,
    })?;
    if bytes.is_empty() {
        return Err(LakeError::Corruption(format!(
            "tablet metadata file is empty: {}",
            path.display()
        )));
    }
    Ok(TabletMetadataPb::decode(bytes.as_slice())?)
}
