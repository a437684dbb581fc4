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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::common::error::{LakeError, Result};
use crate::lake::segment::{SegmentDataPb, encode_delete_keys, write_segment_file};
use crate::lake::txn_log::{OpWritePb, TxnLogPb, write_txn_log_file};
use crate::lake::metadata::RowsetMetadataPb;

/// Buffers one transaction's upserts and deletes for a tablet and turns
/// them into a segment file plus an `op_write` txn log on [`finish`].
/// Within the batch the last operation on a key wins.
///
/// [`finish`]: DeltaWriter::finish
pub struct DeltaWriter {
    root: PathBuf,
    tablet_id: i64,
    txn_id: i64,
    // key -> Some(value) for an upsert, None for a delete.
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    finished: bool,
}

impl DeltaWriter {
    pub fn open(root: impl Into<PathBuf>, tablet_id: i64, txn_id: i64) -> Result<Self> {
        if tablet_id <= 0 || txn_id <= 0 {
            return Err(LakeError::InvalidArgument(format!(
                "invalid delta writer ids: tablet_id={tablet_id}, txn_id={txn_id}"
            )));
        }
        Ok(Self {
            root: root.into(),
            tablet_id,
            txn_id,
            ops: BTreeMap::new(),
            finished: false,
        })
    }

    pub fn txn_id(&self) -> i64 {
        self.txn_id
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(LakeError::InvalidArgument("empty primary key".to_string()));
        }
        self.ops.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(LakeError::InvalidArgument("empty primary key".to_string()));
        }
        self.ops.insert(key.to_vec(), None);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Persist the batch: segment file (if any upserts survive) and the
    /// txn log that makes the batch publishable. Consumes the writer's
    /// buffer; an empty batch still produces a txn log so the version
    /// chain has no holes.
    pub fn finish(&mut self) -> Result<TxnLogPb> {
        if self.finished {
            return Err(LakeError::InvalidArgument(format!(
                "delta writer already finished: tablet_id={}, txn_id={}",
                self.tablet_id, self.txn_id
            )));
        }

        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut delete_keys = Vec::new();
        for (key, op) in std::mem::take(&mut self.ops) {
            match op {
                Some(value) => {
                    keys.push(key);
                    values.push(value);
                }
                None => delete_keys.push(key),
            }
        }

        let rowset = if keys.is_empty() {
            None
        } else {
            let file_name = segment_file_name(self.tablet_id, self.txn_id);
            let data_size: i64 = keys
                .iter()
                .zip(values.iter())
                .map(|(k, v)| (k.len() + v.len()) as i64)
                .sum();
            let num_rows = keys.len() as i64;
            write_segment_file(&self.root, &file_name, &SegmentDataPb { keys, values })?;
            Some(RowsetMetadataPb {
                id: None,
                overlapped: Some(false),
                segments: vec![file_name],
                num_rows: Some(num_rows),
                data_size: Some(data_size),
            })
        };

        let dels = if delete_keys.is_empty() {
            Vec::new()
        } else {
            vec![encode_delete_keys(&delete_keys)]
        };

        let txn_log = TxnLogPb {
            tablet_id: Some(self.tablet_id),
            txn_id: Some(self.txn_id),
            op_write: Some(OpWritePb { rowset, dels }),
            op_compaction: None,
        };
        write_txn_log_file(&self.root, &txn_log)?;
        self.finished = true;
        tracing::debug!(
            target: "lakemeta::lake",
            tablet_id = self.tablet_id,
            txn_id = self.txn_id,
            rows = txn_log
                .op_write
                .as_ref()
                .and_then(|op| op.rowset.as_ref())
                .and_then(|rs| rs.num_rows)
                .unwrap_or(0),
            deletes = delete_count(&txn_log),
            "DELTA_WRITER finished batch"
        );
        Ok(txn_log)
    }
}

fn delete_count(txn_log: &TxnLogPb) -> usize {
    txn_log
        .op_write
        .as_ref()
        .map(|op| op.dels.len())
        .unwrap_or(0)
}

/// Deterministic segment file name so a retried flush of the same txn
/// overwrites its own file instead of leaking a sibling.
fn segment_file_name(tablet_id: i64, txn_id: i64) -> String {
    let seed = format!("segment_file:tablet={tablet_id}:txn={txn_id}");
    let digest = Sha256::digest(seed.as_bytes());
    format!("{:016x}_{}.dat", txn_id as u64, hex::encode(&digest[0..16]))
}

/// Best-effort cleanup of an unfinished writer's side effects, used by
/// abort paths that never published the txn.
pub fn cleanup_unpublished_segment(root: &Path, tablet_id: i64, txn_id: i64) -> Result<()> {
    let file_name = segment_file_name(tablet_id, txn_id);
    crate::lake::io::delete_path_if_exists(&crate::lake::layout::data_file_path(root, &file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake::segment::{decode_delete_keys, read_segment_file};
    use tempfile::tempdir;

    #[test]
    fn finish_writes_segment_and_txn_log_with_last_write_wins() {
        let tmp = tempdir().expect("create tempdir");
        let mut writer = DeltaWriter::open(tmp.path(), 1, 50).expect("open");
        writer.write(b"k1", b"v1").expect("write");
        writer.write(b"k2", b"old").expect("write");
        writer.write(b"k2", b"new").expect("write");
        writer.delete(b"k3").expect("delete");
        writer.write(b"k3", b"back").expect("write");
        writer.delete(b"k4").expect("delete");

        let txn_log = writer.finish().expect("finish");
        let op_write = txn_log.op_write.as_ref().expect("op_write");
        let rowset = op_write.rowset.as_ref().expect("rowset");
        assert_eq!(rowset.num_rows, Some(3));

        let segment = read_segment_file(tmp.path(), &rowset.segments[0]).expect("read segment");
        assert_eq!(segment.keys, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]);
        assert_eq!(segment.values[1], b"new".to_vec());
        assert_eq!(segment.values[2], b"back".to_vec());
        let dels = decode_delete_keys(&op_write.dels[0]).expect("decode dels");
        assert_eq!(dels, vec![b"k4".to_vec()]);

        let err = writer.finish().expect_err("double finish");
        assert!(matches!(err, LakeError::InvalidArgument(_)));
    }

    #[test]
    fn delete_only_batch_has_no_rowset() {
        let tmp = tempdir().expect("create tempdir");
        let mut writer = DeltaWriter::open(tmp.path(), 1, 51).expect("open");
        writer.delete(b"k1").expect("delete");
        let txn_log = writer.finish().expect("finish");
        let op_write = txn_log.op_write.as_ref().expect("op_write");
        assert!(op_write.rowset.is_none());
        assert_eq!(op_write.dels.len(), 1);
    }

    #[test]
    fn open_rejects_bad_ids() {
        let tmp = tempdir().expect("create tempdir");
        assert!(DeltaWriter::open(tmp.path(), 0, 1).is_err());
        assert!(DeltaWriter::open(tmp.path(), 1, 0).is_err());
    }
}
